// Boucle d'événements réseau de rouilleftp

pub mod dispatcher;

pub use dispatcher::Dispatcher;
