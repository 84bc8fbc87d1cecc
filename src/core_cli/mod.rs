pub mod core_cli;

pub use core_cli::{parse_mode, parse_target, Cli, Command, Target};
