pub mod parser;

pub use parser::{parse_listing, EntryKind, ListingEntry};
