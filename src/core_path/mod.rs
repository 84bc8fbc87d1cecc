pub mod path_type;

pub use path_type::{is_empty_listing_error, server_system_name, vms_dir_name, ServerPathType};
