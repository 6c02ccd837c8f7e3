pub mod build_cmd;
pub mod config_cmd;
pub mod lookup_cmd;
pub mod scan_cmd;
pub mod serve_cmd;

pub use build_cmd::cmd_build;
pub use config_cmd::cmd_config;
pub use lookup_cmd::cmd_lookup;
pub use scan_cmd::cmd_scan;
pub use serve_cmd::cmd_serve;
