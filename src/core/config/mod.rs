pub mod data;
pub mod defaults;
pub mod io;

pub use data::{Config, McpServerConfig, NormalizedServerConfig};
pub use io::ConfigError;
