//! Model Context Protocol client stack: wire codec, transports, tool
//! discovery, alias routing, and the multi-server manager.

pub mod client;
pub mod error;
pub mod manager;
pub mod protocol;
pub mod registry;
pub mod transport;

pub use error::McpError;
pub use manager::{McpManager, McpToolRegistration, ToolExecution};
