//! mcpmux is a Model Context Protocol client that talks to many servers at once.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`mcp::protocol`] classifies JSON-RPC envelopes.
//! - [`mcp::transport`] speaks stdio, SSE, and streamable HTTP behind one
//!   [`mcp::transport::McpTransport`] trait.
//! - [`mcp::client`] discovers and invokes tools over any transport.
//! - [`mcp::manager`] reconciles server configuration, tracks per-server
//!   state, and exposes tools under stable aliases from [`mcp::registry`].
//! - [`core::config`] loads and saves the TOML server list.
//!
//! The `mcpmux` binary routes through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod logging;
pub mod mcp;
