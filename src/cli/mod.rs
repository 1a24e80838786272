//! Command-line interface parsing and handling
//!
//! Every command loads the configured servers, connects them through an
//! [`McpManager`], prints its result, and disposes the manager before exiting.

pub mod call;
pub mod server_list;
pub mod tool_list;

use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use crate::cli::call::call_tool;
use crate::cli::server_list::list_servers;
use crate::cli::tool_list::list_tools;
use crate::core::config::Config;
use crate::logging::{self, LogTarget};
use crate::mcp::McpManager;

#[derive(Parser)]
#[command(name = "mcpmux")]
#[command(version)]
#[command(about = "Connect to MCP servers and call their tools")]
#[command(
    long_about = "mcpmux connects to every Model Context Protocol server in its config file \
over stdio, SSE, or streamable HTTP, discovers their tools, and exposes each one under a \
stable alias.\n\n\
Servers are read from `[[mcp_servers]]` entries in config.toml, found in the platform \
config directory unless --config is given.\n\n\
Environment Variables:\n\
  RUST_LOG          Log filter (defaults to warn)"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Read servers from this config file
    #[arg(short = 'c', long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(short = 'l', long, global = true, value_name = "FILE")]
    pub log: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Connect to every server and show its status
    Servers,
    /// List discovered tools with their aliases
    Tools,
    /// Call a tool by alias
    Call {
        /// Alias as printed by `mcpmux tools`
        alias: String,
        /// Tool arguments as a JSON object
        arguments: Option<String>,
    },
}

pub fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    logging::init(&LogTarget::from_arg(args.log.as_deref()))?;
    tokio::runtime::Runtime::new()?.block_on(async_main(args))
}

fn load_config(path: Option<&Path>) -> Result<Config, Box<dyn Error>> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    Ok(config)
}

async fn async_main(args: Args) -> Result<(), Box<dyn Error>> {
    let config = load_config(args.config.as_deref())?;
    if config.mcp_servers.is_empty() {
        println!("No MCP servers configured.");
        return Ok(());
    }

    let manager = McpManager::new()?;
    manager.set_servers(config.mcp_servers).await;
    let summary = manager.refresh().await;

    let result = match args.command {
        Commands::Servers => {
            list_servers(&summary.servers);
            Ok(())
        }
        Commands::Tools => {
            list_tools(&summary.tools);
            Ok(())
        }
        Commands::Call { alias, arguments } => {
            call_tool(&manager, &alias, arguments.as_deref()).await
        }
    };

    manager.dispose().await;
    result
}

#[cfg(test)]
mod tests;
