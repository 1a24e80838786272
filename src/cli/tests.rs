use super::*;
use crate::cli::call::parse_arguments;
use crate::cli::server_list::format_servers;
use crate::cli::tool_list::format_tools;
use crate::mcp::manager::{RuntimeState, ServerStatus, ToolInfo};
use serde_json::json;

#[test]
fn parses_call_with_optional_arguments() {
    let args = Args::try_parse_from(["mcpmux", "call", "mcp_files_read_abc123", r#"{"path":"a"}"#])
        .expect("call should parse");
    assert_eq!(
        args.command,
        Commands::Call {
            alias: "mcp_files_read_abc123".to_string(),
            arguments: Some(r#"{"path":"a"}"#.to_string()),
        }
    );

    let args = Args::try_parse_from(["mcpmux", "tools", "--config", "servers.toml", "--log", "out.log"])
        .expect("global flags after the subcommand");
    assert_eq!(args.command, Commands::Tools);
    assert_eq!(args.config, Some(PathBuf::from("servers.toml")));
    assert_eq!(args.log, Some(PathBuf::from("out.log")));
}

#[test]
fn subcommand_is_required() {
    assert!(Args::try_parse_from(["mcpmux"]).is_err());
}

#[test]
fn call_arguments_must_be_an_object() {
    assert_eq!(parse_arguments(None).expect("no args"), json!({}));
    assert_eq!(parse_arguments(Some("  ")).expect("blank args"), json!({}));
    assert_eq!(
        parse_arguments(Some(r#"{"text":"hi"}"#)).expect("object"),
        json!({"text": "hi"})
    );
    assert!(parse_arguments(Some("[1]")).is_err());
    let err = parse_arguments(Some("{")).expect_err("invalid json");
    assert!(err.to_string().starts_with("Invalid JSON arguments"));
}

#[test]
fn missing_config_file_loads_empty_config() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = load_config(Some(&dir.path().join("absent.toml"))).expect("default config");
    assert!(config.mcp_servers.is_empty());
}

#[test]
fn server_table_includes_errors_and_stderr() {
    let servers = vec![
        ServerStatus {
            id: "alpha".to_string(),
            transport: "stdio".to_string(),
            enabled: true,
            state: RuntimeState::Disconnected,
            connected: false,
            tool_count: 0,
            last_error: Some("MCP server process exited (code: 2, signal: none)".to_string()),
            stderr_tail: vec!["panic: boom".to_string()],
        },
        ServerStatus {
            id: "beta".to_string(),
            transport: "sse".to_string(),
            enabled: true,
            state: RuntimeState::Connected,
            connected: true,
            tool_count: 3,
            last_error: None,
            stderr_tail: Vec::new(),
        },
    ];
    let rendered = format_servers(&servers);
    assert!(rendered.contains("| alpha | stdio | disconnected | 0 |"));
    assert!(rendered.contains("| beta | sse | connected | 3 |"));
    assert!(rendered.contains("alpha: MCP server process exited (code: 2"));
    assert!(rendered.contains("alpha stderr:\n  panic: boom"));
    assert_eq!(format_servers(&[]), "No MCP servers configured.\n");
}

#[test]
fn tool_table_uses_first_description_line() {
    let tools = vec![ToolInfo {
        alias: "mcp_files_read_abc123".to_string(),
        server: "files".to_string(),
        tool: "read".to_string(),
        description: "Read a file.\nLong details.".to_string(),
        input_schema: json!({"type": "object", "properties": {}}),
    }];
    let rendered = format_tools(&tools);
    assert!(rendered.contains("| mcp_files_read_abc123 | files | read | Read a file. |"));
    assert!(!rendered.contains("Long details"));
}
