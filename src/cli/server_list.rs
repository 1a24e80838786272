use crate::mcp::manager::ServerStatus;

pub fn list_servers(servers: &[ServerStatus]) {
    print!("{}", format_servers(servers));
}

/// Renders one table row per server, followed by any errors and stderr tails.
pub fn format_servers(servers: &[ServerStatus]) -> String {
    if servers.is_empty() {
        return "No MCP servers configured.\n".to_string();
    }

    let mut content = String::from("MCP Servers:\n\n");
    content.push_str("| Server | Transport | State | Tools |\n");
    content.push_str("|---|---|---|---:|\n");
    for server in servers {
        content.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            server.id, server.transport, server.state, server.tool_count
        ));
    }

    for server in servers {
        if let Some(error) = &server.last_error {
            content.push_str(&format!("\n{}: {}\n", server.id, error));
        }
        if !server.stderr_tail.is_empty() {
            content.push_str(&format!("\n{} stderr:\n", server.id));
            for line in &server.stderr_tail {
                content.push_str(&format!("  {line}\n"));
            }
        }
    }
    content
}
