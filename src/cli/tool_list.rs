use crate::mcp::manager::ToolInfo;

pub fn list_tools(tools: &[ToolInfo]) {
    print!("{}", format_tools(tools));
}

pub fn format_tools(tools: &[ToolInfo]) -> String {
    if tools.is_empty() {
        return "No MCP tools available.\n".to_string();
    }

    let mut content = String::from("MCP Tools:\n\n");
    content.push_str("| Alias | Server | Tool | Description |\n");
    content.push_str("|---|---|---|---|\n");
    for tool in tools {
        let description = tool.description.lines().next().unwrap_or_default();
        content.push_str(&format!(
            "| {} | {} | {} | {} |\n",
            tool.alias, tool.server, tool.tool, description
        ));
    }
    content
}
