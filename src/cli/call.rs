use std::error::Error;

use serde_json::Value;

use crate::mcp::McpManager;

/// Parses CLI tool arguments. Absent or blank input means no arguments.
pub fn parse_arguments(raw: Option<&str>) -> Result<Value, Box<dyn Error>> {
    let Some(raw) = raw.map(str::trim).filter(|raw| !raw.is_empty()) else {
        return Ok(Value::Object(Default::default()));
    };
    let arguments: Value =
        serde_json::from_str(raw).map_err(|err| format!("Invalid JSON arguments: {err}"))?;
    if !arguments.is_object() {
        return Err("Tool arguments must be a JSON object.".into());
    }
    Ok(arguments)
}

pub async fn call_tool(
    manager: &McpManager,
    alias: &str,
    arguments: Option<&str>,
) -> Result<(), Box<dyn Error>> {
    let arguments = parse_arguments(arguments)?;
    let execution = manager.call_alias(alias, arguments).await;
    if execution.success {
        println!("{}", execution.output.unwrap_or_default());
        Ok(())
    } else {
        Err(execution
            .error
            .unwrap_or_else(|| "Tool call failed.".to_string())
            .into())
    }
}
