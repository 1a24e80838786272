use serde_json::Value;

pub const NO_OUTPUT: &str = "(no output)";

/// Classified result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolCallOutcome {
    Success(String),
    Failed(String),
}

impl ToolCallOutcome {
    pub fn from_result(result: &Value) -> Self {
        let output = extract_output(result);
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if is_error {
            ToolCallOutcome::Failed(output)
        } else {
            ToolCallOutcome::Success(output)
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ToolCallOutcome::Success(_))
    }

    pub fn text(&self) -> &str {
        match self {
            ToolCallOutcome::Success(text) | ToolCallOutcome::Failed(text) => text,
        }
    }
}

/// Text blocks first, then `structuredContent`, then the whole result.
pub fn extract_output(result: &Value) -> String {
    let text = result
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|block| block.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("\n")
        })
        .unwrap_or_default();
    if !text.trim().is_empty() {
        return text;
    }

    if let Some(structured) = result
        .get("structuredContent")
        .filter(|value| !value.is_null())
    {
        return pretty(structured);
    }

    if is_empty_result(result) {
        NO_OUTPUT.to_string()
    } else {
        pretty(result)
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn is_empty_result(result: &Value) -> bool {
    match result {
        Value::Null => true,
        Value::String(text) => text.trim().is_empty(),
        Value::Object(object) => object.iter().all(|(key, value)| match key.as_str() {
            "isError" | "_meta" => true,
            "content" => value.as_array().is_some_and(Vec::is_empty) || value.is_null(),
            _ => false,
        }),
        _ => false,
    }
}
