//! Alias derivation and the alias → tool routing table.
//!
//! Aliases look like `mcp_<server>_<tool>_<hash>` where the hash is the first
//! six hex digits of the CRC-32 of `"<server>:<tool>"`. Derivation depends only
//! on the raw names and the collision ordinal, so an unchanged topology always
//! yields byte-identical aliases.

use std::collections::{HashMap, HashSet};

pub const ALIAS_PREFIX: &str = "mcp";
pub const MAX_ALIAS_LEN: usize = 64;
const SERVER_SEGMENT_LEN: usize = 16;
const TOOL_SEGMENT_LEN: usize = 24;
const HASH_LEN: usize = 6;
const EMPTY_SEGMENT: &str = "tool";

/// Lower-cases, collapses every non-alphanumeric run into one `_`, trims `_`
/// from both ends and caps the length. Empty results become `"tool"`.
pub fn sanitize_segment(raw: &str, max_len: usize) -> String {
    let mut sanitized = String::with_capacity(raw.len().min(max_len));
    let mut separator = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if separator && !sanitized.is_empty() {
                sanitized.push('_');
            }
            separator = false;
            sanitized.push(ch.to_ascii_lowercase());
        } else {
            separator = true;
        }
    }
    sanitized.truncate(max_len);
    let trimmed = sanitized.trim_end_matches('_');
    if trimmed.is_empty() {
        EMPTY_SEGMENT.to_string()
    } else {
        trimmed.to_string()
    }
}

fn alias_hash(server_id: &str, tool_name: &str) -> String {
    let hash = crc32fast::hash(format!("{server_id}:{tool_name}").as_bytes());
    let mut hex = format!("{hash:08x}");
    hex.truncate(HASH_LEN);
    hex
}

pub fn base_alias(server_id: &str, tool_name: &str) -> String {
    let mut alias = format!(
        "{ALIAS_PREFIX}_{}_{}_{}",
        sanitize_segment(server_id, SERVER_SEGMENT_LEN),
        sanitize_segment(tool_name, TOOL_SEGMENT_LEN),
        alias_hash(server_id, tool_name)
    );
    alias.truncate(MAX_ALIAS_LEN);
    alias
}

fn with_ordinal(base: &str, ordinal: usize) -> String {
    let suffix = format!("_{ordinal}");
    let keep = base.len().min(MAX_ALIAS_LEN - suffix.len());
    format!("{}{suffix}", &base[..keep])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRoute {
    pub alias: String,
    pub server_id: String,
    pub tool_name: String,
}

/// Immutable alias table. The manager builds a fresh one and swaps it in
/// whole; it is never edited in place.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<ToolRoute>,
    by_alias: HashMap<String, usize>,
}

impl RouteTable {
    /// Assigns aliases in iteration order. A repeated base alias gets `_2`,
    /// `_3`, … appended.
    pub fn build<'a>(tools: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut routes = Vec::new();
        let mut by_alias = HashMap::new();
        let mut used = HashSet::new();

        for (server_id, tool_name) in tools {
            let base = base_alias(server_id, tool_name);
            let mut alias = base.clone();
            let mut ordinal = 2;
            while used.contains(&alias) {
                alias = with_ordinal(&base, ordinal);
                ordinal += 1;
            }
            used.insert(alias.clone());
            by_alias.insert(alias.clone(), routes.len());
            routes.push(ToolRoute {
                alias,
                server_id: server_id.to_string(),
                tool_name: tool_name.to_string(),
            });
        }

        Self { routes, by_alias }
    }

    pub fn resolve(&self, alias: &str) -> Option<&ToolRoute> {
        self.by_alias
            .get(alias)
            .and_then(|index| self.routes.get(*index))
    }

    pub fn alias_for(&self, server_id: &str, tool_name: &str) -> Option<&str> {
        self.routes
            .iter()
            .find(|route| route.server_id == server_id && route.tool_name == tool_name)
            .map(|route| route.alias.as_str())
    }

    pub fn routes(&self) -> &[ToolRoute] {
        &self.routes
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
