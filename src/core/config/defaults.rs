pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 60_000;
pub const MIN_REQUEST_TIMEOUT_MS: u64 = 1_000;
pub const MAX_REQUEST_TIMEOUT_MS: u64 = 120_000;

pub const CONFIG_FILE_NAME: &str = "config.toml";
