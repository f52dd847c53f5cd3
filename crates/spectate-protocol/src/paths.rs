use std::path::PathBuf;

/// Address the server listens on when neither config nor flags say otherwise.
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8790";

/// Environment variable the CLI reads for the broker base URL.
pub const BROKER_URL_ENV: &str = "SPECTATE_URL";

/// Returns the config directory path for spectate.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("spectate")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("spectate")
    } else {
        PathBuf::from("/tmp/spectate")
    }
}

/// Returns the config file path for the broker server.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}

/// Returns the default SQLite state file used when the sqlite store has no explicit path.
pub fn default_sqlite_path() -> PathBuf {
    dirs_path().join("state.db")
}

/// Base URL the CLI talks to when `SPECTATE_URL` is unset.
pub fn default_broker_url() -> String {
    std::env::var(BROKER_URL_ENV).unwrap_or_else(|_| format!("http://{DEFAULT_LISTEN}"))
}
