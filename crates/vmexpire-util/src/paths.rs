//! Default paths for vmexpired components
//!
//! - Socket: `$XDG_RUNTIME_DIR/vmexpired/vmexpired.sock` or `/tmp/vmexpired-$USER/vmexpired.sock`
//! - Data: `$XDG_DATA_HOME/vmexpired` or `~/.local/share/vmexpired`
//! - Config: `/etc/vmexpire/vmexpire.toml` when present, else `$XDG_CONFIG_HOME/vmexpire/vmexpire.toml`

use std::path::PathBuf;

const SOCKET_FILENAME: &str = "vmexpired.sock";
const APP_DIR: &str = "vmexpired";
const SYSTEM_CONFIG: &str = "/etc/vmexpire/vmexpire.toml";

/// Control socket path used when the config leaves it unset.
///
/// `$VMEXPIRE_SOCKET` is handled by the daemon's flags, not here.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join(APP_DIR);
    }

    PathBuf::from("/tmp").join(APP_DIR).join("data")
}

/// Default configuration file.
///
/// The system-wide file wins when it exists, mirroring how the service is
/// usually deployed next to the compute controller.
pub fn default_config_path() -> PathBuf {
    let system = PathBuf::from(SYSTEM_CONFIG);
    if system.exists() {
        return system;
    }

    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join("vmexpire").join("vmexpire.toml");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join("vmexpire")
            .join("vmexpire.toml");
    }

    system
}
