use std::path::PathBuf;

pub const BRIDGE_TCP_PORT: u16 = 9877;

/// Environment variables read by the startup code.  The gateway adapter owns
/// `DISCORD_BOT_TOKEN`; it never reaches this process.
pub const ENV_CLIENT_ID: &str = "SPOTIFY_CLIENT_ID";
pub const ENV_CLIENT_SECRET: &str = "SPOTIFY_CLIENT_SECRET";
pub const ENV_REDIRECT_URI: &str = "REDIRECT_URI";

const APP_DIR: &str = "preview-bot";

pub fn data_dir() -> PathBuf {
    // On macOS and Linux, use ~/.local/share/preview-bot/ (XDG standard)
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".local")
            .join("share")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

pub fn config_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join(APP_DIR)
    }

    #[cfg(windows)]
    {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
    }
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir()
}

pub fn cache_dir() -> PathBuf {
    #[cfg(unix)]
    {
        dirs::home_dir()
            .unwrap_or_else(temp_dir)
            .join(".cache")
            .join(APP_DIR)
    }
    #[cfg(windows)]
    {
        dirs::cache_dir().unwrap_or_else(temp_dir).join(APP_DIR)
    }
}

/// Where staged preview payloads live unless the config says otherwise.
pub fn staging_dir() -> PathBuf {
    cache_dir().join("staging")
}
