use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use url::Url;

pub const DEFAULT_REMOTE_BASE_URL: &str = "http://localhost:5001";
pub const DEFAULT_REMOTE_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_PYTHON_BIN: &str = "python3";
pub const DEFAULT_TOOLS_DIR: &str = "python-ai-backend/ai_tools";
pub const DEFAULT_BIND: &str = "127.0.0.1:8790";

const SETTINGS_REL_PATH: &str = "config/dispatch.settings.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchSettings {
    pub app_root: PathBuf,
    /// `None` disables the remote path entirely.
    pub remote_base_url: Option<Url>,
    pub remote_timeout: Duration,
    pub python_bin: String,
    pub tools_dir: PathBuf,
    pub bind: SocketAddr,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SettingsError {
    #[error("failed to read dispatch settings '{path}': {message}")]
    ReadFile { path: String, message: String },
    #[error("failed to parse dispatch settings TOML '{path}': {message}")]
    ParseToml { path: String, message: String },
    #[error("invalid remote base URL '{value}': {message}")]
    InvalidRemoteUrl { value: String, message: String },
    #[error("invalid remote timeout '{0}': expected a positive number of seconds")]
    InvalidTimeout(String),
    #[error("invalid bind address '{value}': {message}")]
    InvalidBind { value: String, message: String },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    #[serde(default)]
    remote: RemoteSection,
    #[serde(default)]
    local: LocalSection,
    #[serde(default)]
    server: ServerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RemoteSection {
    base_url: Option<String>,
    timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct LocalSection {
    python_bin: Option<String>,
    tools_dir: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServerSection {
    bind: Option<String>,
}

pub fn default_app_root() -> PathBuf {
    std::env::var("IMGPOP_APP_ROOT")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::current_dir().ok())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn load_dispatch_settings(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<DispatchSettings, SettingsError> {
    load_dispatch_settings_with_env(app_root, explicit_path, |key| std::env::var(key).ok())
}

/// File settings first, then `IMGPOP_*` environment overrides.
pub fn load_dispatch_settings_with_env<F>(
    app_root: &Path,
    explicit_path: Option<&str>,
    env: F,
) -> Result<DispatchSettings, SettingsError>
where
    F: Fn(&str) -> Option<String>,
{
    let file = load_settings_file(app_root, explicit_path)?;
    let env_value = |key: &str| env(key).map(|v| v.trim().to_string());

    let remote_base_url = match env_value("IMGPOP_REMOTE_BASE_URL")
        .or(file.remote.base_url)
        .unwrap_or_else(|| String::from(DEFAULT_REMOTE_BASE_URL))
    {
        value if value.trim().is_empty() => None,
        value => Some(parse_remote_url(value.trim())?),
    };

    let remote_timeout_secs = match env_value("IMGPOP_REMOTE_TIMEOUT_SECS") {
        Some(raw) => raw
            .parse::<u64>()
            .ok()
            .filter(|v| *v > 0)
            .ok_or(SettingsError::InvalidTimeout(raw))?,
        None => match file.remote.timeout_secs {
            Some(0) => return Err(SettingsError::InvalidTimeout(String::from("0"))),
            Some(v) => v,
            None => DEFAULT_REMOTE_TIMEOUT_SECS,
        },
    };

    let python_bin = env_value("IMGPOP_PYTHON_BIN")
        .filter(|v| !v.is_empty())
        .or(file.local.python_bin)
        .unwrap_or_else(|| String::from(DEFAULT_PYTHON_BIN));

    let tools_dir = env_value("IMGPOP_TOOLS_DIR")
        .filter(|v| !v.is_empty())
        .or(file.local.tools_dir)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_TOOLS_DIR));
    let tools_dir = if tools_dir.is_absolute() {
        tools_dir
    } else {
        app_root.join(tools_dir)
    };

    let bind_raw = env_value("IMGPOP_BACKEND_BIND")
        .filter(|v| !v.is_empty())
        .or(file.server.bind)
        .unwrap_or_else(|| String::from(DEFAULT_BIND));
    let bind = bind_raw
        .parse::<SocketAddr>()
        .map_err(|e| SettingsError::InvalidBind {
            value: bind_raw.clone(),
            message: e.to_string(),
        })?;

    Ok(DispatchSettings {
        app_root: app_root.to_path_buf(),
        remote_base_url,
        remote_timeout: Duration::from_secs(remote_timeout_secs),
        python_bin,
        tools_dir,
        bind,
    })
}

fn load_settings_file(
    app_root: &Path,
    explicit_path: Option<&str>,
) -> Result<SettingsFile, SettingsError> {
    let explicit = explicit_path
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .map(|p| if p.is_absolute() { p } else { app_root.join(p) });

    let path = match explicit {
        Some(path) => path,
        None => {
            let default_path = app_root.join(SETTINGS_REL_PATH);
            if !default_path.exists() {
                return Ok(SettingsFile::default());
            }
            default_path
        }
    };

    let raw = fs::read_to_string(path.as_path()).map_err(|e| SettingsError::ReadFile {
        path: path.display().to_string(),
        message: e.to_string(),
    })?;
    toml::from_str(raw.as_str()).map_err(|e| SettingsError::ParseToml {
        path: path.display().to_string(),
        message: e.to_string(),
    })
}

fn parse_remote_url(value: &str) -> Result<Url, SettingsError> {
    let url = Url::parse(value).map_err(|e| SettingsError::InvalidRemoteUrl {
        value: value.to_string(),
        message: e.to_string(),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SettingsError::InvalidRemoteUrl {
            value: value.to_string(),
            message: String::from("scheme must be http or https"),
        });
    }
    Ok(url)
}
