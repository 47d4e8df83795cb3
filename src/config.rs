use crate::fetcher::ScriptRepository;
use crate::strategy::{SandboxLimits, ScriptInfo};
use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file read from the working directory when `--config` is not given
pub const DEFAULT_CONFIG_FILE: &str = "grbalance.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentityBackend {
    Firebase,
    Local,
}

impl std::str::FromStr for IdentityBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "firebase" => Ok(IdentityBackend::Firebase),
            "local" => Ok(IdentityBackend::Local),
            other => Err(format!("unknown identity backend '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IdentitySettings {
    pub backend: IdentityBackend,
    pub firebase_api_key: Option<String>,
    pub firebase_project_id: String,
    /// Used when the hosted configuration cannot be fetched
    pub firebase_dev_api_key: Option<String>,
    pub identity_base: String,
    pub token_base: String,
    pub users_file: PathBuf,
    pub token_ttl_secs: u64,
    pub timeout_secs: u64,
}

impl Default for IdentitySettings {
    fn default() -> Self {
        IdentitySettings {
            backend: IdentityBackend::Firebase,
            firebase_api_key: None,
            firebase_project_id: "gr-balance".to_string(),
            firebase_dev_api_key: None,
            identity_base: "https://identitytoolkit.googleapis.com".to_string(),
            token_base: "https://securetoken.googleapis.com".to_string(),
            users_file: PathBuf::from("database/users.json"),
            token_ttl_secs: 3600,
            timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScriptSettings {
    pub remote_enabled: bool,
    #[serde(flatten)]
    pub repository: ScriptRepository,
    /// Remote scripts offered in the selector besides the built-in ones
    pub catalog: Vec<ScriptInfo>,
    pub max_operations: u64,
    pub max_seconds: u64,
}

impl Default for ScriptSettings {
    fn default() -> Self {
        let limits = SandboxLimits::default();
        ScriptSettings {
            remote_enabled: false,
            repository: ScriptRepository::default(),
            catalog: Vec::new(),
            max_operations: limits.max_operations,
            max_seconds: limits.max_runtime.as_secs(),
        }
    }
}

impl ScriptSettings {
    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            max_operations: self.max_operations,
            max_runtime: Duration::from_secs(self.max_seconds),
            ..SandboxLimits::default()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub bind_addr: String,
    pub max_upload_bytes: usize,
    pub session_ttl_secs: u64,
    pub identity: IdentitySettings,
    pub scripts: ScriptSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            bind_addr: "127.0.0.1:3000".to_string(),
            max_upload_bytes: 20 * 1024 * 1024,
            session_ttl_secs: 24 * 60 * 60,
            identity: IdentitySettings::default(),
            scripts: ScriptSettings::default(),
        }
    }
}

/// Load settings: defaults, then the TOML file, then `APP__*` environment
/// variables.
///
/// An explicitly named file must exist; the default file is optional.
pub fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let settings = match path {
        Some(path) => read_file(path)?,
        None if Path::new(DEFAULT_CONFIG_FILE).exists() => read_file(Path::new(DEFAULT_CONFIG_FILE))?,
        None => Settings::default(),
    };
    apply_overrides(settings, |key| std::env::var(key).ok())
}

fn read_file(path: &Path) -> Result<Settings> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

/// Apply environment overrides using `lookup` to read variables
pub fn apply_overrides<F>(mut settings: Settings, lookup: F) -> Result<Settings>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(v) = lookup("APP__BIND_ADDR") {
        settings.bind_addr = v;
    }
    if let Some(v) = lookup("APP__IDENTITY_BACKEND") {
        settings.identity.backend = v.parse().map_err(anyhow::Error::msg)?;
    }
    if let Some(v) = lookup("APP__FIREBASE_API_KEY") {
        settings.identity.firebase_api_key = Some(v).filter(|k| !k.is_empty());
    }
    if let Some(v) = lookup("APP__FIREBASE_PROJECT_ID") {
        settings.identity.firebase_project_id = v;
    }
    if let Some(v) = lookup("APP__USERS_FILE") {
        settings.identity.users_file = PathBuf::from(v);
    }
    if let Some(v) = lookup("APP__REMOTE_SCRIPTS") {
        settings.scripts.remote_enabled = parse_flag(&v)
            .with_context(|| format!("APP__REMOTE_SCRIPTS: expected a boolean, got '{v}'"))?;
    }
    if let Some(v) = lookup("APP__SCRIPTS_OWNER") {
        settings.scripts.repository.owner = v;
    }
    if let Some(v) = lookup("APP__SCRIPTS_REPO") {
        settings.scripts.repository.repo = v;
    }
    if let Some(v) = lookup("APP__MAX_UPLOAD_BYTES") {
        settings.max_upload_bytes = v
            .parse()
            .with_context(|| format!("APP__MAX_UPLOAD_BYTES: expected a number, got '{v}'"))?;
    }
    Ok(settings)
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HostedConfig {
    api_key: String,
}

pub fn hosted_config_url(project_id: &str) -> String {
    format!("https://{project_id}.firebaseapp.com/__/firebase/init.json")
}

/// Resolve the Firebase web API key
///
/// A configured key wins. Otherwise the project's hosted `init.json` is
/// fetched from `url`; when that fails the development key is used.
pub async fn resolve_firebase_api_key(identity: &IdentitySettings, url: &str) -> Result<String> {
    if let Some(key) = &identity.firebase_api_key {
        return Ok(key.clone());
    }

    match fetch_hosted_key(url, Duration::from_secs(identity.timeout_secs)).await {
        Ok(key) => Ok(key),
        Err(e) => {
            log::error!("Error loading remote Firebase config: {e:#}");
            match &identity.firebase_dev_api_key {
                Some(key) => {
                    log::warn!("Using development Firebase configuration");
                    Ok(key.clone())
                }
                None => bail!("No Firebase configuration available"),
            }
        }
    }
}

async fn fetch_hosted_key(url: &str, timeout: Duration) -> Result<String> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        bail!("Failed to load Firebase configuration from remote source ({})", response.status());
    }
    let config: HostedConfig = response.json().await?;
    Ok(config.api_key)
}
