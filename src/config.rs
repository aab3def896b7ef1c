// Configuration: built-in defaults, overridden by an optional TOML file,
// overridden by environment variables. The defaults are the values the
// jobs have always run with, so an empty config is usable for everything
// except credentials.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ApiError;

/// Environment variable pointing at an explicit config file.
pub const CONFIG_ENV: &str = "APITASKS_CONFIG";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub task_api: TaskApiConfig,
    pub gemini: GeminiConfig,
    pub admin: AdminConfig,
}

/// Submit-and-poll image API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub size: String,
    pub resolution: String,
    pub n: u32,
    pub language: String,
    pub poll_interval_ms: u64,
    /// Zero disables the deadline.
    pub poll_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub prompts: Vec<String>,
}

impl Default for TaskApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.apimart.ai".into(),
            api_key: None,
            model: "gemini-3-pro-image-preview".into(),
            size: "1:1".into(),
            resolution: "1K".into(),
            n: 1,
            language: "zh".into(),
            poll_interval_ms: 1500,
            poll_timeout_secs: 900,
            request_timeout_secs: 60,
            prompts: vec![
                "月光下的竹林小径".into(),
                "赛博朋克风格的未来城市霓虹灯".into(),
                "一只在太空中漂浮的橘猫".into(),
            ],
        }
    }
}

impl TaskApiConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        (self.poll_timeout_secs > 0).then(|| Duration::from_secs(self.poll_timeout_secs))
    }

    pub fn api_key(&self) -> std::result::Result<&str, ApiError> {
        require(&self.api_key, "APITASKS_TASK_API_KEY")
    }
}

/// Synchronous `generateContent` image API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeminiConfig {
    pub url: String,
    pub api_key: Option<String>,
    pub aspect_ratio: String,
    pub image_size: String,
    pub output_dir: PathBuf,
    pub request_timeout_secs: u64,
    pub prompts: Vec<String>,
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            url: "https://api.vectorengine.ai/v1beta/models/gemini-3-pro-image-preview:generateContent"
                .into(),
            api_key: None,
            aspect_ratio: "1:1".into(),
            image_size: "2K".into(),
            output_dir: PathBuf::from("output"),
            request_timeout_secs: 900,
            prompts: vec!["A cute llama standing in a futuristic city, cyberpunk style".into()],
        }
    }
}

impl GeminiConfig {
    pub fn api_key(&self) -> std::result::Result<&str, ApiError> {
        require(&self.api_key, "APITASKS_GEMINI_API_KEY")
    }
}

/// Token administration API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub base_url: String,
    pub user_id: Option<String>,
    pub access_token: Option<String>,
    pub max_workers: usize,
    pub request_timeout_secs: u64,
    pub list_timeout_secs: u64,
    pub page_size: u32,
    /// Quota of each created token, in currency units.
    pub quota: f64,
    pub create_count: usize,
    /// Group assigned to newly created tokens.
    pub group: String,
    /// Group the update job moves tokens into.
    pub target_group: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.vectorengine.ai".into(),
            user_id: None,
            access_token: None,
            max_workers: 10,
            request_timeout_secs: 10,
            list_timeout_secs: 15,
            page_size: 100,
            quota: 1.75,
            create_count: 400,
            group: "限时特价,default".into(),
            target_group: "限时特价,优质gemini".into(),
        }
    }
}

impl AdminConfig {
    pub fn credentials(&self) -> std::result::Result<(&str, &str), ApiError> {
        Ok((
            require(&self.user_id, "APITASKS_ADMIN_USER")?,
            require(&self.access_token, "APITASKS_ADMIN_TOKEN")?,
        ))
    }
}

fn require<'a>(
    value: &'a Option<String>,
    var: &'static str,
) -> std::result::Result<&'a str, ApiError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ApiError::MissingCredential(var)),
    }
}

impl Config {
    /// Load defaults, then the config file (if any), then the environment.
    pub fn load() -> Result<Self> {
        let mut config = match config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&text)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `APITASKS_*` overrides. `lookup` is injectable so tests do not
    /// have to touch the process environment.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("APITASKS_TASK_API_URL") {
            self.task_api.base_url = v;
        }
        if let Some(v) = lookup("APITASKS_TASK_API_KEY") {
            self.task_api.api_key = Some(v);
        }
        if let Some(v) = lookup("APITASKS_GEMINI_URL") {
            self.gemini.url = v;
        }
        if let Some(v) = lookup("APITASKS_GEMINI_API_KEY") {
            self.gemini.api_key = Some(v);
        }
        if let Some(v) = lookup("APITASKS_ADMIN_URL") {
            self.admin.base_url = v;
        }
        if let Some(v) = lookup("APITASKS_ADMIN_USER") {
            self.admin.user_id = Some(v);
        }
        if let Some(v) = lookup("APITASKS_ADMIN_TOKEN") {
            self.admin.access_token = Some(v);
        }
        if let Some(v) = lookup("APITASKS_MAX_WORKERS") {
            self.admin.max_workers = v
                .trim()
                .parse()
                .with_context(|| format!("APITASKS_MAX_WORKERS is not a number: {v}"))?;
        }
        Ok(())
    }
}

/// `$APITASKS_CONFIG`, else `<config dir>/apitasks/config.toml`.
pub fn config_path() -> Option<PathBuf> {
    if let Ok(p) = std::env::var(CONFIG_ENV) {
        return Some(PathBuf::from(p));
    }
    dirs::config_dir().map(|d| d.join("apitasks").join("config.toml"))
}
