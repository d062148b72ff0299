use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;

use crate::models::secret::DEFAULT_COST;
use crate::store::BackendKind;

/// Bytes of server secret allowed in front of the password. bcrypt only
/// looks at the first 72 bytes of its input.
pub const MAX_SECRET_KEY_LEN: usize = 48;

const DEFAULT_CONFIG_FILE: &str = "config.yaml";

#[derive(Debug, Clone)]
pub struct Config {
    /// Server-side secret mixed into every password before hashing.
    pub secret_key: String,
    pub storage_class: BackendKind,
    /// Backend options, validated against the backend's schema at startup.
    pub storage_config: BTreeMap<String, String>,
    pub storage_clean_interval: Duration,
    pub max_data_size_mb: u64,
    pub app_listen_ip: IpAddr,
    pub app_port: u16,
    pub bcrypt_cost: u32,
}

impl Config {
    /// Request body limit in bytes.
    pub fn max_body_bytes(&self) -> usize {
        (self.max_data_size_mb as usize).saturating_mul(1_000_000)
    }
}

/// Shape of the YAML file. Every key is optional here; required keys are
/// checked after environment overrides are applied.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    secret_key: Option<String>,
    storage_class: Option<String>,
    #[serde(default)]
    storage_config: BTreeMap<String, serde_yaml::Value>,
    storage_clean_interval: Option<u64>,
    max_data_size_mb: Option<u64>,
    app_listen_ip: Option<String>,
    app_port: Option<u16>,
    bcrypt_cost: Option<u32>,
}

/// Load configuration from `.env`, the YAML file named by `WHISPER_CONFIG`
/// (default `config.yaml`, skipped when absent) and `WHISPER_*` variables.
pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();

    let explicit = std::env::var("WHISPER_CONFIG").ok();
    let path = explicit.as_deref().unwrap_or(DEFAULT_CONFIG_FILE);

    let contents = if Path::new(path).exists() {
        Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path))?,
        )
    } else if explicit.is_some() {
        anyhow::bail!("config file {} does not exist", path);
    } else {
        tracing::warn!(path = %path, "config file does not exist, using environment only");
        None
    };

    let env: BTreeMap<String, String> = std::env::vars()
        .filter(|(k, _)| k.starts_with("WHISPER_"))
        .collect();

    from_sources(contents.as_deref(), |key| env.get(key).cloned())
}

/// Build a [`Config`] from YAML text and an environment lookup.
///
/// Scalar keys are overridden by `WHISPER_<KEY>`; a backend option `<name>`
/// by `WHISPER_STORAGE_CONFIG_<NAME>`.
pub fn from_sources(
    yaml: Option<&str>,
    env: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Config> {
    let file: FileConfig = match yaml {
        Some(text) if !text.trim().is_empty() => {
            serde_yaml::from_str(text).context("invalid config file")?
        }
        _ => FileConfig::default(),
    };

    let var = |key: &str| env(&format!("WHISPER_{}", key.to_uppercase()));

    let secret_key = var("secret_key")
        .or(file.secret_key)
        .filter(|k| !k.is_empty())
        .context("missing configuration parameter: secret_key")?;
    if secret_key.len() > MAX_SECRET_KEY_LEN {
        anyhow::bail!(
            "secret_key must be at most {} bytes, got {}",
            MAX_SECRET_KEY_LEN,
            secret_key.len()
        );
    }

    let storage_class: BackendKind = var("storage_class")
        .or(file.storage_class)
        .context("missing configuration parameter: storage_class")?
        .parse()?;

    let mut storage_config = BTreeMap::new();
    for (key, value) in file.storage_config {
        let value = scalar_to_string(&value)
            .with_context(|| format!("storage_config.{} must be a scalar", key))?;
        storage_config.insert(key, value);
    }
    for option in storage_class.schema() {
        if let Some(value) = var(&format!("storage_config_{}", option.name)) {
            storage_config.insert(option.name.to_string(), value);
        }
    }

    let storage_clean_interval = parse_override(&var, "storage_clean_interval")?
        .or(file.storage_clean_interval)
        .unwrap_or(900);
    if storage_clean_interval == 0 {
        anyhow::bail!("storage_clean_interval must be greater than zero");
    }

    let max_data_size_mb = parse_override(&var, "max_data_size_mb")?
        .or(file.max_data_size_mb)
        .unwrap_or(1);

    let app_listen_ip = var("app_listen_ip")
        .or(file.app_listen_ip)
        .unwrap_or_else(|| "0.0.0.0".into());
    let app_listen_ip: IpAddr = app_listen_ip
        .parse()
        .with_context(|| format!("invalid app_listen_ip: {}", app_listen_ip))?;

    let app_port = parse_override(&var, "app_port")?
        .or(file.app_port)
        .unwrap_or(5000);

    let bcrypt_cost = parse_override(&var, "bcrypt_cost")?
        .or(file.bcrypt_cost)
        .unwrap_or(DEFAULT_COST);
    if !(4..=31).contains(&bcrypt_cost) {
        anyhow::bail!("bcrypt_cost must be between 4 and 31, got {}", bcrypt_cost);
    }

    Ok(Config {
        secret_key,
        storage_class,
        storage_config,
        storage_clean_interval: Duration::from_secs(storage_clean_interval),
        max_data_size_mb,
        app_listen_ip,
        app_port,
        bcrypt_cost,
    })
}

fn parse_override<T>(var: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid WHISPER_{}: {}", key.to_uppercase(), e)),
        None => Ok(None),
    }
}

fn scalar_to_string(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        serde_yaml::Value::Null => Some(String::new()),
        _ => None,
    }
}
