//! Config resolver (C8): a unified view over defaults, config file, and
//! environment variables.
//!
//! Shaped like `clawnode::config::NodeConfig` — a plain struct with
//! `serde(default = "...")` per-field defaults and a `Default` impl for the
//! baseline — but the teacher loads exactly one JSON path with no
//! layering; this resolver genuinely merges three sources, highest
//! priority first: environment, file (YAML), defaults.

#![forbid(unsafe_code)]

use morpheus_core::{MorpheusError, MorpheusResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MorpheusConfig {
    pub hetzner_api_token: Option<String>,
    pub hetzner_dns_token: Option<String>,
    #[serde(default = "default_provider")]
    pub machine_provider: String,
    #[serde(default = "default_server_type")]
    pub server_type: String,
    #[serde(default)]
    pub server_type_fallback: Vec<String>,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_location")]
    pub location: String,
    #[serde(default = "default_ssh_key_name")]
    pub ssh_key_name: String,
    pub ssh_key_path: Option<PathBuf>,
    #[serde(default)]
    pub ipv4_enabled: bool,
    pub dns_domain: Option<String>,
    pub registry_path: Option<PathBuf>,
}

fn default_provider() -> String {
    "hetzner".to_string()
}

fn default_server_type() -> String {
    "cx22".to_string()
}

fn default_image() -> String {
    "ubuntu-24.04".to_string()
}

fn default_location() -> String {
    "fsn1".to_string()
}

fn default_ssh_key_name() -> String {
    "morpheus".to_string()
}

impl Default for MorpheusConfig {
    fn default() -> Self {
        Self {
            hetzner_api_token: None,
            hetzner_dns_token: None,
            machine_provider: default_provider(),
            server_type: default_server_type(),
            server_type_fallback: Vec::new(),
            image: default_image(),
            location: default_location(),
            ssh_key_name: default_ssh_key_name(),
            ssh_key_path: None,
            ipv4_enabled: false,
            dns_domain: None,
            registry_path: None,
        }
    }
}

impl MorpheusConfig {
    pub fn dns_token(&self) -> Option<&str> {
        self.hetzner_dns_token
            .as_deref()
            .or(self.hetzner_api_token.as_deref())
    }

    /// The exact file the registry reads and writes, honoring `registry_path`
    /// verbatim when set, else `$HOME/.morpheus/registry.json`.
    pub fn resolved_registry_path(&self) -> MorpheusResult<PathBuf> {
        if let Some(path) = &self.registry_path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| MorpheusError::ConfigInvalid("could not determine home directory".into()))?;
        Ok(home.join(".morpheus").join("registry.json"))
    }

    /// Fatal validation per spec.md §4.8: a missing cloud token when the
    /// provider is `hetzner` fails at load time, not later.
    pub fn validate(&self) -> MorpheusResult<()> {
        if self.machine_provider != "hetzner" {
            return Err(MorpheusError::ConfigInvalid(format!(
                "unsupported machine_provider: {} (only \"hetzner\" is supported)",
                self.machine_provider
            )));
        }
        if self.hetzner_api_token.is_none() {
            return Err(MorpheusError::ConfigInvalid(
                "hetzner_api_token is required when machine_provider is \"hetzner\"".into(),
            ));
        }
        Ok(())
    }

    /// Renders secrets redacted: first four and last four characters only.
    pub fn display_redacted(&self) -> String {
        format!(
            "MorpheusConfig {{ provider: {}, server_type: {}, location: {}, hetzner_api_token: {}, hetzner_dns_token: {} }}",
            self.machine_provider,
            self.server_type,
            self.location,
            redact(self.hetzner_api_token.as_deref()),
            redact(self.hetzner_dns_token.as_deref()),
        )
    }
}

fn redact(token: Option<&str>) -> String {
    match token {
        None => "<unset>".to_string(),
        Some(t) if t.len() <= 8 => "****".to_string(),
        Some(t) => format!("{}...{}", &t[..4], &t[t.len() - 4..]),
    }
}

const SEARCH_PATHS: [&str; 1] = ["./config.yaml"];

fn config_search_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = SEARCH_PATHS.iter().map(PathBuf::from).collect();
    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".morpheus").join("config.yaml"));
    }
    paths.push(PathBuf::from("/etc/morpheus/config.yaml"));
    paths
}

fn find_config_file() -> Option<PathBuf> {
    config_search_paths().into_iter().find(|p| p.is_file())
}

fn load_file_layer(path: &Path) -> MorpheusResult<serde_yaml::Value> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| MorpheusError::ConfigInvalid(format!("failed to read {}: {e}", path.display())))?;
    serde_yaml::from_str(&contents)
        .map_err(|e| MorpheusError::ConfigInvalid(format!("failed to parse {}: {e}", path.display())))
}

fn env_layer() -> serde_yaml::Value {
    let mut map = serde_yaml::Mapping::new();
    if let Ok(v) = std::env::var("HETZNER_API_TOKEN") {
        map.insert("hetzner_api_token".into(), v.into());
    }
    if let Ok(v) = std::env::var("HETZNER_DNS_TOKEN") {
        map.insert("hetzner_dns_token".into(), v.into());
    }
    serde_yaml::Value::Mapping(map)
}

/// Merges `overlay` on top of `base`, mapping key by mapping key; scalar
/// values in `overlay` win outright.
fn merge(base: serde_yaml::Value, overlay: serde_yaml::Value) -> serde_yaml::Value {
    match (base, overlay) {
        (serde_yaml::Value::Mapping(mut base_map), serde_yaml::Value::Mapping(overlay_map)) => {
            for (k, v) in overlay_map {
                base_map.insert(k, v);
            }
            serde_yaml::Value::Mapping(base_map)
        }
        (_, overlay) => overlay,
    }
}

/// Resolves config from environment, file search path, then defaults —
/// environment wins, defaults lose.
pub fn resolve() -> MorpheusResult<MorpheusConfig> {
    let defaults = serde_yaml::to_value(MorpheusConfig::default())
        .map_err(|e| MorpheusError::ConfigInvalid(e.to_string()))?;

    let file_layer = match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config file");
            load_file_layer(&path)?
        }
        None => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
    };

    let merged = merge(merge(defaults, file_layer), env_layer());

    let config: MorpheusConfig = serde_yaml::from_value(merged)
        .map_err(|e| MorpheusError::ConfigInvalid(format!("failed to assemble config: {e}")))?;
    config.validate()?;
    Ok(config)
}
