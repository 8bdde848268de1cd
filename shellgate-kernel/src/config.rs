/**
 * CONFIGURATION KERNEL - kernel.yaml
 *
 * Chemin : `SHELLGATE_KERNEL_CONFIG` (défaut `kernel.yaml`), après chargement
 * du `.env` par dotenvy. Fichier absent, illisible ou sans section
 * `security` : le kernel refuse de démarrer.
 *
 * La clé API peut aussi venir de `SHELLGATE_API_KEY` (prioritaire).
 */

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shellgate_shared::SecurityPolicy;
use std::path::Path;
use tokio::fs;

use crate::dispatcher::DispatchConfig;
use crate::registry::RegistryConfig;

pub const CONFIG_ENV: &str = "SHELLGATE_KERNEL_CONFIG";
pub const API_KEY_ENV: &str = "SHELLGATE_API_KEY";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub security: SecurityPolicy,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Devices connectés au démarrage
    #[serde(default)]
    pub devices: Vec<DeviceConf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConf {
    pub id: String,
    pub address: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl KernelConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self> {
        serde_yaml::from_str(txt).context("invalid kernel config")
    }

    /// Clé API effective : variable d'environnement, sinon fichier ; vide = absente
    pub fn resolved_api_key(&self) -> Option<String> {
        std::env::var(API_KEY_ENV)
            .ok()
            .or_else(|| self.api_key.clone())
            .filter(|k| !k.is_empty())
    }
}

pub async fn load_config() -> Result<KernelConfig> {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| "kernel.yaml".into());
    load_config_from(Path::new(&path)).await
}

pub async fn load_config_from(path: &Path) -> Result<KernelConfig> {
    let txt = fs::read_to_string(path)
        .await
        .with_context(|| format!("cannot read kernel config {}", path.display()))?;
    KernelConfig::from_yaml_str(&txt).with_context(|| format!("in {}", path.display()))
}
