use crate::image_reference::has_registry_domain;
use crate::secret_string::SecretString;
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub webserver: Webserver,
    pub mirror: MirrorConfig,
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub kubernetes: KubernetesConfig,
}

#[derive(Debug, Deserialize)]
pub struct Webserver {
    pub port: u16,
    pub tls: Option<Tls>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tls {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorConfig {
    /// Mirror host plus optional project path, e.g. `demo.goharbor.io/library`
    pub registry: String,
    #[serde(default = "default_tag")]
    pub default_tag: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsConfig {
    /// Key of the entry in the docker config `auths` map
    pub registry_url: String,
    pub username: String,
    pub password: SecretString,
    pub email_domain: String,
    #[serde(default = "default_owner")]
    pub owner: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

impl KubernetesConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_owner() -> String {
    "tars".to_string()
}

fn default_timeout_seconds() -> u64 {
    5
}

impl Config {
    /// Rejects values that would break the mutation invariants at request time.
    pub fn validate(&self) -> Result<()> {
        let registry = self.mirror.registry.trim_end_matches('/');
        if !has_registry_domain(&format!("{}/", registry)) {
            bail!(
                "Mirror registry {} must start with a dotted host name, e.g. mirror.example.com/library",
                self.mirror.registry
            );
        }
        if self.mirror.default_tag.is_empty() {
            bail!("mirror.defaultTag must not be empty");
        }
        if self.credentials.username.is_empty() {
            bail!("credentials.username must not be empty");
        }
        if self.credentials.password.is_empty() {
            bail!("credentials.password must not be empty");
        }
        if self.credentials.registry_url.is_empty() {
            bail!("credentials.registryUrl must not be empty");
        }
        if self.kubernetes.timeout_seconds == 0 {
            bail!("kubernetes.timeoutSeconds must be greater than zero");
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config: Config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;
    config.validate().context("Invalid configuration")?;

    info!(
        "Mirroring images through {} with default tag {}",
        config.mirror.registry, config.mirror.default_tag
    );
    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming every variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing = Vec::new();
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.push(var_name.to_string());
            String::new()
        })
    });

    if !missing.is_empty() {
        bail!("Missing environment variable: {}", missing.join(", "));
    }

    Ok(result.into_owned())
}
