use crate::queue::RateLimit;
use anyhow::{Context, Result, bail};
use regex::Regex;
use serde::Deserialize;
use std::time::Duration;
use std::{env, fs, path::Path};
use tracing::info;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub prefetch: Prefetch,
    pub workloads: Workloads,
    pub workers: Workers,
    pub queue: Queue,
    #[serde(rename = "resyncSchedule")]
    pub resync_schedule: ResyncSchedule,
    pub webserver: Webserver,
}

/// Identity and image of the managed DaemonSet.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Prefetch {
    pub namespace: String,
    pub name: String,
    pub image: String,
}

impl Default for Prefetch {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            name: "kube-image-prefetch".to_string(),
            image: "averagemarcus/kube-image-prefetch:latest".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
    DaemonSet,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Workloads {
    pub kinds: Vec<WorkloadKind>,
    /// Restricts the watch to a single namespace, all namespaces when unset.
    pub namespace: Option<String>,
}

impl Default for Workloads {
    fn default() -> Self {
        Self {
            kinds: vec![WorkloadKind::Deployment],
            namespace: None,
        }
    }
}

/// Number of reconciler tasks per workload kind.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(transparent)]
pub struct Workers(pub usize);

impl Default for Workers {
    fn default() -> Self {
        Workers(2)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Queue {
    pub max_attempts: u32,
    pub base_delay_millis: u64,
    pub max_delay_seconds: u64,
}

impl Default for Queue {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_millis: 5,
            max_delay_seconds: 1000,
        }
    }
}

impl Queue {
    pub fn rate_limit(&self) -> RateLimit {
        RateLimit {
            base_delay: Duration::from_millis(self.base_delay_millis),
            max_delay: Duration::from_secs(self.max_delay_seconds),
            max_attempts: self.max_attempts,
        }
    }
}

/// Cron expression (with seconds) for the periodic full resync, `~` disables it.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct ResyncSchedule(pub Option<String>);

impl Default for ResyncSchedule {
    fn default() -> Self {
        ResyncSchedule(Some("0 */15 * * * *".to_string()))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Webserver {
    pub port: u16,
}

impl Default for Webserver {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    info!("Loading config from file {}", path.as_ref().display());
    let yaml_str = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

    let expanded = expand_env_vars(&yaml_str)?;

    let config = serde_yaml_ng::from_str(&expanded)
        .context("Failed to parse YAML config after environment variable expansion")?;

    Ok(config)
}

/// Replaces `${VAR}` placeholders with environment variables values.
/// Returns an error naming the first variable that is not set.
fn expand_env_vars(input: &str) -> Result<String> {
    let re =
        Regex::new(r"\$\{([^}]+)}").context("Invalid regex pattern for env var substitution")?;

    let mut missing: Option<String> = None;
    let result = re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        env::var(var_name).unwrap_or_else(|_| {
            missing.get_or_insert_with(|| var_name.to_string());
            String::new()
        })
    });

    if let Some(var_name) = missing {
        bail!("Missing environment variable: {}", var_name);
    }
    Ok(result.into_owned())
}
