//! Configuration loading.
//!
//! Defaults < YAML file < environment. Environment variables are prefixed
//! `QUARRY_` and nest with `__`, e.g. `QUARRY_CACHE__ORG_BUDGET_BYTES=1024`.

use clap::Parser;
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::cache::CacheConfig;
use crate::connectors::Dataset;
use crate::orchestrator::PipelineConfig;
use crate::sandbox::SandboxConfig;
use crate::selector::DEFAULT_BASELINE_MODEL;
use crate::worker::WorkerConfig;

#[derive(Debug, Parser)]
#[command(name = "quarry", about = "Natural-language data analysis orchestrator")]
pub struct Args {
    /// Path to the YAML configuration file.
    #[arg(short = 'f', long = "config", env = "QUARRY_CONFIG")]
    pub config: Option<String>,

    /// Load and validate the configuration, then exit.
    #[arg(long)]
    pub validate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub pipeline: PipelineConfig,
    pub worker: WorkerConfig,
    pub cache: CacheConfig,
    pub sandbox: SandboxConfig,
    pub selection: SelectionConfig,
    pub providers: ProvidersConfig,
    /// Datasets registered at startup.
    pub datasets: Vec<Dataset>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SelectionConfig {
    /// The model selection falls back to when nothing else is available.
    pub baseline_model: String,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            baseline_model: DEFAULT_BASELINE_MODEL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ProvidersConfig {
    pub openai: ProviderEndpoint,
    pub anthropic: ProviderEndpoint,
    pub gateway: ProviderEndpoint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub api_key: String,
    #[serde(with = "humantime_serde")]
    pub timeout: std::time::Duration,
}

impl Default for ProviderEndpoint {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout: std::time::Duration::from_secs(120),
        }
    }
}

impl Config {
    /// Load configuration from defaults, an optional YAML file, and the
    /// environment.
    pub fn load(path: Option<&str>) -> figment::error::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        figment
            .merge(Env::prefixed("QUARRY_").split("__"))
            .extract()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_without_a_file() {
        figment::Jail::expect_with(|_| {
            let config = Config::load(None).expect("defaults should load");
            assert_eq!(config.pipeline.min_query_chars, 10);
            assert_eq!(config.pipeline.max_query_chars, 5000);
            assert_eq!(config.selection.baseline_model, DEFAULT_BASELINE_MODEL);
            assert!(config.cache.enabled);
            Ok(())
        });
    }

    #[test]
    fn yaml_and_env_override_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "quarry.yaml",
                r#"
worker:
  max_concurrent_requests: 8
cache:
  org_budget_bytes: 2048
"#,
            )?;
            jail.set_env("QUARRY_PIPELINE__MAX_PLAN_STEPS", "3");

            let config = Config::load(Some("quarry.yaml")).expect("config should load");
            assert_eq!(config.worker.max_concurrent_requests, 8);
            assert_eq!(config.cache.org_budget_bytes, 2048);
            assert_eq!(config.pipeline.max_plan_steps, 3);
            // Untouched values keep their defaults.
            assert_eq!(config.worker.claim_batch_size, 10);
            Ok(())
        });
    }

    #[test]
    fn unknown_fields_are_rejected() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "quarry.yaml",
                r#"
pipeline:
  not_a_real_knob: 1
"#,
            )?;
            assert!(Config::load(Some("quarry.yaml")).is_err());
            Ok(())
        });
    }
}
