use std::{path::PathBuf, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::time::Instant;
use tracing::info;

use crate::{
    config::Config,
    mihomo::{
        MihomoClient,
        builder::{ConfigError, ConfigParams, build_config, digest, render, validate_references, write_config},
    },
    probe::{ProbeError, ProbeOptions, ProbeResult, probe_all, select_best},
    proxy_env,
    reload::{ReloadError, ReloadOrchestrator, ReloadTier},
    subscription::{ProxyNode, SubscriptionError, SubscriptionLoader, SubscriptionLoaderOptions},
    verify::{local_proxy_url, verify_connectivity},
};

/// Result of a step whose failure never fails the update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Ok,
    Skipped,
    Advisory(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transport,
    Validation,
    Selection,
    Reload,
}

impl ErrorClass {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transport => "transport",
            Self::Validation => "validation",
            Self::Selection => "selection",
            Self::Reload => "reload",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    Subscription(SubscriptionError),
    Probe(ProbeError),
    Config(ConfigError),
    Reload(ReloadError),
    DeadlineExceeded { secs: u64 },
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Subscription(e) if e.is_transport() => ErrorClass::Transport,
            Self::Subscription(_) => ErrorClass::Validation,
            Self::Probe(_) => ErrorClass::Selection,
            Self::Config(ConfigError::Io { .. }) => ErrorClass::Transport,
            Self::Config(_) => ErrorClass::Validation,
            Self::Reload(_) => ErrorClass::Reload,
            Self::DeadlineExceeded { .. } => ErrorClass::Transport,
        }
    }
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscription(e) => write!(f, "subscription: {e}"),
            Self::Probe(e) => write!(f, "probe: {e}"),
            Self::Config(e) => write!(f, "config: {e}"),
            Self::Reload(e) => write!(f, "reload: {e}"),
            Self::DeadlineExceeded { secs } => write!(f, "update did not finish within {secs}s"),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<SubscriptionError> for PipelineError {
    fn from(value: SubscriptionError) -> Self {
        Self::Subscription(value)
    }
}

impl From<ProbeError> for PipelineError {
    fn from(value: ProbeError) -> Self {
        Self::Probe(value)
    }
}

impl From<ConfigError> for PipelineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<ReloadError> for PipelineError {
    fn from(value: ReloadError) -> Self {
        Self::Reload(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    pub nodes: usize,
    pub alive: usize,
    pub best_node: String,
    pub best_delay_ms: u32,
    pub config_path: PathBuf,
    pub config_digest: String,
    pub reload_tier: ReloadTier,
    pub proxy_env: StepOutcome,
    pub verify: StepOutcome,
    pub duration_ms: u64,
}

impl UpdateReport {
    pub fn summary(&self) -> String {
        format!(
            "applied via {}; best node {} ({} ms); {}/{} nodes alive",
            self.reload_tier, self.best_node, self.best_delay_ms, self.alive, self.nodes
        )
    }

    pub fn advisories(&self) -> Vec<&str> {
        [&self.proxy_env, &self.verify]
            .into_iter()
            .filter_map(|step| match step {
                StepOutcome::Advisory(msg) => Some(msg.as_str()),
                StepOutcome::Ok | StepOutcome::Skipped => None,
            })
            .collect()
    }
}

pub fn config_params(config: &Config) -> ConfigParams {
    ConfigParams {
        mixed_port: config.mixed_port,
        api_port: config.api_port,
        secret: config.api_secret.clone(),
    }
}

/// Builds, checks and atomically writes the mihomo config. Returns the SHA-256 of what was
/// written.
pub fn synthesize(
    config: &Config,
    nodes: &[ProxyNode],
    results: &[ProbeResult],
    best: &str,
) -> Result<String, ConfigError> {
    let generated = build_config(nodes, results, best, &config_params(config))?;
    validate_references(&generated)?;
    let rendered = render(&generated)?;
    let config_digest = digest(&rendered);

    let path = config.generated_config_path();
    write_config(&path, &rendered)?;
    info!(
        path = %path.display(),
        digest = %config_digest,
        proxies = generated.proxies.len(),
        "mihomo config written"
    );
    Ok(config_digest)
}

/// The update-and-reload sequence: fetch, probe, select, synthesize, reload, publish, verify.
#[derive(Clone)]
pub struct UpdatePipeline {
    config: Arc<Config>,
    loader: SubscriptionLoader,
    reload: ReloadOrchestrator,
}

impl UpdatePipeline {
    pub fn new(config: Arc<Config>, loader: SubscriptionLoader, reload: ReloadOrchestrator) -> Self {
        Self {
            config,
            loader,
            reload,
        }
    }

    pub fn from_config(config: Arc<Config>, client: MihomoClient) -> Result<Self, PipelineError> {
        let loader = SubscriptionLoader::new(SubscriptionLoaderOptions::from_config(&config))?;
        let reload = ReloadOrchestrator::from_config(&config, client);
        Ok(Self::new(config, loader, reload))
    }

    pub async fn run(&self) -> Result<UpdateReport, PipelineError> {
        let started = Instant::now();
        let config = &self.config;

        let url = config
            .subscription_url
            .as_deref()
            .ok_or(SubscriptionError::MissingUrl)?;
        let subscription = self.loader.load(url, &config.subscription_path()).await?;

        let results = probe_all(&subscription.nodes, &ProbeOptions::from_config(config)).await;
        let alive = results.iter().filter(|r| r.alive).count();
        let best = select_best(&results)?;
        info!(best_node = %best.name, delay_ms = best.delay_ms, alive, "best node selected");

        let config_digest = synthesize(config, &subscription.nodes, &results, &best.name)?;

        let config_path = config.generated_config_path();
        let outcome = self.reload.reload(&config_path).await?;

        let proxy_env = if config.publish_proxy_env {
            proxy_env::publish(&config.proxy_env_file, config.mixed_port)
        } else {
            StepOutcome::Skipped
        };

        let verify = verify_connectivity(
            &local_proxy_url(config.mixed_port),
            &config.verify_url,
            Duration::from_secs(config.verify_timeout_secs),
        )
        .await;

        Ok(UpdateReport {
            nodes: subscription.nodes.len(),
            alive,
            best_node: best.name,
            best_delay_ms: best.delay_ms,
            config_path,
            config_digest,
            reload_tier: outcome.tier,
            proxy_env,
            verify,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}
