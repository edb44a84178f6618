use std::{
    future::Future,
    path::{Path, PathBuf},
    pin::Pin,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    config::{Config, ServiceManager},
    fsutil::is_executable,
    mihomo::{LIVENESS_TIMEOUT, MihomoClient},
};

const KILL_SETTLE: Duration = Duration::from_secs(1);
const SYSTEMCTL: &[&str] = &["/usr/bin/systemctl", "/bin/systemctl", "systemctl"];
const RC_SERVICE: &[&str] = &["/sbin/rc-service", "/usr/sbin/rc-service", "rc-service"];
const DOAS: &[&str] = &["/usr/bin/doas", "/bin/doas", "doas"];
const SUDO: &[&str] = &["/usr/bin/sudo", "/bin/sudo", "sudo"];
const PKILL: &[&str] = &["/usr/bin/pkill", "/bin/pkill", "pkill"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadTier {
    HotReload,
    ManagedRestart,
    DirectLaunch,
}

impl ReloadTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::HotReload => "hot_reload",
            Self::ManagedRestart => "managed_restart",
            Self::DirectLaunch => "direct_launch",
        }
    }
}

impl std::fmt::Display for ReloadTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ReloadFuture = Pin<Box<dyn Future<Output = Result<(), String>> + Send>>;

/// One way of getting the daemon to run a config file.
pub trait ReloadStrategy: Send + Sync {
    fn tier(&self) -> ReloadTier;
    fn attempt(&self, config_path: &Path) -> ReloadFuture;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadOutcome {
    pub tier: ReloadTier,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TierFailure {
    pub tier: ReloadTier,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadError {
    Exhausted { failures: Vec<TierFailure> },
}

impl std::fmt::Display for ReloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exhausted { failures } if failures.is_empty() => {
                write!(f, "no reload strategy is configured")
            }
            Self::Exhausted { failures } => {
                write!(f, "every reload tier failed")?;
                for failure in failures {
                    write!(f, "; {}: {}", failure.tier, failure.message)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ReloadError {}

/// Applies a config through the control API of an already running daemon.
#[derive(Debug, Clone)]
pub struct HotReload {
    client: MihomoClient,
    liveness_timeout: Duration,
}

impl HotReload {
    pub fn new(client: MihomoClient) -> Self {
        Self {
            client,
            liveness_timeout: LIVENESS_TIMEOUT,
        }
    }
}

impl ReloadStrategy for HotReload {
    fn tier(&self) -> ReloadTier {
        ReloadTier::HotReload
    }

    fn attempt(&self, config_path: &Path) -> ReloadFuture {
        let client = self.client.clone();
        let timeout = self.liveness_timeout;
        let config_path = config_path.to_path_buf();
        Box::pin(async move {
            let config_path = std::path::absolute(&config_path)
                .map_err(|e| format!("resolve {}: {e}", config_path.display()))?;
            let version = client
                .version_with_timeout(timeout)
                .await
                .map_err(|e| format!("liveness check failed: {e}"))?;
            debug!(version = %version.version, "mihomo is up; requesting config reload");
            client
                .load_config(&config_path)
                .await
                .map_err(|e| format!("config reload rejected: {e}"))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManagedService {
    Systemd { unit: String },
    Openrc { service: String },
}

/// Executable lookup lists, first existing entry wins.
#[derive(Debug, Clone)]
pub struct ServicePrograms {
    pub systemctl: Vec<String>,
    pub rc_service: Vec<String>,
    pub doas: Vec<String>,
    pub sudo: Vec<String>,
}

impl Default for ServicePrograms {
    fn default() -> Self {
        let owned = |list: &[&str]| list.iter().map(|s| s.to_string()).collect();
        Self {
            systemctl: owned(SYSTEMCTL),
            rc_service: owned(RC_SERVICE),
            doas: owned(DOAS),
            sudo: owned(SUDO),
        }
    }
}

/// Restarts the daemon through the host service manager.
#[derive(Debug, Clone)]
pub struct ManagedRestart {
    service: ManagedService,
    settle: Duration,
    command_timeout: Duration,
    programs: ServicePrograms,
}

impl ManagedRestart {
    pub fn new(service: ManagedService, settle: Duration, command_timeout: Duration) -> Self {
        Self {
            service,
            settle,
            command_timeout,
            programs: ServicePrograms::default(),
        }
    }

    pub fn with_programs(mut self, programs: ServicePrograms) -> Self {
        self.programs = programs;
        self
    }
}

impl ReloadStrategy for ManagedRestart {
    fn tier(&self) -> ReloadTier {
        ReloadTier::ManagedRestart
    }

    fn attempt(&self, _config_path: &Path) -> ReloadFuture {
        let this = self.clone();
        Box::pin(async move {
            match &this.service {
                ManagedService::Systemd { unit } => this.restart_systemd(unit).await,
                ManagedService::Openrc { service } => this.restart_openrc(service).await,
            }
        })
    }
}

impl ManagedRestart {
    async fn restart_systemd(&self, unit: &str) -> Result<(), String> {
        let systemctl = as_strs(&self.programs.systemctl);
        let timeout = self.command_timeout;

        run_command_with_timeout(&systemctl, &["cat", unit], timeout)
            .await
            .map_err(|details| format!("unit {unit} is not known to systemd: {details}"))?;
        run_command_with_timeout(&systemctl, &["restart", unit], timeout)
            .await
            .map_err(|details| format!("systemctl restart {unit}: {details}"))?;

        tokio::time::sleep(self.settle).await;

        run_command_with_timeout(&systemctl, &["is-active", "--quiet", unit], timeout)
            .await
            .map_err(|details| format!("unit {unit} is not active after restart: {details}"))
    }

    async fn restart_openrc(&self, service: &str) -> Result<(), String> {
        let rc_service = as_strs(&self.programs.rc_service);
        let timeout = self.command_timeout;

        run_command_with_timeout(&rc_service, &["--exists", service], timeout)
            .await
            .map_err(|details| format!("service {service} is not known to openrc: {details}"))?;

        let restarted = match run_command_with_timeout(&rc_service, &[service, "restart"], timeout)
            .await
        {
            Ok(()) => Ok(()),
            Err(direct) => {
                let rc = rc_service.first().copied().unwrap_or("rc-service");
                let elevated = ["-n", rc, service, "restart"];
                match run_command_with_timeout(&as_strs(&self.programs.doas), &elevated, timeout)
                    .await
                {
                    Ok(()) => Ok(()),
                    Err(_) => {
                        run_command_with_timeout(&as_strs(&self.programs.sudo), &elevated, timeout)
                            .await
                            .map_err(|sudo| format!("{direct}; doas/sudo: {sudo}"))
                    }
                }
            }
        };
        restarted.map_err(|details| format!("rc-service {service} restart: {details}"))?;

        tokio::time::sleep(self.settle).await;

        run_command_with_timeout(&rc_service, &[service, "status"], timeout)
            .await
            .map_err(|details| format!("service {service} is not running after restart: {details}"))
    }
}

/// Kills any running daemon and starts the binary directly, detached from this process.
#[derive(Debug, Clone)]
pub struct DirectLaunch {
    binary: PathBuf,
    data_dir: PathBuf,
    log_path: PathBuf,
    grace: Duration,
    kill_settle: Duration,
    kill_programs: Vec<String>,
}

impl DirectLaunch {
    pub fn new(binary: PathBuf, data_dir: PathBuf, log_path: PathBuf, grace: Duration) -> Self {
        Self {
            binary,
            data_dir,
            log_path,
            grace,
            kill_settle: KILL_SETTLE,
            kill_programs: PKILL.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_kill(mut self, programs: Vec<String>, settle: Duration) -> Self {
        self.kill_programs = programs;
        self.kill_settle = settle;
        self
    }

    async fn launch(&self, config_path: &Path) -> Result<(), String> {
        if !is_executable(&self.binary) {
            return Err(format!(
                "{} does not exist or is not executable",
                self.binary.display()
            ));
        }

        if let Some(process_name) = self.binary.file_name().and_then(|n| n.to_str()) {
            // pkill exits non-zero when nothing matched.
            if let Err(details) = run_command_with_timeout(
                &as_strs(&self.kill_programs),
                &["-9", "-x", process_name],
                Duration::from_secs(5),
            )
            .await
            {
                debug!(process_name, %details, "pkill did not kill anything");
            }
        }
        tokio::time::sleep(self.kill_settle).await;

        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| format!("create {}: {e}", self.data_dir.display()))?;
        let log = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(|e| format!("open {}: {e}", self.log_path.display()))?
            .into_std()
            .await;
        let log_err = log
            .try_clone()
            .map_err(|e| format!("open {}: {e}", self.log_path.display()))?;

        let mut cmd = tokio::process::Command::new(&self.binary);
        cmd.arg("-d")
            .arg(&self.data_dir)
            .arg("-f")
            .arg(config_path)
            .stdin(std::process::Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .kill_on_drop(false);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("spawn {}: {e}", self.binary.display()))?;
        let pid = child.id();

        tokio::time::sleep(self.grace).await;

        match child.try_wait() {
            Ok(None) => {
                info!(pid, binary = %self.binary.display(), "mihomo launched");
                Ok(())
            }
            Ok(Some(status)) => Err(format!(
                "{} exited during the grace period with {status}; see {}",
                self.binary.display(),
                self.log_path.display()
            )),
            Err(e) => Err(format!("wait for {}: {e}", self.binary.display())),
        }
    }
}

impl ReloadStrategy for DirectLaunch {
    fn tier(&self) -> ReloadTier {
        ReloadTier::DirectLaunch
    }

    fn attempt(&self, config_path: &Path) -> ReloadFuture {
        let this = self.clone();
        let config_path = config_path.to_path_buf();
        Box::pin(async move { this.launch(&config_path).await })
    }
}

/// Tries each strategy in order, at most once each, stopping at the first success.
#[derive(Clone)]
pub struct ReloadOrchestrator {
    strategies: Vec<Arc<dyn ReloadStrategy>>,
}

impl ReloadOrchestrator {
    pub fn new(strategies: Vec<Arc<dyn ReloadStrategy>>) -> Self {
        Self { strategies }
    }

    pub fn from_config(config: &Config, client: MihomoClient) -> Self {
        let mut strategies: Vec<Arc<dyn ReloadStrategy>> = vec![Arc::new(HotReload::new(client))];

        let settle = Duration::from_secs(config.restart_settle_secs);
        let timeout = Duration::from_secs(config.restart_timeout_secs);
        match config.service_manager {
            ServiceManager::None => {}
            ServiceManager::Systemd => strategies.push(Arc::new(ManagedRestart::new(
                ManagedService::Systemd {
                    unit: config.mihomo_systemd_unit.clone(),
                },
                settle,
                timeout,
            ))),
            ServiceManager::Openrc => strategies.push(Arc::new(ManagedRestart::new(
                ManagedService::Openrc {
                    service: config.mihomo_openrc_service.clone(),
                },
                settle,
                timeout,
            ))),
        }

        strategies.push(Arc::new(DirectLaunch::new(
            config.mihomo_bin.clone(),
            config.data_dir.clone(),
            config.mihomo_log_path(),
            Duration::from_secs(config.launch_grace_secs),
        )));
        Self::new(strategies)
    }

    #[cfg(test)]
    pub fn tiers(&self) -> Vec<ReloadTier> {
        self.strategies.iter().map(|s| s.tier()).collect()
    }

    pub async fn reload(&self, config_path: &Path) -> Result<ReloadOutcome, ReloadError> {
        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let tier = strategy.tier();
            match strategy.attempt(config_path).await {
                Ok(()) => {
                    info!(%tier, path = %config_path.display(), "mihomo config applied");
                    return Ok(ReloadOutcome { tier });
                }
                Err(message) => {
                    warn!(%tier, error = %message, "reload tier failed");
                    failures.push(TierFailure { tier, message });
                }
            }
        }
        Err(ReloadError::Exhausted { failures })
    }
}

fn as_strs(list: &[String]) -> Vec<&str> {
    list.iter().map(String::as_str).collect()
}

async fn run_command_with_timeout(
    programs: &[&str],
    args: &[&str],
    timeout: Duration,
) -> Result<(), String> {
    for program in programs {
        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::null());
        cmd.stderr(std::process::Stdio::null());
        cmd.kill_on_drop(true);

        let status = match tokio::time::timeout(timeout, cmd.status()).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Ok(Err(err)) => return Err(format!("spawn {program}: {err}")),
            Err(_) => return Err(format!("timeout running {program}")),
        };

        if status.success() {
            return Ok(());
        }
        return Err(format!("{program} exited with {status}"));
    }

    Err("no matching program found".to_string())
}
