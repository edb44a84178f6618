use std::{net::SocketAddr, path::PathBuf, time::Duration};

use clap::{Args, Parser, Subcommand};

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceManager {
    None,
    Systemd,
    Openrc,
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "mihomo-pilot",
    about = "Keeps a local mihomo daemon on the fastest subscription node",
    version = crate::version::VERSION,
    disable_help_subcommand = true
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub config: Config,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the control-plane HTTP server (default).
    Run,

    /// Run the update pipeline once in the foreground.
    Update,

    /// Probe the stored subscription and print the fastest node.
    Probe(ProbeArgs),

    /// Regenerate the mihomo config from the stored subscription without probing.
    Generate(GenerateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ProbeArgs {
    #[arg(long, value_name = "N", default_value_t = 10)]
    pub top: usize,
}

#[derive(Args, Debug, Clone)]
pub struct GenerateArgs {
    #[arg(long = "best-node", value_name = "NAME")]
    pub best_node: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct Config {
    #[arg(
        long,
        global = true,
        env = "PILOT_BIND",
        value_name = "ADDR",
        default_value = "0.0.0.0:8900"
    )]
    pub bind: SocketAddr,

    #[arg(
        long = "subscription-url",
        global = true,
        env = "PILOT_SUBSCRIPTION_URL",
        value_name = "URL"
    )]
    pub subscription_url: Option<String>,

    #[arg(
        long = "subscription-user-agent",
        global = true,
        env = "PILOT_SUBSCRIPTION_USER_AGENT",
        value_name = "UA",
        default_value = "clash.meta"
    )]
    pub subscription_user_agent: String,

    #[arg(
        long = "fetch-attempts",
        global = true,
        env = "PILOT_FETCH_ATTEMPTS",
        value_name = "N",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    pub fetch_attempts: u32,

    #[arg(
        long = "fetch-retry-delay-secs",
        global = true,
        env = "PILOT_FETCH_RETRY_DELAY_SECS",
        value_name = "SECS",
        default_value_t = 5,
        value_parser = clap::value_parser!(u64).range(0..=300)
    )]
    pub fetch_retry_delay_secs: u64,

    #[arg(
        long = "fetch-connect-timeout-secs",
        global = true,
        env = "PILOT_FETCH_CONNECT_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub fetch_connect_timeout_secs: u64,

    #[arg(
        long = "fetch-timeout-secs",
        global = true,
        env = "PILOT_FETCH_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..=600)
    )]
    pub fetch_timeout_secs: u64,

    #[arg(
        long = "probe-workers",
        global = true,
        env = "PILOT_PROBE_WORKERS",
        value_name = "N",
        default_value_t = 50,
        value_parser = clap::value_parser!(u64).range(1..=512)
    )]
    pub probe_workers: u64,

    #[arg(
        long = "probe-timeout-secs",
        global = true,
        env = "PILOT_PROBE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(1..=30)
    )]
    pub probe_timeout_secs: u64,

    #[arg(
        long,
        global = true,
        env = "PILOT_DATA_DIR",
        value_name = "PATH",
        default_value = "./data"
    )]
    pub data_dir: PathBuf,

    #[arg(
        long = "mixed-port",
        global = true,
        env = "PILOT_MIXED_PORT",
        value_name = "PORT",
        default_value_t = 7893,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub mixed_port: u16,

    #[arg(
        long = "api-port",
        global = true,
        env = "PILOT_API_PORT",
        value_name = "PORT",
        default_value_t = 9090,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub api_port: u16,

    #[arg(
        long = "api-secret",
        global = true,
        env = "PILOT_API_SECRET",
        value_name = "SECRET",
        default_value = ""
    )]
    pub api_secret: String,

    #[arg(
        long = "service-manager",
        global = true,
        env = "PILOT_SERVICE_MANAGER",
        value_name = "MANAGER",
        default_value = "systemd",
        value_enum
    )]
    pub service_manager: ServiceManager,

    #[arg(
        long = "mihomo-systemd-unit",
        global = true,
        env = "PILOT_MIHOMO_SYSTEMD_UNIT",
        value_name = "UNIT",
        default_value = "mihomo.service"
    )]
    pub mihomo_systemd_unit: String,

    #[arg(
        long = "mihomo-openrc-service",
        global = true,
        env = "PILOT_MIHOMO_OPENRC_SERVICE",
        value_name = "NAME",
        default_value = "mihomo"
    )]
    pub mihomo_openrc_service: String,

    #[arg(
        long = "restart-settle-secs",
        global = true,
        env = "PILOT_RESTART_SETTLE_SECS",
        value_name = "SECS",
        default_value_t = 3,
        value_parser = clap::value_parser!(u64).range(0..=60)
    )]
    pub restart_settle_secs: u64,

    #[arg(
        long = "restart-timeout-secs",
        global = true,
        env = "PILOT_RESTART_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 15,
        value_parser = clap::value_parser!(u64).range(1..=120)
    )]
    pub restart_timeout_secs: u64,

    #[arg(
        long = "mihomo-bin",
        global = true,
        env = "PILOT_MIHOMO_BIN",
        value_name = "PATH",
        default_value = "/usr/local/bin/mihomo"
    )]
    pub mihomo_bin: PathBuf,

    #[arg(
        long = "launch-grace-secs",
        global = true,
        env = "PILOT_LAUNCH_GRACE_SECS",
        value_name = "SECS",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub launch_grace_secs: u64,

    #[arg(
        long = "publish-proxy-env",
        global = true,
        env = "PILOT_PUBLISH_PROXY_ENV",
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set,
        value_parser = clap::builder::BoolishValueParser::new()
    )]
    pub publish_proxy_env: bool,

    #[arg(
        long = "proxy-env-file",
        global = true,
        env = "PILOT_PROXY_ENV_FILE",
        value_name = "PATH",
        default_value = "/etc/profile.d/mihomo-proxy.sh"
    )]
    pub proxy_env_file: PathBuf,

    #[arg(
        long = "verify-url",
        global = true,
        env = "PILOT_VERIFY_URL",
        value_name = "URL",
        default_value = "http://www.gstatic.com/generate_204"
    )]
    pub verify_url: String,

    #[arg(
        long = "verify-timeout-secs",
        global = true,
        env = "PILOT_VERIFY_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 10,
        value_parser = clap::value_parser!(u64).range(1..=60)
    )]
    pub verify_timeout_secs: u64,

    #[arg(
        long = "update-timeout-secs",
        global = true,
        env = "PILOT_UPDATE_TIMEOUT_SECS",
        value_name = "SECS",
        default_value_t = 180,
        value_parser = clap::value_parser!(u64).range(30..=3600)
    )]
    pub update_timeout_secs: u64,

    #[arg(
        long = "update-interval-secs",
        global = true,
        env = "PILOT_UPDATE_INTERVAL_SECS",
        value_name = "SECS",
        default_value_t = 0
    )]
    pub update_interval_secs: u64,
}

impl Config {
    /// Resolves `data_dir` and `proxy_env_file` against the current directory. mihomo only
    /// accepts absolute paths in `PUT /configs`.
    pub fn absolutize_paths(&mut self) -> std::io::Result<()> {
        self.data_dir = std::path::absolute(&self.data_dir)?;
        self.proxy_env_file = std::path::absolute(&self.proxy_env_file)?;
        Ok(())
    }

    pub fn subscription_path(&self) -> PathBuf {
        self.data_dir.join("subscription.yaml")
    }

    pub fn generated_config_path(&self) -> PathBuf {
        self.data_dir.join("config.yaml")
    }

    pub fn mihomo_log_path(&self) -> PathBuf {
        self.data_dir.join("mihomo.log")
    }

    pub fn api_base_url(&self) -> String {
        format!("http://127.0.0.1:{}", self.api_port)
    }

    pub fn update_interval(&self) -> Option<Duration> {
        (self.update_interval_secs > 0).then(|| Duration::from_secs(self.update_interval_secs))
    }
}
