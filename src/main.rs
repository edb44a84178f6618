use anyhow::Result;
use std::{sync::Arc, time::Duration};

use clap::Parser;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use mihomo_pilot::{
    config::{Cli, Command, Config},
    http::{AppState, build_router},
    job::{UpdateJobHandle, UpdateRunner, run_with_deadline},
    mihomo::MihomoClient,
    pipeline::{UpdatePipeline, synthesize},
    probe::{ProbeOptions, probe_all, rank, select_best},
    scheduler::spawn_update_scheduler,
    subscription::load_from_file,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let mut cli = Cli::parse();
    cli.config.absolutize_paths()?;
    let cmd = cli.command.clone().unwrap_or(Command::Run);

    match cmd {
        Command::Run => run_server(cli.config).await,
        Command::Update => run_update_once(cli.config).await,
        Command::Probe(args) => probe_stored(&cli.config, args.top).await,
        Command::Generate(args) => generate(&cli.config, args.best_node.as_deref()),
    }
}

fn mihomo_client(config: &Config) -> Result<MihomoClient> {
    MihomoClient::new(&config.api_base_url(), &config.api_secret)
        .map_err(|e| anyhow::anyhow!("mihomo client: {e}"))
}

fn update_pipeline(config: Arc<Config>) -> Result<UpdatePipeline> {
    let client = mihomo_client(&config)?;
    UpdatePipeline::from_config(config, client).map_err(|e| anyhow::anyhow!("{e}"))
}

async fn run_server(config: Config) -> Result<()> {
    let config = Arc::new(config);
    if config.subscription_url.is_none() {
        warn!("no subscription url configured; updates will fail until one is set");
    }

    let pipeline: Arc<dyn UpdateRunner> = Arc::new(update_pipeline(config.clone())?);
    let job = UpdateJobHandle::new(
        pipeline,
        Duration::from_secs(config.update_timeout_secs),
    );
    let _scheduler = config
        .update_interval()
        .map(|interval| spawn_update_scheduler(job.clone(), interval));

    let app = build_router(AppState {
        job,
        mihomo: mihomo_client(&config)?,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    info!(
        bind = %config.bind,
        data_dir = %config.data_dir.display(),
        mihomo_api = %config.api_base_url(),
        version = mihomo_pilot::version::VERSION,
        "starting mihomo-pilot"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn run_update_once(config: Config) -> Result<()> {
    let deadline = Duration::from_secs(config.update_timeout_secs);
    let pipeline: Arc<dyn UpdateRunner> = Arc::new(update_pipeline(Arc::new(config))?);

    let report = run_with_deadline(pipeline, deadline)
        .await
        .map_err(|e| anyhow::anyhow!("update failed: {e}"))?;
    for advisory in report.advisories() {
        warn!(%advisory, "update finished with advisory");
    }
    println!("{}", report.summary());
    Ok(())
}

async fn probe_stored(config: &Config, top: usize) -> Result<()> {
    let path = config.subscription_path();
    let subscription =
        load_from_file(&path).map_err(|e| anyhow::anyhow!("load subscription: {e}"))?;

    let results = probe_all(&subscription.nodes, &ProbeOptions::from_config(config)).await;
    let alive = results.iter().filter(|r| r.alive).count();
    eprintln!("{alive}/{} nodes reachable", results.len());
    for (i, result) in rank(&results).into_iter().filter(|r| r.alive).take(top).enumerate() {
        eprintln!(
            "{:>3}. {:>6} ms  {}",
            i + 1,
            result.delay_ms.unwrap_or_default(),
            result.node_name
        );
    }

    let best = select_best(&results).map_err(|e| anyhow::anyhow!("{e}"))?;
    println!("{}", best.name);
    Ok(())
}

fn generate(config: &Config, best_node: Option<&str>) -> Result<()> {
    let path = config.subscription_path();
    let subscription =
        load_from_file(&path).map_err(|e| anyhow::anyhow!("load subscription: {e}"))?;

    let best = match best_node {
        Some(name) => name.to_string(),
        None => subscription
            .names()
            .next()
            .map(str::to_string)
            .unwrap_or_default(),
    };
    let digest = synthesize(config, &subscription.nodes, &[], &best)
        .map_err(|e| anyhow::anyhow!("generate config: {e}"))?;
    eprintln!(
        "wrote {} ({} nodes, sha256 {digest})",
        config.generated_config_path().display(),
        subscription.nodes.len()
    );
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
