use std::{sync::Arc, time::Duration};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::{net::TcpStream, sync::Semaphore, time::Instant};
use tracing::{debug, info, warn};

use crate::{config::Config, subscription::ProxyNode};

pub const DEFAULT_WORKERS: usize = 50;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub node_name: String,
    pub alive: bool,
    /// Time to TCP connection establishment. Present iff `alive`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u32>,
}

impl ProbeResult {
    fn alive(node_name: &str, delay_ms: u32) -> Self {
        Self {
            node_name: node_name.to_string(),
            alive: true,
            delay_ms: Some(delay_ms),
        }
    }

    fn dead(node_name: &str) -> Self {
        Self {
            node_name: node_name.to_string(),
            alive: false,
            delay_ms: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BestNode {
    pub name: String,
    pub delay_ms: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    NoReachableNode { total: usize },
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoReachableNode { total } => {
                write!(f, "no reachable node among {total} probed")
            }
        }
    }
}

impl std::error::Error for ProbeError {}

#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub workers: usize,
    pub timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ProbeOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            workers: config.probe_workers as usize,
            timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

/// Probes every node exactly once with at most `opts.workers` connections in flight.
///
/// Results come back in subscription order, one per node, regardless of completion order.
pub async fn probe_all(nodes: &[ProxyNode], opts: &ProbeOptions) -> Vec<ProbeResult> {
    let sem = Arc::new(Semaphore::new(opts.workers.max(1)));
    let mut tasks = Vec::with_capacity(nodes.len());

    for node in nodes {
        let permit = match sem.clone().acquire_owned().await {
            Ok(permit) => permit,
            // The semaphore is never closed.
            Err(_) => break,
        };
        let name = node.name.clone();
        let server = node.server.clone();
        let port = node.port;
        let timeout = opts.timeout;

        tasks.push(tokio::spawn(async move {
            let _permit = permit;
            probe_one(&name, &server, port, timeout).await
        }));
    }

    let mut results = Vec::with_capacity(nodes.len());
    for (node, joined) in nodes.iter().zip(join_all(tasks).await) {
        match joined {
            Ok(result) => results.push(result),
            Err(join_err) => {
                warn!(node = %node.name, %join_err, "probe task join error");
                results.push(ProbeResult::dead(&node.name));
            }
        }
    }

    let alive = results.iter().filter(|r| r.alive).count();
    info!(total = results.len(), alive, "probe run finished");
    results
}

async fn probe_one(name: &str, server: &str, port: u16, timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    // The stream is dropped (and the socket closed) on every branch below.
    match tokio::time::timeout(timeout, TcpStream::connect((server, port))).await {
        Ok(Ok(stream)) => {
            let elapsed_ms = started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32;
            drop(stream);
            debug!(node = name, delay_ms = elapsed_ms, "probe ok");
            ProbeResult::alive(name, elapsed_ms)
        }
        Ok(Err(err)) => {
            debug!(node = name, error = %err, "probe failed");
            ProbeResult::dead(name)
        }
        Err(_) => {
            debug!(node = name, timeout_ms = timeout.as_millis() as u64, "probe timed out");
            ProbeResult::dead(name)
        }
    }
}

/// Minimum delay among alive results; ties go to the earliest result.
pub fn select_best(results: &[ProbeResult]) -> Result<BestNode, ProbeError> {
    let mut best: Option<BestNode> = None;
    for result in results {
        let (true, Some(delay_ms)) = (result.alive, result.delay_ms) else {
            continue;
        };
        if best.as_ref().is_none_or(|b| delay_ms < b.delay_ms) {
            best = Some(BestNode {
                name: result.node_name.clone(),
                delay_ms,
            });
        }
    }
    best.ok_or(ProbeError::NoReachableNode {
        total: results.len(),
    })
}

/// Alive results by ascending delay (stable), followed by unreachable ones in input order.
pub fn rank(results: &[ProbeResult]) -> Vec<&ProbeResult> {
    let mut alive: Vec<&ProbeResult> = results.iter().filter(|r| r.alive).collect();
    alive.sort_by_key(|r| r.delay_ms.unwrap_or(u32::MAX));
    alive.extend(results.iter().filter(|r| !r.alive));
    alive
}
