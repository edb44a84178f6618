use std::time::Duration;

use reqwest::StatusCode;
use tracing::{info, warn};

use crate::pipeline::StepOutcome;

/// Checks end-to-end connectivity by fetching `url` through the local mixed port.
/// Only `204 No Content` counts as success.
pub async fn verify_connectivity(proxy_url: &str, url: &str, timeout: Duration) -> StepOutcome {
    let proxy = match reqwest::Proxy::all(proxy_url) {
        Ok(proxy) => proxy,
        Err(err) => return StepOutcome::Advisory(format!("invalid proxy url {proxy_url}: {err}")),
    };
    let client = match reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .build()
    {
        Ok(client) => client,
        Err(err) => return StepOutcome::Advisory(format!("build verify client: {err}")),
    };

    match client.get(url).send().await {
        Ok(resp) if resp.status() == StatusCode::NO_CONTENT => {
            info!(url, "connectivity verified through mihomo");
            StepOutcome::Ok
        }
        Ok(resp) => {
            let status = resp.status().as_u16();
            warn!(url, status, "connectivity check returned unexpected status");
            StepOutcome::Advisory(format!("{url} returned status {status}, expected 204"))
        }
        Err(err) => {
            warn!(url, error = %err, "connectivity check failed");
            StepOutcome::Advisory(format!("{url} via {proxy_url}: {err}"))
        }
    }
}

pub fn local_proxy_url(mixed_port: u16) -> String {
    format!("http://127.0.0.1:{mixed_port}")
}
