use std::{collections::HashMap, path::Path, time::Duration};

use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::debug;

pub mod builder;

pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MihomoApiError {
    /// The controller could not be reached or did not answer in time.
    Transport { message: String },
    Status { status: u16, body: String },
    Decode { message: String },
    NotFound { name: String },
}

impl MihomoApiError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl std::fmt::Display for MihomoApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport { message } => write!(f, "mihomo controller unreachable: {message}"),
            Self::Status { status, body } => {
                write!(f, "mihomo controller responded with status {status}: {body}")
            }
            Self::Decode { message } => write!(f, "mihomo controller response decode: {message}"),
            Self::NotFound { name } => write!(f, "mihomo has no proxy or group named `{name}`"),
        }
    }
}

impl std::error::Error for MihomoApiError {}

impl From<reqwest::Error> for MihomoApiError {
    fn from(value: reqwest::Error) -> Self {
        if value.is_decode() {
            Self::Decode {
                message: value.to_string(),
            }
        } else {
            Self::Transport {
                message: value.to_string(),
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionInfo {
    pub version: String,
    #[serde(default)]
    pub meta: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyInfo {
    pub name: String,
    #[serde(rename = "type", default)]
    pub proxy_type: String,
    #[serde(default)]
    pub alive: Option<bool>,
    #[serde(default)]
    pub all: Option<Vec<String>>,
    #[serde(default)]
    pub now: Option<String>,
    #[serde(default)]
    pub history: Vec<DelayEntry>,
}

impl ProxyInfo {
    /// Delay of the most recent health check, 0 when there is none.
    pub fn last_delay(&self) -> u32 {
        self.history.last().and_then(|h| h.delay).unwrap_or(0)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DelayEntry {
    #[serde(default)]
    pub delay: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ProxiesResponse {
    proxies: HashMap<String, ProxyInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupMember {
    pub name: String,
    #[serde(rename = "type")]
    pub member_type: String,
    pub alive: bool,
    pub delay: u32,
    pub current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupView {
    pub group: String,
    pub current: Option<String>,
    pub total: usize,
    pub nodes: Vec<GroupMember>,
}

/// Client for the daemon's local REST control API.
#[derive(Debug, Clone)]
pub struct MihomoClient {
    base: Url,
    secret: Option<String>,
    client: reqwest::Client,
}

impl MihomoClient {
    pub fn new(base_url: &str, secret: &str) -> Result<Self, MihomoApiError> {
        let base = Url::parse(base_url).map_err(|e| MihomoApiError::Transport {
            message: format!("invalid controller url {base_url}: {e}"),
        })?;
        if base.cannot_be_a_base() {
            return Err(MihomoApiError::Transport {
                message: format!("invalid controller url {base_url}"),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            // The controller is always local; never route it through a proxy.
            .no_proxy()
            .build()?;
        Ok(Self {
            base,
            secret: (!secret.is_empty()).then(|| secret.to_string()),
            client,
        })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn request(&self, method: reqwest::Method, url: Url) -> reqwest::RequestBuilder {
        let req = self.client.request(method, url);
        match &self.secret {
            Some(secret) => req.bearer_auth(secret),
            None => req,
        }
    }

    pub async fn version(&self) -> Result<VersionInfo, MihomoApiError> {
        self.version_with_timeout(REQUEST_TIMEOUT).await
    }

    pub async fn version_with_timeout(
        &self,
        timeout: Duration,
    ) -> Result<VersionInfo, MihomoApiError> {
        let resp = self
            .request(reqwest::Method::GET, self.url(&["version"]))
            .timeout(timeout)
            .send()
            .await?;
        let resp = expect_status(resp, StatusCode::OK, "version").await?;
        Ok(resp.json::<VersionInfo>().await?)
    }

    /// Asks the daemon to load the config at `path`. Only `204 No Content` counts as success.
    pub async fn load_config(&self, path: &Path) -> Result<(), MihomoApiError> {
        let mut url = self.url(&["configs"]);
        url.query_pairs_mut().append_pair("force", "true");
        let body = serde_json::json!({ "path": path.display().to_string() });
        let resp = self
            .request(reqwest::Method::PUT, url)
            .json(&body)
            .send()
            .await?;
        expect_status(resp, StatusCode::NO_CONTENT, "configs").await?;
        debug!(path = %path.display(), "mihomo accepted config reload");
        Ok(())
    }

    pub async fn proxies(&self) -> Result<HashMap<String, ProxyInfo>, MihomoApiError> {
        let resp = self
            .request(reqwest::Method::GET, self.url(&["proxies"]))
            .send()
            .await?;
        let resp = expect_status(resp, StatusCode::OK, "proxies").await?;
        Ok(resp.json::<ProxiesResponse>().await?.proxies)
    }

    pub async fn get_proxy(&self, name: &str) -> Result<ProxyInfo, MihomoApiError> {
        let resp = self
            .request(reqwest::Method::GET, self.url(&["proxies", name]))
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(MihomoApiError::NotFound {
                name: name.to_string(),
            });
        }
        let resp = expect_status(resp, StatusCode::OK, name).await?;
        Ok(resp.json::<ProxyInfo>().await?)
    }

    /// Points select group `group` at member `name`.
    pub async fn select_proxy(&self, group: &str, name: &str) -> Result<(), MihomoApiError> {
        let body = serde_json::json!({ "name": name });
        let resp = self
            .request(reqwest::Method::PUT, self.url(&["proxies", group]))
            .json(&body)
            .send()
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(MihomoApiError::NotFound {
                name: group.to_string(),
            });
        }
        expect_status(resp, StatusCode::NO_CONTENT, group).await?;
        Ok(())
    }

    /// Members of `group` with their liveness and last measured delay.
    pub async fn list_group_nodes(&self, group: &str) -> Result<GroupView, MihomoApiError> {
        let all = self.proxies().await?;
        let info = all.get(group).ok_or_else(|| MihomoApiError::NotFound {
            name: group.to_string(),
        })?;
        let members = info.all.clone().unwrap_or_default();
        let current = info.now.clone();

        let nodes = members
            .into_iter()
            .map(|name| {
                let detail = all.get(&name);
                GroupMember {
                    member_type: detail
                        .map(|d| d.proxy_type.clone())
                        .unwrap_or_else(|| "Unknown".to_string()),
                    alive: detail.and_then(|d| d.alive).unwrap_or(false),
                    delay: detail.map(ProxyInfo::last_delay).unwrap_or(0),
                    current: current.as_deref() == Some(name.as_str()),
                    name,
                }
            })
            .collect::<Vec<_>>();

        Ok(GroupView {
            group: group.to_string(),
            current,
            total: nodes.len(),
            nodes,
        })
    }
}

async fn expect_status(
    resp: reqwest::Response,
    expected: StatusCode,
    what: &str,
) -> Result<reqwest::Response, MihomoApiError> {
    let status = resp.status();
    if status == expected {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    debug!(endpoint = what, status = status.as_u16(), %body, "unexpected mihomo response");
    Err(MihomoApiError::Status {
        status: status.as_u16(),
        body,
    })
}
