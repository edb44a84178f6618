use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use tracing::{debug, info, warn};

use crate::{config::Config, fsutil::write_atomic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyType {
    Vmess,
    Vless,
    #[serde(rename = "ss", alias = "shadowsocks")]
    Shadowsocks,
    #[serde(rename = "ssr", alias = "shadowsocksr")]
    Shadowsocksr,
    Trojan,
    Hysteria,
    Hysteria2,
    Tuic,
    Wireguard,
}

impl ProxyType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vmess => "vmess",
            Self::Vless => "vless",
            Self::Shadowsocks => "ss",
            Self::Shadowsocksr => "ssr",
            Self::Trojan => "trojan",
            Self::Hysteria => "hysteria",
            Self::Hysteria2 => "hysteria2",
            Self::Tuic => "tuic",
            Self::Wireguard => "wireguard",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "vmess" => Some(Self::Vmess),
            "vless" => Some(Self::Vless),
            "ss" | "shadowsocks" => Some(Self::Shadowsocks),
            "ssr" | "shadowsocksr" => Some(Self::Shadowsocksr),
            "trojan" => Some(Self::Trojan),
            "hysteria" => Some(Self::Hysteria),
            "hysteria2" | "hy2" => Some(Self::Hysteria2),
            "tuic" => Some(Self::Tuic),
            "wireguard" | "wg" => Some(Self::Wireguard),
            _ => None,
        }
    }
}

/// One upstream node. `raw` is the node's full mapping from the subscription and is written
/// back into the generated config, with `name` trimmed and `type` in canonical form.
#[derive(Debug, Clone, PartialEq)]
pub struct ProxyNode {
    pub name: String,
    pub proxy_type: ProxyType,
    pub server: String,
    pub port: u16,
    pub raw: Mapping,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub nodes: Vec<ProxyNode>,
    pub fetched_at: DateTime<Utc>,
    pub source: String,
}

impl Subscription {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.nodes.iter().map(|n| n.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionError {
    MissingUrl,
    Request { message: String },
    Status { status: u16 },
    Parse { reason: String },
    MissingProxies,
    Empty,
    InvalidNode { index: usize, reason: String },
    DuplicateName { name: String },
    Io { path: PathBuf, message: String },
}

impl SubscriptionError {
    /// Network-level failures, as opposed to a document that arrived but is unusable.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Request { .. } | Self::Status { .. } | Self::Io { .. }
        )
    }
}

impl std::fmt::Display for SubscriptionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingUrl => write!(f, "subscription url is not configured"),
            Self::Request { message } => write!(f, "subscription request failed: {message}"),
            Self::Status { status } => {
                write!(f, "subscription server responded with status {status}")
            }
            Self::Parse { reason } => write!(f, "subscription is not valid yaml: {reason}"),
            Self::MissingProxies => write!(f, "subscription has no `proxies` list"),
            Self::Empty => write!(f, "subscription contains no usable proxy nodes"),
            Self::InvalidNode { index, reason } => {
                write!(f, "invalid proxy node at index {index}: {reason}")
            }
            Self::DuplicateName { name } => write!(f, "duplicate proxy node name: {name}"),
            Self::Io { path, message } => write!(f, "{}: {message}", path.display()),
        }
    }
}

impl std::error::Error for SubscriptionError {}

/// Parses a subscription document into validated nodes.
///
/// Nodes with a protocol outside [`ProxyType`] are dropped with a warning; any other
/// malformed node rejects the whole document.
pub fn parse_nodes(bytes: &[u8]) -> Result<Vec<ProxyNode>, SubscriptionError> {
    let doc: Value = serde_yaml::from_slice(bytes).map_err(|e| SubscriptionError::Parse {
        reason: e.to_string(),
    })?;

    let proxies = match doc.get("proxies") {
        None | Some(Value::Null) => return Err(SubscriptionError::MissingProxies),
        Some(Value::Sequence(seq)) => seq,
        Some(_) => {
            return Err(SubscriptionError::Parse {
                reason: "`proxies` is not a list".to_string(),
            });
        }
    };
    if proxies.is_empty() {
        return Err(SubscriptionError::Empty);
    }

    let mut seen: HashSet<String> = HashSet::new();
    let mut nodes = Vec::with_capacity(proxies.len());
    for (index, item) in proxies.iter().enumerate() {
        let Some(node) = parse_node(index, item)? else {
            continue;
        };
        if !seen.insert(node.name.clone()) {
            return Err(SubscriptionError::DuplicateName { name: node.name });
        }
        nodes.push(node);
    }

    if nodes.is_empty() {
        return Err(SubscriptionError::Empty);
    }
    Ok(nodes)
}

fn parse_node(index: usize, item: &Value) -> Result<Option<ProxyNode>, SubscriptionError> {
    let invalid = |reason: &str| SubscriptionError::InvalidNode {
        index,
        reason: reason.to_string(),
    };

    let raw = item
        .as_mapping()
        .ok_or_else(|| invalid("node is not a mapping"))?;

    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing or empty `name`"))?;

    let type_str = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing `type`"))?;
    let Some(proxy_type) = ProxyType::parse(type_str) else {
        warn!(
            node = name,
            proxy_type = type_str,
            "skipping node with unsupported type"
        );
        return Ok(None);
    };

    let server = raw
        .get("server")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| invalid("missing or empty `server`"))?;

    let port = match raw.get("port") {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse::<u64>().ok(),
        _ => None,
    }
    .filter(|p| (1..=u64::from(u16::MAX)).contains(p))
    .ok_or_else(|| invalid("missing or out-of-range `port`"))?;

    // The emitted proxy entry must carry the same identity the groups reference.
    let mut normalized = raw.clone();
    normalized.insert(Value::from("name"), Value::from(name));
    normalized.insert(Value::from("type"), Value::from(proxy_type.as_str()));

    Ok(Some(ProxyNode {
        name: name.to_string(),
        proxy_type,
        server: server.to_string(),
        port: port as u16,
        raw: normalized,
    }))
}

/// Reads a subscription previously stored by [`SubscriptionLoader::load`].
pub fn load_from_file(path: &Path) -> Result<Subscription, SubscriptionError> {
    let bytes = std::fs::read(path).map_err(|e| SubscriptionError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let nodes = parse_nodes(&bytes)?;
    let fetched_at = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());
    Ok(Subscription {
        nodes,
        fetched_at,
        source: path.display().to_string(),
    })
}

#[derive(Debug, Clone)]
pub struct SubscriptionLoaderOptions {
    pub attempts: u32,
    pub retry_delay: Duration,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl SubscriptionLoaderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.fetch_attempts,
            retry_delay: Duration::from_secs(config.fetch_retry_delay_secs),
            connect_timeout: Duration::from_secs(config.fetch_connect_timeout_secs),
            request_timeout: Duration::from_secs(config.fetch_timeout_secs),
            user_agent: config.subscription_user_agent.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionLoader {
    client: reqwest::Client,
    opts: SubscriptionLoaderOptions,
}

impl SubscriptionLoader {
    pub fn new(opts: SubscriptionLoaderOptions) -> Result<Self, SubscriptionError> {
        let client = reqwest::Client::builder()
            .user_agent(opts.user_agent.clone())
            .connect_timeout(opts.connect_timeout)
            .timeout(opts.request_timeout)
            .build()
            .map_err(|e| SubscriptionError::Request {
                message: e.to_string(),
            })?;
        Ok(Self { client, opts })
    }

    /// Fetches and validates the subscription at `url`, then atomically replaces `store_path`
    /// with the fetched document. Nothing is written unless validation passes.
    pub async fn load(
        &self,
        url: &str,
        store_path: &Path,
    ) -> Result<Subscription, SubscriptionError> {
        let body = self.fetch(url).await?;
        let nodes = parse_nodes(&body)?;

        write_atomic(store_path, &body).map_err(|e| SubscriptionError::Io {
            path: store_path.to_path_buf(),
            message: e.to_string(),
        })?;

        info!(
            nodes = nodes.len(),
            path = %store_path.display(),
            "subscription stored"
        );
        Ok(Subscription {
            nodes,
            fetched_at: Utc::now(),
            source: url.to_string(),
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, SubscriptionError> {
        let attempts = self.opts.attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.fetch_once(url).await {
                Ok(body) => {
                    debug!(attempt, bytes = body.len(), "subscription fetched");
                    return Ok(body);
                }
                Err(err) => {
                    warn!(attempt, attempts, error = %err, "subscription fetch failed");
                    last_err = Some(err);
                    if attempt < attempts {
                        tokio::time::sleep(self.opts.retry_delay).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(SubscriptionError::Request {
            message: "no attempt made".to_string(),
        }))
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, SubscriptionError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SubscriptionError::Request {
                message: e.to_string(),
            })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(SubscriptionError::Status {
                status: status.as_u16(),
            });
        }
        let bytes = resp.bytes().await.map_err(|e| SubscriptionError::Request {
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}
