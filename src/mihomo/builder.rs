use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use serde::{Serialize, Serializer};
use serde_yaml::{Mapping, Value};
use sha2::{Digest as _, Sha256};
use tracing::warn;

use crate::{
    fsutil::write_atomic,
    probe::{ProbeResult, rank},
    subscription::ProxyNode,
};

pub const GROUP_PROXY: &str = "Proxy";
pub const GROUP_AUTO: &str = "Auto";
pub const GROUP_FALLBACK: &str = "Fallback";
pub const POLICY_DIRECT: &str = "DIRECT";
pub const POLICY_REJECT: &str = "REJECT";

pub const HEALTH_CHECK_URL: &str = "http://www.gstatic.com/generate_204";
const GROUP_INTERVAL_SECS: u32 = 300;
const AUTO_TOLERANCE_MS: u32 = 50;

const FILE_HEADER: &str = "# mihomo config generated by mihomo-pilot; manual edits are overwritten\n";

const GEOX_BASE: &str = "https://github.com/MetaCubeX/meta-rules-dat/releases/latest/download";

const FAKE_IP_FILTER: &[&str] = &[
    "*.lan",
    "*.local",
    "localhost.ptlogin2.qq.com",
    "+.stun.*.*",
    "+.stun.*.*.*",
    "+.stun.*.*.*.*",
    "*.n.n.srv.nintendo.net",
    "+.stun.playstation.net",
    "xbox.*.*.microsoft.com",
    "*.*.xboxlive.com",
    "*.msftncsi.com",
    "*.msftconnecttest.com",
];
const DEFAULT_NAMESERVERS: &[&str] = &["223.5.5.5", "119.29.29.29"];
const DOH_NAMESERVERS: &[&str] = &[
    "https://doh.pub/dns-query",
    "https://dns.alidns.com/dns-query",
];
const FALLBACK_NAMESERVERS: &[&str] = &[
    "https://1.1.1.1/dns-query",
    "https://dns.google/dns-query",
    "tls://8.8.8.8:853",
];

// Sites routed through `Proxy` ahead of the catch-all.
const PROXIED_GEOSITES: &[&str] = &["google", "github", "twitter", "telegram", "youtube"];

#[derive(Debug, Clone)]
pub struct ConfigParams {
    pub mixed_port: u16,
    pub api_port: u16,
    pub secret: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct GeneratedConfig {
    pub mixed_port: u16,
    pub allow_lan: bool,
    pub bind_address: String,
    pub mode: String,
    pub log_level: String,
    pub ipv6: bool,
    pub external_controller: String,
    pub secret: String,
    pub tcp_concurrent: bool,
    pub find_process_mode: String,
    pub geodata_mode: bool,
    pub geox_url: GeoxUrl,
    pub dns: DnsConfig,
    pub proxies: Vec<Mapping>,
    pub proxy_groups: Vec<ProxyGroup>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeoxUrl {
    pub geoip: String,
    pub geosite: String,
    pub mmdb: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct DnsConfig {
    pub enable: bool,
    pub ipv6: bool,
    pub listen: String,
    pub enhanced_mode: String,
    pub fake_ip_range: String,
    pub fake_ip_filter: Vec<String>,
    pub default_nameserver: Vec<String>,
    pub nameserver: Vec<String>,
    pub fallback: Vec<String>,
    pub fallback_filter: FallbackFilter,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FallbackFilter {
    pub geoip: bool,
    pub geoip_code: String,
    pub ipcidr: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProxyGroup {
    pub name: String,
    #[serde(rename = "type")]
    pub group_type: String,
    pub proxies: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<u32>,
}

/// One first-match-wins routing rule, rendered as mihomo's comma form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub matcher: &'static str,
    pub payload: Option<&'static str>,
    pub target: String,
    pub no_resolve: bool,
}

impl Rule {
    fn new(matcher: &'static str, payload: &'static str, target: &str) -> Self {
        Self {
            matcher,
            payload: Some(payload),
            target: target.to_string(),
            no_resolve: false,
        }
    }

    fn no_resolve(mut self) -> Self {
        self.no_resolve = true;
        self
    }

    fn catch_all(target: &str) -> Self {
        Self {
            matcher: "MATCH",
            payload: None,
            target: target.to_string(),
            no_resolve: false,
        }
    }
}

impl std::fmt::Display for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.matcher)?;
        if let Some(payload) = self.payload {
            write!(f, ",{payload}")?;
        }
        write!(f, ",{}", self.target)?;
        if self.no_resolve {
            write!(f, ",no-resolve")?;
        }
        Ok(())
    }
}

impl Serialize for Rule {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    NoNodes,
    DanglingReference { owner: String, reference: String },
    Serialize { reason: String },
    Io { path: PathBuf, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoNodes => write!(f, "cannot build a config without proxy nodes"),
            Self::DanglingReference { owner, reference } => write!(
                f,
                "{owner} references `{reference}` which is not defined before it"
            ),
            Self::Serialize { reason } => write!(f, "config yaml serialize error: {reason}"),
            Self::Io { path, message } => write!(f, "{}: {message}", path.display()),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Builds the full mihomo config from the subscription nodes and one probe run.
///
/// `Auto` and `Fallback` list alive nodes by ascending delay. `Proxy` is a select group whose
/// first member (its default) is `best`, followed by every other node and the two automatic
/// groups. With no alive results (config generated without probing) the subscription order
/// is used instead. Groups are emitted so that every reference points backwards.
pub fn build_config(
    nodes: &[ProxyNode],
    results: &[ProbeResult],
    best: &str,
    params: &ConfigParams,
) -> Result<GeneratedConfig, ConfigError> {
    let first = nodes.first().ok_or(ConfigError::NoNodes)?;
    let best = if nodes.iter().any(|n| n.name == best) {
        best
    } else {
        warn!(
            best_node = best,
            fallback = %first.name,
            "best node is not in the subscription; using the first node"
        );
        first.name.as_str()
    };

    let known: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
    let mut by_latency: Vec<String> = rank(results)
        .into_iter()
        .filter(|r| r.alive && known.contains(r.node_name.as_str()))
        .map(|r| r.node_name.clone())
        .collect();
    if by_latency.is_empty() {
        by_latency = nodes.iter().map(|n| n.name.clone()).collect();
    }

    let mut selectable: Vec<String> = Vec::with_capacity(nodes.len() + 3);
    selectable.push(best.to_string());
    selectable.extend(by_latency.iter().filter(|n| *n != best).cloned());
    for node in nodes {
        if !selectable.contains(&node.name) {
            selectable.push(node.name.clone());
        }
    }
    selectable.extend([
        GROUP_AUTO.to_string(),
        GROUP_FALLBACK.to_string(),
        POLICY_DIRECT.to_string(),
    ]);

    let proxy_groups = vec![
        ProxyGroup {
            name: GROUP_AUTO.to_string(),
            group_type: "url-test".to_string(),
            proxies: by_latency.clone(),
            url: Some(HEALTH_CHECK_URL.to_string()),
            interval: Some(GROUP_INTERVAL_SECS),
            tolerance: Some(AUTO_TOLERANCE_MS),
        },
        ProxyGroup {
            name: GROUP_FALLBACK.to_string(),
            group_type: "fallback".to_string(),
            proxies: by_latency,
            url: Some(HEALTH_CHECK_URL.to_string()),
            interval: Some(GROUP_INTERVAL_SECS),
            tolerance: None,
        },
        ProxyGroup {
            name: GROUP_PROXY.to_string(),
            group_type: "select".to_string(),
            proxies: selectable,
            url: None,
            interval: None,
            tolerance: None,
        },
    ];

    Ok(GeneratedConfig {
        mixed_port: params.mixed_port,
        allow_lan: true,
        bind_address: "*".to_string(),
        mode: "rule".to_string(),
        log_level: "info".to_string(),
        ipv6: false,
        external_controller: format!("0.0.0.0:{}", params.api_port),
        secret: params.secret.clone(),
        tcp_concurrent: true,
        find_process_mode: "off".to_string(),
        geodata_mode: true,
        geox_url: GeoxUrl {
            geoip: format!("{GEOX_BASE}/geoip.dat"),
            geosite: format!("{GEOX_BASE}/geosite.dat"),
            mmdb: format!("{GEOX_BASE}/country.mmdb"),
        },
        dns: dns_config(),
        proxies: nodes.iter().map(|n| n.raw.clone()).collect(),
        proxy_groups,
        rules: rules(),
    })
}

fn dns_config() -> DnsConfig {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    DnsConfig {
        enable: true,
        ipv6: false,
        listen: "0.0.0.0:1053".to_string(),
        enhanced_mode: "fake-ip".to_string(),
        fake_ip_range: "198.18.0.1/16".to_string(),
        fake_ip_filter: strings(FAKE_IP_FILTER),
        default_nameserver: strings(DEFAULT_NAMESERVERS),
        nameserver: strings(DOH_NAMESERVERS),
        fallback: strings(FALLBACK_NAMESERVERS),
        fallback_filter: FallbackFilter {
            geoip: true,
            geoip_code: "CN".to_string(),
            ipcidr: vec!["240.0.0.0/4".to_string()],
        },
    }
}

fn rules() -> Vec<Rule> {
    let mut rules = vec![
        Rule::new("GEOIP", "private", POLICY_DIRECT).no_resolve(),
        Rule::new("GEOSITE", "cn", POLICY_DIRECT),
        Rule::new("GEOIP", "CN", POLICY_DIRECT).no_resolve(),
    ];
    rules.extend(
        PROXIED_GEOSITES
            .iter()
            .map(|&site| Rule::new("GEOSITE", site, GROUP_PROXY)),
    );
    rules.push(Rule::catch_all(GROUP_PROXY));
    rules
}

/// Checks that every group member and rule target names a proxy, a built-in policy, or a
/// group defined earlier in the document.
pub fn validate_references(config: &GeneratedConfig) -> Result<(), ConfigError> {
    let mut defined: HashSet<String> = [POLICY_DIRECT, POLICY_REJECT]
        .into_iter()
        .map(str::to_string)
        .collect();
    for proxy in &config.proxies {
        if let Some(name) = proxy.get("name").and_then(Value::as_str) {
            defined.insert(name.to_string());
        }
    }

    for group in &config.proxy_groups {
        for member in &group.proxies {
            if !defined.contains(member) {
                return Err(ConfigError::DanglingReference {
                    owner: format!("proxy group `{}`", group.name),
                    reference: member.clone(),
                });
            }
        }
        defined.insert(group.name.clone());
    }

    for rule in &config.rules {
        if !defined.contains(&rule.target) {
            return Err(ConfigError::DanglingReference {
                owner: format!("rule `{rule}`"),
                reference: rule.target.clone(),
            });
        }
    }
    Ok(())
}

/// Serializes the config. The output depends only on `config`.
pub fn render(config: &GeneratedConfig) -> Result<String, ConfigError> {
    let body = serde_yaml::to_string(config).map_err(|e| ConfigError::Serialize {
        reason: e.to_string(),
    })?;
    Ok(format!("{FILE_HEADER}{body}"))
}

pub fn digest(rendered: &str) -> String {
    hex::encode(Sha256::digest(rendered.as_bytes()))
}

pub fn write_config(path: &Path, rendered: &str) -> Result<(), ConfigError> {
    write_atomic(path, rendered.as_bytes()).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::{ProxyType, parse_nodes};
    use pretty_assertions::assert_eq;

    const SUB: &str = r#"
proxies:
  - {name: A, type: vmess, server: a.example, port: 443, uuid: u-a, cipher: auto}
  - {name: B, type: trojan, server: b.example, port: 443, password: p-b}
  - {name: C, type: ss, server: c.example, port: 8388, cipher: aes-128-gcm, password: p-c}
"#;

    fn nodes() -> Vec<ProxyNode> {
        parse_nodes(SUB.as_bytes()).unwrap()
    }

    fn results() -> Vec<ProbeResult> {
        vec![
            ProbeResult {
                node_name: "A".to_string(),
                alive: true,
                delay_ms: Some(45),
            },
            ProbeResult {
                node_name: "B".to_string(),
                alive: true,
                delay_ms: Some(67),
            },
            ProbeResult {
                node_name: "C".to_string(),
                alive: false,
                delay_ms: None,
            },
        ]
    }

    fn params() -> ConfigParams {
        ConfigParams {
            mixed_port: 7893,
            api_port: 9090,
            secret: String::new(),
        }
    }

    fn group<'a>(config: &'a GeneratedConfig, name: &str) -> &'a ProxyGroup {
        config
            .proxy_groups
            .iter()
            .find(|g| g.name == name)
            .unwrap()
    }

    #[test]
    fn groups_follow_probe_results() {
        let config = build_config(&nodes(), &results(), "A", &params()).unwrap();

        let names: Vec<&str> = config
            .proxy_groups
            .iter()
            .map(|g| g.name.as_str())
            .collect();
        assert_eq!(names, vec!["Auto", "Fallback", "Proxy"]);

        let auto = group(&config, GROUP_AUTO);
        assert_eq!(auto.group_type, "url-test");
        assert_eq!(auto.proxies, vec!["A", "B"]);
        assert_eq!(auto.interval, Some(300));
        assert_eq!(auto.tolerance, Some(50));

        let fallback = group(&config, GROUP_FALLBACK);
        assert_eq!(fallback.group_type, "fallback");
        assert_eq!(fallback.proxies, vec!["A", "B"]);

        let proxy = group(&config, GROUP_PROXY);
        assert_eq!(proxy.group_type, "select");
        assert_eq!(
            proxy.proxies,
            vec!["A", "B", "C", "Auto", "Fallback", "DIRECT"]
        );

        // Unreachable nodes stay in the node list.
        assert_eq!(config.proxies.len(), 3);
    }

    #[test]
    fn best_node_leads_the_select_group_even_if_not_fastest() {
        let config = build_config(&nodes(), &results(), "B", &params()).unwrap();
        let proxy = group(&config, GROUP_PROXY);
        assert_eq!(
            proxy.proxies,
            vec!["B", "A", "C", "Auto", "Fallback", "DIRECT"]
        );
    }

    #[test]
    fn unknown_best_node_falls_back_to_first_node() {
        let config = build_config(&nodes(), &results(), "nope", &params()).unwrap();
        assert_eq!(group(&config, GROUP_PROXY).proxies[0], "A");
    }

    #[test]
    fn without_probe_results_subscription_order_is_used() {
        let config = build_config(&nodes(), &[], "C", &params()).unwrap();
        assert_eq!(group(&config, GROUP_AUTO).proxies, vec!["A", "B", "C"]);
        assert_eq!(
            group(&config, GROUP_PROXY).proxies,
            vec!["C", "A", "B", "Auto", "Fallback", "DIRECT"]
        );
    }

    #[test]
    fn empty_node_list_is_rejected() {
        assert_eq!(
            build_config(&[], &results(), "A", &params()).unwrap_err(),
            ConfigError::NoNodes
        );
    }

    #[test]
    fn rules_keep_fixed_precedence() {
        let config = build_config(&nodes(), &results(), "A", &params()).unwrap();
        let rendered: Vec<String> = config.rules.iter().map(|r| r.to_string()).collect();
        assert_eq!(
            rendered,
            vec![
                "GEOIP,private,DIRECT,no-resolve",
                "GEOSITE,cn,DIRECT",
                "GEOIP,CN,DIRECT,no-resolve",
                "GEOSITE,google,Proxy",
                "GEOSITE,github,Proxy",
                "GEOSITE,twitter,Proxy",
                "GEOSITE,telegram,Proxy",
                "GEOSITE,youtube,Proxy",
                "MATCH,Proxy",
            ]
        );
    }

    #[test]
    fn generated_references_resolve() {
        let config = build_config(&nodes(), &results(), "A", &params()).unwrap();
        validate_references(&config).unwrap();
    }

    #[test]
    fn padded_names_and_type_aliases_render_consistently() {
        let doc = r#"
proxies:
  - {name: 'HK 01 ', type: Shadowsocks, server: hk.example, port: 8388, cipher: aes-128-gcm, password: p}
  - {name: JP 01, type: HY2, server: jp.example, port: 443, password: p}
"#;
        let nodes = parse_nodes(doc.as_bytes()).unwrap();
        let config = build_config(&nodes, &[], "HK 01", &params()).unwrap();
        validate_references(&config).unwrap();

        let rendered: Value = serde_yaml::from_str(&render(&config).unwrap()).unwrap();
        assert_eq!(rendered["proxies"][0]["name"].as_str(), Some("HK 01"));
        assert_eq!(rendered["proxies"][0]["type"].as_str(), Some("ss"));
        assert_eq!(rendered["proxies"][1]["type"].as_str(), Some("hysteria2"));
        assert_eq!(group(&config, GROUP_PROXY).proxies[0], "HK 01");
    }

    #[test]
    fn dangling_references_are_detected() {
        let mut config = build_config(&nodes(), &results(), "A", &params()).unwrap();
        config.proxy_groups[0].proxies.push("Ghost".to_string());
        assert_eq!(
            validate_references(&config).unwrap_err(),
            ConfigError::DanglingReference {
                owner: "proxy group `Auto`".to_string(),
                reference: "Ghost".to_string(),
            }
        );

        // A forward reference to a group defined later is also dangling.
        let mut config = build_config(&nodes(), &results(), "A", &params()).unwrap();
        config.proxy_groups.swap(0, 2);
        assert!(matches!(
            validate_references(&config).unwrap_err(),
            ConfigError::DanglingReference { .. }
        ));

        let mut config = build_config(&nodes(), &results(), "A", &params()).unwrap();
        config.rules.push(Rule::catch_all("Missing"));
        assert!(matches!(
            validate_references(&config).unwrap_err(),
            ConfigError::DanglingReference { reference, .. } if reference == "Missing"
        ));
    }

    #[test]
    fn render_is_deterministic_and_carries_ports() {
        let params = ConfigParams {
            mixed_port: 17893,
            api_port: 19090,
            secret: "s3cret".to_string(),
        };
        let a = render(&build_config(&nodes(), &results(), "A", &params).unwrap()).unwrap();
        let b = render(&build_config(&nodes(), &results(), "A", &params).unwrap()).unwrap();
        assert_eq!(a, b);
        assert_eq!(digest(&a), digest(&b));
        assert!(a.starts_with(FILE_HEADER));

        let doc: Value = serde_yaml::from_str(&a).unwrap();
        assert_eq!(doc["mixed-port"].as_u64(), Some(17893));
        assert_eq!(doc["external-controller"].as_str(), Some("0.0.0.0:19090"));
        assert_eq!(doc["secret"].as_str(), Some("s3cret"));
        assert_eq!(doc["dns"]["enhanced-mode"].as_str(), Some("fake-ip"));
        assert_eq!(doc["dns"]["fake-ip-range"].as_str(), Some("198.18.0.1/16"));
        assert_eq!(doc["proxy-groups"][2]["name"].as_str(), Some("Proxy"));
        assert_eq!(doc["rules"][8].as_str(), Some("MATCH,Proxy"));
    }

    #[test]
    fn node_parameters_pass_through_verbatim() {
        let config = build_config(&nodes(), &results(), "A", &params()).unwrap();
        let rendered = render(&config).unwrap();
        let doc: Value = serde_yaml::from_str(&rendered).unwrap();

        let first = &doc["proxies"][0];
        assert_eq!(first["name"].as_str(), Some("A"));
        assert_eq!(first["type"].as_str(), Some(ProxyType::Vmess.as_str()));
        assert_eq!(first["uuid"].as_str(), Some("u-a"));
        assert_eq!(first["cipher"].as_str(), Some("auto"));
        assert_eq!(doc["proxies"][2]["password"].as_str(), Some("p-c"));
    }

    #[test]
    fn write_config_replaces_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("config.yaml");
        write_config(&path, "a: 1\n").unwrap();
        write_config(&path, "a: 2\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "a: 2\n");
    }
}
