use std::sync::Arc;

use clap::Parser as _;
use pretty_assertions::assert_eq;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use mihomo_pilot::{
    config::Cli,
    mihomo::MihomoClient,
    pipeline::{StepOutcome, UpdatePipeline, synthesize},
    reload::ReloadTier,
    subscription::load_from_file,
};

fn subscription_yaml(open: u16, closed: u16) -> String {
    format!(
        r#"proxies:
  - name: "HK 01"
    type: vmess
    server: 127.0.0.1
    port: {open}
    uuid: 00000000-0000-0000-0000-000000000000
    alterId: 0
    cipher: auto
  - name: "JP 01"
    type: trojan
    server: 127.0.0.1
    port: {closed}
    password: secret
"#
    )
}

// A single mock server plays the subscription provider, the mihomo controller and the
// mixed-port proxy used for the connectivity check.
#[tokio::test]
async fn hot_reload_success_never_escalates() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let open = listener.local_addr().unwrap().port();
    let accept = tokio::spawn(async move { while listener.accept().await.is_ok() {} });
    let closed = {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    };

    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sub"))
        .respond_with(ResponseTemplate::new(200).set_body_string(subscription_yaml(open, closed)))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/version"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(serde_json::json!({"version": "v1.18.5"})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/configs"))
        .and(query_param("force", "true"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/generate_204"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let port = server.address().port().to_string();
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    let cli = Cli::try_parse_from([
        "mihomo-pilot".to_string(),
        "--subscription-url".to_string(),
        format!("{}/sub", server.uri()),
        "--data-dir".to_string(),
        data_dir.display().to_string(),
        "--mixed-port".to_string(),
        port.clone(),
        "--api-port".to_string(),
        port,
        // Would fail loudly if the escalation path were ever taken.
        "--mihomo-systemd-unit".to_string(),
        "does-not-exist.service".to_string(),
        "--mihomo-bin".to_string(),
        tmp.path().join("no-such-binary").display().to_string(),
        "--publish-proxy-env".to_string(),
        "false".to_string(),
        "--verify-url".to_string(),
        "http://connectivity.test/generate_204".to_string(),
    ])
    .unwrap();
    let config = Arc::new(cli.config);

    let client = MihomoClient::new(&config.api_base_url(), &config.api_secret).unwrap();
    let pipeline = UpdatePipeline::from_config(config.clone(), client).unwrap();
    let report = pipeline.run().await.unwrap();

    assert_eq!(report.reload_tier, ReloadTier::HotReload);
    assert_eq!(report.best_node, "HK 01");
    assert_eq!(report.alive, 1);
    assert_eq!(report.proxy_env, StepOutcome::Skipped);
    assert_eq!(report.verify, StepOutcome::Ok);

    let stored = load_from_file(&config.subscription_path()).unwrap();
    assert_eq!(stored.nodes.len(), 2);
    accept.abort();
}

#[test]
fn generate_from_stored_subscription_is_reproducible() {
    let tmp = tempfile::tempdir().unwrap();
    let data_dir = tmp.path().join("data");
    std::fs::create_dir_all(&data_dir).unwrap();
    std::fs::write(
        data_dir.join("subscription.yaml"),
        subscription_yaml(443, 8443),
    )
    .unwrap();

    let cli = Cli::try_parse_from([
        "mihomo-pilot",
        "--data-dir",
        data_dir.to_str().unwrap(),
        "generate",
        "--best-node",
        "JP 01",
    ])
    .unwrap();
    let config = cli.config;
    let subscription = load_from_file(&config.subscription_path()).unwrap();

    let first = synthesize(&config, &subscription.nodes, &[], "JP 01").unwrap();
    let written = std::fs::read_to_string(config.generated_config_path()).unwrap();
    let second = synthesize(&config, &subscription.nodes, &[], "JP 01").unwrap();
    assert_eq!(first, second);
    assert_eq!(
        written,
        std::fs::read_to_string(config.generated_config_path()).unwrap()
    );

    let doc: serde_yaml::Value = serde_yaml::from_str(&written).unwrap();
    assert_eq!(doc["proxy-groups"][2]["name"].as_str(), Some("Proxy"));
    assert_eq!(doc["proxy-groups"][2]["proxies"][0].as_str(), Some("JP 01"));
    assert_eq!(doc["mixed-port"].as_u64(), Some(7893));
}

#[cfg(unix)]
mod managed_restart {
    use std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::Duration,
    };

    use axum::{
        Router,
        body::Body,
        http::{Request, StatusCode},
    };
    use clap::Parser as _;
    use http_body_util::BodyExt as _;
    use pretty_assertions::assert_eq;
    use serde_json::{Value, json};
    use tower::ServiceExt as _;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use mihomo_pilot::{
        config::Cli,
        http::{AppState, build_router},
        job::UpdateJobHandle,
        mihomo::MihomoClient,
        pipeline::UpdatePipeline,
        reload::{
            HotReload, ManagedRestart, ManagedService, ReloadOrchestrator, ReloadStrategy,
            ServicePrograms,
        },
        subscription::{SubscriptionLoader, SubscriptionLoaderOptions},
    };

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    async fn get_json(app: &Router, uri: &str) -> (StatusCode, Value) {
        let res = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let bytes = res.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn closed_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    // The restarted daemon reports whatever the generated config put into `Proxy`.
    async fn serve_generated_groups(controller: &MockServer, config_path: &Path) {
        let doc: serde_yaml::Value =
            serde_yaml::from_str(&std::fs::read_to_string(config_path).unwrap()).unwrap();
        let groups = doc["proxy-groups"].as_sequence().unwrap();
        let proxy_group = groups
            .iter()
            .find(|g| g["name"].as_str() == Some("Proxy"))
            .unwrap();
        let members: Vec<String> = proxy_group["proxies"]
            .as_sequence()
            .unwrap()
            .iter()
            .map(|m| m.as_str().unwrap().to_string())
            .collect();

        let mut proxies = serde_json::Map::new();
        proxies.insert(
            "Proxy".to_string(),
            json!({"name": "Proxy", "type": "Selector", "all": members, "now": members[0]}),
        );
        for node in doc["proxies"].as_sequence().unwrap() {
            let name = node["name"].as_str().unwrap();
            proxies.insert(
                name.to_string(),
                json!({"name": name, "type": node["type"].as_str().unwrap(), "alive": true, "history": []}),
            );
        }
        Mock::given(method("GET"))
            .and(path("/proxies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "proxies": proxies })))
            .mount(controller)
            .await;
    }

    #[tokio::test]
    async fn dead_daemon_is_restarted_and_nodes_reflect_new_default() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let accept = tokio::spawn(async move { while listener.accept().await.is_ok() {} });

        let provider = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sub"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(super::subscription_yaml(open, closed_port())),
            )
            .mount(&provider)
            .await;

        let controller = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/version"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&controller)
            .await;
        Mock::given(method("PUT"))
            .and(path("/configs"))
            .respond_with(ResponseTemplate::new(204))
            .expect(0)
            .mount(&controller)
            .await;

        let tmp = tempfile::tempdir().unwrap();
        let calls = tmp.path().join("systemctl.log");
        let systemctl = write_script(
            tmp.path(),
            "systemctl",
            &format!("echo \"$@\" >> {}\nexit 0", calls.display()),
        );

        let cli = Cli::try_parse_from([
            "mihomo-pilot".to_string(),
            "--subscription-url".to_string(),
            format!("{}/sub", provider.uri()),
            "--data-dir".to_string(),
            tmp.path().join("data").display().to_string(),
            "--mixed-port".to_string(),
            closed_port().to_string(),
            "--publish-proxy-env".to_string(),
            "false".to_string(),
        ])
        .unwrap();
        let config = Arc::new(cli.config);

        let client = MihomoClient::new(&controller.uri(), "").unwrap();
        let restart = ManagedRestart::new(
            ManagedService::Systemd {
                unit: "mihomo.service".to_string(),
            },
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .with_programs(ServicePrograms {
            systemctl: vec![systemctl.display().to_string()],
            ..ServicePrograms::default()
        });
        let tiers: Vec<Arc<dyn ReloadStrategy>> =
            vec![Arc::new(HotReload::new(client.clone())), Arc::new(restart)];
        let reload = ReloadOrchestrator::new(tiers);
        let loader =
            SubscriptionLoader::new(SubscriptionLoaderOptions::from_config(&config)).unwrap();
        let pipeline = UpdatePipeline::new(config.clone(), loader, reload);

        let job = UpdateJobHandle::new(Arc::new(pipeline), Duration::from_secs(60));
        let app = build_router(AppState {
            job: job.clone(),
            mihomo: client,
        });

        let res = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/update")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::ACCEPTED);

        let mut status = Value::Null;
        for _ in 0..400 {
            let (code, body) = get_json(&app, "/status").await;
            assert_eq!(code, StatusCode::OK);
            if body["update_running"] == false && !body["last_update_result"].is_null() {
                status = body;
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        let last = &status["last_update_result"];
        assert_eq!(last["success"], true, "{status}");
        assert_eq!(last["report"]["reload_tier"], "managed_restart");
        assert_eq!(last["report"]["best_node"], "HK 01");

        assert_eq!(
            std::fs::read_to_string(&calls).unwrap().lines().collect::<Vec<_>>(),
            vec![
                "cat mihomo.service",
                "restart mihomo.service",
                "is-active --quiet mihomo.service"
            ]
        );

        serve_generated_groups(&controller, &config.generated_config_path()).await;
        let (code, nodes) = get_json(&app, "/nodes").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(nodes["group"], "Proxy");
        assert_eq!(nodes["current"], "HK 01");
        assert_eq!(nodes["nodes"][0]["name"], "HK 01");
        assert_eq!(nodes["nodes"][0]["current"], true);
        assert_eq!(nodes["nodes"][1]["name"], "JP 01");
        accept.abort();
    }
}
