use std::path::Path;

use tracing::{info, warn};

use crate::{fsutil::write_atomic, pipeline::StepOutcome};

pub const NO_PROXY: &str = "localhost,127.0.0.1,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16";

/// Shell snippet exporting the proxy variables for login shells.
pub fn render(mixed_port: u16) -> String {
    let http = format!("http://127.0.0.1:{mixed_port}");
    let socks = format!("socks5://127.0.0.1:{mixed_port}");
    let vars = [
        ("http_proxy", http.as_str()),
        ("https_proxy", http.as_str()),
        ("all_proxy", socks.as_str()),
        ("no_proxy", NO_PROXY),
    ];

    let mut out = String::from("# managed by mihomo-pilot\n");
    for (name, value) in vars {
        out.push_str(&format!("export {name}=\"{value}\"\n"));
    }
    for (name, value) in vars {
        out.push_str(&format!("export {}=\"{value}\"\n", name.to_ascii_uppercase()));
    }
    out
}

/// Writes the env file. Failure never aborts an update; it is reported as an advisory.
pub fn publish(path: &Path, mixed_port: u16) -> StepOutcome {
    match write_atomic(path, render(mixed_port).as_bytes()) {
        Ok(()) => {
            info!(path = %path.display(), mixed_port, "proxy environment published");
            StepOutcome::Ok
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to publish proxy environment");
            StepOutcome::Advisory(format!("write {}: {err}", path.display()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn render_exports_lower_and_upper_case_variables() {
        let text = render(7893);
        let exports: Vec<&str> = text.lines().filter(|l| l.starts_with("export ")).collect();
        assert_eq!(
            exports,
            vec![
                "export http_proxy=\"http://127.0.0.1:7893\"",
                "export https_proxy=\"http://127.0.0.1:7893\"",
                "export all_proxy=\"socks5://127.0.0.1:7893\"",
                "export no_proxy=\"localhost,127.0.0.1,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16\"",
                "export HTTP_PROXY=\"http://127.0.0.1:7893\"",
                "export HTTPS_PROXY=\"http://127.0.0.1:7893\"",
                "export ALL_PROXY=\"socks5://127.0.0.1:7893\"",
                "export NO_PROXY=\"localhost,127.0.0.1,::1,10.0.0.0/8,172.16.0.0/12,192.168.0.0/16\"",
            ]
        );
    }

    #[test]
    fn publish_writes_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("profile.d").join("mihomo-proxy.sh");
        assert_eq!(publish(&path, 17890), StepOutcome::Ok);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), render(17890));
    }

    #[test]
    fn unwritable_target_is_advisory() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let outcome = publish(&blocker.join("mihomo-proxy.sh"), 7893);
        assert!(matches!(outcome, StepOutcome::Advisory(_)), "{outcome:?}");
    }
}
