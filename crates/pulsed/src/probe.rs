//! Backend reachability probe. Drives the node's online flag.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::TcpStream;
use tokio::sync::watch;
use url::Url;

/// `host:port` of the backend, from a base URL like `http://host:8080/api`.
/// IPv6 hosts keep their brackets so the result feeds straight into a connect.
pub fn probe_target(base_url: &str) -> Result<String> {
    let url = Url::parse(base_url)
        .with_context(|| format!("invalid backend url '{}'", base_url))?;
    if !matches!(url.scheme(), "http" | "https") {
        anyhow::bail!("unsupported backend url '{}'", base_url);
    }
    let host = url
        .host()
        .with_context(|| format!("backend url '{}' has no host", base_url))?;
    let port = url
        .port_or_known_default()
        .with_context(|| format!("backend url '{}' has no port", base_url))?;
    Ok(format!("{}:{}", host, port))
}

/// Try a TCP connect to `target` every `interval` and publish the result.
/// Subscribers only wake on a change.
pub async fn probe_loop(target: String, interval: Duration, online: watch::Sender<bool>) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        let reachable = matches!(
            tokio::time::timeout(interval, TcpStream::connect(&target)).await,
            Ok(Ok(_))
        );
        let changed = online.send_if_modified(|state| {
            if *state == reachable {
                return false;
            }
            *state = reachable;
            true
        });
        if changed {
            tracing::info!(target = %target, online = reachable, "connectivity changed");
        }
        if online.is_closed() {
            tracing::debug!("no connectivity subscribers left, probe stopping");
            return;
        }
    }
}
