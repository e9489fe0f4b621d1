//! Health probing helpers.
//!
//! Used by the lifecycle supervisor (single-instance and version-drift
//! checks against an already-running worker) and exposed to hook clients
//! through the admin endpoints.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Poll interval for the wait helpers.
const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Outcome of comparing our version against a running worker's.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionMatch {
    pub matches: bool,
    pub plugin_version: Option<String>,
    pub worker_version: Option<String>,
}

#[derive(Debug, Deserialize)]
struct VersionBody {
    version: Option<String>,
}

/// Whether something is listening on the loopback port.
pub async fn port_in_use(port: u16) -> bool {
    tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .is_ok()
}

/// Poll `/api/health` until it answers 200 or the timeout expires.
pub async fn wait_for_health(port: u16, timeout: Duration) -> bool {
    let client = http_client(timeout);
    let url = format!("http://127.0.0.1:{port}/api/health");
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(response) = client.get(&url).send().await {
            if response.status().is_success() {
                return true;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll until nothing accepts connections on the port.
pub async fn wait_for_port_free(port: u16, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !port_in_use(port).await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Compare this binary's version with the `/api/version` of a running
/// worker. Unknown versions compare equal - a probe failure must not cause
/// a restart loop.
pub async fn check_version_match(port: u16, timeout: Duration) -> VersionMatch {
    let plugin_version = Some(env!("CARGO_PKG_VERSION").to_owned());
    let client = http_client(timeout);
    let url = format!("http://127.0.0.1:{port}/api/version");

    let worker_version = match client.get(&url).send().await {
        Ok(response) if response.status().is_success() => response
            .json::<VersionBody>()
            .await
            .ok()
            .and_then(|body| body.version),
        _ => None,
    };

    let matches = match (&plugin_version, &worker_version) {
        (Some(ours), Some(theirs)) => ours == theirs,
        _ => true,
    };
    VersionMatch {
        matches,
        plugin_version,
        worker_version,
    }
}

/// Ask a running worker to shut down gracefully.
pub async fn request_shutdown(port: u16, timeout: Duration) -> bool {
    let client = http_client(timeout);
    let url = format!("http://127.0.0.1:{port}/api/admin/shutdown");
    matches!(client.post(&url).send().await, Ok(r) if r.status().is_success() || r.status().as_u16() == 202)
}

fn http_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_port_is_not_in_use() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!port_in_use(port).await);
        assert!(wait_for_port_free(port, Duration::from_millis(300)).await);
    }

    #[tokio::test]
    async fn bound_port_is_in_use() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(port_in_use(port).await);
    }

    #[tokio::test]
    async fn version_probe_failure_compares_equal() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = check_version_match(port, Duration::from_millis(300)).await;
        assert!(result.matches);
        assert!(result.worker_version.is_none());
        assert!(result.plugin_version.is_some());
    }

    #[tokio::test]
    async fn wait_for_health_times_out_quietly() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!wait_for_health(port, Duration::from_millis(300)).await);
    }
}
