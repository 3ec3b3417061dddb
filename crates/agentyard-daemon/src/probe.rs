//! Localhost HTTP probe used for health checks and port classification.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tracing::debug;

/// What a probed port answered.
#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    /// Nothing accepted the request within the timeout.
    NoResponse,
    /// Something answered, but not with our signature.
    Foreign,
    /// A JSON object carrying the marker field.
    Ours(Value),
}

impl ProbeOutcome {
    pub const fn is_ours(&self) -> bool {
        matches!(self, Self::Ours(_))
    }
}

/// Short-timeout HTTP client for `127.0.0.1` probes.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    fn url(port: u16, path: &str) -> String {
        if path.starts_with('/') {
            format!("http://127.0.0.1:{port}{path}")
        } else {
            format!("http://127.0.0.1:{port}/{path}")
        }
    }

    /// GET `path` and look for `marker` at the top level of a JSON object.
    pub async fn check_marker(&self, port: u16, path: &str, marker: &str) -> ProbeOutcome {
        let url = Self::url(port, path);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!(port, error = %e, "Probe got no response");
                return ProbeOutcome::NoResponse;
            }
        };

        if !response.status().is_success() {
            debug!(port, status = %response.status(), "Probe got non-success status");
            return ProbeOutcome::Foreign;
        }

        match response.json::<Value>().await {
            Ok(body) if body.get(marker).is_some_and(|v| !v.is_null()) => ProbeOutcome::Ours(body),
            Ok(_) => ProbeOutcome::Foreign,
            Err(e) => {
                debug!(port, error = %e, "Probe response is not JSON");
                ProbeOutcome::Foreign
            }
        }
    }

    /// Whether anything answers `GET path` with a success status.
    pub async fn responds(&self, port: u16, path: &str) -> bool {
        match self.client.get(Self::url(port, path)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod tests {
    use axum::Router;
    use axum::routing::get;
    use serde_json::json;
    use tokio::net::TcpListener;

    use super::*;

    /// Serve `router` on an ephemeral localhost port.
    pub(crate) async fn serve(router: Router) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        port
    }

    /// A port with no listener behind it.
    pub(crate) fn closed_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn probe() -> HttpProbe {
        HttpProbe::new(Duration::from_millis(500)).unwrap()
    }

    #[tokio::test]
    async fn marker_present_is_ours() {
        let port = serve(Router::new().route(
            "/health",
            get(|| async { axum::Json(json!({"serverId": "abc"})) }),
        ))
        .await;

        let outcome = probe().check_marker(port, "/health", "serverId").await;
        assert_eq!(outcome, ProbeOutcome::Ours(json!({"serverId": "abc"})));
    }

    #[tokio::test]
    async fn json_without_marker_is_foreign() {
        let port = serve(Router::new().route(
            "/",
            get(|| async { axum::Json(json!({"name": "someone else"})) }),
        ))
        .await;

        let outcome = probe().check_marker(port, "/", "wsEndpoint").await;
        assert_eq!(outcome, ProbeOutcome::Foreign);
    }

    #[tokio::test]
    async fn plain_text_is_foreign() {
        let port = serve(Router::new().route("/", get(|| async { "hello" }))).await;
        assert_eq!(
            probe().check_marker(port, "/", "wsEndpoint").await,
            ProbeOutcome::Foreign
        );
        assert!(probe().responds(port, "/").await);
    }

    #[tokio::test]
    async fn closed_port_has_no_response() {
        let port = closed_port();
        assert_eq!(
            probe().check_marker(port, "/", "wsEndpoint").await,
            ProbeOutcome::NoResponse
        );
        assert!(!probe().responds(port, "/json/version").await);
    }

    #[test]
    fn url_handles_missing_leading_slash() {
        assert_eq!(HttpProbe::url(80, "health"), "http://127.0.0.1:80/health");
        assert_eq!(HttpProbe::url(80, "/health"), "http://127.0.0.1:80/health");
    }
}
