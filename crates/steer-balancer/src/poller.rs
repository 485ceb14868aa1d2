//! Health poller: backend telemetry fetches and down-transition detection.
//!
//! Every edge-cache backend exposes a telemetry endpoint returning
//! `{currentConnectionCount, currentTps, bitsPerSecond}`. A 200 with a body
//! that parses marks the backend up with those numbers; anything else marks
//! it down. The fallback origin is never polled and is always up.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use steer_state::{Backend, BackendStatus};

/// Body of a backend's telemetry response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryReport {
    pub current_connection_count: u64,
    pub current_tps: f64,
    pub bits_per_second: f64,
}

impl From<TelemetryReport> for BackendStatus {
    fn from(report: TelemetryReport) -> Self {
        BackendStatus::up(
            report.current_connection_count,
            report.current_tps,
            report.bits_per_second,
        )
    }
}

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Where backend status comes from. The daemon uses HTTP; tests inject fakes.
pub type TelemetrySource = Arc<dyn Fn(Backend) -> BoxFuture<BackendStatus> + Send + Sync>;

/// Wrap an async function as a `TelemetrySource`.
pub fn telemetry_source<F, Fut>(f: F) -> TelemetrySource
where
    F: Fn(Backend) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = BackendStatus> + Send + 'static,
{
    Arc::new(move |backend: Backend| -> BoxFuture<BackendStatus> { Box::pin(f(backend)) })
}

/// Telemetry over HTTP/1.1 with a per-request timeout.
pub fn http_source(timeout: Duration) -> TelemetrySource {
    telemetry_source(move |backend: Backend| async move {
        match backend.telemetry_url.as_deref() {
            Some(url) => fetch_status(url, timeout).await,
            None => {
                debug!(backend = %backend.id, "backend has no telemetry url");
                BackendStatus::down()
            }
        }
    })
}

/// Fetch one backend's status. Never fails: errors come back as down.
pub async fn fetch_status(url: &str, timeout: Duration) -> BackendStatus {
    match tokio::time::timeout(timeout, fetch_report(url)).await {
        Ok(Ok(report)) => report.into(),
        Ok(Err(e)) => {
            debug!(error = %e, %url, "telemetry fetch failed");
            BackendStatus::down()
        }
        Err(_) => {
            debug!(%url, "telemetry fetch timed out");
            BackendStatus::down()
        }
    }
}

async fn fetch_report(url: &str) -> anyhow::Result<TelemetryReport> {
    let uri: http::Uri = url.parse()?;
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("telemetry url has no host"))?;
    let port = uri.port_u16().unwrap_or(80);
    let authority = uri
        .authority()
        .map(|a| a.as_str().to_string())
        .unwrap_or_else(|| host.to_string());

    let stream = tokio::net::TcpStream::connect((host, port)).await?;
    let io = hyper_util::rt::TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    let req = http::Request::builder()
        .method("GET")
        .uri(path)
        .header("host", authority)
        .header("user-agent", "steer-poller/0.1")
        .body(http_body_util::Empty::<bytes::Bytes>::new())?;

    let resp = sender.send_request(req).await?;
    if resp.status() != http::StatusCode::OK {
        anyhow::bail!("telemetry endpoint returned {}", resp.status());
    }
    let body = resp.into_body().collect().await?.to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

/// Result of one polling round.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    /// Every polled backend with its new status, in input order.
    pub backends: Vec<Backend>,
    /// Backends that were up before this round and are down now.
    pub newly_down: Vec<Backend>,
}

/// Poll every pollable backend concurrently and apply the new statuses.
///
/// Backends that are not pollable are reset to up.
pub async fn poll_backends(source: &TelemetrySource, backends: Vec<Backend>) -> PollOutcome {
    let mut set = JoinSet::new();
    for (idx, backend) in backends.iter().enumerate() {
        if backend.class.pollable() {
            let fut = source(backend.clone());
            set.spawn(async move { (idx, fut.await) });
        }
    }

    let mut statuses: Vec<Option<BackendStatus>> = vec![None; backends.len()];
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((idx, status)) => statuses[idx] = Some(status),
            Err(e) => warn!(error = %e, "telemetry task failed"),
        }
    }

    let mut newly_down = Vec::new();
    let backends: Vec<Backend> = backends
        .into_iter()
        .zip(statuses)
        .map(|(mut backend, status)| {
            let was_down = backend.is_down();
            backend.status = if backend.class.pollable() {
                status.unwrap_or_else(BackendStatus::down)
            } else {
                BackendStatus::default()
            };
            match (was_down, backend.is_down()) {
                (false, true) => {
                    warn!(backend = %backend.id, name = %backend.name, "backend went down");
                    newly_down.push(backend.clone());
                }
                (true, false) => {
                    info!(backend = %backend.id, name = %backend.name, "backend recovered");
                }
                _ => {}
            }
            backend
        })
        .collect();

    PollOutcome {
        backends,
        newly_down,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use steer_state::{BackendClass, LastStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn backend(id: &str, class: BackendClass, url: Option<String>) -> Backend {
        Backend {
            id: id.to_string(),
            name: id.to_string(),
            class,
            cost: Some(1.0),
            telemetry_url: url,
            source_base_url: format!("http://{id}/"),
            status: BackendStatus::default(),
            last_status: LastStatus::default(),
        }
    }

    /// Serve one canned HTTP response and return the telemetry URL.
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {status_line}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });
        format!("http://{addr}/status")
    }

    #[tokio::test]
    async fn fetch_parses_telemetry() {
        let url = serve_once(
            "200 OK",
            r#"{"currentConnectionCount":12,"currentTps":3.5,"bitsPerSecond":96000}"#,
        )
        .await;
        let status = fetch_status(&url, Duration::from_secs(2)).await;
        assert_eq!(status, BackendStatus::up(12, 3.5, 96_000.0));
    }

    #[tokio::test]
    async fn fetch_non_200_is_down() {
        let url = serve_once("503 Service Unavailable", "{}").await;
        assert!(fetch_status(&url, Duration::from_secs(2)).await.is_down);
    }

    #[tokio::test]
    async fn fetch_malformed_body_is_down() {
        let url = serve_once("200 OK", r#"{"connections":"many"}"#).await;
        assert!(fetch_status(&url, Duration::from_secs(2)).await.is_down);
    }

    #[tokio::test]
    async fn fetch_refused_connection_is_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let status = fetch_status(&format!("http://{addr}/status"), Duration::from_millis(500)).await;
        assert!(status.is_down);
    }

    #[tokio::test]
    async fn fetch_times_out() {
        // Accept but never answer.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });
        let status = fetch_status(&format!("http://{addr}/status"), Duration::from_millis(100)).await;
        assert!(status.is_down);
    }

    #[tokio::test]
    async fn poll_detects_newly_down_and_skips_origin() {
        let source = telemetry_source(|backend: Backend| async move {
            if backend.id == "a" {
                BackendStatus::down()
            } else {
                BackendStatus::up(5, 1.0, 100.0)
            }
        });

        let mut already_down = backend("c", BackendClass::EdgeCache, None);
        already_down.status = BackendStatus::down();
        let mut origin = backend("origin", BackendClass::FallbackOrigin, None);
        origin.status = BackendStatus::down();

        let outcome = poll_backends(
            &source,
            vec![
                backend("a", BackendClass::EdgeCache, None),
                backend("b", BackendClass::EdgeCache, None),
                already_down,
                origin,
            ],
        )
        .await;

        let ids: Vec<&str> = outcome.newly_down.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["a"]);
        assert!(outcome.backends[0].is_down());
        assert_eq!(outcome.backends[1].status.connection_count, 5);
        // "c" recovered, the origin is forced up.
        assert!(!outcome.backends[2].is_down());
        assert!(!outcome.backends[3].is_down());
    }

    #[tokio::test]
    async fn slow_backend_does_not_hold_up_the_others() {
        let deadline = Duration::from_millis(500);
        let fast_done = Arc::new(std::sync::Mutex::new(None));
        let started = std::time::Instant::now();

        let recorded = Arc::clone(&fast_done);
        let source = telemetry_source(move |backend: Backend| {
            let recorded = Arc::clone(&recorded);
            async move {
                let fetch = async {
                    if backend.id.starts_with("slow") {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    } else {
                        *recorded.lock().unwrap() = Some(started.elapsed());
                    }
                    BackendStatus::up(1, 1.0, 10.0)
                };
                tokio::time::timeout(deadline, fetch)
                    .await
                    .unwrap_or_else(|_| BackendStatus::down())
            }
        });

        let outcome = poll_backends(
            &source,
            vec![
                backend("slow-1", BackendClass::EdgeCache, None),
                backend("fast", BackendClass::EdgeCache, None),
                backend("slow-2", BackendClass::EdgeCache, None),
            ],
        )
        .await;
        let total = started.elapsed();

        let fast_elapsed = fast_done.lock().unwrap().expect("fast backend was polled");
        assert!(fast_elapsed < deadline, "fast poll waited {fast_elapsed:?}");
        // Both slow deadlines ran side by side.
        assert!(total < deadline * 2, "round took {total:?}");

        assert!(outcome.backends[0].is_down());
        assert!(!outcome.backends[1].is_down());
        assert!(outcome.backends[2].is_down());
        let ids: Vec<&str> = outcome.newly_down.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["slow-1", "slow-2"]);
    }
}
