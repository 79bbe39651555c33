//! Retrying HTTP connectivity prober
//!
//! A probe makes up to `retries + 1` GET requests, each bounded by the
//! per-attempt timeout, and succeeds on the first `200 OK`. Redirects are not
//! followed: a redirect from a freshly created service or route is itself a
//! finding. Between attempts the prober sleeps only for what is left of the
//! attempt's timeout window, so a probe takes roughly
//! `attempts x per_attempt_timeout` in the worst case.
//!
//! Both `http://` and `https://` URLs are accepted; TLS goes through rustls
//! with the webpki root set.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{redirect, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Checks that a URL answers
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    /// Probe `url`, returning the number of attempts it took to succeed.
    ///
    /// `stop` is checked before each attempt and during the pause between
    /// attempts; an attempt already in flight is never cut short.
    async fn probe(&self, url: &str, stop: &CancellationToken) -> Result<u32>;
}

/// [`ConnectivityProbe`] backed by reqwest
#[derive(Clone, Debug)]
pub struct RetryingProber {
    client: reqwest::Client,
    per_attempt_timeout: Duration,
    max_retries: u32,
}

impl RetryingProber {
    /// Build a prober with a hard per-attempt timeout and no redirect following.
    ///
    /// Environment proxies are ignored: the targets are cluster and router
    /// addresses that must be reached directly.
    pub fn new(per_attempt_timeout: Duration, max_retries: u32) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(per_attempt_timeout)
            .redirect(redirect::Policy::none())
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            per_attempt_timeout,
            max_retries,
        })
    }

    /// Maximum number of requests a single probe makes
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    async fn attempt(&self, url: &str) -> std::result::Result<(), String> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                format!(
                    "no response within {}ms",
                    self.per_attempt_timeout.as_millis()
                )
            } else if e.is_connect() {
                format!("connection failed: {}", e)
            } else {
                format!("request failed: {}", e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::OK {
            return Ok(());
        }
        if status.is_redirection() {
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("<none>");
            return Err(format!("unexpected redirect ({}) to {}", status, location));
        }
        Err(format!("unexpected status {}", status))
    }
}

#[async_trait]
impl ConnectivityProbe for RetryingProber {
    #[instrument(skip(self, stop), fields(max_attempts = self.max_attempts()))]
    async fn probe(&self, url: &str, stop: &CancellationToken) -> Result<u32> {
        let max_attempts = self.max_attempts();
        let mut last_reason = String::new();

        for attempt in 1..=max_attempts {
            if stop.is_cancelled() {
                return Err(Error::interrupted(format!(
                    "probe of {} stopped after {} attempt(s)",
                    url,
                    attempt - 1
                )));
            }

            let started = Instant::now();
            match self.attempt(url).await {
                Ok(()) => {
                    debug!(attempt, "probe succeeded");
                    return Ok(attempt);
                }
                Err(reason) => {
                    debug!(attempt, %reason, "probe attempt failed");
                    last_reason = reason;
                }
            }

            if attempt == max_attempts {
                break;
            }

            let remaining = self.per_attempt_timeout.saturating_sub(started.elapsed());
            tokio::select! {
                _ = tokio::time::sleep(remaining) => {}
                _ = stop.cancelled() => {
                    return Err(Error::interrupted(format!(
                        "probe of {} stopped after {} attempt(s): {}",
                        url, attempt, last_reason
                    )));
                }
            }
        }

        Err(Error::Connectivity {
            url: url.to_string(),
            attempts: max_attempts,
            reason: last_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use axum::http::{header, StatusCode as HttpStatus};
    use axum::routing::get;
    use axum::Router;

    async fn serve(app: Router) -> SocketAddr {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    /// Server that fails the first `failures` requests with 503
    async fn flaky_server(failures: u32) -> (SocketAddr, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/",
            get(move || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < failures {
                        HttpStatus::SERVICE_UNAVAILABLE
                    } else {
                        HttpStatus::OK
                    }
                }
            }),
        );
        (serve(app).await, hits)
    }

    /// Story: A healthy endpoint succeeds on the first attempt
    #[tokio::test]
    async fn story_first_attempt_success() {
        let (addr, hits) = flaky_server(0).await;
        let prober = RetryingProber::new(Duration::from_millis(500), 3).unwrap();

        let attempts = prober
            .probe(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    /// Story: Transient failures are retried until the endpoint answers
    #[tokio::test]
    async fn story_retries_until_success() {
        let (addr, hits) = flaky_server(2).await;
        let prober = RetryingProber::new(Duration::from_millis(200), 5).unwrap();

        let attempts = prober
            .probe(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(attempts, 3);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    /// Story: Exhausted retries report the last failure and make exactly r+1 attempts
    #[tokio::test]
    async fn story_exhausted_retries_report_last_reason() {
        let (addr, hits) = flaky_server(u32::MAX).await;
        let prober = RetryingProber::new(Duration::from_millis(100), 2).unwrap();

        let err = prober
            .probe(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::Connectivity {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("503"), "{reason}");
            }
            other => panic!("Expected Connectivity error, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    /// Story: Redirects fail the attempt instead of being followed
    #[tokio::test]
    async fn story_redirect_is_a_failure() {
        let app = Router::new()
            .route(
                "/",
                get(|| async { (HttpStatus::FOUND, [(header::LOCATION, "/login")]) }),
            )
            .route("/login", get(|| async { HttpStatus::OK }));
        let addr = serve(app).await;
        let prober = RetryingProber::new(Duration::from_millis(100), 0).unwrap();

        let err = prober
            .probe(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("redirect"), "{err}");
        assert!(err.to_string().contains("/login"), "{err}");
    }

    /// Story: A hung endpoint costs one timeout window per attempt, not more
    #[tokio::test]
    async fn story_total_time_bounded_by_attempts_times_timeout() {
        let app = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                HttpStatus::OK
            }),
        );
        let addr = serve(app).await;
        let prober = RetryingProber::new(Duration::from_millis(100), 2).unwrap();

        let started = Instant::now();
        let err = prober
            .probe(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap_err();
        let elapsed = started.elapsed();

        assert!(err.to_string().contains("no response within 100ms"), "{err}");
        assert!(elapsed >= Duration::from_millis(250), "{elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");
    }

    /// Story: Refused connections still pace retries by the timeout window
    #[tokio::test]
    async fn story_refused_connection_paces_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let prober = RetryingProber::new(Duration::from_millis(100), 2).unwrap();
        let started = Instant::now();
        let err = prober
            .probe(&format!("http://{}/", addr), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Connectivity { attempts: 3, .. }));
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    /// Story: An https URL is dialed over TLS rather than rejected up front
    ///
    /// The server below only speaks plain HTTP, so the handshake fails. What
    /// matters is that the failure is a connection failure, not a client
    /// that refuses the scheme.
    #[tokio::test]
    async fn story_https_url_is_dialed() {
        let (addr, hits) = flaky_server(0).await;
        let prober = RetryingProber::new(Duration::from_millis(500), 0).unwrap();

        let err = prober
            .probe(&format!("https://{}/", addr), &CancellationToken::new())
            .await
            .unwrap_err();

        match err {
            Error::Connectivity {
                attempts, reason, ..
            } => {
                assert_eq!(attempts, 1);
                assert!(reason.starts_with("connection failed"), "{reason}");
            }
            other => panic!("Expected Connectivity, got {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// Story: No new attempt starts once the run was interrupted
    #[tokio::test]
    async fn story_cancelled_probe_makes_no_attempt() {
        let (addr, hits) = flaky_server(0).await;
        let prober = RetryingProber::new(Duration::from_millis(100), 5).unwrap();
        let stop = CancellationToken::new();
        stop.cancel();

        let err = prober
            .probe(&format!("http://{}/", addr), &stop)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Interrupted { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    /// Story: An interrupt during the pause between attempts ends the probe
    #[tokio::test]
    async fn story_cancel_between_attempts() {
        let (addr, hits) = flaky_server(u32::MAX).await;
        let prober = RetryingProber::new(Duration::from_secs(5), 5).unwrap();
        let stop = CancellationToken::new();

        let canceller = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            canceller.cancel();
        });

        let err = prober
            .probe(&format!("http://{}/", addr), &stop)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted { .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
