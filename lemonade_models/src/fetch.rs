//! Fetcher – HTTP with production failure semantics
//! ================================================
//!
//! One [`reqwest::Client`] (one connection pool) behind a small API:
//!
//! * [`Fetcher::get`] / [`Fetcher::post_json`] – buffered request helpers.
//! * [`Fetcher::post_stream`] – body chunks handed to a callback as they
//!   arrive; returning `false` aborts the transfer. A transport error after
//!   a 200 status is treated as end-of-stream, not as a failure, because
//!   inference servers routinely close mid-keep-alive after the final SSE
//!   event.
//! * [`Fetcher::download`] – resumable file download. Resumes from the
//!   on-disk size via a `Range:` header, classifies errors as transient
//!   (retried with exponential backoff) or permanent (reported with a
//!   resumable/not-resumable verdict), and always preserves the partial
//!   file.
//! * [`Fetcher::reachable`] – `true` only on HTTP 200.

use std::{
    io::Write,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use backoff::backoff::Backoff;
use futures::StreamExt;

/// Default timeout for buffered requests.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("HTTP {status} from {url}")]
    Status { status: u16, url: String },

    #[error("response from {url} is not valid JSON: {source}")]
    Json {
        url: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(
        "download of {url} gave up after {attempts} attempts: {reason}; \
         the partial file was kept and the download is resumable"
    )]
    RetriesExhausted {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("download of {url} failed: {reason}; the partial file is not resumable")]
    Permanent { url: String, reason: String },

    #[error("download of {url} was cancelled; the partial file was kept")]
    Cancelled { url: String },

    #[error("{operation} failed for '{path}'")]
    FileSystem {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
    /// Whether re-running the download can pick up where this one stopped.
    /// `None` for errors that are not download failures.
    pub fn resumable(&self) -> Option<bool> {
        match self {
            FetchError::RetriesExhausted { .. } | FetchError::Cancelled { .. } => Some(true),
            FetchError::Permanent { .. } => Some(false),
            _ => None,
        }
    }
}

pub type FetchResult<T> = std::result::Result<T, FetchError>;

/// Retry knobs for [`Fetcher::download`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl RetryPolicy {
    fn backoff(&self) -> backoff::ExponentialBackoff {
        backoff::ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_delay)
            .with_max_interval(self.max_delay)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Cooperative cancellation flag shared between a download and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Downloaded { bytes: u64 },
    /// The server answered 416 to a non-zero resume offset: everything is
    /// already on disk.
    AlreadyComplete,
}

/// Internal classification used by the retry loop.
enum DownloadFailure {
    Transient(String),
    Permanent(String),
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct Fetcher {
    client: reqwest::Client,
    policy: RetryPolicy,
}

impl Default for Fetcher {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

impl Fetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            client: reqwest::Client::new(),
            policy,
        }
    }

    /// Buffered GET; errors on any non-2xx status.
    pub async fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> FetchResult<reqwest::Response> {
        let mut req = self.client.get(url).timeout(REQUEST_TIMEOUT);
        for (name, value) in headers {
            req = req.header(*name, *value);
        }
        let response = req.send().await.map_err(|e| FetchError::Request {
            url: url.to_owned(),
            source: e,
        })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_owned(),
            });
        }
        Ok(response)
    }

    pub async fn get_json(&self, url: &str) -> FetchResult<serde_json::Value> {
        let response = self.get(url, &[]).await?;
        let bytes = response.bytes().await.map_err(|e| FetchError::Request {
            url: url.to_owned(),
            source: e,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Json {
            url: url.to_owned(),
            source: e,
        })
    }

    /// Buffered POST with a JSON body.
    pub async fn post_json(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> FetchResult<serde_json::Value> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_owned(),
                source: e,
            })?;
        let status = response.status();
        let bytes = response.bytes().await.map_err(|e| FetchError::Request {
            url: url.to_owned(),
            source: e,
        })?;
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_owned(),
            });
        }
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Json {
            url: url.to_owned(),
            source: e,
        })
    }

    /// POST that never interprets the status: returns `(status, body)` so a
    /// proxy can relay upstream error bodies verbatim.
    pub async fn post_passthrough(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> FetchResult<(u16, Vec<u8>)> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_owned(),
                source: e,
            })?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await.map_err(|e| FetchError::Request {
            url: url.to_owned(),
            source: e,
        })?;
        Ok((status, bytes.to_vec()))
    }

    /// Two-phase streaming POST: sends the request, checks the status, and
    /// hands the open response back so the caller can consume the body
    /// stream itself (dropping it aborts the transfer).
    pub async fn post_stream_response(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> FetchResult<reqwest::Response> {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_owned(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_owned(),
            });
        }
        Ok(response)
    }

    /// Streaming POST. `on_chunk` is called with each body chunk as it
    /// arrives; returning `false` aborts the transfer (this is the client
    /// disconnect path and is not an error). Errors raised by the transport
    /// *after* a successful status are end-of-stream, not failures.
    pub async fn post_stream<F>(
        &self,
        url: &str,
        body: &serde_json::Value,
        timeout: Duration,
        mut on_chunk: F,
    ) -> FetchResult<()>
    where
        F: FnMut(&[u8]) -> bool,
    {
        let response = self
            .client
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Request {
                url: url.to_owned(),
                source: e,
            })?;
        if !response.status().is_success() {
            return Err(FetchError::Status {
                status: response.status().as_u16(),
                url: url.to_owned(),
            });
        }

        let mut stream = response.bytes_stream();
        while let Some(item) = stream.next().await {
            match item {
                Ok(chunk) => {
                    if !on_chunk(&chunk) {
                        crate::debug!("downstream aborted streaming transfer from {url}");
                        return Ok(());
                    }
                }
                Err(e) => {
                    crate::debug!("upstream stream from {url} ended with {e}; treating as EOF");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// `true` only when the URL answers HTTP 200 within `timeout`.
    pub async fn reachable(&self, url: &str, timeout: Duration) -> bool {
        match self.client.get(url).timeout(timeout).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Resumable download with retry. Progress is reported as
    /// `(bytes_downloaded, bytes_total)`; the total is `None` when the
    /// server does not advertise a length.
    pub async fn download<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelToken,
        mut on_progress: F,
    ) -> FetchResult<DownloadOutcome>
    where
        F: FnMut(u64, Option<u64>),
    {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent).map_err(|e| FetchError::FileSystem {
                operation: "create download directory",
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut backoff = self.policy.backoff();
        let mut attempts: u32 = 0;
        loop {
            match self.download_once(url, dest, cancel, &mut on_progress).await {
                Ok(outcome) => return Ok(outcome),
                Err(DownloadFailure::Cancelled) => {
                    return Err(FetchError::Cancelled {
                        url: url.to_owned(),
                    });
                }
                Err(DownloadFailure::Permanent(reason)) => {
                    return Err(FetchError::Permanent {
                        url: url.to_owned(),
                        reason,
                    });
                }
                Err(DownloadFailure::Transient(reason)) => {
                    attempts += 1;
                    if attempts > self.policy.max_retries {
                        return Err(FetchError::RetriesExhausted {
                            url: url.to_owned(),
                            attempts,
                            reason,
                        });
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.policy.max_delay);
                    crate::warn!(
                        "download of {url} hit transient error ({reason}); \
                         retry {attempts}/{} in {delay:?}",
                        self.policy.max_retries
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn download_once<F>(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancelToken,
        on_progress: &mut F,
    ) -> Result<DownloadOutcome, DownloadFailure>
    where
        F: FnMut(u64, Option<u64>),
    {
        if cancel.is_cancelled() {
            return Err(DownloadFailure::Cancelled);
        }

        let existing = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);

        let mut req = self.client.get(url);
        if existing > 0 {
            req = req.header(reqwest::header::RANGE, format!("bytes={existing}-"));
        }

        let response = req.send().await.map_err(|e| {
            // A redirect loop never resolves on its own; retrying it only
            // burns the backoff budget.
            if e.is_redirect() {
                DownloadFailure::Permanent(format!("redirect loop: {e}"))
            } else {
                DownloadFailure::Transient(format!("request failed: {e}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // The server has nothing past our offset: the file is complete.
            on_progress(existing, Some(existing));
            return Ok(DownloadOutcome::AlreadyComplete);
        }
        if status.is_client_error() {
            return Err(DownloadFailure::Permanent(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(DownloadFailure::Transient(format!("HTTP {status}")));
        }

        // Resume only counts when the server honored the Range; a plain 200
        // means it restarted the body from byte zero.
        let resumed = existing > 0 && status == reqwest::StatusCode::PARTIAL_CONTENT;
        let offset = if resumed { existing } else { 0 };
        let total = response.content_length().map(|len| len + offset);

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(dest)
            .map_err(|e| DownloadFailure::Transient(format!("open {}: {e}", dest.display())))?;

        let mut downloaded = offset;
        let mut stream = response.bytes_stream();
        while let Some(item) = stream.next().await {
            if cancel.is_cancelled() {
                return Err(DownloadFailure::Cancelled);
            }
            let chunk = item
                .map_err(|e| DownloadFailure::Transient(format!("truncated response: {e}")))?;
            file.write_all(&chunk)
                .map_err(|e| DownloadFailure::Transient(format!("write failed: {e}")))?;
            downloaded += chunk.len() as u64;
            on_progress(downloaded, total);
        }

        if let Some(total) = total {
            if downloaded < total {
                return Err(DownloadFailure::Transient(format!(
                    "truncated response: got {downloaded} of {total} bytes"
                )));
            }
        }

        Ok(DownloadOutcome::Downloaded { bytes: downloaded })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_retries: 2,
        }
    }

    #[tokio::test]
    async fn download_resumes_with_range_header() {
        let mut server = mockito::Server::new_async().await;
        let body_tail = b"world";
        let mock = server
            .mock("GET", "/file.bin")
            .match_header("range", "bytes=5-")
            .with_status(206)
            .with_body(body_tail)
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let dest = td.path().join("file.bin");
        std::fs::write(&dest, b"hello").unwrap();

        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/file.bin", server.url());
        let outcome = fetcher
            .download(&url, &dest, &CancelToken::new(), |_, _| {})
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(outcome, DownloadOutcome::Downloaded { bytes: 10 });
        assert_eq!(std::fs::read(&dest).unwrap(), b"helloworld");
    }

    #[tokio::test]
    async fn http_416_on_resume_is_complete() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/file.bin")
            .with_status(416)
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let dest = td.path().join("file.bin");
        std::fs::write(&dest, b"already-here").unwrap();

        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/file.bin", server.url());
        let outcome = fetcher
            .download(&url, &dest, &CancelToken::new(), |_, _| {})
            .await
            .unwrap();

        assert_eq!(outcome, DownloadOutcome::AlreadyComplete);
        assert_eq!(std::fs::read(&dest).unwrap(), b"already-here");
    }

    #[tokio::test]
    async fn plain_200_on_resume_restarts_from_zero() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/file.bin")
            .with_status(200)
            .with_body(b"fresh")
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let dest = td.path().join("file.bin");
        std::fs::write(&dest, b"stale-partial").unwrap();

        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/file.bin", server.url());
        fetcher
            .download(&url, &dest, &CancelToken::new(), |_, _| {})
            .await
            .unwrap();

        assert_eq!(std::fs::read(&dest).unwrap(), b"fresh");
    }

    #[tokio::test]
    async fn client_error_is_permanent_and_not_resumable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/missing.bin")
            .with_status(404)
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/missing.bin", server.url());
        let err = fetcher
            .download(&url, &td.path().join("missing.bin"), &CancelToken::new(), |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Permanent { .. }));
        assert_eq!(err.resumable(), Some(false));
    }

    #[tokio::test]
    async fn redirect_loop_is_permanent_and_not_retried() {
        let mut server = mockito::Server::new_async().await;
        // The mock redirects to itself; the client gives up after its
        // redirect cap within a single attempt. Anything past that cap
        // would mean the loop was retried.
        let mock = server
            .mock("GET", "/loop.bin")
            .with_status(302)
            .with_header("location", "/loop.bin")
            .expect_at_most(11)
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/loop.bin", server.url());
        let err = fetcher
            .download(&url, &td.path().join("loop.bin"), &CancelToken::new(), |_, _| {})
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, FetchError::Permanent { .. }));
        assert_eq!(err.resumable(), Some(false));
    }

    #[tokio::test]
    async fn server_errors_retry_then_exhaust() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky.bin")
            .with_status(503)
            .expect(3) // first try + max_retries
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/flaky.bin", server.url());
        let err = fetcher
            .download(&url, &td.path().join("flaky.bin"), &CancelToken::new(), |_, _| {})
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(matches!(err, FetchError::RetriesExhausted { attempts: 3, .. }));
        assert_eq!(err.resumable(), Some(true));
    }

    #[tokio::test]
    async fn cancelled_download_keeps_partial_file() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/big.bin")
            .with_status(200)
            .with_body(vec![0u8; 1024])
            .create_async()
            .await;

        let td = tempfile::tempdir().unwrap();
        let dest = td.path().join("big.bin");
        std::fs::write(&dest, b"partial").unwrap();

        let cancel = CancelToken::new();
        cancel.cancel();

        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/big.bin", server.url());
        let err = fetcher
            .download(&url, &dest, &cancel, |_, _| {})
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Cancelled { .. }));
        assert_eq!(std::fs::read(&dest).unwrap(), b"partial");
    }

    #[tokio::test]
    async fn post_stream_aborts_when_callback_declines() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/stream")
            .with_status(200)
            .with_body(vec![b'x'; 64 * 1024])
            .create_async()
            .await;

        let fetcher = Fetcher::new(quick_policy());
        let url = format!("{}/stream", server.url());
        let mut calls = 0;
        fetcher
            .post_stream(&url, &serde_json::json!({}), REQUEST_TIMEOUT, |_| {
                calls += 1;
                false
            })
            .await
            .unwrap();

        assert_eq!(calls, 1, "transfer should stop after the first refusal");
    }

    #[tokio::test]
    async fn reachable_only_on_200() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/ok").with_status(200).create_async().await;
        server.mock("GET", "/no").with_status(503).create_async().await;

        let fetcher = Fetcher::default();
        assert!(fetcher.reachable(&format!("{}/ok", server.url()), REQUEST_TIMEOUT).await);
        assert!(!fetcher.reachable(&format!("{}/no", server.url()), REQUEST_TIMEOUT).await);
        assert!(!fetcher.reachable("http://127.0.0.1:1/none", Duration::from_millis(200)).await);
    }
}
