//! # Resource Watch Client
//!
//! Long-lived subscription to the file-change stream of a workspace:
//!
//! `GET {base}/{locator}/deconfig/watch?path-filter=..&branch=main&from-ctime=..&watcher-id=..`
//!
//! The response is an SSE stream whose `data:` payloads are JSON change records. Each record is
//! mapped to a [`WatchEvent`]; malformed records are logged and dropped without ending the stream.
//!
//! Every subscription records its start time once; reconnects keep it. With `skip_historical`
//! set, events whose `ctime` predates the subscription are kept in the local history but never
//! forwarded, so consumers only react to writes that happened after they subscribed. Writes made
//! while a reconnect was pending are newer than that start and are forwarded. `from-ctime`
//! resumes after the last observed change, which keeps reconnects from replaying what was
//! already seen.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use flowsync_types::{WatchEvent, WatchEventKind};
use futures_util::StreamExt;
use reqwest::{Method, StatusCode, Url, header};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::FlowsyncClient;
use crate::sse::{SseDecoder, SseFrame};

/// Branch every subscription is pinned to.
pub const WATCH_BRANCH: &str = "main";
/// Events retained in [`ResourceWatchClient::history`] unless configured otherwise.
pub const DEFAULT_HISTORY_CAPACITY: usize = 1024;

/// Failures of a single watch connection.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("watch locator is not configured")]
    MissingLocator,
    #[error("invalid watch url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("watch request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("watch endpoint returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("watch stream closed by server")]
    StreamClosed,
}

impl WatchError {
    /// Configuration problems and client errors other than timeouts and throttling are final.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::MissingLocator | Self::InvalidUrl(_) => false,
            Self::Status { status, .. } => {
                !status.is_client_error() || *status == StatusCode::REQUEST_TIMEOUT || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Request(_) | Self::StreamClosed => true,
        }
    }
}

/// What to subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    pub path_filter: String,
    /// Drop events that happened before the subscription started.
    pub skip_historical: bool,
}

impl WatchOptions {
    pub fn new(path_filter: impl Into<String>) -> Self {
        Self {
            path_filter: path_filter.into(),
            skip_historical: true,
        }
    }

    pub fn include_history(mut self) -> Self {
        self.skip_historical = false;
        self
    }
}

/// Reconnect policy for [`ResourceWatchClient::watch_with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// `min(base * 2^attempt, max)` for a zero-based attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Per-subscription suppression state, shared by every connection of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchSession {
    subscribed_at: u64,
    skip_historical: bool,
}

impl WatchSession {
    /// Starts a session now.
    pub fn start(skip_historical: bool) -> Self {
        Self::starting_at(now_millis(), skip_historical)
    }

    pub fn starting_at(subscribed_at: u64, skip_historical: bool) -> Self {
        Self {
            subscribed_at,
            skip_historical,
        }
    }

    /// Milliseconds since the epoch at which the subscription began.
    pub fn subscribed_at(&self) -> u64 {
        self.subscribed_at
    }

    /// Whether the event should reach the consumer.
    pub fn should_forward(&self, event: &WatchEvent) -> bool {
        !(self.skip_historical && event.ctime < self.subscribed_at)
    }
}

fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default()
}

/// Change record as sent by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChangeRecord {
    #[serde(rename = "type")]
    kind: String,
    path: String,
    #[serde(default)]
    metadata: Option<Value>,
    timestamp: u64,
    #[serde(default)]
    patch_id: Option<Value>,
}

/// Decodes one `data:` payload, logging and dropping anything malformed.
pub fn decode_watch_event(data: &str) -> Option<WatchEvent> {
    let record: RawChangeRecord = match serde_json::from_str(data) {
        Ok(record) => record,
        Err(error) => {
            warn!(error = %error, "dropping malformed watch event");
            return None;
        }
    };
    let Some(kind) = WatchEventKind::from_wire(&record.kind) else {
        warn!(kind = %record.kind, path = %record.path, "dropping watch event with unknown type");
        return None;
    };
    debug!(path = %record.path, ctime = record.timestamp, patch = ?record.patch_id, "decoded watch event");
    Some(WatchEvent {
        kind,
        path: record.path,
        ctime: record.timestamp,
        metadata: record.metadata,
    })
}

#[derive(Debug)]
struct WatchState {
    last_ctime: Option<u64>,
    history: VecDeque<WatchEvent>,
    history_capacity: usize,
}

impl WatchState {
    fn with_capacity(history_capacity: usize) -> Self {
        Self {
            last_ctime: None,
            history: VecDeque::with_capacity(history_capacity.min(DEFAULT_HISTORY_CAPACITY)),
            history_capacity,
        }
    }

    fn record(&mut self, event: &WatchEvent) {
        self.last_ctime = Some(self.last_ctime.map_or(event.ctime, |last| last.max(event.ctime)));
        if self.history_capacity == 0 {
            return;
        }
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(event.clone());
    }
}

/// Subscribes to workspace file changes.
///
/// The client keeps the highest observed `ctime` across connections, so reconnects resume where
/// the previous connection stopped, plus the most recent events in a bounded history.
#[derive(Debug)]
pub struct ResourceWatchClient {
    client: FlowsyncClient,
    state: Mutex<WatchState>,
}

impl ResourceWatchClient {
    pub fn new(client: FlowsyncClient) -> Self {
        Self {
            client,
            state: Mutex::new(WatchState::with_capacity(DEFAULT_HISTORY_CAPACITY)),
        }
    }

    /// Keeps at most `capacity` events in [`Self::history`]; older ones are dropped first.
    pub fn with_history_capacity(self, capacity: usize) -> Self {
        let mut state = self.state.into_inner().unwrap_or_else(PoisonError::into_inner);
        state.history_capacity = capacity;
        while state.history.len() > capacity {
            state.history.pop_front();
        }
        Self {
            client: self.client,
            state: Mutex::new(state),
        }
    }

    fn state(&self) -> MutexGuard<'_, WatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The most recent events received, forwarded or not, in arrival order.
    pub fn history(&self) -> Vec<WatchEvent> {
        self.state().history.iter().cloned().collect()
    }

    pub fn clear_history(&self) {
        self.state().history.clear();
    }

    pub fn last_ctime(&self) -> Option<u64> {
        self.state().last_ctime
    }

    /// Builds the subscription URL with a fresh watcher id.
    pub fn watch_url(&self, path_filter: &str) -> Result<Url, WatchError> {
        let config = self.client.config();
        let locator = config.locator.as_deref().ok_or(WatchError::MissingLocator)?;
        let from_ctime = self.last_ctime().map_or(1, |ctime| ctime.saturating_add(1));

        let mut url = Url::parse(&format!("{}/{}/deconfig/watch", config.base(), locator.trim_matches('/')))?;
        url.query_pairs_mut()
            .append_pair("path-filter", path_filter)
            .append_pair("branch", WATCH_BRANCH)
            .append_pair("from-ctime", &from_ctime.to_string())
            .append_pair("watcher-id", &Uuid::new_v4().to_string());
        Ok(url)
    }

    /// Records an event and reports whether it should be forwarded.
    pub fn observe(&self, session: &WatchSession, event: &WatchEvent) -> bool {
        self.state().record(event);
        session.should_forward(event)
    }

    /// Handles decoded frames for a session, invoking `on_event` for forwarded events.
    pub fn dispatch_frames<F>(&self, session: &WatchSession, frames: Vec<SseFrame>, on_event: &mut F) -> usize
    where
        F: FnMut(WatchEvent),
    {
        let mut forwarded = 0;
        for event in frames.iter().filter_map(|frame| frame.data.as_deref()).filter_map(decode_watch_event) {
            if self.observe(session, &event) {
                forwarded += 1;
                on_event(event);
            } else {
                debug!(path = %event.path, ctime = event.ctime, "suppressed historical watch event");
            }
        }
        forwarded
    }

    /// Runs one connection until it is cancelled (returns `Ok`) or fails.
    pub async fn watch<F>(&self, options: &WatchOptions, cancel: &CancellationToken, mut on_event: F) -> Result<(), WatchError>
    where
        F: FnMut(WatchEvent) + Send,
    {
        let session = WatchSession::start(options.skip_historical);
        self.watch_once(&session, options, cancel, &mut on_event).await
    }

    async fn watch_once<F>(
        &self,
        session: &WatchSession,
        options: &WatchOptions,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(WatchEvent) + Send,
    {
        let url = self.watch_url(&options.path_filter)?;
        info!(path_filter = %options.path_filter, subscribed_at = session.subscribed_at(), "opening watch stream");

        let request = self
            .client
            .request(Method::GET, url)
            .header(header::ACCEPT, "text/event-stream");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            response = request.send() => response?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(WatchError::Status { status, body });
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::new();
        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("watch cancelled");
                    return Ok(());
                }
                chunk = stream.next() => chunk,
            };
            match chunk {
                Some(Ok(bytes)) => {
                    let frames = decoder.push(&bytes);
                    self.dispatch_frames(session, frames, on_event);
                }
                Some(Err(error)) => return Err(error.into()),
                None => {
                    let trailing = decoder.finish().into_iter().collect();
                    self.dispatch_frames(session, trailing, on_event);
                    return Err(WatchError::StreamClosed);
                }
            }
        }
    }

    /// Like [`Self::watch`], reconnecting retryable failures with capped exponential backoff.
    ///
    /// Gives up after `max_retries` consecutive failed connections.
    pub async fn watch_with_retry<F>(
        &self,
        options: &WatchOptions,
        retry: RetryConfig,
        cancel: &CancellationToken,
        mut on_event: F,
    ) -> Result<(), WatchError>
    where
        F: FnMut(WatchEvent) + Send,
    {
        let session = WatchSession::start(options.skip_historical);
        let mut attempt = 0;
        loop {
            let resume_from = self.last_ctime();
            let result = self.watch_once(&session, options, cancel, &mut on_event).await;
            // A connection that delivered events starts a fresh backoff sequence.
            if self.last_ctime() != resume_from {
                attempt = 0;
            }
            match result {
                Ok(()) => return Ok(()),
                Err(error) if error.is_retryable() && attempt < retry.max_retries => {
                    let delay = retry.delay_for_attempt(attempt);
                    attempt += 1;
                    warn!(error = %error, attempt, delay = ?delay, "watch failed; reconnecting");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ApiConfig;

    fn watch_client() -> ResourceWatchClient {
        let config = ApiConfig::default().with_base_url("http://localhost:3001/").with_locator("acme/default");
        ResourceWatchClient::new(FlowsyncClient::new(config).expect("client"))
    }

    fn frame_for(kind: &str, path: &str, timestamp: u64) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"type": kind, "path": path, "timestamp": timestamp, "patchId": 3})
        )
    }

    #[test]
    fn url_carries_filter_branch_ctime_and_watcher_id() {
        let client = watch_client();
        let url = client.watch_url("/src/workflows/").expect("url");
        assert_eq!(url.path(), "/acme/default/deconfig/watch");

        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0], ("path-filter".into(), "/src/workflows/".into()));
        assert_eq!(pairs[1], ("branch".into(), "main".into()));
        assert_eq!(pairs[2], ("from-ctime".into(), "1".into()));
        assert!(Uuid::parse_str(&pairs[3].1).is_ok());

        let other = client.watch_url("/src/workflows/").expect("url");
        assert_ne!(url.query(), other.query(), "watcher id is fresh per connection");
    }

    #[test]
    fn from_ctime_resumes_after_last_event() {
        let client = watch_client();
        let session = WatchSession::starting_at(0, false);
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(frame_for("modified", "/src/workflows/a.json", 1_700).as_bytes());
        client.dispatch_frames(&session, frames, &mut |_| {});

        let url = client.watch_url("/src/").expect("url");
        assert!(url.query().is_some_and(|query| query.contains("from-ctime=1701")));
    }

    #[test]
    fn historical_events_are_recorded_but_not_forwarded() {
        let client = watch_client();
        let start = 1_000_000;
        let session = WatchSession::starting_at(start, true);

        let body = [
            frame_for("modified", "/src/workflows/a.json", start - 1),
            frame_for("modified", "/src/workflows/a.json", start + 1),
        ]
        .concat();
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(body.as_bytes());

        let mut forwarded = Vec::new();
        let count = client.dispatch_frames(&session, frames, &mut |event| forwarded.push(event));
        assert_eq!(count, 1);
        assert_eq!(forwarded.len(), 1);
        assert_eq!(forwarded[0].ctime, start + 1);
        assert_eq!(forwarded[0].kind, WatchEventKind::Modify);

        assert_eq!(client.history().len(), 2);
        assert_eq!(client.last_ctime(), Some(start + 1));
        client.clear_history();
        assert!(client.history().is_empty());
    }

    #[test]
    fn history_is_forwarded_when_requested() {
        let session = WatchSession::starting_at(10, false);
        let event = WatchEvent {
            kind: WatchEventKind::Add,
            path: "/a".into(),
            ctime: 1,
            metadata: None,
        };
        assert!(session.should_forward(&event));
        assert!(!WatchSession::starting_at(10, true).should_forward(&event));
    }

    #[test]
    fn malformed_records_are_dropped() {
        assert!(decode_watch_event("not json").is_none());
        assert!(decode_watch_event(r#"{"type": "renamed", "path": "/a", "timestamp": 1}"#).is_none());
        assert!(decode_watch_event(r#"{"type": "added", "path": "/a"}"#).is_none());

        let event = decode_watch_event(r#"{"type": "deleted", "path": "/a", "timestamp": 9, "metadata": {"size": 1}}"#)
            .expect("valid record");
        assert_eq!(event.kind, WatchEventKind::Delete);
        assert_eq!(event.metadata, Some(serde_json::json!({"size": 1})));
    }

    #[test]
    fn backoff_is_capped() {
        let retry = RetryConfig::default();
        assert_eq!(retry.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(retry.delay_for_attempt(10), Duration::from_secs(30));
        assert_eq!(retry.delay_for_attempt(40), Duration::from_secs(30));
    }

    #[test]
    fn client_errors_are_final() {
        let unauthorized = WatchError::Status {
            status: StatusCode::UNAUTHORIZED,
            body: String::new(),
        };
        assert!(!unauthorized.is_retryable());
        let unavailable = WatchError::Status {
            status: StatusCode::SERVICE_UNAVAILABLE,
            body: String::new(),
        };
        assert!(unavailable.is_retryable());
        assert!(WatchError::StreamClosed.is_retryable());
    }

    #[tokio::test]
    async fn cancelled_watch_returns_cleanly() {
        let client = watch_client();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = client
            .watch_with_retry(&WatchOptions::new("/src/"), RetryConfig::default(), &cancel, |_| {})
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn missing_locator_is_not_retried() {
        let client = ResourceWatchClient::new(FlowsyncClient::new(ApiConfig::default()).expect("client"));
        let result = client
            .watch_with_retry(&WatchOptions::new("/src/"), RetryConfig::default(), &CancellationToken::new(), |_| {})
            .await;
        assert!(matches!(result, Err(WatchError::MissingLocator)));
    }

    #[test]
    fn history_keeps_the_most_recent_events() {
        let client = watch_client().with_history_capacity(2);
        let session = WatchSession::starting_at(0, false);
        let body = [
            frame_for("added", "/src/a.json", 1),
            frame_for("modified", "/src/a.json", 2),
            frame_for("modified", "/src/a.json", 3),
        ]
        .concat();
        let frames = SseDecoder::new().push(body.as_bytes());
        assert_eq!(client.dispatch_frames(&session, frames, &mut |_| {}), 3);

        let ctimes: Vec<u64> = client.history().iter().map(|event| event.ctime).collect();
        assert_eq!(ctimes, vec![2, 3]);
        assert_eq!(client.last_ctime(), Some(3));
    }

    mod streaming {
        use super::*;
        use std::sync::Arc;
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        /// Replaced with a ctime slightly before the moment the chunk is written.
        const RECENT_CTIME: &str = "RECENT_CTIME";

        /// One canned HTTP response; every accepted connection takes the next one.
        struct CannedResponse {
            status: &'static str,
            chunks: Vec<String>,
            hold_open: bool,
        }

        impl CannedResponse {
            fn events(chunks: &[&str]) -> Self {
                Self {
                    status: "200 OK",
                    chunks: chunks.iter().map(|chunk| chunk.to_string()).collect(),
                    hold_open: false,
                }
            }

            fn status(status: &'static str, body: &str) -> Self {
                Self {
                    status,
                    chunks: vec![body.to_string()],
                    hold_open: false,
                }
            }

            fn held_open(mut self) -> Self {
                self.hold_open = true;
                self
            }
        }

        /// Serves the responses in order and returns the base URL plus the request lines seen.
        async fn serve(responses: Vec<CannedResponse>) -> (String, Arc<Mutex<Vec<String>>>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
            let base_url = format!("http://{}", listener.local_addr().expect("local addr"));
            let requests = Arc::new(Mutex::new(Vec::new()));
            let seen = requests.clone();

            tokio::spawn(async move {
                for response in responses {
                    let Ok((mut socket, _)) = listener.accept().await else {
                        return;
                    };
                    let mut head = Vec::new();
                    let mut buffer = [0u8; 1024];
                    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
                        match socket.read(&mut buffer).await {
                            Ok(0) | Err(_) => break,
                            Ok(read) => head.extend_from_slice(&buffer[..read]),
                        }
                    }
                    let request_line = String::from_utf8_lossy(&head).lines().next().unwrap_or_default().to_string();
                    seen.lock().unwrap().push(request_line);

                    let content_type = if response.status.starts_with("200") { "text/event-stream" } else { "text/plain" };
                    let head = format!("HTTP/1.1 {}\r\nContent-Type: {content_type}\r\nConnection: close\r\n\r\n", response.status);
                    let _ = socket.write_all(head.as_bytes()).await;
                    for chunk in response.chunks {
                        let chunk = chunk.replace(RECENT_CTIME, &(now_millis() - 20).to_string());
                        let _ = socket.write_all(chunk.as_bytes()).await;
                        let _ = socket.flush().await;
                        tokio::time::sleep(Duration::from_millis(20)).await;
                    }
                    if response.hold_open {
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_secs(30)).await;
                            drop(socket);
                        });
                    }
                }
            });
            (base_url, requests)
        }

        fn client_for(base_url: &str) -> ResourceWatchClient {
            let config = ApiConfig::default().with_base_url(base_url).with_locator("acme/default");
            ResourceWatchClient::new(FlowsyncClient::new(config).expect("client"))
        }

        fn quick_retry(max_retries: u32) -> RetryConfig {
            RetryConfig {
                max_retries,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_millis(200),
            }
        }

        #[tokio::test]
        async fn split_frames_are_reassembled_and_the_trailing_frame_is_flushed() {
            let (base_url, _) = serve(vec![CannedResponse::events(&[
                r#"data: {"type":"modi"#,
                concat!(r#"fied","path":"/src/a.json","timestamp":5}"#, "\n\n", r#"data: {"type":"added","#),
                r#""path":"/src/b.json","timestamp":6}"#,
            ])])
            .await;
            let client = client_for(&base_url);

            let mut forwarded = Vec::new();
            let result = client
                .watch(&WatchOptions::new("/src/").include_history(), &CancellationToken::new(), |event| {
                    forwarded.push((event.kind, event.ctime))
                })
                .await;

            assert!(matches!(result, Err(WatchError::StreamClosed)));
            assert_eq!(forwarded, vec![(WatchEventKind::Modify, 5), (WatchEventKind::Add, 6)]);
        }

        #[tokio::test]
        async fn client_error_status_is_reported_without_retrying() {
            let (base_url, requests) = serve(vec![
                CannedResponse::status("401 Unauthorized", "denied"),
                CannedResponse::events(&[]),
            ])
            .await;
            let client = client_for(&base_url);

            let result = client
                .watch_with_retry(&WatchOptions::new("/src/"), quick_retry(3), &CancellationToken::new(), |_| {})
                .await;

            match result {
                Err(WatchError::Status { status, body }) => {
                    assert_eq!(status, StatusCode::UNAUTHORIZED);
                    assert_eq!(body, "denied");
                }
                other => panic!("expected status error, got {other:?}"),
            }
            assert_eq!(requests.lock().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn reconnect_forwards_changes_made_while_disconnected() {
            let old_change = frame_for("modified", "/src/a.json", 5);
            let gap_change = format!(
                "data: {{\"type\":\"modified\",\"path\":\"/src/a.json\",\"timestamp\":{RECENT_CTIME}}}\n\n"
            );
            let (base_url, requests) = serve(vec![
                CannedResponse::events(&[&old_change]),
                CannedResponse::events(&[&gap_change]).held_open(),
            ])
            .await;
            let client = client_for(&base_url);
            let cancel = CancellationToken::new();
            let subscribed_after = now_millis();

            let mut forwarded = Vec::new();
            let result = client
                .watch_with_retry(&WatchOptions::new("/src/"), quick_retry(3), &cancel, |event| {
                    forwarded.push(event.ctime);
                    cancel.cancel();
                })
                .await;

            assert!(result.is_ok());
            assert_eq!(forwarded.len(), 1, "only the change after subscribing is forwarded");
            assert!(forwarded[0] >= subscribed_after);
            assert_eq!(client.history().len(), 2);

            let requests = requests.lock().unwrap();
            assert_eq!(requests.len(), 2);
            assert!(requests[1].contains("from-ctime=6&"), "reconnect resumes after the last change: {}", requests[1]);
        }

        #[tokio::test]
        async fn retry_budget_resets_after_a_connection_delivers_events() {
            let (base_url, requests) = serve(vec![
                CannedResponse::events(&[]),
                CannedResponse::events(&[&frame_for("added", "/src/a.json", 7)]),
                CannedResponse::events(&[]),
            ])
            .await;
            let client = client_for(&base_url);

            let mut forwarded = Vec::new();
            let result = client
                .watch_with_retry(&WatchOptions::new("/src/").include_history(), quick_retry(1), &CancellationToken::new(), |event| {
                    forwarded.push(event.ctime)
                })
                .await;

            assert!(matches!(result, Err(WatchError::StreamClosed)));
            assert_eq!(forwarded, vec![7]);
            let requests = requests.lock().unwrap();
            assert_eq!(requests.len(), 3);
            assert!(requests[2].contains("from-ctime=8&"));
        }

        #[tokio::test]
        async fn cancelling_mid_stream_returns_cleanly() {
            let (base_url, _) = serve(vec![CannedResponse::events(&[&frame_for("added", "/src/a.json", 1)]).held_open()]).await;
            let client = client_for(&base_url);
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();

            let mut seen = 0;
            let result = client
                .watch(&WatchOptions::new("/src/").include_history(), &cancel, |_| {
                    seen += 1;
                    trigger.cancel();
                })
                .await;

            assert!(result.is_ok());
            assert_eq!(seen, 1);
        }
    }
}
