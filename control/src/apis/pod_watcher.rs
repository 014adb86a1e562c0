//! Pod watch loop
//!
//! Consumes cluster-wide pod events and hands each one to a
//! [`PodEventHandler`], strictly one at a time. The loop is an explicit
//! state machine driven by a cancellation token:
//!
//! ```text
//!              open ok                 stream end / error / lifetime
//! Connecting ---------> Watching ------------------------------------> Backoff
//!     ^    \ open failed                                                  |
//!     |     `-------------------------------------------------------------+
//!     |                         fixed delay                               |
//!     `-------------------------------------------------------------------'
//!
//! any state --(cancelled)--> Draining --> Err(Cancelled)
//! ```
//!
//! Retries are unbounded with a fixed delay. An event already being handled
//! when cancellation arrives is finished before the loop drains.

use crate::apis::metrics;
use crate::error::SyncError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

impl PodEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PodEventKind::Added => "ADDED",
            PodEventKind::Modified => "MODIFIED",
            PodEventKind::Deleted => "DELETED",
        }
    }
}

impl fmt::Display for PodEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: Pod,
}

/// One watch connection; ends when the server closes it
pub type PodEventStream = BoxStream<'static, Result<PodEvent, SyncError>>;

/// Opens pod watch streams
///
/// Sources swallow malformed events themselves; an `Err` item means the
/// stream is unusable and must be reopened.
#[async_trait]
pub trait PodEventSource: Send + Sync {
    async fn open(&self) -> Result<PodEventStream, SyncError>;
}

/// Handles one pod event to completion
#[async_trait]
pub trait PodEventHandler: Send + Sync {
    async fn handle(&self, event: &PodEvent) -> Result<(), SyncError>;
}

// =============================================================================
// Kubernetes source
// =============================================================================

/// Resource version to resume the next watch from
///
/// `"0"` asks the server for a synthetic ADDED event per existing pod.
#[derive(Debug)]
pub struct ResumeVersion(Mutex<String>);

impl Default for ResumeVersion {
    fn default() -> Self {
        Self(Mutex::new("0".to_string()))
    }
}

impl ResumeVersion {
    pub fn get(&self) -> String {
        self.0.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn set(&self, version: &str) {
        if !version.is_empty() {
            *self.0.lock().unwrap_or_else(|p| p.into_inner()) = version.to_string();
        }
    }

    pub fn reset(&self) {
        self.set("0");
    }
}

/// Translate one raw watch item
///
/// Returns None for items that are consumed here: bookmarks (which only
/// move the resume version) and events that fail to decode.
pub fn translate_watch_event(
    resume: &ResumeVersion,
    item: Result<WatchEvent<Pod>, kube::Error>,
) -> Option<Result<PodEvent, SyncError>> {
    let (kind, pod) = match item {
        Ok(WatchEvent::Added(pod)) => (PodEventKind::Added, pod),
        Ok(WatchEvent::Modified(pod)) => (PodEventKind::Modified, pod),
        Ok(WatchEvent::Deleted(pod)) => (PodEventKind::Deleted, pod),
        Ok(WatchEvent::Bookmark(bookmark)) => {
            resume.set(&bookmark.metadata.resource_version);
            return None;
        }
        Ok(WatchEvent::Error(err)) => {
            if err.code == 410 {
                // Resource version too old, start over with a full resync
                resume.reset();
            }
            return Some(Err(SyncError::Watch(format!(
                "watch error {}: {}",
                err.code, err.message
            ))));
        }
        Err(kube::Error::SerdeError(e)) => {
            warn!("Skipping malformed pod event: {}", e);
            return None;
        }
        Err(e) => return Some(Err(e.into())),
    };

    if let Some(version) = pod.resource_version() {
        resume.set(&version);
    }

    Some(Ok(PodEvent { kind, pod }))
}

/// Cluster-wide pod watch via the Kubernetes API
pub struct KubePodEventSource {
    api: Api<Pod>,
    params: WatchParams,
    resume: Arc<ResumeVersion>,
}

impl KubePodEventSource {
    /// `timeout_secs` bounds each connection server side (must be < 295)
    pub fn new(client: Client, timeout_secs: u32) -> Self {
        Self {
            api: Api::all(client),
            // Bookmarks are requested by default
            params: WatchParams::default().timeout(timeout_secs),
            resume: Arc::new(ResumeVersion::default()),
        }
    }
}

#[async_trait]
impl PodEventSource for KubePodEventSource {
    async fn open(&self) -> Result<PodEventStream, SyncError> {
        let version = self.resume.get();
        debug!("Opening pod watch from resource version {}", version);

        let events = self.api.watch(&self.params, &version).await?;
        let resume = self.resume.clone();

        Ok(events
            .filter_map(move |item| future::ready(translate_watch_event(&resume, item)))
            .boxed())
    }
}

// =============================================================================
// Watch loop
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    Connecting,
    Watching,
    Backoff,
    Draining,
}

enum Next {
    Event(PodEvent),
    Failed(SyncError),
    Closed,
    Expired,
    Cancelled,
}

/// Pod watch state machine
pub struct WatchLoop {
    source: Arc<dyn PodEventSource>,
    handler: Arc<dyn PodEventHandler>,
    reconnect_delay: Duration,
    max_stream_lifetime: Duration,
}

impl WatchLoop {
    pub fn new(
        source: Arc<dyn PodEventSource>,
        handler: Arc<dyn PodEventHandler>,
        reconnect_delay: Duration,
        max_stream_lifetime: Duration,
    ) -> Self {
        Self {
            source,
            handler,
            reconnect_delay,
            max_stream_lifetime,
        }
    }

    /// Run until `shutdown` is cancelled
    ///
    /// Only ever returns `Err(SyncError::Cancelled)`; every other failure
    /// leads back to `Connecting` after the reconnect delay.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), SyncError> {
        let mut state = WatchState::Connecting;
        let mut stream: Option<PodEventStream> = None;
        let mut deadline = Instant::now();

        loop {
            debug!("Watch loop state: {:?}", state);

            state = match state {
                WatchState::Connecting => {
                    if shutdown.is_cancelled() {
                        WatchState::Draining
                    } else {
                        tokio::select! {
                            biased;
                            _ = shutdown.cancelled() => WatchState::Draining,
                            opened = self.source.open() => match opened {
                                Ok(events) => {
                                    info!("Start watching pod events...");
                                    stream = Some(events);
                                    deadline = Instant::now() + self.max_stream_lifetime;
                                    WatchState::Watching
                                }
                                Err(e) => {
                                    error!("Failed to create watcher: {}", e);
                                    metrics::record_watch_restart("open_failed");
                                    WatchState::Backoff
                                }
                            },
                        }
                    }
                }

                WatchState::Watching => {
                    let next = match stream.as_mut() {
                        Some(events) => {
                            tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => Next::Cancelled,
                                _ = sleep_until(deadline) => Next::Expired,
                                item = events.next() => match item {
                                    Some(Ok(event)) => Next::Event(event),
                                    Some(Err(e)) => Next::Failed(e),
                                    None => Next::Closed,
                                },
                            }
                        }
                        None => Next::Closed,
                    };

                    match next {
                        Next::Event(event) => {
                            if shutdown.is_cancelled() {
                                WatchState::Draining
                            } else {
                                self.dispatch(&event).await;
                                WatchState::Watching
                            }
                        }
                        Next::Failed(e) => {
                            warn!("Pod watch failed, retrying: {}", e);
                            metrics::record_watch_restart("stream_error");
                            stream = None;
                            WatchState::Backoff
                        }
                        Next::Closed => {
                            warn!("Watcher stopped, retrying...");
                            metrics::record_watch_restart("stream_closed");
                            stream = None;
                            WatchState::Backoff
                        }
                        Next::Expired => {
                            info!(
                                "Pod watch reached its {}s lifetime, reconnecting",
                                self.max_stream_lifetime.as_secs()
                            );
                            metrics::record_watch_restart("lifetime");
                            stream = None;
                            WatchState::Backoff
                        }
                        Next::Cancelled => WatchState::Draining,
                    }
                }

                WatchState::Backoff => {
                    tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => WatchState::Draining,
                        _ = sleep(self.reconnect_delay) => WatchState::Connecting,
                    }
                }

                WatchState::Draining => {
                    drop(stream.take());
                    info!("Pod watch loop stopped");
                    return Err(SyncError::Cancelled);
                }
            };
        }
    }

    async fn dispatch(&self, event: &PodEvent) {
        if let Err(e) = self.handler.handle(event).await {
            error!(
                "Failed to handle {} event for pod {}/{}: {}",
                event.kind,
                event.pod.namespace().unwrap_or_default(),
                event.pod.name_any(),
                e
            );
            metrics::record_pod_event(event.kind.as_str(), "error");
        }
    }
}
