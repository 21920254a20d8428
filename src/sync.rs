//! Feed synchronization: pulls each registered link's iCalendar feed and
//! swaps the cached event set for that link in one atomic replace.
//!
//! Failures are scoped to the link that produced them. A fetch or parse
//! error marks the link but leaves its previously cached events in place,
//! so a flaky upstream degrades to stale data instead of false vacancy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use ulid::Ulid;

use crate::engine::{now_ms, Engine, EngineError};
use crate::feed;
use crate::limits::{DEFAULT_FETCH_TIMEOUT_MS, DEFAULT_SYNC_CONCURRENCY, MAX_FEED_BYTES};
use crate::observability;

#[derive(Debug)]
pub enum FetchError {
    Transport(String),
    Timeout,
    Status(u16),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::Transport(msg) => write!(f, "transport error: {}", msg),
            FetchError::Timeout => write!(f, "fetch timed out"),
            FetchError::Status(code) => write!(f, "upstream returned status {}", code),
        }
    }
}

impl std::error::Error for FetchError {}

/// Retrieves raw feed bytes for a URL. Abstracted so tests can substitute
/// canned payloads without a network.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError>;
}

/// Production fetcher backed by a shared reqwest client.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("corral/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_default_timeout() -> Result<Self, reqwest::Error> {
        Self::new(Duration::from_millis(DEFAULT_FETCH_TIMEOUT_MS as u64))
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await.map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        let body = response.bytes().await.map_err(map_reqwest)?;
        if body.len() > MAX_FEED_BYTES {
            return Err(FetchError::Transport(format!(
                "feed body of {} bytes exceeds limit",
                body.len()
            )));
        }
        Ok(body.to_vec())
    }
}

fn map_reqwest(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Transport(err.to_string())
    }
}

/// Outcome of synchronizing a single link. `error` is populated for fetch
/// and parse failures; the cached events from the previous successful sync
/// remain in effect in that case.
#[derive(Debug, Serialize)]
pub struct SyncResult {
    pub link_id: Ulid,
    pub event_count: usize,
    pub warning_count: usize,
    pub error: Option<String>,
}

impl SyncResult {
    fn failed(link_id: Ulid, error: String) -> Self {
        Self {
            link_id,
            event_count: 0,
            warning_count: 0,
            error: Some(error),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    pub results: Vec<SyncResult>,
}

pub struct Synchronizer {
    fetcher: Arc<dyn FeedFetcher>,
    concurrency: usize,
}

impl Synchronizer {
    pub fn new(fetcher: Arc<dyn FeedFetcher>, concurrency: usize) -> Self {
        Self {
            fetcher,
            concurrency: concurrency.max(1),
        }
    }

    pub fn with_default_concurrency(fetcher: Arc<dyn FeedFetcher>) -> Self {
        Self::new(fetcher, DEFAULT_SYNC_CONCURRENCY)
    }

    /// Synchronizes one link. Fetch and parse failures are recorded on the
    /// link and reported in the result; store failures propagate.
    pub async fn sync_one(
        &self,
        engine: &Engine,
        link_id: Ulid,
    ) -> Result<SyncResult, EngineError> {
        let link = engine.link_snapshot(link_id).await?;
        if !link.active {
            return Ok(SyncResult::failed(link_id, "link is revoked".to_string()));
        }

        let raw = match self.fetcher.fetch(&link.feed_url).await {
            Ok(raw) => raw,
            Err(err) => {
                let message = err.to_string();
                warn!(link_id = %link_id, source = %link.source_label, error = %message, "feed fetch failed");
                metrics::counter!(observability::SYNC_FAILURES_TOTAL).increment(1);
                engine.mark_link_error(link_id, message.clone()).await?;
                return Ok(SyncResult::failed(link_id, message));
            }
        };

        let convention = feed::end_convention(&link.source_label);
        let (drafts, warnings) = match feed::decode(&raw, convention) {
            Ok(decoded) => decoded,
            Err(err) => {
                let message = err.to_string();
                warn!(link_id = %link_id, source = %link.source_label, error = %message, "feed parse failed");
                metrics::counter!(observability::SYNC_FAILURES_TOTAL).increment(1);
                engine.mark_link_error(link_id, message.clone()).await?;
                return Ok(SyncResult::failed(link_id, message));
            }
        };

        for warning in &warnings {
            warn!(
                link_id = %link_id,
                source = %link.source_label,
                event_index = warning.index,
                uid = warning.uid.as_deref().unwrap_or("?"),
                "skipped feed event: {}", warning.message
            );
        }

        let event_count = engine.replace_link_events(link_id, drafts, now_ms()).await?;
        metrics::counter!(observability::SYNC_SUCCESS_TOTAL).increment(1);
        metrics::counter!(observability::SYNC_EVENTS_TOTAL).increment(event_count as u64);
        info!(
            link_id = %link_id,
            source = %link.source_label,
            events = event_count,
            warnings = warnings.len(),
            "link synchronized"
        );

        Ok(SyncResult {
            link_id,
            event_count,
            warning_count: warnings.len(),
            error: None,
        })
    }

    /// Synchronizes every active link with bounded concurrency. Each link
    /// is attempted regardless of other links' failures.
    pub async fn sync_all(&self, engine: &Engine) -> SyncReport {
        let started = Instant::now();
        let links = engine.active_links().await;
        let results: Vec<SyncResult> = stream::iter(links)
            .map(|link| async move {
                match self.sync_one(engine, link.id).await {
                    Ok(result) => result,
                    Err(err) => SyncResult::failed(link.id, format!("store error: {}", err)),
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let failed = results.iter().filter(|r| r.error.is_some()).count();
        let report = SyncReport {
            synced: results.len() - failed,
            failed,
            results,
        };
        metrics::histogram!(observability::SYNC_BATCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        info!(synced = report.synced, failed = report.failed, "sync batch finished");
        report
    }
}
