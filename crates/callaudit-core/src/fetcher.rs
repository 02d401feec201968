//! Draining a remote paged source into a complete record set.
//!
//! Page requests are sequential: whether another page is needed depends on the
//! total reported by the previous one. Cancellation is observed at every page
//! boundary and while a page request is in flight.

use crate::config::AuditConfig;
use crate::error::{FetchError, PartialDataError, PartialReason};
use crate::{CallRecord, Page};
use std::borrow::Cow;
use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Items that can be deduplicated across pages.
pub trait PageItem {
    /// Stable identifier, or `None` when the item has no identity of its own.
    fn dedup_key(&self) -> Option<Cow<'_, str>>;
}

impl PageItem for CallRecord {
    fn dedup_key(&self) -> Option<Cow<'_, str>> {
        Some(Cow::Borrowed(self.id.as_str()))
    }
}

/// Numeric ids key the same way `CallRecord` reads them, so `3` and `"3"` collide.
impl PageItem for serde_json::Value {
    fn dedup_key(&self) -> Option<Cow<'_, str>> {
        match self.get("id")? {
            serde_json::Value::String(s) => Some(Cow::Borrowed(s.as_str())),
            serde_json::Value::Number(n) => Some(Cow::Owned(n.to_string())),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutcome<T> {
    pub records: Vec<T>,
    /// Latest non-zero total reported by the source, 0 if it never reported one.
    pub reported_total: u64,
    pub calls: usize,
    pub duplicates_dropped: usize,
    pub partial: Option<PartialDataError>,
}

#[derive(Debug, Clone, Copy)]
pub struct PagedFetcher {
    page_size: usize,
    safety_cap: usize,
    page_timeout: Duration,
}

impl PagedFetcher {
    pub fn new(page_size: usize, safety_cap: usize, page_timeout: Duration) -> Self {
        Self {
            page_size: page_size.max(1),
            safety_cap: safety_cap.max(1),
            page_timeout,
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.page_size, config.safety_cap, config.page_timeout())
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn safety_cap(&self) -> usize {
        self.safety_cap
    }

    /// Call `fetch_page(offset, limit)` until the source is drained.
    ///
    /// Stops on an empty page, once the accumulated count reaches the latest
    /// reported total, or when the offset reaches the safety cap. Errors from
    /// `fetch_page` are returned immediately.
    pub async fn fetch_all<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut fetch_page: F,
    ) -> Result<FetchOutcome<T>, FetchError>
    where
        T: PageItem,
        F: FnMut(usize, usize) -> Fut,
        Fut: Future<Output = Result<Page<T>, FetchError>>,
    {
        let mut records: Vec<T> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut offset = 0usize;
        let mut reported_total = 0u64;
        let mut calls = 0usize;
        let mut duplicates_dropped = 0usize;
        let mut partial = None;

        loop {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }

            if offset >= self.safety_cap {
                let accumulated = records.len() as u64;
                if reported_total == 0 || accumulated < reported_total {
                    warn!(
                        source = label,
                        accumulated,
                        reported_total,
                        safety_cap = self.safety_cap,
                        "safety cap reached before the reported total"
                    );
                    partial = Some(PartialDataError {
                        accumulated,
                        reported_total,
                        reason: PartialReason::SafetyCap,
                    });
                }
                break;
            }

            let limit = self.page_size.min(self.safety_cap - offset);
            let page = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = tokio::time::timeout(self.page_timeout, fetch_page(offset, limit)) => {
                    match result {
                        Ok(page) => page?,
                        Err(_) => return Err(FetchError::Timeout(self.page_timeout)),
                    }
                }
            };
            calls += 1;

            if page.total_count > 0 {
                reported_total = page.total_count;
            }
            let returned = page.records.len();
            debug!(
                source = label,
                offset,
                limit,
                returned,
                reported_total,
                "fetched page"
            );

            if returned == 0 {
                let accumulated = records.len() as u64;
                if accumulated < reported_total {
                    warn!(
                        source = label,
                        accumulated, reported_total, "source ran dry before its reported total"
                    );
                    partial = Some(PartialDataError {
                        accumulated,
                        reported_total,
                        reason: PartialReason::SourceExhausted,
                    });
                }
                break;
            }

            offset += returned;
            for item in page.records {
                let fresh = match item.dedup_key() {
                    Some(key) => seen.insert(key.into_owned()),
                    None => true,
                };
                if fresh {
                    records.push(item);
                } else {
                    duplicates_dropped += 1;
                }
            }

            if reported_total > 0 && records.len() as u64 >= reported_total {
                break;
            }
        }

        if duplicates_dropped > 0 {
            warn!(
                source = label,
                duplicates_dropped, "dropped records repeated across pages"
            );
        }

        Ok(FetchOutcome {
            records,
            reported_total,
            calls,
            duplicates_dropped,
            partial,
        })
    }
}
