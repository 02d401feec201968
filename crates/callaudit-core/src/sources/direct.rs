//! Direct scan of the raw record table.

use super::{PagedQuery, RecordQuery, RunContext, SortKey, SourceData};
use crate::aggregator::MetricsAggregator;
use crate::error::FetchError;
use crate::fetcher::PagedFetcher;
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct DirectScanSource {
    label: String,
    query: Arc<dyn PagedQuery>,
    sort: SortKey,
}

impl DirectScanSource {
    pub fn new(label: impl Into<String>, query: Arc<dyn PagedQuery>) -> Self {
        Self {
            label: label.into(),
            query,
            sort: SortKey::default(),
        }
    }

    pub fn with_sort(mut self, sort: SortKey) -> Self {
        self.sort = sort;
        self
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) async fn compute(&self, ctx: &RunContext<'_>) -> Result<SourceData, FetchError> {
        let query = RecordQuery {
            window: *ctx.window,
            identity: ctx.identity.map(str::to_string),
            status: ctx.status.map(str::to_string),
            sort: self.sort,
        };
        let query_ref = &query;
        let source = self.query.as_ref();

        let outcome = PagedFetcher::from_config(ctx.config)
            .fetch_all(&self.label, ctx.cancel, move |offset, limit| async move {
                source.fetch_page(query_ref, offset, limit).await
            })
            .await?;

        let aggregation =
            MetricsAggregator::new(ctx.normalizer, &ctx.config.answered_status, ctx.window)
                .aggregate(&outcome.records);
        info!(
            records = outcome.records.len(),
            calls = outcome.calls,
            reported_total = outcome.reported_total,
            "direct scan complete"
        );

        Ok(SourceData::from_aggregation(aggregation, ctx).with_fetch(&outcome))
    }
}
