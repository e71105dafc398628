use crate::config::{DatasetSpec, PropertyKind, PropertySpec, ThresholdFilter};
use crate::models::{OwnerRef, Record};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

/// Filters and projection for one fetch call. All filters are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    /// Properties to request, with the kind used to normalize each value.
    pub properties: Vec<PropertySpec>,
    pub name_property: String,
    /// Stage membership; empty means any stage.
    pub stages: Vec<String>,
    /// Stages always excluded (terminal "lost").
    pub excluded_stages: Vec<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub thresholds: Vec<ThresholdFilter>,
    /// Hard cap on records returned by one fetch.
    pub cap: usize,
}

impl RecordQuery {
    /// Build the query for a dataset. `extra` adds properties the engine needs
    /// beyond the visible columns (e.g. aggregate ordering fields), as dates.
    pub fn for_dataset(
        dataset: &DatasetSpec,
        extra: &[&str],
        now: DateTime<Utc>,
        cap: usize,
    ) -> Self {
        let mut properties = dataset.properties.clone();
        for name in extra {
            if name.trim().is_empty() || properties.iter().any(|p| p.name == *name) {
                continue;
            }
            properties.push(PropertySpec {
                name: name.to_string(),
                header: name.to_string(),
                kind: PropertyKind::Date,
                score: false,
            });
        }
        Self {
            properties,
            name_property: dataset.name_property.clone(),
            stages: dataset.stages.clone(),
            excluded_stages: dataset.lost_stages.clone(),
            created_after: dataset
                .created_within_days
                .map(|days| now - Duration::days(i64::from(days))),
            thresholds: dataset.thresholds.clone(),
            cap,
        }
    }

    pub fn property_names(&self) -> Vec<String> {
        self.properties.iter().map(|p| p.name.clone()).collect()
    }
}

/// One page of a cursor-paginated search.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RecordPage {
    pub records: Vec<Record>,
    /// Server-supplied cursor for the next page; `None` when exhausted.
    pub next_cursor: Option<String>,
}

/// A system of record that can be searched for an owner's records.
///
/// Implementations live in `dealsync_integrations` (HubSpot) or test code.
#[async_trait]
pub trait RecordSource: Send + Sync {
    /// Source identifier for logs, e.g. "hubspot".
    fn id(&self) -> &'static str;

    /// Look up the source's owner id by contact address.
    async fn lookup_owner_id(&self, email: &str) -> Result<Option<String>>;

    /// Fetch one page of records owned by `owner_id` matching `query`.
    ///
    /// A non-success response must surface as an error; callers do not retry.
    async fn fetch_page(
        &self,
        owner_id: &str,
        query: &RecordQuery,
        cursor: Option<&str>,
    ) -> Result<RecordPage>;
}

/// Convenience for callers that hold an `OwnerRef` and want records in one call.
pub async fn fetch(
    source: &dyn RecordSource,
    owner: &OwnerRef,
    query: &RecordQuery,
) -> Result<Vec<Record>> {
    match super::fetcher::resolve_owner_id(source, owner).await? {
        Some(owner_id) => super::fetcher::fetch_all(source, &owner_id, query).await,
        None => Ok(Vec::new()),
    }
}
