#![cfg(test)]

use crate::config::SyncConfig;
use crate::models::{Record, RecordId};
use crate::records::{RecordPage, RecordQuery, RecordSource};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub(crate) const SAMPLE_CONFIG: &str = r#"{
    "datasets": [
        {
            "name": "Open Pipeline",
            "stages": ["qualifiedtobuy", "presentationscheduled", "contractsent"],
            "lost_stages": ["closedlost"],
            "created_within_days": 180,
            "properties": [
                {"name": "dealname", "header": "Deal", "kind": "text"},
                {"name": "dealstage", "header": "Stage", "kind": "text"},
                {"name": "amount", "header": "Amount", "kind": "number"},
                {"name": "closedate", "header": "Close Date", "kind": "date"},
                {"name": "notes_next_activity_date", "header": "Next Activity", "kind": "date"},
                {"name": "notes_last_updated", "header": "Last Activity", "kind": "date"},
                {"name": "hs_deal_score", "header": "Score", "kind": "number", "score": true}
            ]
        },
        {
            "name": "Won",
            "stages": ["closedwon"],
            "properties": [
                {"name": "dealname", "header": "Deal", "kind": "text"},
                {"name": "amount", "header": "Amount", "kind": "number"}
            ]
        }
    ],
    "annotations": {"note_slots": ["Notes"], "flag_header": "Flag"},
    "lock": {"name": "dealsync-test", "cycle_wait_ms": 200, "interactive_wait_ms": 50}
}"#;

pub(crate) fn sample_config() -> SyncConfig {
    SyncConfig::from_json_str(SAMPLE_CONFIG).expect("sample config is valid")
}

/// An open-pipeline record with every sample property populated.
pub(crate) fn record(id: &str, owner_id: &str) -> Record {
    let name = format!("Deal {id}");
    let mut properties = BTreeMap::new();
    properties.insert("dealname".to_string(), name.clone());
    properties.insert("dealstage".to_string(), "qualifiedtobuy".to_string());
    properties.insert("amount".to_string(), "1000".to_string());
    properties.insert("closedate".to_string(), "2025-06-30".to_string());
    properties.insert("notes_next_activity_date".to_string(), String::new());
    properties.insert("notes_last_updated".to_string(), "2025-01-01".to_string());
    properties.insert("hs_deal_score".to_string(), "50".to_string());
    Record {
        id: RecordId::new(id).expect("test id"),
        owner_id: owner_id.to_string(),
        name,
        stage: "qualifiedtobuy".to_string(),
        properties,
        created_at: None,
        updated_at: None,
    }
}

pub(crate) fn record_in_stage(id: &str, owner_id: &str, stage: &str) -> Record {
    let mut r = record(id, owner_id);
    r.stage = stage.to_string();
    r.properties
        .insert("dealstage".to_string(), stage.to_string());
    r
}

/// Deterministic `RecordSource` driven by in-memory records.
///
/// Honors stage membership and exclusion from the query; pages by
/// `page_size` with the offset as cursor.
pub(crate) struct ScriptedSource {
    records: Mutex<HashMap<String, Vec<Record>>>,
    owner_emails: HashMap<String, String>,
    page_size: usize,
    fail_on_call: Option<usize>,
    failing_owners: Mutex<HashSet<String>>,
    delay: Option<Duration>,
    page_calls: AtomicUsize,
    lookups: AtomicUsize,
}

impl ScriptedSource {
    pub(crate) fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            owner_emails: HashMap::new(),
            page_size: 100,
            fail_on_call: None,
            failing_owners: Mutex::new(HashSet::new()),
            delay: None,
            page_calls: AtomicUsize::new(0),
            lookups: AtomicUsize::new(0),
        }
    }

    pub(crate) fn with_page_size(mut self, n: usize) -> Self {
        self.page_size = n;
        self
    }

    pub(crate) fn with_records(self, owner_id: &str, records: Vec<Record>) -> Self {
        self.set_records(owner_id, records);
        self
    }

    pub(crate) fn with_owner_email(mut self, email: &str, owner_id: &str) -> Self {
        self.owner_emails
            .insert(email.to_string(), owner_id.to_string());
        self
    }

    /// Fail the n-th page call (1-based) with a 429.
    pub(crate) fn fail_on_page(mut self, n: usize) -> Self {
        self.fail_on_call = Some(n);
        self
    }

    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub(crate) fn set_records(&self, owner_id: &str, records: Vec<Record>) {
        self.records
            .lock()
            .unwrap()
            .insert(owner_id.to_string(), records);
    }

    pub(crate) fn fail_owner(&self, owner_id: &str) {
        self.failing_owners
            .lock()
            .unwrap()
            .insert(owner_id.to_string());
    }

    pub(crate) fn heal_owner(&self, owner_id: &str) {
        self.failing_owners.lock().unwrap().remove(owner_id);
    }

    pub(crate) fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    fn id(&self) -> &'static str {
        "scripted"
    }

    async fn lookup_owner_id(&self, email: &str) -> Result<Option<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.owner_emails.get(email).cloned())
    }

    async fn fetch_page(
        &self,
        owner_id: &str,
        query: &RecordQuery,
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        let call = self.page_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_call == Some(call) || self.failing_owners.lock().unwrap().contains(owner_id) {
            return Err(Error::Remote {
                status: 429,
                body: "rate limited".to_string(),
            });
        }

        let matching: Vec<Record> = self
            .records
            .lock()
            .unwrap()
            .get(owner_id)
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|r| query.stages.is_empty() || query.stages.contains(&r.stage))
            .filter(|r| !query.excluded_stages.contains(&r.stage))
            .collect();

        let offset: usize = cursor.map(|c| c.parse().unwrap_or(0)).unwrap_or(0);
        let end = (offset + self.page_size).min(matching.len());
        let records = matching[offset.min(end)..end].to_vec();
        let next_cursor = (end < matching.len()).then(|| end.to_string());
        Ok(RecordPage {
            records,
            next_cursor,
        })
    }
}
