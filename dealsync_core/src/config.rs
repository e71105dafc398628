use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_FETCH_CAP: usize = 10_000;
pub const DEFAULT_TOKEN_SECRET: &str = "HUBSPOT_ACCESS_TOKEN";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    Text,
    Number,
    Date,
}

/// A record property materialized as a column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertySpec {
    /// Property name in the record source, e.g. `amount`.
    pub name: String,
    pub header: String,
    pub kind: PropertyKind,
    /// Score columns get gradient shading.
    #[serde(default)]
    pub score: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdOp {
    Gt,
    Gte,
    Lt,
    Lte,
}

/// Numeric filter layered on top of the standard dataset filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdFilter {
    pub property: String,
    pub op: ThresholdOp,
    pub value: f64,
}

/// A named record filter. Each dataset is one tab in every store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Tab name.
    pub name: String,
    /// Stage membership filter; empty means any stage.
    #[serde(default)]
    pub stages: Vec<String>,
    /// Terminal "lost" stages that are always excluded.
    #[serde(default)]
    pub lost_stages: Vec<String>,
    /// Rolling creation-date window.
    #[serde(default)]
    pub created_within_days: Option<u32>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdFilter>,
    pub properties: Vec<PropertySpec>,
    /// Source property holding the human-readable record name.
    #[serde(default = "default_name_property")]
    pub name_property: String,
    /// Entity tabs only: order rows by stage and insert a separator row per stage.
    #[serde(default)]
    pub group_by_stage: bool,
}

fn default_name_property() -> String {
    "dealname".to_string()
}

/// Which annotation columns exist, by header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnotationSpec {
    /// Note slot headers. Notes flow entity -> aggregate.
    pub note_slots: Vec<String>,
    /// Flag column header. Flags and colors flow aggregate -> entity.
    #[serde(default = "default_flag_header")]
    pub flag_header: String,
}

fn default_flag_header() -> String {
    "Flag".to_string()
}

impl Default for AnnotationSpec {
    fn default() -> Self {
        Self {
            note_slots: vec!["Notes".to_string()],
            flag_header: default_flag_header(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Row cap per aggregate tab.
    pub max_rows: usize,
    /// Property whose non-empty value means a next action is pending.
    #[serde(default = "default_next_action_property")]
    pub next_action_property: String,
    /// Date property used for recency ordering.
    #[serde(default = "default_last_activity_property")]
    pub last_activity_property: String,
}

fn default_next_action_property() -> String {
    "notes_next_activity_date".to_string()
}

fn default_last_activity_property() -> String {
    "notes_last_updated".to_string()
}

impl Default for AggregateSpec {
    fn default() -> Self {
        Self {
            max_rows: 500,
            next_action_property: default_next_action_property(),
            last_activity_property: default_last_activity_property(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSpec {
    pub name: String,
    /// Bounded wait for a full cycle.
    pub cycle_wait_ms: u64,
    /// Bounded wait for interactive single-group commands. Short by intent.
    pub interactive_wait_ms: u64,
}

impl Default for LockSpec {
    fn default() -> Self {
        Self {
            name: "dealsync".to_string(),
            cycle_wait_ms: 30_000,
            interactive_wait_ms: 3_000,
        }
    }
}

/// Engine configuration (datasets, layouts, limits).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    pub datasets: Vec<DatasetSpec>,
    #[serde(default)]
    pub annotations: AnnotationSpec,
    #[serde(default)]
    pub aggregate: AggregateSpec,
    #[serde(default)]
    pub lock: LockSpec,
    /// Header of the record id column in every layout.
    #[serde(default = "default_id_header")]
    pub id_header: String,
    #[serde(default = "default_owner_header")]
    pub owner_header: String,
    /// Hard cap on records per fetch call.
    #[serde(default = "default_fetch_cap")]
    pub fetch_cap: usize,
    /// Execution ceiling for one full cycle.
    #[serde(default = "default_max_cycle_secs")]
    pub max_cycle_secs: u64,
    /// Deprecated: allow notes-up to match aggregate rows by display name
    /// when the record id is not found.
    #[serde(default)]
    pub legacy_name_matching: bool,
    /// Secret name holding the record source bearer token.
    #[serde(default = "default_token_secret")]
    pub token_secret: String,
}

fn default_id_header() -> String {
    "Record ID".to_string()
}

fn default_owner_header() -> String {
    "Owner".to_string()
}

fn default_fetch_cap() -> usize {
    DEFAULT_FETCH_CAP
}

fn default_max_cycle_secs() -> u64 {
    330
}

fn default_token_secret() -> String {
    DEFAULT_TOKEN_SECRET.to_string()
}

impl SyncConfig {
    #[tracing::instrument(level = "debug")]
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {e}", path.display())))?;
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(raw)
            .map_err(|e| Error::Config(format!("parse sync config: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn cycle_lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock.cycle_wait_ms)
    }

    pub fn interactive_lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock.interactive_wait_ms)
    }

    pub fn max_cycle_duration(&self) -> Duration {
        Duration::from_secs(self.max_cycle_secs)
    }

    pub fn dataset(&self, name: &str) -> Option<&DatasetSpec> {
        self.datasets.iter().find(|d| d.name == name)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        if self.datasets.is_empty() {
            return Err(Error::InvalidInput("datasets is empty".to_string()));
        }
        let mut tabs = HashSet::new();
        for ds in &self.datasets {
            if ds.name.trim().is_empty() {
                return Err(Error::InvalidInput("dataset name is empty".to_string()));
            }
            if !tabs.insert(ds.name.as_str()) {
                return Err(Error::InvalidInput(format!(
                    "duplicate dataset '{}'",
                    ds.name
                )));
            }
            if ds.properties.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "dataset '{}' has no properties",
                    ds.name
                )));
            }
            let mut headers = HashSet::new();
            for fixed in [
                self.id_header.as_str(),
                self.owner_header.as_str(),
                self.annotations.flag_header.as_str(),
            ] {
                if !headers.insert(fixed) {
                    return Err(Error::InvalidInput(format!(
                        "column header '{fixed}' is used by more than one fixed column"
                    )));
                }
            }
            for slot in &self.annotations.note_slots {
                if !headers.insert(slot.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "note slot '{slot}' collides with another column header"
                    )));
                }
            }
            for p in &ds.properties {
                if p.name.trim().is_empty() || p.header.trim().is_empty() {
                    return Err(Error::InvalidInput(format!(
                        "dataset '{}' has a property with an empty name or header",
                        ds.name
                    )));
                }
                if !headers.insert(p.header.as_str()) {
                    return Err(Error::InvalidInput(format!(
                        "dataset '{}' header '{}' is not unique",
                        ds.name, p.header
                    )));
                }
                if p.score && p.kind != PropertyKind::Number {
                    return Err(Error::InvalidInput(format!(
                        "score column '{}' must be numeric",
                        p.header
                    )));
                }
            }
        }
        if self.annotations.flag_header.trim().is_empty() {
            return Err(Error::InvalidInput("flag_header is empty".to_string()));
        }
        if self.aggregate.max_rows == 0 {
            return Err(Error::InvalidInput(
                "aggregate.max_rows must be > 0".to_string(),
            ));
        }
        if self.fetch_cap == 0 {
            return Err(Error::InvalidInput("fetch_cap must be > 0".to_string()));
        }
        if self.lock.name.trim().is_empty() || self.lock.name.contains(' ') {
            return Err(Error::InvalidInput(
                "lock.name must be non-empty without spaces".to_string(),
            ));
        }
        if self.lock.interactive_wait_ms == 0 || self.lock.cycle_wait_ms == 0 {
            return Err(Error::InvalidInput("lock waits must be > 0".to_string()));
        }
        if self.max_cycle_secs == 0 {
            return Err(Error::InvalidInput("max_cycle_secs must be > 0".to_string()));
        }
        if self.token_secret.trim().is_empty() {
            return Err(Error::InvalidInput("token_secret is empty".to_string()));
        }
        Ok(())
    }
}

/// Process-level settings read from the environment.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub config_path: PathBuf,
    pub directory_path: PathBuf,
    /// Local directory for the JSON document store.
    pub data_dir: PathBuf,
    /// When set, the cycle lock is held in Redis and shared across processes.
    pub redis_url: Option<String>,
    pub redis_key_prefix: Option<String>,
    pub hubspot_base_url: Option<String>,
}

impl RuntimeConfig {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let config_path = std::env::var("DEALSYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./dealsync.json"));
        let directory_path = std::env::var("DEALSYNC_DIRECTORY")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./directory.json"));
        let data_dir = std::env::var("DEALSYNC_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.dealsync_data"));
        let redis_url = std::env::var("DEALSYNC_REDIS_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let redis_key_prefix = std::env::var("DEALSYNC_REDIS_KEY_PREFIX").ok();
        let hubspot_base_url = std::env::var("DEALSYNC_HUBSPOT_BASE_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let cfg = Self {
            config_path,
            directory_path,
            data_dir,
            redis_url,
            redis_key_prefix,
            hubspot_base_url,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.config_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("config_path is empty".to_string()));
        }
        if self.directory_path.as_os_str().is_empty() {
            return Err(Error::InvalidInput("directory_path is empty".to_string()));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(Error::InvalidInput("data_dir is empty".to_string()));
        }
        Ok(())
    }
}
