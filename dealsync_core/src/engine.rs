//! Sync orchestrator: the full refresh cycle and the two interactive
//! single-group operations, all serialized by one named lock.

use crate::adapters::{AggregateStoreAdapter, EntityStoreAdapter, WriteSummary};
use crate::config::{DatasetSpec, SyncConfig};
use crate::directory::{DirectoryConfig, DirectoryIndex, GroupEntry, GroupView, OwnerEntry};
use crate::layout::Layout;
use crate::lock::{with_lock, LockOutcome, SyncLock};
use crate::models::{Actor, Record};
use crate::preserve;
use crate::propagation::{PropagationStats, Propagator};
use crate::records::{fetch_all, resolve_owner_id, RecordQuery, RecordSource};
use crate::store::{DocumentRef, DocumentStore};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    Succeeded,
    /// Finished, but at least one owner or group failed.
    Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitFailure {
    /// `owner:<key>` or `group:<name>`.
    pub unit: String,
    pub dataset: Option<String>,
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionedStore {
    pub unit: String,
    pub document: DocumentRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub actor: String,
    pub status: CycleStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub owners_ok: usize,
    pub owners_failed: usize,
    pub groups_ok: usize,
    pub groups_failed: usize,
    pub rows_written: usize,
    pub rows_truncated: usize,
    /// Aggregate tabs left as they were because a member's fetch failed.
    pub aggregates_skipped: usize,
    pub provisioned: Vec<ProvisionedStore>,
    pub notes_up: PropagationStats,
    pub flags_down: PropagationStats,
    pub failures: Vec<UnitFailure>,
}

impl CycleReport {
    fn start(actor: &Actor) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            actor: actor.to_string(),
            status: CycleStatus::Succeeded,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            owners_ok: 0,
            owners_failed: 0,
            groups_ok: 0,
            groups_failed: 0,
            rows_written: 0,
            rows_truncated: 0,
            aggregates_skipped: 0,
            provisioned: Vec::new(),
            notes_up: PropagationStats::default(),
            flags_down: PropagationStats::default(),
            failures: Vec::new(),
        }
    }

    fn fail(&mut self, unit: String, dataset: Option<&str>, err: &Error) {
        tracing::error!(run_id = %self.run_id, unit = %unit, dataset, kind = err.kind(), error = %err, "sync unit failed");
        self.failures.push(UnitFailure {
            unit,
            dataset: dataset.map(str::to_string),
            kind: err.kind().to_string(),
            message: err.to_string(),
        });
    }

    fn record_write(&mut self, summary: WriteSummary) {
        self.rows_written += summary.rows_written;
        self.rows_truncated += summary.rows_truncated;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    NotesUp,
    FlagsDown,
}

/// Result of an interactive single-group propagation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub run_id: Uuid,
    pub actor: String,
    pub group: String,
    pub direction: Direction,
    pub duration_ms: u64,
    pub stats: PropagationStats,
}

/// Per-dataset layouts and fetch query, computed once per run.
struct DatasetPlan<'a> {
    spec: &'a DatasetSpec,
    entity: Layout,
    aggregate: Layout,
    query: RecordQuery,
}

pub struct SyncEngine {
    config: Arc<SyncConfig>,
    directory: DirectoryConfig,
    source: Arc<dyn RecordSource>,
    store: Arc<dyn DocumentStore>,
    lock: Arc<dyn SyncLock>,
    entity: EntityStoreAdapter,
    aggregate: AggregateStoreAdapter,
    propagator: Propagator,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        directory: DirectoryConfig,
        source: Arc<dyn RecordSource>,
        store: Arc<dyn DocumentStore>,
        lock: Arc<dyn SyncLock>,
    ) -> Result<Self> {
        config.validate()?;
        let entity = EntityStoreAdapter::new(store.clone());
        let aggregate = AggregateStoreAdapter::new(store.clone(), config.aggregate.clone());
        let propagator = Propagator::new(store.clone(), config.legacy_name_matching);
        if config.legacy_name_matching {
            tracing::warn!("legacy display-name matching is enabled; it is deprecated and will be removed");
        }
        Ok(Self {
            config: Arc::new(config),
            directory,
            source,
            store,
            lock,
            entity,
            aggregate,
            propagator,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn plans(&self, now: DateTime<Utc>) -> Vec<DatasetPlan<'_>> {
        let extra = [
            self.config.aggregate.next_action_property.as_str(),
            self.config.aggregate.last_activity_property.as_str(),
        ];
        self.config
            .datasets
            .iter()
            .map(|spec| DatasetPlan {
                spec,
                entity: Layout::entity(&self.config, spec),
                aggregate: Layout::aggregate(&self.config, spec),
                query: RecordQuery::for_dataset(spec, &extra, now, self.config.fetch_cap),
            })
            .collect()
    }

    /// Full refresh: every owner's entity store, then every group's aggregate
    /// store followed by notes-up and flags-down for that group.
    ///
    /// Returns `Busy` if another run holds the lock past `cycle_lock_wait`.
    #[tracing::instrument(level = "info", skip(self, actor), fields(actor = %actor))]
    pub async fn run_cycle(&self, actor: &Actor) -> Result<LockOutcome<CycleReport>> {
        let this = self;
        with_lock(
            self.lock.as_ref(),
            &self.config.lock.name,
            self.config.cycle_lock_wait(),
            move || this.cycle_with_ceiling(actor),
        )
        .await
    }

    async fn cycle_with_ceiling(&self, actor: &Actor) -> Result<CycleReport> {
        let ceiling = self.config.max_cycle_duration();
        match tokio::time::timeout(ceiling, self.cycle(actor)).await {
            Ok(res) => res,
            Err(_) => {
                tracing::error!(ceiling_secs = ceiling.as_secs(), "sync cycle exceeded its execution ceiling");
                Err(Error::Timeout(format!(
                    "sync cycle exceeded {}s",
                    ceiling.as_secs()
                )))
            }
        }
    }

    async fn cycle(&self, actor: &Actor) -> Result<CycleReport> {
        let clock = Instant::now();
        let mut report = CycleReport::start(actor);
        tracing::info!(run_id = %report.run_id, "sync cycle started");

        let directory = self.prepare_directory(&mut report).await?;
        let index = DirectoryIndex::build(&directory);
        index.authorize(actor)?;
        let plans = self.plans(Utc::now());

        // owner key -> per-dataset records, None where the refresh failed
        let mut fetched: HashMap<String, Vec<Option<Vec<Record>>>> = HashMap::new();
        for owner in index.owners() {
            let results = self.refresh_owner(owner, &plans, &mut report).await;
            if results.iter().all(Option::is_some) {
                report.owners_ok += 1;
            } else {
                report.owners_failed += 1;
            }
            fetched.insert(owner.key(), results);
        }

        for group in index.groups() {
            match self.refresh_group(group, &plans, &mut fetched, &mut report).await {
                Ok(()) => report.groups_ok += 1,
                Err((dataset, e)) => {
                    report.groups_failed += 1;
                    report.fail(format!("group:{}", group.name), dataset.as_deref(), &e);
                }
            }
        }

        report.finished_at = Utc::now();
        report.duration_ms = clock.elapsed().as_millis() as u64;
        if !report.failures.is_empty() {
            report.status = CycleStatus::Partial;
        }
        tracing::info!(
            run_id = %report.run_id,
            status = ?report.status,
            duration_ms = report.duration_ms,
            owners_ok = report.owners_ok,
            owners_failed = report.owners_failed,
            groups_ok = report.groups_ok,
            groups_failed = report.groups_failed,
            rows_written = report.rows_written,
            notes_cells = report.notes_up.cells_patched,
            flag_cells = report.flags_down.cells_patched,
            "sync cycle finished"
        );
        Ok(report)
    }

    /// Copy of the directory with implied groups added and stores that an
    /// earlier run provisioned filled in.
    async fn effective_directory(&self) -> Result<DirectoryConfig> {
        let mut dir = self.directory.clone();
        for owner in dir.owners.iter_mut().filter(|o| o.store.is_none()) {
            owner.store = self.store.provisioned(&owner_unit(owner)).await?;
        }
        let declared: HashSet<String> = dir.groups.iter().map(|g| g.name.clone()).collect();
        let implied: BTreeSet<String> = dir
            .owners
            .iter()
            .filter_map(|o| o.group.clone())
            .filter(|g| !declared.contains(g))
            .collect();
        dir.groups.extend(implied.into_iter().map(|name| GroupEntry { name, store: None }));
        for group in dir.groups.iter_mut().filter(|g| g.store.is_none()) {
            group.store = self.store.provisioned(&group_unit(&group.name)).await?;
        }
        Ok(dir)
    }

    /// Provision a store for every directory entry that still has none.
    /// Failures are recorded; the entry then fails its own refresh.
    async fn prepare_directory(&self, report: &mut CycleReport) -> Result<DirectoryConfig> {
        let mut dir = self.effective_directory().await?;
        for owner in dir.owners.iter_mut().filter(|o| o.store.is_none()) {
            let title = format!("{} deals", owner.name);
            owner.store = self.provision_unit(owner_unit(owner), &title, report).await;
        }
        for group in dir.groups.iter_mut().filter(|g| g.store.is_none()) {
            let title = format!("{} team deals", group.name);
            group.store = self.provision_unit(group_unit(&group.name), &title, report).await;
        }
        Ok(dir)
    }

    async fn provision_unit(
        &self,
        unit: String,
        title: &str,
        report: &mut CycleReport,
    ) -> Option<DocumentRef> {
        match self.store.provision(&unit, title).await {
            Ok(doc) => {
                tracing::info!(unit = %unit, document = %doc, "provisioned store; add it to the directory");
                report.provisioned.push(ProvisionedStore {
                    unit,
                    document: doc.clone(),
                });
                Some(doc)
            }
            Err(e) => {
                report.fail(unit, None, &e);
                None
            }
        }
    }

    #[tracing::instrument(level = "info", skip_all, fields(owner = %owner.key()))]
    async fn refresh_owner(
        &self,
        owner: &OwnerEntry,
        plans: &[DatasetPlan<'_>],
        report: &mut CycleReport,
    ) -> Vec<Option<Vec<Record>>> {
        let unit = owner_unit(owner);
        let Some(doc) = owner.store.as_ref() else {
            return vec![None; plans.len()];
        };
        let owner_id = match resolve_owner_id(self.source.as_ref(), &owner.owner_ref()).await {
            Ok(id) => id,
            Err(e) => {
                report.fail(unit, None, &e);
                return vec![None; plans.len()];
            }
        };

        let mut out = Vec::with_capacity(plans.len());
        for plan in plans {
            match self.refresh_entity_tab(doc, owner_id.as_deref(), plan).await {
                Ok((records, summary)) => {
                    report.record_write(summary);
                    out.push(Some(records));
                }
                Err(e) => {
                    report.fail(unit.clone(), Some(&plan.spec.name), &e);
                    out.push(None);
                }
            }
        }
        out
    }

    async fn refresh_entity_tab(
        &self,
        doc: &DocumentRef,
        owner_id: Option<&str>,
        plan: &DatasetPlan<'_>,
    ) -> Result<(Vec<Record>, WriteSummary)> {
        let records = match owner_id {
            Some(id) => fetch_all(self.source.as_ref(), id, &plan.query).await?,
            None => Vec::new(),
        };
        let captured = self.entity.capture(doc, plan.spec, &plan.entity).await?;
        let rows = preserve::merge(&records, &captured, &plan.entity, None);
        let summary = self.entity.write(doc, plan.spec, &plan.entity, rows).await?;
        Ok((records, summary))
    }

    /// Rebuild each aggregate tab from this cycle's fetches, then propagate.
    /// The error carries the dataset it happened in, if any.
    #[tracing::instrument(level = "info", skip_all, fields(group = %group.name))]
    async fn refresh_group(
        &self,
        group: &GroupView,
        plans: &[DatasetPlan<'_>],
        fetched: &mut HashMap<String, Vec<Option<Vec<Record>>>>,
        report: &mut CycleReport,
    ) -> std::result::Result<(), (Option<String>, Error)> {
        let Some(doc) = group.store.as_ref() else {
            return Err((
                None,
                Error::Config(format!("group '{}' has no aggregate store", group.name)),
            ));
        };

        for (i, plan) in plans.iter().enumerate() {
            let tagged = |e: Error| (Some(plan.spec.name.clone()), e);
            let complete = group.members.iter().all(|m| {
                fetched
                    .get(&m.key())
                    .and_then(|per_ds| per_ds.get(i))
                    .is_some_and(Option::is_some)
            });

            if complete {
                let captured = self
                    .aggregate
                    .capture(doc, plan.spec, &plan.aggregate)
                    .await
                    .map_err(tagged)?;
                let mut rows = Vec::new();
                for member in &group.members {
                    let records = fetched
                        .get_mut(&member.key())
                        .and_then(|per_ds| per_ds.get_mut(i))
                        .and_then(Option::take)
                        .unwrap_or_default();
                    rows.extend(preserve::merge(
                        &records,
                        &captured,
                        &plan.aggregate,
                        Some(&member.name),
                    ));
                }
                let summary = self
                    .aggregate
                    .write(doc, plan.spec, &plan.aggregate, rows)
                    .await
                    .map_err(tagged)?;
                report.record_write(summary);
            } else {
                tracing::warn!(
                    tab = %plan.spec.name,
                    "a member refresh failed; aggregate tab left as is this cycle"
                );
                report.aggregates_skipped += 1;
            }

            report.notes_up += self
                .propagator
                .notes_up(group, plan.spec, &plan.entity, &plan.aggregate)
                .await
                .map_err(tagged)?;
            report.flags_down += self
                .propagator
                .flags_down(group, plan.spec, &plan.entity, &plan.aggregate)
                .await
                .map_err(tagged)?;
        }
        Ok(())
    }

    /// Push note edits from the group's entity stores to its aggregate store.
    #[tracing::instrument(level = "info", skip(self, actor), fields(actor = %actor))]
    pub async fn push_notes_up(
        &self,
        actor: &Actor,
        group: &str,
    ) -> Result<LockOutcome<PropagationReport>> {
        self.interactive(actor, group, Direction::NotesUp).await
    }

    /// Push flags and row colors from the group's aggregate store down to
    /// its members' entity stores.
    #[tracing::instrument(level = "info", skip(self, actor), fields(actor = %actor))]
    pub async fn sync_highlights(
        &self,
        actor: &Actor,
        group: &str,
    ) -> Result<LockOutcome<PropagationReport>> {
        self.interactive(actor, group, Direction::FlagsDown).await
    }

    async fn interactive(
        &self,
        actor: &Actor,
        group: &str,
        direction: Direction,
    ) -> Result<LockOutcome<PropagationReport>> {
        let index = DirectoryIndex::build(&self.effective_directory().await?);
        index.authorize(actor)?;
        let group = index.group(group)?.clone();
        let plans = self.plans(Utc::now());

        let this = self;
        let (group, plans) = (&group, &plans);
        with_lock(
            self.lock.as_ref(),
            &self.config.lock.name,
            self.config.interactive_lock_wait(),
            move || this.propagate_group(actor, group, plans, direction),
        )
        .await
    }

    async fn propagate_group(
        &self,
        actor: &Actor,
        group: &GroupView,
        plans: &[DatasetPlan<'_>],
        direction: Direction,
    ) -> Result<PropagationReport> {
        let clock = Instant::now();
        let mut stats = PropagationStats::default();
        for plan in plans {
            stats += match direction {
                Direction::NotesUp => {
                    self.propagator
                        .notes_up(group, plan.spec, &plan.entity, &plan.aggregate)
                        .await?
                }
                Direction::FlagsDown => {
                    self.propagator
                        .flags_down(group, plan.spec, &plan.entity, &plan.aggregate)
                        .await?
                }
            };
        }
        let report = PropagationReport {
            run_id: Uuid::new_v4(),
            actor: actor.to_string(),
            group: group.name.clone(),
            direction,
            duration_ms: clock.elapsed().as_millis() as u64,
            stats,
        };
        tracing::info!(
            group = %report.group,
            direction = ?direction,
            cells = stats.cells_patched,
            unmatched = stats.rows_unmatched,
            "interactive propagation finished"
        );
        Ok(report)
    }
}

fn owner_unit(owner: &OwnerEntry) -> String {
    format!("owner:{}", owner.key())
}

fn group_unit(name: &str) -> String {
    format!("group:{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::{FileLock, MemoryLock};
    use crate::models::{Color, RecordId};
    use crate::store::{CellPatch, Grid, JsonDocumentStore, MemoryDocumentStore};
    use crate::test_support::{record, sample_config, ScriptedSource};
    use std::time::Duration;

    const ANA: &str = "ana-doc";
    const BO: &str = "bo-doc";
    const WEST: &str = "west-doc";

    fn directory() -> DirectoryConfig {
        let owner = |name: &str, id: &str, doc: &str| OwnerEntry {
            name: name.to_string(),
            email: Some(format!("{}@example.com", name.to_ascii_lowercase())),
            crm_owner_id: Some(id.to_string()),
            store: Some(DocumentRef::new(doc)),
            group: Some("West".to_string()),
        };
        DirectoryConfig {
            owners: vec![owner("Ana", "a", ANA), owner("Bo", "b", BO)],
            groups: vec![GroupEntry {
                name: "West".to_string(),
                store: Some(DocumentRef::new(WEST)),
            }],
            allowlist: vec![],
        }
    }

    struct Harness {
        engine: SyncEngine,
        mem: MemoryDocumentStore,
        source: Arc<ScriptedSource>,
        lock: MemoryLock,
    }

    async fn harness_with(cfg: SyncConfig, dir: DirectoryConfig, source: ScriptedSource) -> Harness {
        let mem = MemoryDocumentStore::new();
        for doc in [ANA, BO, WEST] {
            mem.insert_document(DocumentRef::new(doc)).await;
        }
        let source = Arc::new(source);
        let lock = MemoryLock::new();
        let engine = SyncEngine::new(
            cfg,
            dir,
            source.clone(),
            Arc::new(mem.clone()),
            Arc::new(lock.clone()),
        )
        .unwrap();
        Harness {
            engine,
            mem,
            source,
            lock,
        }
    }

    async fn harness() -> Harness {
        let source = ScriptedSource::new()
            .with_records("a", vec![record("1", "a"), record("2", "a")])
            .with_records("b", vec![record("3", "b")]);
        harness_with(sample_config(), directory(), source).await
    }

    fn system() -> Actor {
        Actor::system("test")
    }

    async fn cycle(h: &Harness) -> CycleReport {
        h.engine.run_cycle(&system()).await.unwrap().acquired().unwrap()
    }

    async fn open_tab(h: &Harness, doc: &str) -> Grid {
        h.mem
            .tab(&DocumentRef::new(doc), "Open Pipeline")
            .await
            .unwrap()
    }

    fn ids(grid: &Grid, id_col: usize) -> Vec<String> {
        grid.data_rows()
            .filter_map(|(r, _)| RecordId::parse_cell(grid.cell(r, id_col)))
            .map(|id| id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn cycle_writes_entity_and_aggregate_tabs() {
        let h = harness().await;
        let report = cycle(&h).await;
        assert_eq!(report.status, CycleStatus::Succeeded);
        assert_eq!(report.owners_ok, 2);
        assert_eq!(report.groups_ok, 1);
        assert!(report.failures.is_empty());

        assert_eq!(ids(&open_tab(&h, ANA).await, 0), vec!["1", "2"]);
        assert_eq!(ids(&open_tab(&h, BO).await, 0), vec!["3"]);
        let agg = open_tab(&h, WEST).await;
        assert_eq!(ids(&agg, 1), vec!["1", "2", "3"]);
        assert_eq!(agg.cell(3, 0), "Bo");
    }

    #[tokio::test]
    async fn repeated_cycles_without_edits_are_idempotent() {
        let h = harness().await;
        cycle(&h).await;
        let first = (open_tab(&h, ANA).await, open_tab(&h, WEST).await);
        let report = cycle(&h).await;
        let second = (open_tab(&h, ANA).await, open_tab(&h, WEST).await);
        assert_eq!(first, second);
        assert_eq!(report.notes_up.cells_patched, 0);
        assert_eq!(report.flags_down.cells_patched, 0);
    }

    #[tokio::test]
    async fn annotations_survive_refresh_and_orphans_are_dropped() {
        let h = harness().await;
        cycle(&h).await;
        let notes = Layout::entity(h.engine.config(), &h.engine.config().datasets[0])
            .index_of("note:Notes")
            .unwrap();
        let doc = DocumentRef::new(ANA);
        h.mem
            .edit_tab(&doc, "Open Pipeline", |g| {
                g.values[1][notes] = "call back".into();
                g.values[2][notes] = "about to vanish".into();
            })
            .await
            .unwrap();

        h.source.set_records("a", vec![record("1", "a"), record("4", "a")]);
        cycle(&h).await;
        let ent = open_tab(&h, ANA).await;
        assert_eq!(ids(&ent, 0), vec!["1", "4"]);
        assert_eq!(ent.cell(1, notes), "call back");
        assert_eq!(ent.cell(2, notes), "");
        assert!(ent.values.iter().flatten().all(|c| c != "about to vanish"));
    }

    #[tokio::test]
    async fn cycle_propagates_notes_up_and_flags_down() {
        let h = harness().await;
        cycle(&h).await;
        let cfg = h.engine.config().clone();
        let entity = Layout::entity(&cfg, &cfg.datasets[0]);
        let aggregate = Layout::aggregate(&cfg, &cfg.datasets[0]);
        let e_notes = entity.index_of("note:Notes").unwrap();
        let a_flag = aggregate.index_of("flag").unwrap();
        let a_name = aggregate.index_of("prop:dealname").unwrap();
        let orange = Color::new("#ffa500");

        h.mem
            .edit_tab(&DocumentRef::new(BO), "Open Pipeline", |g| {
                g.values[1][e_notes] = "legal review".into()
            })
            .await
            .unwrap();
        let o = orange.clone();
        h.mem
            .edit_tab(&DocumentRef::new(WEST), "Open Pipeline", move |g| {
                g.values[1][a_flag] = "priority".into();
                g.backgrounds[1][a_name] = o;
            })
            .await
            .unwrap();

        let report = cycle(&h).await;
        assert_eq!(report.notes_up.cells_patched, 1);
        assert!(report.flags_down.cells_patched >= 2);

        let agg = open_tab(&h, WEST).await;
        assert_eq!(agg.cell(3, aggregate.index_of("note:Notes").unwrap()), "legal review");
        let ana = open_tab(&h, ANA).await;
        assert_eq!(ana.cell(1, entity.index_of("flag").unwrap()), "Priority");
        assert_eq!(
            ana.row_backgrounds(1)[entity.index_of("prop:dealname").unwrap()],
            orange
        );
        // Notes never flow down.
        assert_eq!(ana.cell(1, e_notes), "");
    }

    #[tokio::test]
    async fn failed_owner_is_isolated_and_aggregate_left_untouched() {
        let h = harness().await;
        cycle(&h).await;
        let before = open_tab(&h, WEST).await;

        h.source.fail_owner("b");
        h.source.set_records("a", vec![record("1", "a")]);
        let report = cycle(&h).await;
        assert_eq!(report.status, CycleStatus::Partial);
        assert_eq!(report.owners_ok, 1);
        assert_eq!(report.owners_failed, 1);
        assert_eq!(report.aggregates_skipped, 2);
        assert_eq!(report.failures[0].unit, "owner:bo@example.com");
        assert_eq!(report.failures[0].kind, "remote");

        assert_eq!(ids(&open_tab(&h, ANA).await, 0), vec!["1"]);
        assert_eq!(open_tab(&h, WEST).await, before);

        h.source.heal_owner("b");
        let report = cycle(&h).await;
        assert_eq!(report.status, CycleStatus::Succeeded);
        assert_eq!(ids(&open_tab(&h, WEST).await, 1), vec!["1", "3"]);
    }

    #[tokio::test]
    async fn empty_dataset_renders_placeholder() {
        let h = harness().await;
        cycle(&h).await;
        let won = h.mem.tab(&DocumentRef::new(ANA), "Won").await.unwrap();
        assert_eq!(won.values.len(), 2);
        assert_eq!(won.cell(1, 0), crate::adapters::EMPTY_PLACEHOLDER);
    }

    #[tokio::test]
    async fn fetch_cap_bounds_entity_rows() {
        let mut cfg = sample_config();
        cfg.fetch_cap = 3;
        let many: Vec<_> = (1..=8).map(|i| record(&i.to_string(), "a")).collect();
        let source = ScriptedSource::new().with_page_size(2).with_records("a", many);
        let h = harness_with(cfg, directory(), source).await;
        cycle(&h).await;
        assert_eq!(ids(&open_tab(&h, ANA).await, 0).len(), 3);
    }

    #[tokio::test]
    async fn concurrent_cycles_are_mutually_exclusive() {
        let source = ScriptedSource::new()
            .with_records("a", vec![record("1", "a")])
            .with_delay(Duration::from_millis(150));
        let h = harness_with(sample_config(), directory(), source).await;
        let actor = system();
        let (a, b) = tokio::join!(h.engine.run_cycle(&actor), h.engine.run_cycle(&actor));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.is_busy()).count(), 1);
        assert_eq!(outcomes.iter().filter(|o| !o.is_busy()).count(), 1);
    }

    #[tokio::test]
    async fn interactive_operations_respect_lock_and_allowlist() {
        let mut dir = directory();
        dir.allowlist = vec!["lead@example.com".to_string()];
        let source = ScriptedSource::new().with_records("a", vec![record("1", "a")]);
        let h = harness_with(sample_config(), dir, source).await;
        cycle(&h).await;

        let stranger = Actor::user("someone@example.com");
        let err = h.engine.push_notes_up(&stranger, "West").await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));

        let lead = Actor::user("Lead@example.com");
        let err = h.engine.sync_highlights(&lead, "East").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));

        let ok = h.engine.push_notes_up(&lead, "West").await.unwrap();
        let report = ok.acquired().unwrap();
        assert_eq!(report.direction, Direction::NotesUp);
        assert_eq!(report.stats.cells_patched, 0);

        let _held = h
            .lock
            .acquire("dealsync-test", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        let busy = h.engine.sync_highlights(&lead, "West").await.unwrap();
        assert!(busy.is_busy());
    }

    #[tokio::test]
    async fn missing_stores_are_provisioned_once() {
        let mut dir = directory();
        dir.owners[1].store = None;
        dir.groups.clear();
        let source = ScriptedSource::new()
            .with_records("a", vec![record("1", "a")])
            .with_records("b", vec![record("3", "b")]);
        let h = harness_with(sample_config(), dir, source).await;

        let first = cycle(&h).await;
        assert_eq!(first.provisioned.len(), 2);
        assert_eq!(first.status, CycleStatus::Succeeded);
        let count = h.mem.document_count().await;

        let second = cycle(&h).await;
        assert!(second.provisioned.is_empty());
        assert_eq!(h.mem.document_count().await, count);
        let west = h.mem.provisioned("group:West").await.unwrap().unwrap();
        let agg = h.mem.tab(&west, "Open Pipeline").await.unwrap();
        assert_eq!(ids(&agg, 1), vec!["1", "3"]);
    }

    fn unprovisioned_directory() -> DirectoryConfig {
        let mut dir = directory();
        for owner in &mut dir.owners {
            owner.store = None;
        }
        dir.groups.clear();
        dir
    }

    /// An engine wired the way the CLI wires one: JSON files plus a host
    /// file lock under a shared data directory.
    async fn disk_engine(root: &std::path::Path, source: Arc<ScriptedSource>) -> SyncEngine {
        let store = JsonDocumentStore::open(root.join("docs")).await.unwrap();
        let lock = FileLock::open(root.join("locks"))
            .await
            .unwrap()
            .with_poll_interval(Duration::from_millis(10));
        SyncEngine::new(
            sample_config(),
            unprovisioned_directory(),
            source,
            Arc::new(store),
            Arc::new(lock),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn engines_sharing_a_data_dir_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            ScriptedSource::new()
                .with_records("a", vec![record("1", "a")])
                .with_delay(Duration::from_millis(150)),
        );
        let first = disk_engine(dir.path(), source.clone()).await;
        let second = disk_engine(dir.path(), source).await;
        let actor = system();
        let (a, b) = tokio::join!(first.run_cycle(&actor), second.run_cycle(&actor));
        let outcomes = [a.unwrap(), b.unwrap()];
        assert_eq!(outcomes.iter().filter(|o| o.is_busy()).count(), 1);
    }

    #[tokio::test]
    async fn provisioned_stores_are_reused_by_a_fresh_engine() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(
            ScriptedSource::new()
                .with_records("a", vec![record("1", "a")])
                .with_records("b", vec![record("3", "b")]),
        );
        let first = disk_engine(dir.path(), source.clone()).await;
        let report = first.run_cycle(&system()).await.unwrap().acquired().unwrap();
        assert_eq!(report.provisioned.len(), 3);
        let bo = report
            .provisioned
            .iter()
            .find(|p| p.unit == "owner:bo@example.com")
            .unwrap()
            .document
            .clone();
        drop(first);

        let cfg = sample_config();
        let notes = Layout::entity(&cfg, &cfg.datasets[0])
            .index_of("note:Notes")
            .unwrap();
        let store = JsonDocumentStore::open(dir.path().join("docs")).await.unwrap();
        store
            .patch_cells(&bo, "Open Pipeline", &[CellPatch::value(1, notes, "human note")])
            .await
            .unwrap();

        let second = disk_engine(dir.path(), source).await;
        let report = second.run_cycle(&system()).await.unwrap().acquired().unwrap();
        assert_eq!(report.status, CycleStatus::Succeeded);
        assert!(report.provisioned.is_empty());

        let tab = store.read_tab(&bo, "Open Pipeline").await.unwrap().unwrap();
        assert_eq!(ids(&tab, 0), vec!["3"]);
        assert_eq!(tab.cell(1, notes), "human note");
        let documents = std::fs::read_dir(dir.path().join("docs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json") && !n.starts_with('.'))
            .count();
        assert_eq!(documents, 3);
    }

    #[tokio::test]
    async fn cycle_exceeding_ceiling_times_out() {
        let mut cfg = sample_config();
        cfg.max_cycle_secs = 1;
        let source = ScriptedSource::new()
            .with_records("a", vec![record("1", "a")])
            .with_delay(Duration::from_millis(400));
        let h = harness_with(cfg, directory(), source).await;
        let err = h.engine.run_cycle(&system()).await.unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        // The lock was released despite the timeout.
        assert!(h
            .lock
            .acquire("dealsync-test", Duration::from_millis(10))
            .await
            .unwrap()
            .is_some());
    }
}
