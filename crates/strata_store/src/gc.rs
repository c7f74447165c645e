//! Garbage collection of dead-tablet files across split lineages.
//!
//! A split child keeps reading its dead parent's SST files until compaction
//! migrates them; GC may only reclaim a file once no live tablet claims it.
//! Claims arrive as inheritance reports inside the per-node query responses.
//!
//! Two strategies with identical steady-state outcomes:
//! - batch: rebuild the full candidate set every round, subtract all claims,
//!   delete the remainder;
//! - incremental: persistently track per-dead-tablet file sets and delete as
//!   soon as every live tablet has reported past the tablet's death time.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::meta::tablet_path;
use crate::rpc::{InheritedLiveFiles, TabletReport, META_TABLE_NAME};
use crate::tablet_manager::TabletManager;

/// Strategy seam driven by the master's GC tick and query callbacks.
pub trait GcStrategy: Send + Sync {
    /// Gather dead-tablet candidates; false means nothing to do this round.
    fn pre_query(&self) -> bool;
    /// Fold one tablet server's query response into the strategy state.
    fn process_query_report(&self, tablets: &[TabletReport], inherited: &[InheritedLiveFiles]);
    /// Reclaim whatever no live tablet claims.
    fn post_query(&self);
    /// Drop all state for a removed table.
    fn clear_table(&self, table: &str);
}

fn delete_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(path = %path.display(), "gc deleted file"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => tracing::warn!(path = %path.display(), error = %err, "gc delete failed"),
    }
}

/// Remove now-empty directories bottom-up under a tablet dir.
fn prune_empty_dirs(dir: &Path) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        if entry.path().is_dir() {
            prune_empty_dirs(&entry.path());
        }
    }
    if std::fs::read_dir(dir).map(|mut e| e.next().is_none()).unwrap_or(false) {
        let _ = std::fs::remove_dir(dir);
    }
}

/// Batch strategy: stateless between rounds apart from the in-flight one.
pub struct BatchGcStrategy {
    tablet_manager: Arc<TabletManager>,
    root: PathBuf,
    state: Mutex<BatchState>,
}

#[derive(Default)]
struct BatchState {
    /// table -> (live tablets not yet confirmed by a report, dead tablets).
    gc_tablets: HashMap<String, (BTreeSet<u64>, BTreeSet<u64>)>,
    /// table -> candidate files as (dead tablet num, path under tablet dir).
    candidates: HashMap<String, BTreeSet<(u64, String)>>,
}

impl BatchGcStrategy {
    pub fn new(tablet_manager: Arc<TabletManager>, root: impl Into<PathBuf>) -> Self {
        Self {
            tablet_manager,
            root: root.into(),
            state: Mutex::new(BatchState::default()),
        }
    }
}

impl GcStrategy for BatchGcStrategy {
    fn pre_query(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        state.gc_tablets.clear();
        state.candidates.clear();

        let mut file_total = 0usize;
        for table in self.tablet_manager.user_tables() {
            if table.name() == META_TABLE_NAME {
                continue;
            }
            let Some((live, dead)) = table.tablets_for_gc(&self.root) else {
                continue;
            };
            if dead.is_empty() {
                continue;
            }
            let name = table.name();
            let mut files = BTreeSet::new();
            for &num in &dead {
                let dir = self.root.join(tablet_path(&name, num));
                for file in crate::tablet_io::list_files_under(&dir) {
                    files.insert((num, file));
                }
            }
            file_total += files.len();
            state.candidates.insert(name.clone(), files);
            state.gc_tablets.insert(name, (live, dead));
        }

        if state.gc_tablets.is_empty() {
            tracing::info!("gc: no dead tablets this round");
            return false;
        }
        tracing::info!(
            tables = state.gc_tablets.len(),
            candidate_files = file_total,
            "gc collected dead tablet files"
        );
        true
    }

    fn process_query_report(&self, tablets: &[TabletReport], inherited: &[InheritedLiveFiles]) {
        let mut state = self.state.lock().unwrap();
        // Confirm live tablets seen in this report.
        for report in tablets {
            if let Some((live, _)) = state.gc_tablets.get_mut(&report.meta.table_name) {
                if let Some(num) = report.meta.tablet_num() {
                    live.remove(&num);
                }
            }
        }
        // Subtract inherited claims from the candidates.
        for section in inherited {
            if let Some(files) = state.candidates.get_mut(&section.table_name) {
                for claim in &section.ancestors {
                    for file in &claim.files {
                        files.remove(&(claim.ancestor, file.clone()));
                    }
                }
            }
        }
    }

    fn post_query(&self) {
        let mut state = self.state.lock().unwrap();
        let unconfirmed = state
            .gc_tablets
            .iter()
            .find(|(_, (live, _))| !live.is_empty());
        if let Some((table, _)) = unconfirmed {
            // A live tablet never reported; its claims are unknown, so the
            // whole round is abandoned.
            tracing::info!(table = %table, "gc round abandoned: live tablet unreported");
            state.gc_tablets.clear();
            state.candidates.clear();
            return;
        }

        let mut deleted = 0usize;
        for (table, files) in std::mem::take(&mut state.candidates) {
            let mut touched_dirs = BTreeSet::new();
            for (num, file) in files {
                let tablet_dir = self.root.join(tablet_path(&table, num));
                delete_file(&tablet_dir.join(&file));
                deleted += 1;
                touched_dirs.insert(tablet_dir);
            }
            for dir in touched_dirs {
                prune_empty_dirs(&dir);
            }
        }
        state.gc_tablets.clear();
        tracing::info!(deleted, "gc round finished");
    }

    fn clear_table(&self, _table: &str) {
        // Batch state is rebuilt from scratch each round.
    }
}

#[derive(Default, Debug, Clone)]
struct LgFileSet {
    storage: BTreeSet<String>,
    live: BTreeSet<String>,
}

#[derive(Default, Debug, Clone)]
struct TabletFileSet {
    ready_time_ms: u64,
    dead_time_ms: u64,
    /// Keyed by the first path component under the tablet dir (the LG dir).
    files: BTreeMap<String, LgFileSet>,
}

type TabletFiles = BTreeMap<u64, TabletFileSet>;

/// Incremental strategy: dead-tablet directories are enumerated once, then
/// tracked until every file is reclaimed.
pub struct IncrementalGcStrategy {
    tablet_manager: Arc<TabletManager>,
    root: PathBuf,
    state: Mutex<IncrementalState>,
}

#[derive(Default)]
struct IncrementalState {
    dead_tablet_files: HashMap<String, TabletFiles>,
    live_tablet_files: HashMap<String, TabletFiles>,
}

fn split_lg(file: &str) -> (String, String) {
    match file.split_once('/') {
        Some((lg, rest)) => (lg.to_string(), rest.to_string()),
        None => (String::new(), file.to_string()),
    }
}

impl IncrementalGcStrategy {
    pub fn new(tablet_manager: Arc<TabletManager>, root: impl Into<PathBuf>) -> Self {
        Self {
            tablet_manager,
            root: root.into(),
            state: Mutex::new(IncrementalState::default()),
        }
    }

    fn collect_dead_tablet(&self, table: &str, num: u64) -> TabletFileSet {
        let dir = self.root.join(tablet_path(table, num));
        let mut set = TabletFileSet {
            dead_time_ms: crate::unix_time_ms(),
            ..Default::default()
        };
        for file in crate::tablet_io::list_files_under(&dir) {
            let (lg, rest) = split_lg(&file);
            set.files.entry(lg).or_default().storage.insert(rest);
        }
        set
    }
}

impl GcStrategy for IncrementalGcStrategy {
    fn pre_query(&self) -> bool {
        let mut state = self.state.lock().unwrap();
        for table in self.tablet_manager.user_tables() {
            let name = table.name();
            if name == META_TABLE_NAME {
                continue;
            }
            let Some((live, dead)) = table.tablets_for_gc(&self.root) else {
                continue;
            };
            let dead_entry = state.dead_tablet_files.entry(name.clone()).or_default();
            for &num in &dead {
                if !dead_entry.contains_key(&num) {
                    tracing::debug!(table = %name, tablet = num, "gc: newly dead tablet");
                    let set = self.collect_dead_tablet(&name, num);
                    dead_entry.insert(num, set);
                }
            }
            let newly_dead: BTreeSet<u64> = dead_entry.keys().copied().collect();
            let live_entry = state.live_tablet_files.entry(name.clone()).or_default();
            live_entry.retain(|num, _| !newly_dead.contains(num));
            for &num in &live {
                live_entry.entry(num).or_default();
            }
        }
        state.dead_tablet_files.values().any(|t| !t.is_empty())
    }

    fn process_query_report(&self, tablets: &[TabletReport], inherited: &[InheritedLiveFiles]) {
        let mut state = self.state.lock().unwrap();
        let now = crate::unix_time_ms();

        // Tables with an inheritance section in this response are fully
        // reported; only their live tablets get a fresh ready time.
        let reported_tables: BTreeSet<&str> = inherited
            .iter()
            .map(|i| i.table_name.as_str())
            .collect();
        for report in tablets {
            let table = report.meta.table_name.as_str();
            if table == META_TABLE_NAME || !reported_tables.contains(table) {
                continue;
            }
            let Some(live) = state.live_tablet_files.get_mut(table) else {
                continue;
            };
            let Some(num) = report.meta.tablet_num() else {
                continue;
            };
            if let Some(entry) = live.get_mut(&num) {
                entry.ready_time_ms = now;
            }
        }

        for section in inherited {
            let Some(dead) = state.dead_tablet_files.get_mut(&section.table_name) else {
                continue;
            };
            for claim in &section.ancestors {
                let Some(tablet) = dead.get_mut(&claim.ancestor) else {
                    tracing::debug!(
                        table = %section.table_name,
                        ancestor = claim.ancestor,
                        "gc: claim for tablet not yet tracked as dead"
                    );
                    continue;
                };
                for file in &claim.files {
                    let (lg, rest) = split_lg(file);
                    let lg_set = tablet.files.entry(lg).or_default();
                    if !lg_set.storage.contains(&rest) {
                        // A claim for a file we never enumerated: report and
                        // skip rather than aborting the master.
                        tracing::error!(
                            table = %section.table_name,
                            ancestor = claim.ancestor,
                            file = %rest,
                            "gc: live file missing from storage set"
                        );
                        continue;
                    }
                    lg_set.live.insert(rest);
                }
            }
        }
    }

    fn post_query(&self) {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let now = crate::unix_time_ms();
        for (table, dead_tablets) in state.dead_tablet_files.iter_mut() {
            let live_tablets = state.live_tablet_files.entry(table.clone()).or_default();
            let earliest_ready_ms = live_tablets
                .values()
                .map(|t| t.ready_time_ms)
                .min()
                .unwrap_or(u64::MAX);

            let eligible: Vec<u64> = dead_tablets
                .iter()
                .filter(|(_, set)| set.dead_time_ms < earliest_ready_ms)
                .map(|(&num, _)| num)
                .collect();

            for num in eligible {
                let tablet_dir = self.root.join(tablet_path(table, num));
                let Some(set) = dead_tablets.get_mut(&num) else {
                    continue;
                };
                set.files.retain(|lg, lg_set| {
                    let doomed: Vec<String> = lg_set
                        .storage
                        .iter()
                        .filter(|file| !lg_set.live.contains(*file))
                        .cloned()
                        .collect();
                    for file in doomed {
                        let rel = if lg.is_empty() {
                            file.clone()
                        } else {
                            format!("{lg}/{file}")
                        };
                        delete_file(&tablet_dir.join(rel));
                        lg_set.storage.remove(&file);
                    }
                    if lg_set.storage.is_empty() {
                        let _ = std::fs::remove_dir_all(tablet_dir.join(lg));
                        false
                    } else {
                        true
                    }
                });

                if set.files.is_empty() {
                    let _ = std::fs::remove_dir_all(&tablet_dir);
                    tracing::info!(table = %table, tablet = num, "gc reclaimed dead tablet dir");
                    dead_tablets.remove(&num);
                } else {
                    // Files survive via live claims: require fresh claims next
                    // round before this tablet qualifies again.
                    for lg_set in set.files.values_mut() {
                        lg_set.live.clear();
                    }
                    set.dead_time_ms = now;
                }
            }
        }
        state.dead_tablet_files.retain(|_, t| !t.is_empty());
    }

    fn clear_table(&self, table: &str) {
        let mut state = self.state.lock().unwrap();
        state.dead_tablet_files.remove(table);
        state.live_tablet_files.remove(table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{KeyRange, TableMeta, TableSchema, TableStatus, TabletMeta, TabletStatus};
    use crate::tablet_manager::{Table, Tablet};

    fn ready_tablet(table: &str, num: u64, start: &[u8], end: &[u8]) -> Tablet {
        let tablet = Tablet::new(TabletMeta {
            table_name: table.to_string(),
            path: tablet_path(table, num),
            key_range: KeyRange::new(start, end),
            server_addr: "ts1:7777".into(),
            status: TabletStatus::NotInit,
            ..Default::default()
        });
        assert!(tablet.set_status(TabletStatus::Ready));
        tablet
    }

    /// One table with tablets 2 and 3 live (children) and tablet 1 dead on
    /// disk; the children still claim one parent file.
    fn setup(root: &Path) -> (Arc<TabletManager>, Vec<TabletReport>) {
        let manager = Arc::new(TabletManager::new());
        let mut meta = TableMeta::new(TableSchema::kv("t"), 0);
        meta.status = TableStatus::Enable;
        meta.next_tablet_num = 4;
        let table = Table::new(meta);
        let left = ready_tablet("t", 2, b"", b"m");
        let right = ready_tablet("t", 3, b"m", b"");
        assert!(table.add_tablet(left.clone()));
        assert!(table.add_tablet(right.clone()));
        manager.add_table(table).unwrap();

        for num in [1u64, 2, 3] {
            let dir = root.join(tablet_path("t", num)).join("lg0");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("000001.sst"), b"sst").unwrap();
        }
        std::fs::write(
            root.join(tablet_path("t", 1)).join("lg0").join("000002.sst"),
            b"sst",
        )
        .unwrap();

        let reports = vec![
            TabletReport {
                meta: left.meta(),
                counter: Default::default(),
            },
            TabletReport {
                meta: right.meta(),
                counter: Default::default(),
            },
        ];
        (manager, reports)
    }

    fn claims(files: Vec<&str>) -> Vec<InheritedLiveFiles> {
        vec![InheritedLiveFiles {
            table_name: "t".into(),
            ancestors: vec![crate::rpc::InheritedAncestor {
                ancestor: 1,
                files: files.into_iter().map(String::from).collect(),
            }],
        }]
    }

    #[test]
    fn batch_gc_keeps_claimed_files_and_deletes_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, reports) = setup(dir.path());
        let gc = BatchGcStrategy::new(manager, dir.path());

        assert!(gc.pre_query());
        gc.process_query_report(&reports, &claims(vec!["lg0/000001.sst"]));
        gc.post_query();

        let parent = dir.path().join(tablet_path("t", 1));
        assert!(parent.join("lg0/000001.sst").exists(), "claimed file deleted");
        assert!(!parent.join("lg0/000002.sst").exists(), "unclaimed file kept");
        // Live tablet dirs are untouched.
        assert!(dir.path().join(tablet_path("t", 2)).join("lg0/000001.sst").exists());

        // Next round: no claims at all -> the parent dir is fully reclaimed.
        assert!(gc.pre_query());
        gc.process_query_report(&reports, &claims(vec![]));
        gc.post_query();
        assert!(!parent.exists(), "dead dir should be reclaimed");
    }

    #[test]
    fn batch_gc_abandons_round_when_a_live_tablet_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, reports) = setup(dir.path());
        let gc = BatchGcStrategy::new(manager, dir.path());

        assert!(gc.pre_query());
        // Only one of the two live tablets reports.
        gc.process_query_report(&reports[..1], &claims(vec![]));
        gc.post_query();
        assert!(
            dir.path()
                .join(tablet_path("t", 1))
                .join("lg0/000001.sst")
                .exists(),
            "nothing may be deleted while a live tablet is unreported"
        );
    }

    #[test]
    fn incremental_gc_waits_for_fresh_ready_times() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, reports) = setup(dir.path());
        let gc = IncrementalGcStrategy::new(manager, dir.path());

        // Round 1: dead tablet discovered, both children report, one claim.
        assert!(gc.pre_query());
        std::thread::sleep(std::time::Duration::from_millis(5));
        gc.process_query_report(&reports, &claims(vec!["lg0/000001.sst"]));
        gc.post_query();
        let parent = dir.path().join(tablet_path("t", 1));
        assert!(parent.join("lg0/000001.sst").exists());
        assert!(!parent.join("lg0/000002.sst").exists());

        // Round 2: dead_time was refreshed, so deletion needs reports newer
        // than it; silent children mean nothing further is deleted.
        assert!(gc.pre_query());
        gc.post_query();
        assert!(parent.join("lg0/000001.sst").exists());

        // Round 3: children report again without the claim -> reclaimed.
        assert!(gc.pre_query());
        std::thread::sleep(std::time::Duration::from_millis(5));
        gc.process_query_report(&reports, &claims(vec![]));
        gc.post_query();
        assert!(!parent.exists());
    }

    #[test]
    fn incremental_gc_skips_claims_outside_storage_set() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, reports) = setup(dir.path());
        let gc = IncrementalGcStrategy::new(manager, dir.path());
        assert!(gc.pre_query());
        std::thread::sleep(std::time::Duration::from_millis(5));
        // Claim names a file that was never enumerated: skip, don't panic.
        gc.process_query_report(&reports, &claims(vec!["lg0/bogus.sst", "lg0/000001.sst"]));
        gc.post_query();
        assert!(dir
            .path()
            .join(tablet_path("t", 1))
            .join("lg0/000001.sst")
            .exists());
    }
}
