// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicUsize, Ordering::SeqCst };
use std::time::Duration;
use chrono::NaiveDate;
use parking_lot::{ Condvar, Mutex };

use crate::calibration::CalibrationVector;
use crate::lookup_table::LookUpTable;
use crate::partial_update::{ self, RebuildReason, UpdateDecision };
use crate::progress::BuildControl;
use crate::table_builder::{ self, BuildError, BuildOptions };

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey {
    pub make: String,
    pub model: String,
    pub width: usize,
    pub height: usize,
}

impl CacheKey {
    pub fn new(make: &str, model: &str, width: usize, height: usize) -> Self {
        Self { make: make.to_owned(), model: model.to_owned(), width, height }
    }
    pub fn is_camera(&self, make: &str, model: &str) -> bool {
        self.make == make && self.model == model
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {} {}x{}", self.make, self.model, self.width, self.height)
    }
}

/// How a lookup was satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Patched(UpdateDecision),
    Built(RebuildReason),
    /// Waited for a build started by another caller.
    Joined,
}

#[derive(Debug, Clone)]
pub struct CacheLookup {
    pub table: Arc<LookUpTable>,
    pub outcome: CacheOutcome,
}

type BuildResult = Result<Arc<LookUpTable>, BuildError>;

// How often a waiting caller checks its own cancel flag
const WAIT_POLL: Duration = Duration::from_millis(20);

struct InFlight {
    vector: CalibrationVector,
    as_of_date: Option<NaiveDate>,
    result: Mutex<Option<BuildResult>>,
    done: Condvar,
}

impl InFlight {
    fn new(vector: CalibrationVector, as_of_date: Option<NaiveDate>) -> Self {
        Self { vector, as_of_date, result: Mutex::new(None), done: Condvar::new() }
    }
    /// Blocks until the builder publishes. Returns `None` if `cancel` is raised first.
    fn wait(&self, cancel: &AtomicBool) -> Option<BuildResult> {
        let mut result = self.result.lock();
        loop {
            if let Some(r) = result.as_ref() {
                return Some(r.clone());
            }
            if cancel.load(SeqCst) {
                return None;
            }
            self.done.wait_for(&mut result, WAIT_POLL);
        }
    }
    fn finish(&self, r: BuildResult) {
        *self.result.lock() = Some(r);
        self.done.notify_all();
    }
}

#[derive(Clone)]
enum Slot {
    Ready(Arc<LookUpTable>),
    Building(Arc<InFlight>),
}

/// Publishes the build result and wakes waiters, also when the builder unwinds.
struct BuildGuard<'a> {
    cache: &'a LutCache,
    key: &'a CacheKey,
    inflight: Arc<InFlight>,
    finished: bool,
}

impl BuildGuard<'_> {
    fn complete(mut self, result: BuildResult) {
        self.publish(result);
        self.finished = true;
    }
    fn publish(&self, result: BuildResult) {
        {
            let mut map = self.cache.map.lock();
            // Invalidated or overwritten while building: hand the result to the waiters only
            let still_ours = matches!(map.get(self.key), Some(Slot::Building(f)) if Arc::ptr_eq(f, &self.inflight));
            if still_ours {
                match &result {
                    Ok(table) => { map.insert(self.key.clone(), Slot::Ready(table.clone())); },
                    Err(_)    => { map.remove(self.key); },
                }
            } else if result.is_ok() {
                log::debug!("{}: dropped after invalidation", self.key);
            }
        }
        self.inflight.finish(result);
    }
}

impl Drop for BuildGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            log::error!("{}: build abandoned", self.key);
            self.publish(Err(BuildError::Abandoned));
        }
    }
}

/// Tables by (make, model, width, height).
///
/// The map lock is only held for lookups and inserts. A miss registers an in-flight build,
/// and concurrent callers for the same key wait for it instead of building again.
pub struct LutCache {
    map: Mutex<HashMap<CacheKey, Slot>>,
    options: BuildOptions,
    builds: AtomicUsize,
    patches: AtomicUsize,
}

impl LutCache {
    pub fn new(options: BuildOptions) -> Self {
        Self {
            map: Mutex::new(HashMap::new()),
            options,
            builds: AtomicUsize::new(0),
            patches: AtomicUsize::new(0),
        }
    }

    pub fn options(&self) -> &BuildOptions { &self.options }

    pub fn get_or_build(&self, key: &CacheKey, vector: &[f64], as_of_date: Option<NaiveDate>) -> Result<Arc<LookUpTable>, BuildError> {
        self.lookup(key, vector, as_of_date, &BuildControl::default()).map(|l| l.table)
    }

    /// Returns the table for `key`, valid for `vector` and `as_of_date`, building or patching as needed.
    pub fn lookup(&self, key: &CacheKey, vector: &[f64], as_of_date: Option<NaiveDate>, control: &BuildControl) -> Result<CacheLookup, BuildError> {
        let vector = CalibrationVector::from_slice(vector)?;
        let quirk = self.options.quirk_for(&key.make, &key.model);

        loop {
            let (inflight, reason) = {
                let mut map = self.map.lock();
                let current = map.get(key).cloned();
                match current {
                    Some(Slot::Ready(table)) => {
                        let decision = match table.calibration_vector() {
                            Ok(cached) => partial_update::decide(&cached, table.as_of_date, &vector, as_of_date, quirk),
                            Err(e) => {
                                log::warn!("{key}: cached table has unreadable metadata ({e}), rebuilding");
                                UpdateDecision::Rebuild(RebuildReason::Missing)
                            }
                        };
                        match decision {
                            UpdateDecision::Reuse if table.as_of_date == as_of_date => {
                                return Ok(CacheLookup { table, outcome: CacheOutcome::Hit });
                            }
                            UpdateDecision::Reuse => {
                                let table = Arc::new(table.with_metadata_from(&vector, as_of_date));
                                map.insert(key.clone(), Slot::Ready(table.clone()));
                                return Ok(CacheLookup { table, outcome: CacheOutcome::Hit });
                            }
                            UpdateDecision::Patch { .. } => {
                                let table = Arc::new(table.with_metadata_from(&vector, as_of_date));
                                map.insert(key.clone(), Slot::Ready(table.clone()));
                                self.patches.fetch_add(1, SeqCst);
                                log::info!("{key}: patched in place ({decision:?})");
                                return Ok(CacheLookup { table, outcome: CacheOutcome::Patched(decision) });
                            }
                            UpdateDecision::Rebuild(reason) => {
                                let inflight = Arc::new(InFlight::new(vector.clone(), as_of_date));
                                map.insert(key.clone(), Slot::Building(inflight.clone()));
                                (inflight, reason)
                            }
                        }
                    }
                    Some(Slot::Building(inflight)) => {
                        drop(map);
                        log::debug!("{key}: waiting for build in flight");
                        let Some(result) = control.with(|cancel, _| inflight.wait(cancel)) else {
                            log::debug!("{key}: cancelled while waiting");
                            return Err(BuildError::Cancelled);
                        };
                        if let Err(e @ (BuildError::Cancelled | BuildError::Abandoned)) = &result {
                            // The builder gave up, not this caller. Its slot is gone, so build it here
                            log::debug!("{key}: build in flight ended with \"{e}\", retrying");
                            continue;
                        }
                        if inflight.vector == vector && inflight.as_of_date == as_of_date {
                            return result.map(|table| CacheLookup { table, outcome: CacheOutcome::Joined });
                        }
                        // Built for another calibration, check again against whatever got stored
                        continue;
                    }
                    None => {
                        let inflight = Arc::new(InFlight::new(vector.clone(), as_of_date));
                        map.insert(key.clone(), Slot::Building(inflight.clone()));
                        (inflight, RebuildReason::Missing)
                    }
                }
            };

            return self.run_build(key, inflight, reason, control);
        }
    }

    fn run_build(&self, key: &CacheKey, inflight: Arc<InFlight>, reason: RebuildReason, control: &BuildControl) -> Result<CacheLookup, BuildError> {
        self.builds.fetch_add(1, SeqCst);
        log::info!("{key}: building ({reason:?})");

        let guard = BuildGuard { cache: self, key, inflight: inflight.clone(), finished: false };

        let result = control.with(|cancel, progress| {
            table_builder::build_table(key.width, key.height, inflight.vector.as_slice(), &key.make, &key.model, inflight.as_of_date, &self.options, cancel, progress)
        }).map(Arc::new);
        if let Err(e) = &result {
            log::warn!("{key}: {e}");
        }
        guard.complete(result.clone());

        result.map(|table| CacheLookup { table, outcome: CacheOutcome::Built(reason) })
    }

    pub fn insert(&self, key: CacheKey, table: LookUpTable) {
        self.map.lock().insert(key, Slot::Ready(Arc::new(table)));
    }

    /// Completed table for `key`, without checking it against any calibration.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<LookUpTable>> {
        match self.map.lock().get(key) {
            Some(Slot::Ready(t)) => Some(t.clone()),
            _ => None,
        }
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        matches!(self.map.lock().get(key), Some(Slot::Ready(_)))
    }

    /// Drops every size variant of one camera. Builds in flight finish but are not stored.
    pub fn invalidate(&self, make: &str, model: &str) -> usize {
        let mut map = self.map.lock();
        let before = map.len();
        map.retain(|k, _| !k.is_camera(make, model));
        let removed = before - map.len();
        log::debug!("Invalidated {removed} tables for {make} {model}");
        removed
    }

    pub fn clear(&self) {
        self.map.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.map.lock().values().filter(|s| matches!(s, Slot::Ready(_))).count()
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn keys(&self) -> Vec<CacheKey> {
        let mut keys: Vec<_> = self.map.lock().iter().filter(|(_, s)| matches!(s, Slot::Ready(_))).map(|(k, _)| k.clone()).collect();
        keys.sort();
        keys
    }

    pub fn build_count(&self) -> usize { self.builds.load(SeqCst) }
    pub fn patch_count(&self) -> usize { self.patches.load(SeqCst) }
}
