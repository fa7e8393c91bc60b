pub mod calibration;
pub mod calibration_store;
pub mod distortion;
pub mod lookup_table;
pub mod lut_cache;
pub mod partial_update;
pub mod progress;
pub mod scheduler;
pub mod settings;
pub mod table_builder;
pub mod table_file;

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use chrono::NaiveDate;

pub use calibration::{ CalibrationError, CalibrationVector };
pub use calibration_store::{ CalibrationStore, JsonCalibrationStore, MemoryCalibrationStore };
pub use lookup_table::{ Dimensions, LookUpTable };
pub use lut_cache::{ CacheKey, CacheLookup, CacheOutcome, LutCache };
pub use progress::{ BuildControl, Flow, ProgressSink };
pub use scheduler::{ Scheduler, SchedulerError, SchedulerEvent };
pub use settings::LutConfig;
pub use table_builder::{ BuildError, BuildOptions };

/// Owns the table cache and its background scheduler. Create one at startup and share it.
///
/// Dropping the service stops the scheduler.
pub struct LutService {
    config: LutConfig,
    store: Arc<dyn CalibrationStore>,
    cache: Arc<LutCache>,
    scheduler: Scheduler,
}

impl LutService {
    pub fn new(config: LutConfig, store: Arc<dyn CalibrationStore>) -> Self {
        let cache = Arc::new(LutCache::new(BuildOptions::from_config(&config)));
        let scheduler = Scheduler::new(cache.clone(), store.clone(), &config);
        Self { config, store, cache, scheduler }
    }

    pub fn config(&self) -> &LutConfig { &self.config }
    pub fn cache(&self) -> &Arc<LutCache> { &self.cache }
    pub fn store(&self) -> &Arc<dyn CalibrationStore> { &self.store }

    /// Builds without touching the cache.
    #[allow(clippy::too_many_arguments)]
    pub fn build_table(&self, width: usize, height: usize, vector: &[f64], make: &str, model: &str, as_of_date: Option<NaiveDate>, control: &BuildControl) -> Result<LookUpTable, BuildError> {
        control.with(|cancel, progress| {
            table_builder::build_table(width, height, vector, make, model, as_of_date, self.cache.options(), cancel, progress)
        })
    }

    pub fn get_or_build(&self, make: &str, model: &str, width: usize, height: usize, vector: &[f64], as_of_date: Option<NaiveDate>) -> Result<Arc<LookUpTable>, BuildError> {
        self.cache.get_or_build(&CacheKey::new(make, model, width, height), vector, as_of_date)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn lookup(&self, make: &str, model: &str, width: usize, height: usize, vector: &[f64], as_of_date: Option<NaiveDate>, control: &BuildControl) -> Result<CacheLookup, BuildError> {
        self.cache.lookup(&CacheKey::new(make, model, width, height), vector, as_of_date, control)
    }

    pub fn insert(&self, make: &str, model: &str, width: usize, height: usize, table: LookUpTable) {
        self.cache.insert(CacheKey::new(make, model, width, height), table);
    }

    pub fn invalidate(&self, make: &str, model: &str) -> usize { self.cache.invalidate(make, model) }
    pub fn clear(&self) { self.cache.clear() }

    pub fn start(&self) -> Result<(), SchedulerError> { self.scheduler.start() }
    pub fn stop(&self) -> Result<(), SchedulerError> { self.scheduler.stop() }
    pub fn pause(&self) { self.scheduler.pause() }
    pub fn resume(&self) { self.scheduler.resume() }
    pub fn is_running(&self) -> bool { self.scheduler.is_running() }
    pub fn subscribe(&self) -> Receiver<SchedulerEvent> { self.scheduler.subscribe() }

    pub fn request_priority(&self, make: &str, model: &str, width: usize, height: usize) -> bool {
        self.scheduler.request_priority(make, model, width, height)
    }

    /// The camera's calibration was edited: drop its tables and rebuild the standard sizes first.
    pub fn camera_changed(&self, make: &str, model: &str) {
        let removed = self.cache.invalidate(make, model);
        log::info!("{make} {model} changed, dropped {removed} tables");
        for d in &self.config.standard_dimensions {
            self.scheduler.request_priority(make, model, d.w, d.h);
        }
    }
}
