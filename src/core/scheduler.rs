// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, Ordering::SeqCst };
use std::sync::mpsc::{ self, Receiver, RecvTimeoutError, Sender, TryRecvError };
use std::thread::JoinHandle;
use std::time::Duration;
use chrono::NaiveDate;
use itertools::Itertools;
use parking_lot::Mutex;

use crate::calibration_store::CalibrationStore;
use crate::lookup_table::Dimensions;
use crate::lut_cache::{ CacheKey, CacheOutcome, LutCache };
use crate::progress::BuildControl;
use crate::settings::LutConfig;
use crate::table_builder::BuildError;

#[derive(thiserror::Error, Debug)]
pub enum SchedulerError {
    #[error("Scheduler worker did not exit within {0:?}")] JoinTimeout(Duration),
    #[error("Scheduler worker panicked")]                  WorkerPanicked,
    #[error("Failed to spawn scheduler worker: {0:?}")]    Spawn(#[from] std::io::Error),
    #[error("Previous scheduler worker has not exited yet")] WorkerStillRunning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundTask {
    pub key: CacheKey,
    pub as_of_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerEvent {
    TableBuilt { make: String, model: String, width: usize, height: usize },
    TaskFailed { make: String, model: String, width: usize, height: usize, reason: String },
    BacklogDrained,
}

impl SchedulerEvent {
    fn built(key: &CacheKey) -> Self {
        Self::TableBuilt { make: key.make.clone(), model: key.model.clone(), width: key.width, height: key.height }
    }
    fn failed(key: &CacheKey, reason: String) -> Self {
        Self::TaskFailed { make: key.make.clone(), model: key.model.clone(), width: key.width, height: key.height, reason }
    }
}

enum Command {
    Enqueue(BackgroundTask),
    Pause,
    Resume,
    Stop,
}

type Subscribers = Arc<Mutex<Vec<Sender<SchedulerEvent>>>>;

fn emit(subscribers: &Subscribers, event: SchedulerEvent) {
    // Drop subscribers whose receiver is gone
    subscribers.lock().retain(|s| s.send(event.clone()).is_ok());
}

struct WorkerHandle {
    commands: Sender<Command>,
    cancel: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    exited: Receiver<()>,
    thread: JoinHandle<()>,
}

/// Pre-builds tables for every known camera at the standard sizes on one background thread.
///
/// Priority requests always run before the background sweep. Control methods take `&self`
/// and may be called from any thread.
pub struct Scheduler {
    cache: Arc<LutCache>,
    store: Arc<dyn CalibrationStore>,
    standard_dimensions: Vec<Dimensions>,
    stop_timeout: Duration,
    subscribers: Subscribers,
    worker: Mutex<Option<WorkerHandle>>,
    // Worker that missed its stop deadline. No new worker starts until it exits
    detached: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(cache: Arc<LutCache>, store: Arc<dyn CalibrationStore>, config: &LutConfig) -> Self {
        Self {
            cache,
            store,
            standard_dimensions: config.standard_dimensions.clone(),
            stop_timeout: config.stop_timeout(),
            subscribers: Default::default(),
            worker: Mutex::new(None),
            detached: Mutex::new(None),
        }
    }

    /// Events of every worker started after this call.
    pub fn subscribe(&self) -> Receiver<SchedulerEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn start(&self) -> Result<(), SchedulerError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            log::debug!("Scheduler already running");
            return Ok(());
        }
        {
            let mut detached = self.detached.lock();
            match detached.take() {
                Some(thread) if !thread.is_finished() => {
                    *detached = Some(thread);
                    log::warn!("Previous scheduler worker is still running, not starting another");
                    return Err(SchedulerError::WorkerStillRunning);
                }
                Some(thread) => {
                    if thread.join().is_err() {
                        log::warn!("Previous scheduler worker panicked");
                    }
                }
                None => { }
            }
        }

        let (commands, command_rx) = mpsc::channel();
        let (exited_tx, exited) = mpsc::channel();
        let cancel = Arc::new(AtomicBool::new(false));
        let paused = Arc::new(AtomicBool::new(false));

        let state = Worker {
            cache: self.cache.clone(),
            store: self.store.clone(),
            subscribers: self.subscribers.clone(),
            commands: command_rx,
            cancel: cancel.clone(),
            paused: false,
            priority: VecDeque::new(),
            background: VecDeque::new(),
            drained_reported: false,
        };
        let dims = self.standard_dimensions.clone();

        let thread = std::thread::Builder::new().name("lut-scheduler".into()).spawn(move || {
            let mut state = state;
            state.queue_sweep(&dims, chrono::Local::now().date_naive());
            state.run();
            let _ = exited_tx.send(());
        })?;

        log::info!("Scheduler started");
        *worker = Some(WorkerHandle { commands, cancel, paused, exited, thread });
        Ok(())
    }

    /// Cancels the running build, empties both queues and waits for the worker to exit.
    /// Does nothing when the worker is not running.
    ///
    /// On timeout the worker is left running detached, and `start` fails until it has exited.
    pub fn stop(&self) -> Result<(), SchedulerError> {
        let Some(handle) = self.worker.lock().take() else { return Ok(()); };

        handle.cancel.store(true, SeqCst);
        let _ = handle.commands.send(Command::Stop);

        match handle.exited.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                handle.thread.join().map_err(|_| SchedulerError::WorkerPanicked)?;
                log::info!("Scheduler stopped");
                Ok(())
            }
            Err(RecvTimeoutError::Timeout) => {
                log::error!("Scheduler worker did not stop within {:?}, leaving it detached", self.stop_timeout);
                *self.detached.lock() = Some(handle.thread);
                Err(SchedulerError::JoinTimeout(self.stop_timeout))
            }
        }
    }

    /// Takes effect between tasks. A build already running finishes first.
    pub fn pause(&self) {
        if let Some(w) = self.worker.lock().as_ref() {
            w.paused.store(true, SeqCst);
            let _ = w.commands.send(Command::Pause);
            log::info!("Scheduler paused");
        }
    }

    pub fn resume(&self) {
        if let Some(w) = self.worker.lock().as_ref() {
            w.paused.store(false, SeqCst);
            let _ = w.commands.send(Command::Resume);
            log::info!("Scheduler resumed");
        }
    }

    /// Queues a build ahead of the background sweep. Returns false when the worker is not running.
    pub fn request_priority(&self, make: &str, model: &str, width: usize, height: usize) -> bool {
        let task = BackgroundTask {
            key: CacheKey::new(make, model, width, height),
            as_of_date: Some(chrono::Local::now().date_naive()),
        };
        match self.worker.lock().as_ref() {
            Some(w) => w.commands.send(Command::Enqueue(task)).is_ok(),
            None => {
                log::debug!("Scheduler not running, dropping request for {}", task.key);
                false
            }
        }
    }

    pub fn is_running(&self) -> bool { self.worker.lock().is_some() }

    pub fn is_paused(&self) -> bool {
        self.worker.lock().as_ref().is_some_and(|w| w.paused.load(SeqCst))
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::error!("Failed to stop scheduler: {e}");
        }
    }
}

struct Worker {
    cache: Arc<LutCache>,
    store: Arc<dyn CalibrationStore>,
    subscribers: Subscribers,
    commands: Receiver<Command>,
    cancel: Arc<AtomicBool>,
    paused: bool,
    priority: VecDeque<BackgroundTask>,
    background: VecDeque<BackgroundTask>,
    drained_reported: bool,
}

impl Worker {
    fn queue_sweep(&mut self, dims: &[Dimensions], today: NaiveDate) {
        let cameras = self.store.list_all();
        for ((make, model, _), d) in cameras.iter().cartesian_product(dims) {
            self.background.push_back(BackgroundTask { key: CacheKey::new(make, model, d.w, d.h), as_of_date: Some(today) });
        }
        log::debug!("Queued {} background tables for {} cameras", self.background.len(), cameras.len());
    }

    fn run(&mut self) {
        loop {
            loop {
                match self.commands.try_recv() {
                    Ok(cmd) => if !self.apply(cmd) { return; },
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => return,
                }
            }

            if !self.paused {
                if let Some(task) = self.next_task() {
                    self.run_task(task);
                    continue;
                }
                if !self.drained_reported {
                    self.drained_reported = true;
                    log::info!("Scheduler backlog drained");
                    emit(&self.subscribers, SchedulerEvent::BacklogDrained);
                }
            }

            // Idle or paused: sleep until the next command
            match self.commands.recv() {
                Ok(cmd) => if !self.apply(cmd) { return; },
                Err(_) => return,
            }
        }
    }

    /// Returns false on stop.
    fn apply(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Enqueue(task) => {
                self.drained_reported = false;
                self.priority.push_back(task);
            }
            Command::Pause  => self.paused = true,
            Command::Resume => self.paused = false,
            Command::Stop => {
                self.priority.clear();
                self.background.clear();
                return false;
            }
        }
        true
    }

    fn next_task(&mut self) -> Option<BackgroundTask> {
        self.priority.pop_front().or_else(|| self.background.pop_front())
    }

    fn run_task(&mut self, task: BackgroundTask) {
        let key = &task.key;
        let Some(vector) = self.store.get(&key.make, &key.model) else {
            log::warn!("{key}: no calibration in store, skipping");
            return;
        };

        let control = BuildControl::with_cancel_flag(self.cancel.clone());
        match self.cache.lookup(key, vector.as_slice(), task.as_of_date, &control) {
            Ok(l) => match l.outcome {
                CacheOutcome::Built(_) | CacheOutcome::Patched(_) => emit(&self.subscribers, SchedulerEvent::built(key)),
                CacheOutcome::Hit | CacheOutcome::Joined => log::debug!("{key}: already cached"),
            },
            Err(BuildError::Cancelled) if self.cancel.load(SeqCst) => log::debug!("{key}: cancelled by stop"),
            Err(e) => {
                log::warn!("{key}: background build failed: {e}");
                emit(&self.subscribers, SchedulerEvent::failed(key, e.to_string()));
            }
        }
    }
}
