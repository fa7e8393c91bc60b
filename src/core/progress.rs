// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright © 2024 Adrian <adrian.eddy at gmail>

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Cancel,
}

/// Receives `(rows done, rows total)` between row batches.
pub trait ProgressSink {
    fn report(&self, done: usize, total: usize) -> Flow;
}

impl<F: Fn(usize, usize) -> Flow> ProgressSink for F {
    fn report(&self, done: usize, total: usize) -> Flow { self(done, total) }
}

pub struct NoProgress;
impl ProgressSink for NoProgress {
    fn report(&self, _: usize, _: usize) -> Flow { Flow::Continue }
}

/// Cancellation and progress for one cache lookup.
#[derive(Default)]
pub struct BuildControl<'a> {
    pub cancel_flag: Option<Arc<AtomicBool>>,
    pub progress: Option<&'a dyn ProgressSink>,
}

impl<'a> BuildControl<'a> {
    pub fn with_cancel_flag(cancel_flag: Arc<AtomicBool>) -> Self {
        Self { cancel_flag: Some(cancel_flag), progress: None }
    }

    /// Calls `f` with the cancel flag and sink to poll, falling back to a never-raised flag and no reporting.
    pub fn with<T>(&self, f: impl FnOnce(&AtomicBool, &dyn ProgressSink) -> T) -> T {
        let never = AtomicBool::new(false);
        f(self.cancel_flag.as_deref().unwrap_or(&never), self.progress.unwrap_or(&NoProgress))
    }
}
