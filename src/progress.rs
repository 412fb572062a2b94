//! Progress reporting and cancellation, per spec.md §6.
//!
//! The original's contract is a mutable `ProgressData` struct plus a
//! `bool (*callback)(bool)` function pointer polled at a fixed work
//! quantum. We keep the struct (member-wise `Clone`/`PartialEq` fall out
//! of `#[derive]`, sidestepping Open Question 3 about the original's
//! `operator=` not returning `*this`) and replace the raw function
//! pointer with a `&dyn FnMut() -> bool` passed down through each
//! engine's `refresh`-style entry point.

/// Work quantum at which engines check progress/cancellation, matching
/// the original's `PROGRESS_REDUCE` constant.
pub const PROGRESS_REDUCE: usize = 5000;

/// Mirrors the original `ProgressData` struct.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressData {
    /// Index of the current step within the current filter's pipeline.
    pub step: usize,
    /// Total number of steps the current filter's pipeline will run.
    pub max_step: usize,
    /// Human-readable name of the current step (e.g. "Classify Core").
    pub step_name: String,
    /// Progress within the current step, in `[0, 100]`.
    pub filter_progress: u32,
    /// Index of the filter currently running, for multi-filter pipelines.
    pub cur_filter: usize,
    /// Overall progress across the whole pipeline, in `[0, 100]`.
    pub total_progress: u32,
}

impl ProgressData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_step(&mut self, step_name: impl Into<String>) {
        self.step += 1;
        self.step_name = step_name.into();
        self.filter_progress = 0;
    }

    pub fn set_progress_fraction(&mut self, done: usize, total: usize) {
        self.filter_progress = if total == 0 {
            100
        } else {
            ((done as f64 / total as f64) * 100.0) as u32
        };
    }
}

/// A cancellation callback, polled every [`PROGRESS_REDUCE`] inner
/// iterations. Returning `false` aborts the current operation.
pub trait Cancellation {
    fn keep_going(&mut self) -> bool;
}

impl<F: FnMut() -> bool> Cancellation for F {
    fn keep_going(&mut self) -> bool {
        self()
    }
}

/// A cancellation token that never cancels, for callers that don't need
/// to interrupt long-running work (tests, batch CLIs layered on top of
/// this crate).
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverCancel;

impl Cancellation for NeverCancel {
    fn keep_going(&mut self) -> bool {
        true
    }
}
