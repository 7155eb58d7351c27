//! Incremental progress reporting for long-running batch computations

use std::sync::mpsc::Sender;

/// Which batch computation a progress event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStage {
    Resample,
    Signatures,
    DtwPairs,
}

impl BatchStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStage::Resample => "resample",
            BatchStage::Signatures => "signatures",
            BatchStage::DtwPairs => "dtw-pairs",
        }
    }
}

/// One unit of work finished out of `total`.
#[derive(Debug, Clone, Copy)]
pub struct ProgressEvent {
    pub stage: BatchStage,
    pub completed: usize,
    pub total: usize,
}

/// Send a progress event if a listener is attached.
///
/// A dropped receiver must never abort the computation, so send errors are
/// discarded.
pub(crate) fn report(tx: Option<&Sender<ProgressEvent>>, stage: BatchStage, completed: usize, total: usize) {
    if let Some(tx) = tx {
        let _ = tx.send(ProgressEvent {
            stage,
            completed,
            total,
        });
    }
}
