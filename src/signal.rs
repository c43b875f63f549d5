//! Signals a session emits towards its host.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use crate::asset::AssetSummary;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "camelCase")]
pub enum ViewerSignal {
    /// Hardware-accelerated rendering is unavailable; nothing was allocated.
    Unsupported,
    /// Bytes received so far. `total` is `None` when the size is unknown.
    Progress { loaded: u64, total: Option<u64> },
    Loaded(AssetSummary),
    Error { description: String, retryable: bool },
    Disposed,
}

impl ViewerSignal {
    /// Whether this signal ends a load attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ViewerSignal::Loaded(_) | ViewerSignal::Error { .. })
    }
}

/// Receiver of session signals.
pub trait SignalSink {
    fn emit(&mut self, signal: ViewerSignal);
}

impl<F> SignalSink for F
where
    F: FnMut(ViewerSignal),
{
    fn emit(&mut self, signal: ViewerSignal) {
        self(signal)
    }
}

/// Clonable sink that records every signal for later inspection.
#[derive(Debug, Clone, Default)]
pub struct SignalLog {
    signals: Arc<Mutex<Vec<ViewerSignal>>>,
}

impl SignalLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Vec<ViewerSignal> {
        self.signals.lock().clone()
    }

    pub fn drain(&self) -> Vec<ViewerSignal> {
        std::mem::take(&mut *self.signals.lock())
    }

    pub fn count(&self, predicate: impl Fn(&ViewerSignal) -> bool) -> usize {
        self.signals.lock().iter().filter(|s| predicate(s)).count()
    }

    pub fn last(&self) -> Option<ViewerSignal> {
        self.signals.lock().last().cloned()
    }
}

impl SignalSink for SignalLog {
    fn emit(&mut self, signal: ViewerSignal) {
        self.signals.lock().push(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_sinks() {
        let mut seen = Vec::new();
        {
            let mut sink = |signal: ViewerSignal| seen.push(signal);
            sink.emit(ViewerSignal::Disposed);
        }
        assert_eq!(seen, vec![ViewerSignal::Disposed]);
    }

    #[test]
    fn log_clones_share_history() {
        let log = SignalLog::new();
        let mut writer = log.clone();
        writer.emit(ViewerSignal::Progress {
            loaded: 10,
            total: None,
        });
        writer.emit(ViewerSignal::Disposed);
        assert_eq!(log.count(|s| matches!(s, ViewerSignal::Progress { .. })), 1);
        assert_eq!(log.drain().len(), 2);
        assert!(log.snapshot().is_empty());
    }
}
