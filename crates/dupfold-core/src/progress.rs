use crate::model::{ScanPhase, ScanProgressSnapshot, ScanReport, WarningRecord};

/// Observer for scan lifecycle events.
///
/// The CLI implements this with indicatif; transports forward snapshots to
/// their subscribers. Every snapshot is a copy; holding one never aliases
/// live scheduler state. All methods default to no-ops.
pub trait ScanObserver: Send + Sync {
    fn on_phase_change(&self, _scan_id: &str, _phase: ScanPhase) {}
    fn on_progress(&self, _snapshot: &ScanProgressSnapshot) {}
    fn on_warning(&self, _warning: &WarningRecord) {}
    fn on_complete(&self, _report: &ScanReport) {}
    fn on_failed(&self, _scan_id: &str, _message: &str) {}
    fn on_cancelled(&self, _scan_id: &str) {}
}

/// No-op observer for silent operation.
pub struct SilentObserver;

impl ScanObserver for SilentObserver {}
