use dupfold_core::model::{PhaseStatus, ScanPhase};
use dupfold_core::{ScanObserver, ScanProgressSnapshot};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;

/// CLI progress reporter using indicatif.
///
/// - Walking: spinner (discovery is still running, totals unknown)
/// - Aggregating and grouping: percentage bars from the phase ratios
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.bar.lock().unwrap();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        let mut guard = self.bar.lock().unwrap();
        if let Some(pb) = guard.take() {
            pb.finish_and_clear();
        }
    }

    fn spinner(message: &str) -> ProgressBar {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap()
                .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        pb.set_message(message.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(80));
        pb
    }

    fn percent_bar(message: &'static str) -> ProgressBar {
        let pb = ProgressBar::new(100);
        pb.set_style(
            ProgressStyle::with_template(
                "  {spinner:.cyan} {msg} [{bar:30.cyan/dim}] {pos}%",
            )
            .unwrap()
            .progress_chars("━╸─")
            .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"),
        );
        pb.set_message(message);
        pb.enable_steady_tick(std::time::Duration::from_millis(80));
        pb
    }
}

impl ScanObserver for CliReporter {
    fn on_phase_change(&self, _scan_id: &str, phase: ScanPhase) {
        match phase {
            ScanPhase::Walking => self.set_bar(Self::spinner("Walking folder tree...")),
            ScanPhase::Aggregating => self.set_bar(Self::percent_bar("Aggregating")),
            ScanPhase::Grouping => self.set_bar(Self::percent_bar("Grouping")),
            ScanPhase::Done => self.finish_bar(),
        }
    }

    fn on_progress(&self, snapshot: &ScanProgressSnapshot) {
        let guard = self.bar.lock().unwrap();
        let Some(pb) = guard.as_ref() else { return };
        match snapshot.phase {
            ScanPhase::Walking => {
                let mut message = format!(
                    "Walking... {} files in {} folders",
                    snapshot.stats.files_scanned, snapshot.stats.folders_scanned
                );
                if let Some(eta) = snapshot.eta_seconds {
                    message.push_str(&format!(" (~{eta}s left)"));
                }
                pb.set_message(message);
            }
            ScanPhase::Aggregating | ScanPhase::Grouping => {
                let ratio = snapshot
                    .phases
                    .iter()
                    .find(|p| p.phase == snapshot.phase && p.status == PhaseStatus::Running)
                    .and_then(|p| p.progress);
                if let Some(ratio) = ratio {
                    pb.set_position((ratio * 100.0) as u64);
                }
            }
            ScanPhase::Done => {}
        }
    }

    fn on_complete(&self, _report: &dupfold_core::ScanReport) {
        self.finish_bar();
    }

    fn on_failed(&self, _scan_id: &str, _message: &str) {
        self.finish_bar();
    }

    fn on_cancelled(&self, _scan_id: &str) {
        self.finish_bar();
    }
}
