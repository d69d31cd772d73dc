use crate::aggregate;
use crate::cache::FileHashCache;
use crate::config::{AppConfig, ScanRequest};
use crate::deletion::{DeletionPlanner, PlanContext};
use crate::diff;
use crate::error::Error;
use crate::model::{
    DeletionOutcome, DeletionPlan, GroupContents, GroupDiff, GroupInfo, PhaseMetrics,
    PhaseProgress, PhaseStatus, ScanPhase, ScanProgressSnapshot, ScanReport, ScanStatus,
    WarningRecord,
};
use crate::paths;
use crate::progress::ScanObserver;
use crate::scanner::{ScanCounters, Walker};
use crate::similarity;
use crate::store::FolderStore;
use crate::system;
use ahash::AHashMap;
use chrono::Utc;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{error, info};

const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);
const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// Blend weights for overall progress; must sum to 1.
const WEIGHT_WALKING: f64 = 0.55;
const WEIGHT_AGGREGATING: f64 = 0.20;
const WEIGHT_GROUPING: f64 = 0.25;

/// One scan job. The scheduler alone mutates status and phase; the pipeline
/// stages write only to the atomic counters.
pub struct ScanJob {
    pub scan_id: String,
    pub request: ScanRequest,
    pub counters: ScanCounters,
    cancel: AtomicBool,
    state: Mutex<JobState>,
    done: Condvar,
    throughput: Mutex<VecDeque<(Instant, u64)>>,
    last_progress: Mutex<f64>,
    confirm_lock: Mutex<()>,
}

struct JobState {
    status: ScanStatus,
    phase: ScanPhase,
    root: Option<PathBuf>,
    warnings: Vec<WarningRecord>,
    metrics: Vec<PhaseMetrics>,
    error: Option<String>,
    report: Option<Arc<ScanReport>>,
    store: Option<Arc<FolderStore>>,
}

impl ScanJob {
    fn new(scan_id: String, request: ScanRequest) -> Self {
        Self {
            scan_id,
            request,
            counters: ScanCounters::new(),
            cancel: AtomicBool::new(false),
            state: Mutex::new(JobState {
                status: ScanStatus::Pending,
                phase: ScanPhase::Walking,
                root: None,
                warnings: Vec::new(),
                metrics: Vec::new(),
                error: None,
                report: None,
                store: None,
            }),
            done: Condvar::new(),
            throughput: Mutex::new(VecDeque::new()),
            last_progress: Mutex::new(0.0),
            confirm_lock: Mutex::new(()),
        }
    }

    pub fn status(&self) -> ScanStatus {
        self.state.lock().unwrap().status
    }

    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    pub fn report(&self) -> Option<Arc<ScanReport>> {
        self.state.lock().unwrap().report.clone()
    }

    /// Request cooperative cancellation; workers notice at directory or
    /// pair granularity.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Relaxed);
    }

    /// Block until the job reaches a terminal status.
    pub fn wait(&self) -> ScanStatus {
        let mut state = self.state.lock().unwrap();
        while !state.status.is_terminal() {
            state = self.done.wait(state).unwrap();
        }
        state.status
    }

    fn begin_phase(&self, phase: ScanPhase) {
        let mut state = self.state.lock().unwrap();
        self.close_phase_metrics(&mut state);
        state.phase = phase;
        if phase != ScanPhase::Done {
            state.metrics.push(PhaseMetrics {
                phase,
                started_at: Utc::now(),
                ended_at: None,
                bytes_scanned_delta: self.counters.bytes_scanned.load(Ordering::Relaxed),
                folders_processed: self.phase_units(phase),
                files_processed: self.counters.files_scanned.load(Ordering::Relaxed),
                peak_rss_bytes: None,
                workers_active: 0,
            });
        }
    }

    /// Phase-specific unit-of-work counter: folders for walking and
    /// aggregation, candidate pairs for grouping.
    fn phase_units(&self, phase: ScanPhase) -> u64 {
        match phase {
            ScanPhase::Walking => self.counters.folders_scanned.load(Ordering::Relaxed),
            ScanPhase::Aggregating => self.counters.folders_aggregated.load(Ordering::Relaxed),
            ScanPhase::Grouping => self.counters.pairs_processed.load(Ordering::Relaxed),
            ScanPhase::Done => 0,
        }
    }

    /// Open metric entries hold the counter baseline in their fields until
    /// the phase closes, when they become deltas.
    fn close_phase_metrics(&self, state: &mut JobState) {
        if let Some(open) = state.metrics.last_mut() {
            if open.ended_at.is_none() {
                let phase = open.phase;
                open.ended_at = Some(Utc::now());
                open.bytes_scanned_delta = self
                    .counters
                    .bytes_scanned
                    .load(Ordering::Relaxed)
                    .saturating_sub(open.bytes_scanned_delta);
                open.folders_processed =
                    self.phase_units(phase).saturating_sub(open.folders_processed);
                open.files_processed = self
                    .counters
                    .files_scanned
                    .load(Ordering::Relaxed)
                    .saturating_sub(open.files_processed);
                open.peak_rss_bytes = system::peak_rss_bytes();
                open.workers_active = self.counters.workers.load(Ordering::Relaxed);
            }
        }
    }

    fn finish(&self, status: ScanStatus, error: Option<String>) {
        let mut state = self.state.lock().unwrap();
        self.close_phase_metrics(&mut state);
        state.status = status;
        state.error = error;
        if status == ScanStatus::Completed {
            state.phase = ScanPhase::Done;
        }
        drop(state);
        self.done.notify_all();
    }

    /// Copy-on-emit progress snapshot. Emitted overall progress never
    /// decreases even when counters race.
    pub fn snapshot(&self) -> ScanProgressSnapshot {
        let state = self.state.lock().unwrap();
        let stats = self.counters.snapshot();

        let walking_ratio = if stats.folders_discovered > 0 {
            Some((stats.folders_scanned as f64 / stats.folders_discovered as f64).min(1.0))
        } else {
            None
        };
        let total_folders = self.counters.total_folders.load(Ordering::Relaxed);
        let aggregating_ratio = if total_folders > 0 {
            Some(
                (self.counters.folders_aggregated.load(Ordering::Relaxed) as f64
                    / total_folders as f64)
                    .clamp(0.0, 1.0),
            )
        } else {
            None
        };
        let pairs_total = self.counters.pairs_total.load(Ordering::Relaxed);
        let grouping_ratio = if pairs_total > 0 {
            Some(
                (self.counters.pairs_processed.load(Ordering::Relaxed) as f64
                    / pairs_total as f64)
                    .clamp(0.0, 1.0),
            )
        } else {
            None
        };

        let phase_order = [ScanPhase::Walking, ScanPhase::Aggregating, ScanPhase::Grouping];
        let current_index = match state.phase {
            ScanPhase::Walking => 0,
            ScanPhase::Aggregating => 1,
            ScanPhase::Grouping => 2,
            ScanPhase::Done => 3,
        };
        let ratio_for = |phase: ScanPhase| match phase {
            ScanPhase::Walking => walking_ratio,
            ScanPhase::Aggregating => aggregating_ratio,
            ScanPhase::Grouping => grouping_ratio,
            ScanPhase::Done => Some(1.0),
        };

        let mut phases = Vec::with_capacity(3);
        for (index, phase) in phase_order.into_iter().enumerate() {
            let (status, progress) = if state.status == ScanStatus::Completed {
                (PhaseStatus::Completed, Some(1.0))
            } else if state.status == ScanStatus::Pending || index > current_index {
                (PhaseStatus::Pending, Some(0.0))
            } else if index < current_index {
                (PhaseStatus::Completed, Some(1.0))
            } else {
                (PhaseStatus::Running, ratio_for(phase))
            };
            phases.push(PhaseProgress {
                phase,
                status,
                progress,
            });
        }

        let progress = match state.status {
            ScanStatus::Completed => Some(1.0),
            ScanStatus::Running => {
                let contribution = |index: usize, weight: f64, ratio: Option<f64>| {
                    if index < current_index {
                        Some(weight)
                    } else if index == current_index {
                        ratio.map(|r| weight * r)
                    } else {
                        Some(0.0)
                    }
                };
                let parts = [
                    contribution(0, WEIGHT_WALKING, walking_ratio),
                    contribution(1, WEIGHT_AGGREGATING, aggregating_ratio),
                    contribution(2, WEIGHT_GROUPING, grouping_ratio),
                ];
                if parts.iter().all(|p| p.is_none()) {
                    None
                } else if parts[current_index.min(2)].is_none() && current_index < 3 {
                    // Current phase is indeterminate; report only if earlier
                    // phases already contribute something.
                    let sum: f64 = parts.iter().flatten().sum();
                    if sum > 0.0 {
                        Some(sum.min(0.99))
                    } else {
                        None
                    }
                } else {
                    let sum: f64 = parts.iter().flatten().sum();
                    Some(sum.min(0.99))
                }
            }
            _ => None,
        };

        // Monotonic per scan: consumers may miss intermediates but never see
        // the fraction move backwards.
        let progress = progress.map(|p| {
            let mut guard = self.last_progress.lock().unwrap();
            if p > *guard {
                *guard = p;
            }
            *guard
        });

        let eta_seconds = if state.status == ScanStatus::Running
            && state.phase == ScanPhase::Walking
        {
            self.walking_eta(stats.folders_scanned, stats.folders_discovered)
        } else {
            None
        };

        ScanProgressSnapshot {
            scan_id: self.scan_id.clone(),
            status: state.status,
            phase: state.phase,
            phases,
            stats,
            warnings: state.warnings.clone(),
            last_path: self.counters.last_path(),
            progress,
            eta_seconds,
        }
    }

    fn record_throughput_sample(&self) {
        let now = Instant::now();
        let files = self.counters.files_scanned.load(Ordering::Relaxed);
        let mut samples = self.throughput.lock().unwrap();
        samples.push_back((now, files));
        while let Some(&(t, _)) = samples.front() {
            if now.duration_since(t) > THROUGHPUT_WINDOW {
                samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// Remaining-work estimate from walking throughput over the sample
    /// window. Folder discovery is still running, so this is a floor.
    fn walking_eta(&self, scanned: u64, discovered: u64) -> Option<u64> {
        let samples = self.throughput.lock().unwrap();
        let (&(t0, f0), &(t1, f1)) = (samples.front()?, samples.back()?);
        let elapsed = t1.duration_since(t0).as_secs_f64();
        if elapsed <= 0.0 || f1 <= f0 {
            return None;
        }
        let files_per_folder = f1 as f64 / scanned.max(1) as f64;
        let rate = (f1 - f0) as f64 / elapsed;
        let remaining_folders = discovered.saturating_sub(scanned) as f64;
        let remaining_files = remaining_folders * files_per_folder;
        Some((remaining_files / rate).ceil() as u64)
    }
}

/// Bounded admission for concurrent scans; default one active scan.
struct Admission {
    permits: Mutex<usize>,
    available: Condvar,
}

impl Admission {
    fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits.max(1)),
            available: Condvar::new(),
        }
    }

    fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            permits = self.available.wait(permits).unwrap();
        }
        *permits -= 1;
    }

    fn release(&self) {
        *self.permits.lock().unwrap() += 1;
        self.available.notify_one();
    }
}

/// Owns scan jobs end-to-end: admission, the three-phase pipeline, progress
/// publication, report persistence, and the deletion planner.
pub struct ScanManager {
    config: AppConfig,
    cache: Arc<FileHashCache>,
    jobs: Mutex<AHashMap<String, Arc<ScanJob>>>,
    planner: DeletionPlanner,
    admission: Arc<Admission>,
}

impl ScanManager {
    pub fn new(config: AppConfig) -> Result<Self, Error> {
        let cache = Arc::new(FileHashCache::open(&config.cache_db_path())?);
        Ok(Self::with_cache(config, cache))
    }

    pub fn with_cache(config: AppConfig, cache: Arc<FileHashCache>) -> Self {
        let planner = DeletionPlanner::new(config.plan_ttl_minutes);
        let admission = Arc::new(Admission::new(config.max_active_scans));
        Self {
            config,
            cache,
            jobs: Mutex::new(AHashMap::new()),
            planner,
            admission,
        }
    }

    pub fn cache(&self) -> &FileHashCache {
        &self.cache
    }

    /// Submit a scan; the pipeline runs on its own thread.
    pub fn submit(
        &self,
        request: ScanRequest,
        observer: Arc<dyn ScanObserver>,
    ) -> Arc<ScanJob> {
        let scan_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let job = Arc::new(ScanJob::new(scan_id.clone(), request));
        self.jobs.lock().unwrap().insert(scan_id, Arc::clone(&job));

        let config = self.config.clone();
        let cache = Arc::clone(&self.cache);
        let admission = Arc::clone(&self.admission);
        let thread_job = Arc::clone(&job);
        std::thread::spawn(move || {
            run_scan(&thread_job, &config, &cache, &admission, observer.as_ref());
        });
        job
    }

    /// Submit and block until terminal; returns the report.
    pub fn run_blocking(
        &self,
        request: ScanRequest,
        observer: &dyn ScanObserver,
    ) -> Result<Arc<ScanReport>, Error> {
        let scan_id = uuid::Uuid::new_v4().simple().to_string()[..12].to_string();
        let job = Arc::new(ScanJob::new(scan_id.clone(), request));
        self.jobs.lock().unwrap().insert(scan_id, Arc::clone(&job));

        run_scan(&job, &self.config, &self.cache, &self.admission, observer);

        match job.status() {
            ScanStatus::Completed => Ok(job.report().expect("completed scan has a report")),
            ScanStatus::Cancelled => Err(Error::Cancelled),
            _ => Err(Error::ScanFailed(
                job.error().unwrap_or_else(|| "unknown failure".to_string()),
            )),
        }
    }

    pub fn job(&self, scan_id: &str) -> Result<Arc<ScanJob>, Error> {
        self.jobs
            .lock()
            .unwrap()
            .get(scan_id)
            .cloned()
            .ok_or_else(|| Error::ScanNotFound(scan_id.to_string()))
    }

    pub fn jobs(&self) -> Vec<Arc<ScanJob>> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn progress(&self, scan_id: &str) -> Result<ScanProgressSnapshot, Error> {
        Ok(self.job(scan_id)?.snapshot())
    }

    pub fn cancel(&self, scan_id: &str) -> Result<(), Error> {
        self.job(scan_id)?.cancel();
        Ok(())
    }

    pub fn report(&self, scan_id: &str) -> Result<Arc<ScanReport>, Error> {
        let job = self.job(scan_id)?;
        job.report()
            .ok_or_else(|| Error::ScanNotComplete(scan_id.to_string()))
    }

    fn completed_job(
        &self,
        scan_id: &str,
    ) -> Result<(Arc<ScanJob>, Arc<ScanReport>, Arc<FolderStore>, PathBuf), Error> {
        let job = self.job(scan_id)?;
        let state = job.state.lock().unwrap();
        if state.status != ScanStatus::Completed {
            return Err(Error::ScanNotComplete(scan_id.to_string()));
        }
        let report = state.report.clone().expect("completed scan has a report");
        let store = state.store.clone().expect("completed scan has a store");
        let root = state.root.clone().expect("completed scan has a root");
        drop(state);
        Ok((job, report, store, root))
    }

    fn find_group<'a>(report: &'a ScanReport, group_id: &str) -> Result<&'a GroupInfo, Error> {
        report
            .groups
            .iter()
            .find(|g| g.group_id == group_id)
            .ok_or_else(|| Error::GroupNotFound(group_id.to_string()))
    }

    pub fn group_diff(
        &self,
        scan_id: &str,
        group_id: &str,
        left_relative: &str,
        right_relative: &str,
    ) -> Result<GroupDiff, Error> {
        let (_job, report, store, _root) = self.completed_job(scan_id)?;
        let group = Self::find_group(&report, group_id)?;
        for side in [left_relative, right_relative] {
            if !group.members.iter().any(|m| m.relative_path == side) {
                return Err(Error::MemberNotFound(side.to_string()));
            }
        }
        let left = store.get(left_relative)?;
        let right = store.get(right_relative)?;
        Ok(diff::compute_group_diff(&left, &right))
    }

    pub fn group_contents(&self, scan_id: &str, group_id: &str) -> Result<GroupContents, Error> {
        let (_job, report, store, _root) = self.completed_job(scan_id)?;
        let group = Self::find_group(&report, group_id)?;
        diff::group_contents(group, &store)
    }

    pub fn create_plan(
        &self,
        scan_id: &str,
        paths: &[String],
    ) -> Result<DeletionPlan, Error> {
        let (job, report, store, root) = self.completed_job(scan_id)?;
        let context = PlanContext {
            scan_id,
            root: &root,
            store: &store,
            groups: &report.groups,
            deletion_enabled: job.request.deletion_enabled,
            force_case_insensitive: job.request.force_case_insensitive,
        };
        self.planner.create_plan(&context, paths)
    }

    /// Confirm under the per-scan lock so concurrent confirms can never race
    /// on the same targets.
    pub fn confirm_plan(
        &self,
        scan_id: &str,
        plan_id: &str,
        token: &str,
    ) -> Result<DeletionOutcome, Error> {
        let (job, report, store, root) = self.completed_job(scan_id)?;
        let _guard = job.confirm_lock.lock().unwrap();
        let context = PlanContext {
            scan_id,
            root: &root,
            store: &store,
            groups: &report.groups,
            deletion_enabled: job.request.deletion_enabled,
            force_case_insensitive: job.request.force_case_insensitive,
        };
        self.planner.confirm(&context, plan_id, token)
    }
}

fn run_scan(
    job: &Arc<ScanJob>,
    config: &AppConfig,
    cache: &Arc<FileHashCache>,
    admission: &Arc<Admission>,
    observer: &dyn ScanObserver,
) {
    admission.acquire();
    let result = run_pipeline(job, config, cache, observer);
    admission.release();

    match result {
        Ok(()) => {}
        Err(Error::Cancelled) => {
            info!("Scan {} cancelled", job.scan_id);
            job.finish(ScanStatus::Cancelled, None);
            observer.on_cancelled(&job.scan_id);
        }
        Err(err) => {
            error!("Scan {} failed: {}", job.scan_id, err);
            job.finish(ScanStatus::Failed, Some(err.to_string()));
            observer.on_failed(&job.scan_id, &err.to_string());
        }
    }
}

fn run_pipeline(
    job: &Arc<ScanJob>,
    config: &AppConfig,
    cache: &Arc<FileHashCache>,
    observer: &dyn ScanObserver,
) -> Result<(), Error> {
    {
        let mut state = job.state.lock().unwrap();
        state.status = ScanStatus::Running;
    }
    job.begin_phase(ScanPhase::Walking);
    observer.on_phase_change(&job.scan_id, ScanPhase::Walking);

    let root = paths::resolve_root(&job.request.root_path)?;
    job.state.lock().unwrap().root = Some(root.clone());
    info!("Scan {} walking {}", job.scan_id, root.display());

    // Progress ticker: periodic copy-on-emit snapshots for observers plus
    // throughput samples for the walking ETA.
    let ticking = AtomicBool::new(true);

    std::thread::scope(|scope| {
        let ticker = scope.spawn(|| {
            while ticking.load(Ordering::Relaxed) {
                job.record_throughput_sample();
                observer.on_progress(&job.snapshot());
                std::thread::sleep(PROGRESS_INTERVAL);
            }
        });

        let pipeline_result = (|| -> Result<(), Error> {
            let outcome = {
                let walker = Walker::new(
                    root.clone(),
                    &job.request,
                    Some(cache.as_ref()),
                    &job.counters,
                    &job.cancel,
                )?;
                walker.walk()?
            };

            {
                let mut state = job.state.lock().unwrap();
                for warning in &outcome.warnings {
                    observer.on_warning(warning);
                }
                state.warnings.extend(outcome.warnings.iter().cloned());
            }
            observer.on_progress(&job.snapshot());

            job.begin_phase(ScanPhase::Aggregating);
            observer.on_phase_change(&job.scan_id, ScanPhase::Aggregating);
            let folders =
                aggregate::aggregate(&job.request, outcome, &job.counters, &job.cancel)?;

            let store_path = config.scan_dir(&job.scan_id).join("store.bin");
            let store = Arc::new(FolderStore::persist(&store_path, &folders)?);
            job.state.lock().unwrap().store = Some(Arc::clone(&store));
            observer.on_progress(&job.snapshot());

            job.begin_phase(ScanPhase::Grouping);
            observer.on_phase_change(&job.scan_id, ScanPhase::Grouping);
            let groups = similarity::build_groups(
                &folders,
                job.request.similarity_threshold,
                &job.counters,
                &job.cancel,
            )?;

            // Close the grouping metrics entry so the report sees deltas.
            job.begin_phase(ScanPhase::Done);

            let report = {
                let state = job.state.lock().unwrap();
                Arc::new(ScanReport {
                    scan_id: job.scan_id.clone(),
                    root_path: root.clone(),
                    generated_at: Utc::now(),
                    groups,
                    folder_index_ref: store_path.clone(),
                    metrics: state.metrics.clone(),
                    warnings: state.warnings.clone(),
                })
            };
            write_report(&config.scan_dir(&job.scan_id).join("report.json"), &report)?;

            {
                let mut state = job.state.lock().unwrap();
                state.report = Some(Arc::clone(&report));
            }
            job.finish(ScanStatus::Completed, None);
            observer.on_progress(&job.snapshot());
            observer.on_complete(&report);
            info!(
                "Scan {} completed: {} groups, {} warnings",
                job.scan_id,
                report.groups.len(),
                report.warnings.len()
            );
            Ok(())
        })();

        ticking.store(false, Ordering::Relaxed);
        let _ = ticker.join();

        pipeline_result
    })
}

/// Idempotent snapshot write: serialize to a temp file, rename into place.
fn write_report(path: &std::path::Path, report: &ScanReport) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(report).map_err(|e| {
        Error::Store(format!("report serialization failed: {e}"))
    })?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
