use crate::error::Error;
use crate::model::{DeletionOutcome, DeletionPlan, FailedMove, GroupInfo};
use crate::paths;
use crate::store::FolderStore;
use ahash::{AHashMap, AHashSet};
use chrono::{Duration as ChronoDuration, Utc};
use rand::RngCore;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

const QUARANTINE_DIR: &str = ".quarantine";

/// Everything the planner needs from a completed scan.
pub struct PlanContext<'a> {
    pub scan_id: &'a str,
    /// Resolved scan root.
    pub root: &'a Path,
    pub store: &'a FolderStore,
    pub groups: &'a [GroupInfo],
    pub deletion_enabled: bool,
    pub force_case_insensitive: bool,
}

struct StagedPlan {
    plan: DeletionPlan,
}

/// Two-step guarded deletion: stage a plan, confirm it with a single-use
/// token, move targets atomically into the dated quarantine under the root.
pub struct DeletionPlanner {
    plans: Mutex<AHashMap<String, StagedPlan>>,
    ttl: ChronoDuration,
}

impl DeletionPlanner {
    pub fn new(ttl_minutes: i64) -> Self {
        Self {
            plans: Mutex::new(AHashMap::new()),
            ttl: ChronoDuration::minutes(ttl_minutes),
        }
    }

    /// Validate the requested paths and stage a plan. The canonical member
    /// of a group may never be planned.
    pub fn create_plan(
        &self,
        ctx: &PlanContext<'_>,
        requested: &[String],
    ) -> Result<DeletionPlan, Error> {
        if !ctx.deletion_enabled {
            return Err(Error::DeletionDisabled);
        }

        let canonicals: AHashSet<&str> = ctx
            .groups
            .iter()
            .map(|group| group.canonical().relative_path.as_str())
            .collect();

        let mut queue = Vec::with_capacity(requested.len());
        let mut reclaimable_bytes = 0u64;

        for raw in requested {
            if raw.starts_with('/') || raw.split('/').any(|part| part == "..") {
                return Err(Error::RootEscape(PathBuf::from(raw)));
            }
            let rel = normalize_request_path(raw, ctx.force_case_insensitive);
            if rel == "." || rel.is_empty() {
                return Err(Error::InvalidPlanPath(raw.clone()));
            }
            if !ctx.store.contains(&rel) {
                return Err(Error::FolderNotIndexed(rel));
            }
            if canonicals.contains(rel.as_str()) {
                return Err(Error::CannotPlanCanonical(rel));
            }
            // Resolves symlinks and proves the target is still inside root.
            paths::confine(ctx.root, &rel)?;

            let folder = ctx.store.get(&rel)?;
            reclaimable_bytes += folder.total_bytes;
            queue.push(rel);
        }

        let now = Utc::now();
        let plan = DeletionPlan {
            plan_id: uuid::Uuid::new_v4().simple().to_string()[..12].to_string(),
            scan_id: ctx.scan_id.to_string(),
            token: generate_token(),
            created_at: now,
            expires_at: now + self.ttl,
            queue,
            reclaimable_bytes,
            quarantine_root: ctx
                .root
                .join(QUARANTINE_DIR)
                .join(now.format("%Y%m%d").to_string()),
        };

        info!(
            "Staged deletion plan {} for scan {}: {} paths, {} bytes reclaimable",
            plan.plan_id,
            ctx.scan_id,
            plan.queue.len(),
            plan.reclaimable_bytes
        );

        let staged = StagedPlan { plan: plan.clone() };
        self.plans
            .lock()
            .unwrap()
            .insert(plan.plan_id.clone(), staged);
        Ok(plan)
    }

    /// Confirm a staged plan. The token is single-use: a successful match
    /// consumes the plan whether or not the moves succeed afterwards.
    pub fn confirm(
        &self,
        ctx: &PlanContext<'_>,
        plan_id: &str,
        token: &str,
    ) -> Result<DeletionOutcome, Error> {
        let staged = {
            let mut plans = self.plans.lock().unwrap();
            let entry = plans
                .get(plan_id)
                .ok_or_else(|| Error::PlanNotFound(plan_id.to_string()))?;
            if entry.plan.token != token {
                return Err(Error::TokenInvalid);
            }
            if Utc::now() > entry.plan.expires_at {
                plans.remove(plan_id);
                return Err(Error::TokenExpired);
            }
            plans.remove(plan_id).expect("plan present")
        };
        let plan = staged.plan;

        // Drift gate before anything moves: every queued folder is re-stated
        // against its stored representative fingerprint.
        for rel in &plan.queue {
            self.check_drift(ctx, rel)?;
        }

        fs::create_dir_all(&plan.quarantine_root)?;

        let mut moved = Vec::new();
        let mut failed = Vec::new();
        let mut bytes_moved = 0u64;

        for rel in &plan.queue {
            let source = ctx.root.join(rel);
            let target = match free_target(&plan.quarantine_root.join(rel)) {
                Ok(target) => target,
                Err(err) => {
                    failed.push(FailedMove {
                        relative_path: rel.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            };
            if let Some(parent) = target.parent() {
                if let Err(err) = fs::create_dir_all(parent) {
                    failed.push(FailedMove {
                        relative_path: rel.clone(),
                        message: err.to_string(),
                    });
                    continue;
                }
            }
            match fs::rename(&source, &target) {
                Ok(()) => {
                    if let Ok(folder) = ctx.store.get(rel) {
                        bytes_moved += folder.total_bytes;
                    }
                    moved.push(rel.clone());
                }
                Err(err) => {
                    warn!("Failed to quarantine {}: {}", source.display(), err);
                    failed.push(FailedMove {
                        relative_path: rel.clone(),
                        message: err.to_string(),
                    });
                }
            }
        }

        info!(
            "Plan {} confirmed: {} moved, {} failed, {} bytes",
            plan.plan_id,
            moved.len(),
            failed.len(),
            bytes_moved
        );

        Ok(DeletionOutcome {
            plan_id: plan.plan_id,
            moved,
            failed,
            bytes_moved,
            quarantine_root: plan.quarantine_root,
        })
    }

    fn check_drift(&self, ctx: &PlanContext<'_>, rel: &str) -> Result<(), Error> {
        let folder = ctx.store.get(rel)?;
        match &folder.representative {
            Some(rep) => {
                let rep_path = ctx.root.join(rel).join(&rep.relative_path);
                let metadata = fs::symlink_metadata(&rep_path)
                    .map_err(|_| Error::DriftDetected(rel.to_string()))?;
                let mtime_ns = metadata
                    .modified()
                    .ok()
                    .and_then(|t| {
                        t.duration_since(std::time::UNIX_EPOCH)
                            .ok()
                            .and_then(|d| i64::try_from(d.as_nanos()).ok())
                    })
                    .unwrap_or(0);
                if metadata.len() != rep.size || mtime_ns != rep.mtime_ns {
                    return Err(Error::DriftDetected(rel.to_string()));
                }
            }
            None => {
                // No file to compare; the folder itself must still be there.
                if !ctx.root.join(rel).is_dir() {
                    return Err(Error::DriftDetected(rel.to_string()));
                }
            }
        }
        Ok(())
    }
}

fn normalize_request_path(raw: &str, case_insensitive: bool) -> String {
    let parts: Vec<String> = raw
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .map(|part| paths::normalize_name(part, case_insensitive))
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// Smallest free `name.N` alongside an occupied quarantine target.
fn free_target(preferred: &Path) -> Result<PathBuf, Error> {
    if !preferred.exists() {
        return Ok(preferred.to_path_buf());
    }
    let name = preferred
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| Error::InvalidPlanPath(preferred.display().to_string()))?;
    let parent = preferred.parent().unwrap_or_else(|| Path::new(""));
    for n in 1..u32::MAX {
        let candidate = parent.join(format!("{name}.{n}"));
        if !candidate.exists() {
            return Ok(candidate);
        }
    }
    Err(Error::InvalidPlanPath(preferred.display().to_string()))
}

/// 128 bits of entropy, hex-encoded.
fn generate_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut out = String::with_capacity(32);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
