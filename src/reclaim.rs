//! Stale worktree reclamation.
//!
//! Sessions launched in worktree mode leave working copies under
//! `{root}/{project}/{worktree}` that nothing cleans up once the session is
//! gone. A periodic pass classifies each worktree by its symbolic HEAD and
//! deletes it when its age exceeds the expiry window for that class.
//!
//! Classification happens before threshold selection, and anything that
//! cannot be classified gets the largest configured window. Deleting user
//! work is unrecoverable, so unknown state always errs toward keeping.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use tokio::sync::broadcast;

use crate::process::{CommandRunner, RunOptions};

/// Time between reclamation passes.
const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

/// Deadline for the symbolic HEAD probe, a fast local status check.
const REF_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const SECONDS_PER_DAY: u64 = 86_400;

/// Worktree reclamation configuration.
#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Root directory holding `{project}/{worktree}` trees. Empty or missing
    /// roots make every pass a no-op.
    pub root: String,
    /// Master toggle; when false the loop is never started.
    pub prune_enabled: bool,
    /// Expiry for worktrees checked out on a branch.
    pub branch_expiry_days: u64,
    /// Expiry for worktrees on a detached HEAD.
    pub headless_expiry_days: u64,
    /// Expiry knob participating in the unclassifiable maximum.
    pub orphan_expiry_days: u64,
    /// Version-control binary (`git`).
    pub git_bin: String,
}

impl Default for WorktreeConfig {
    fn default() -> Self {
        Self {
            root: String::new(),
            prune_enabled: false,
            branch_expiry_days: 90,
            headless_expiry_days: 30,
            orphan_expiry_days: 90,
            git_bin: "git".to_string(),
        }
    }
}

/// Classification of a worktree's HEAD reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefClass {
    /// HEAD is a symbolic ref to a branch.
    Branch,
    /// HEAD is detached.
    Headless,
    /// The probe ran but reported something else entirely.
    Ambiguous,
    /// The probe itself failed to run.
    Fallback,
}

impl RefClass {
    pub fn label(&self) -> &'static str {
        match self {
            RefClass::Branch => "branch",
            RefClass::Headless => "headless",
            RefClass::Ambiguous => "ambiguous/orphan",
            RefClass::Fallback => "error/fallback",
        }
    }
}

/// Expiry window for a classification.
///
/// Unclassifiable worktrees get the maximum of every configured window so
/// they are never deleted earlier than anything classifiable.
pub fn expiry_for(class: RefClass, config: &WorktreeConfig) -> Duration {
    let days = match class {
        RefClass::Branch => config.branch_expiry_days,
        RefClass::Headless => config.headless_expiry_days,
        RefClass::Ambiguous | RefClass::Fallback => config
            .branch_expiry_days
            .max(config.headless_expiry_days)
            .max(config.orphan_expiry_days),
    };
    Duration::from_secs(days * SECONDS_PER_DAY)
}

/// Whether a worktree of the given class and age is due for deletion.
pub fn should_reclaim(class: RefClass, age: Duration, config: &WorktreeConfig) -> bool {
    age > expiry_for(class, config)
}

/// Background reclaimer for abandoned worktrees.
#[derive(Clone)]
pub struct WorktreeReclaimer {
    runner: Arc<dyn CommandRunner>,
    config: WorktreeConfig,
}

impl WorktreeReclaimer {
    pub fn new(runner: Arc<dyn CommandRunner>, config: WorktreeConfig) -> Self {
        Self { runner, config }
    }

    /// Run reclamation passes until shutdown, starting immediately.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Worktree pruning started (branch: {}d, headless: {}d, orphan: {}d)",
            self.config.branch_expiry_days,
            self.config.headless_expiry_days,
            self.config.orphan_expiry_days
        );

        loop {
            self.prune_once(SystemTime::now()).await;

            tokio::select! {
                _ = tokio::time::sleep(PRUNE_INTERVAL) => {}
                _ = shutdown_rx.recv() => {
                    info!("Worktree pruning shutting down");
                    break;
                }
            }
        }
    }

    /// One reclamation pass over the whole worktree root.
    ///
    /// Per-worktree failures are logged and skipped; a bad worktree never
    /// aborts the remainder of the pass.
    pub async fn prune_once(&self, now: SystemTime) {
        let root = Path::new(&self.config.root);
        if self.config.root.is_empty() || !root.is_dir() {
            debug!("Worktree root {:?} does not exist, skipping prune", root);
            return;
        }

        let mut pruned = 0usize;

        let mut projects = match tokio::fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot read worktree root {}: {}", root.display(), e);
                return;
            }
        };

        while let Ok(Some(project)) = projects.next_entry().await {
            let project_path = project.path();
            if !project_path.is_dir() {
                continue;
            }

            let mut worktrees = match tokio::fs::read_dir(&project_path).await {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Cannot read {}: {}", project_path.display(), e);
                    continue;
                }
            };

            while let Ok(Some(worktree)) = worktrees.next_entry().await {
                let path = worktree.path();
                if !path.is_dir() {
                    continue;
                }
                if self.reclaim_if_expired(&path, now).await {
                    pruned += 1;
                }
            }
        }

        if pruned > 0 {
            info!("Reclaimed {} stale worktree(s)", pruned);
        }
    }

    /// Classify, age, and (when expired) delete one worktree.
    async fn reclaim_if_expired(&self, path: &Path, now: SystemTime) -> bool {
        let age = match directory_age(path, now) {
            Some(age) => age,
            None => return false,
        };

        let class = self.classify(path).await;
        if !should_reclaim(class, age, &self.config) {
            return false;
        }

        info!(
            "Pruning stale worktree: {} ({}, age {}d)",
            path.display(),
            class.label(),
            age.as_secs() / SECONDS_PER_DAY
        );
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to remove {}: {}", path.display(), e);
                false
            }
        }
    }

    /// Probe the worktree's symbolic HEAD.
    ///
    /// Exit 0 means HEAD names a branch, exit 1 a detached HEAD; anything
    /// else is ambiguous, and a probe that cannot run at all is the fallback
    /// class.
    async fn classify(&self, path: &Path) -> RefClass {
        let args = vec![
            "-C".to_string(),
            path.display().to_string(),
            "symbolic-ref".to_string(),
            "-q".to_string(),
            "HEAD".to_string(),
        ];
        match self
            .runner
            .run(
                &self.config.git_bin,
                &args,
                RunOptions::with_timeout(REF_PROBE_TIMEOUT),
            )
            .await
        {
            Ok(output) => match output.exit_code {
                0 => RefClass::Branch,
                1 => RefClass::Headless,
                _ => RefClass::Ambiguous,
            },
            Err(e) => {
                warn!("HEAD probe failed for {}: {}", path.display(), e);
                RefClass::Fallback
            }
        }
    }
}

/// Age of a directory relative to `now`, from its mtime.
fn directory_age(path: &Path, now: SystemTime) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    Some(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HubError;
    use crate::process::testing::SpyRunner;
    use crate::process::ToolOutput;

    fn config() -> WorktreeConfig {
        WorktreeConfig {
            branch_expiry_days: 90,
            headless_expiry_days: 30,
            orphan_expiry_days: 90,
            ..WorktreeConfig::default()
        }
    }

    fn days(n: u64) -> Duration {
        Duration::from_secs(n * SECONDS_PER_DAY)
    }

    #[test]
    fn test_branch_past_expiry_is_reclaimed() {
        assert!(should_reclaim(RefClass::Branch, days(100), &config()));
    }

    #[test]
    fn test_headless_within_expiry_survives() {
        assert!(!should_reclaim(RefClass::Headless, days(20), &config()));
        assert!(should_reclaim(RefClass::Headless, days(40), &config()));
    }

    #[test]
    fn test_unclassifiable_gets_maximum_window() {
        let mut cfg = config();
        cfg.headless_expiry_days = 30;
        cfg.branch_expiry_days = 60;
        cfg.orphan_expiry_days = 90;

        // Past both smaller windows, but within the maximum: survives.
        assert!(!should_reclaim(RefClass::Ambiguous, days(70), &cfg));
        assert!(!should_reclaim(RefClass::Fallback, days(70), &cfg));
        assert!(should_reclaim(RefClass::Ambiguous, days(95), &cfg));
        assert!(should_reclaim(RefClass::Fallback, days(95), &cfg));
    }

    /// Responder mapping the probe's target path to an exit code by name.
    fn probe_by_name(program: &str, args: &[String]) -> crate::error::HubResult<ToolOutput> {
        assert_eq!(program, "git");
        let path = &args[1];
        if path.contains("broken") {
            return Err(HubError::tool("git", "boom"));
        }
        let exit_code = if path.contains("headless") {
            1
        } else if path.contains("orphan") {
            128
        } else {
            0
        };
        Ok(ToolOutput {
            exit_code,
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn reclaimer_at(root: &Path) -> WorktreeReclaimer {
        let mut cfg = config();
        cfg.root = root.display().to_string();
        WorktreeReclaimer::new(Arc::new(SpyRunner::new(probe_by_name)), cfg)
    }

    #[tokio::test]
    async fn test_prune_deletes_only_expired_classes() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("test-project");
        std::fs::create_dir(&project).unwrap();
        std::fs::create_dir(project.join("branch-wt")).unwrap();
        std::fs::create_dir(project.join("headless-wt")).unwrap();
        std::fs::create_dir(project.join("orphan-wt")).unwrap();

        // All directories were just created; advance the clock 40 days.
        // Branch (90d) and orphan (max 90d) survive, headless (30d) expires.
        let now = SystemTime::now() + days(40);
        reclaimer_at(dir.path()).prune_once(now).await;

        assert!(project.join("branch-wt").exists());
        assert!(!project.join("headless-wt").exists());
        assert!(project.join("orphan-wt").exists());
    }

    #[tokio::test]
    async fn test_prune_reclaims_everything_past_maximum() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("test-project");
        std::fs::create_dir(&project).unwrap();
        std::fs::create_dir(project.join("branch-wt")).unwrap();
        std::fs::create_dir(project.join("orphan-wt")).unwrap();
        std::fs::create_dir(project.join("broken-wt")).unwrap();

        let now = SystemTime::now() + days(100);
        reclaimer_at(dir.path()).prune_once(now).await;

        assert!(!project.join("branch-wt").exists());
        assert!(!project.join("orphan-wt").exists());
        assert!(!project.join("broken-wt").exists());
    }

    #[tokio::test]
    async fn test_prune_keeps_fresh_worktrees() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("test-project");
        std::fs::create_dir(&project).unwrap();
        std::fs::create_dir(project.join("branch-wt")).unwrap();
        std::fs::create_dir(project.join("headless-wt")).unwrap();

        reclaimer_at(dir.path()).prune_once(SystemTime::now()).await;

        assert!(project.join("branch-wt").exists());
        assert!(project.join("headless-wt").exists());
    }

    #[tokio::test]
    async fn test_prune_skips_plain_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("not-a-dir.txt"), "hello").unwrap();
        let project = dir.path().join("test-project");
        std::fs::create_dir(&project).unwrap();
        std::fs::write(project.join("stray-file"), "hello").unwrap();

        let now = SystemTime::now() + days(365);
        reclaimer_at(dir.path()).prune_once(now).await;

        assert!(dir.path().join("not-a-dir.txt").exists());
        assert!(project.join("stray-file").exists());
    }

    #[tokio::test]
    async fn test_prune_missing_root_is_a_noop() {
        let mut cfg = config();
        cfg.root = "/nonexistent/worktrees".to_string();
        let runner = Arc::new(SpyRunner::new(probe_by_name));
        let reclaimer = WorktreeReclaimer::new(runner.clone(), cfg);

        reclaimer.prune_once(SystemTime::now()).await;
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_each_worktree_is_probed_exactly_once() {
        // Classification happens before the threshold decision, even for
        // worktrees that end up surviving.
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("p");
        std::fs::create_dir(&project).unwrap();
        std::fs::create_dir(project.join("branch-wt")).unwrap();

        let runner = Arc::new(SpyRunner::new(probe_by_name));
        let mut cfg = config();
        cfg.root = dir.path().display().to_string();
        WorktreeReclaimer::new(runner.clone(), cfg)
            .prune_once(SystemTime::now())
            .await;

        assert_eq!(runner.calls().len(), 1);
        assert_eq!(runner.calls()[0].args[2], "symbolic-ref");
    }
}
