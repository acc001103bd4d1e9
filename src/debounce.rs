//! Per-folder debounce of volume merges.
//!
//! Every saved chapter re-arms the timer of its folder; the merge runs once,
//! `delay` after the last save of a burst.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Work run for a folder once its timer fires.
#[async_trait]
pub trait MergeAction: Send + Sync + 'static {
    async fn run(&self, folder: PathBuf);
}

struct PendingTimer {
    id: u64,
    task: JoinHandle<()>,
}

pub struct MergeScheduler {
    action: Arc<dyn MergeAction>,
    delay: Duration,
    runtime: Handle,
    next_id: AtomicU64,
    pending: Mutex<HashMap<PathBuf, PendingTimer>>,
}

impl MergeScheduler {
    pub fn new(action: Arc<dyn MergeAction>, delay: Duration, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            action,
            delay,
            runtime,
            next_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Cancels any pending timer for `folder` and schedules a new one.
    pub fn arm(self: &Arc<Self>, folder: &Path) {
        let key = folder_key(folder);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // The table stays locked until the new timer is registered, so the
        // task cannot observe a half-replaced entry.
        let mut pending = self.lock_pending();
        if let Some(previous) = pending.remove(&key) {
            previous.task.abort();
        }

        let scheduler = Arc::clone(self);
        let task_key = key.clone();
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(scheduler.delay).await;
            if !scheduler.take_if_current(&task_key, id) {
                return;
            }
            scheduler.action.run(task_key).await;
        });
        pending.insert(key.clone(), PendingTimer { id, task });
        tracing::debug!(folder = %key.display(), delay_secs = self.delay.as_secs(), "merge armed");
    }

    /// Cancels any pending timer for `folder` and runs the action now.
    pub async fn fire_now(&self, folder: &Path) {
        let key = folder_key(folder);
        if let Some(previous) = self.lock_pending().remove(&key) {
            previous.task.abort();
        }
        self.action.run(key).await;
    }

    pub fn is_pending(&self, folder: &Path) -> bool {
        self.lock_pending().contains_key(&folder_key(folder))
    }

    fn take_if_current(&self, key: &Path, id: u64) -> bool {
        let mut pending = self.lock_pending();
        match pending.get(key) {
            Some(timer) if timer.id == id => {
                pending.remove(key);
                true
            }
            _ => false,
        }
    }

    fn lock_pending(&self) -> MutexGuard<'_, HashMap<PathBuf, PendingTimer>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn folder_key(folder: &Path) -> PathBuf {
    std::path::absolute(folder).unwrap_or_else(|_| folder.to_path_buf())
}

#[cfg(test)]
pub(crate) mod tests {
    use tokio::time::Instant;

    use super::*;

    #[derive(Default)]
    pub(crate) struct RecordingAction {
        calls: Mutex<Vec<(PathBuf, Instant)>>,
    }

    impl RecordingAction {
        pub(crate) fn scheduler(delay: Duration) -> (Arc<MergeScheduler>, Arc<Self>) {
            let action = Arc::new(Self::default());
            let scheduler = MergeScheduler::new(
                Arc::clone(&action) as Arc<dyn MergeAction>,
                delay,
                Handle::current(),
            );
            (scheduler, action)
        }

        pub(crate) fn calls(&self) -> Vec<(PathBuf, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MergeAction for RecordingAction {
        async fn run(&self, folder: PathBuf) {
            self.calls.lock().unwrap().push((folder, Instant::now()));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_arms_fires_once_after_last() {
        let (scheduler, action) = RecordingAction::scheduler(Duration::from_secs(60));
        let folder = Path::new("/out/Foo/Bar");
        let start = Instant::now();

        scheduler.arm(folder);
        tokio::time::sleep(Duration::from_secs(10)).await;
        scheduler.arm(folder);
        tokio::time::sleep(Duration::from_secs(10)).await;
        scheduler.arm(folder);

        tokio::time::sleep(Duration::from_secs(59)).await;
        assert!(action.calls().is_empty());
        assert!(scheduler.is_pending(folder));

        tokio::time::sleep(Duration::from_secs(2)).await;
        let calls = action.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, PathBuf::from("/out/Foo/Bar"));
        assert!(calls[0].1 - start >= Duration::from_secs(80));
        assert!(!scheduler.is_pending(folder));
    }

    #[tokio::test(start_paused = true)]
    async fn folders_have_independent_timers() {
        let (scheduler, action) = RecordingAction::scheduler(Duration::from_secs(5));
        scheduler.arm(Path::new("/out/A/1"));
        tokio::time::sleep(Duration::from_secs(3)).await;
        scheduler.arm(Path::new("/out/A/2"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        let calls = action.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, PathBuf::from("/out/A/1"));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(action.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn fire_now_cancels_pending_timer() {
        let (scheduler, action) = RecordingAction::scheduler(Duration::from_secs(60));
        let folder = Path::new("/out/Foo/Bar");
        scheduler.arm(folder);

        scheduler.fire_now(folder).await;
        assert_eq!(action.calls().len(), 1);
        assert!(!scheduler.is_pending(folder));

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(action.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn relative_and_absolute_paths_share_a_timer() {
        let (scheduler, action) = RecordingAction::scheduler(Duration::from_secs(1));
        let relative = Path::new("results/Foo/Bar");
        scheduler.arm(relative);
        scheduler.arm(&std::path::absolute(relative).unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(action.calls().len(), 1);
    }
}
