//! Keyed deferred actions
//!
//! Each handler runs its actions on a dedicated single-worker runtime. An
//! action's entry is removed from the handler before the action runs, so an
//! action may cancel or reschedule its own key. A panicking action is logged
//! and does not disturb the others.

use crate::core::error::ScheduleError;
use crate::core::utils::current_time_millis;
use crate::schedule::job::JobSchedule;
use crate::system::metrics;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Handle, Runtime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type ScheduleResult<T> = std::result::Result<T, ScheduleError>;

#[derive(Debug)]
struct ScheduledEntry {
    generation: u64,
    task: JoinHandle<()>,
}

/// Executor of deferred actions keyed by arbitrary identifiers, e.g. job uuids
pub struct ScheduleHandler<K> {
    name: String,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    entries: Arc<Mutex<HashMap<K, ScheduledEntry>>>,
    generation: AtomicU64,
    shut_down: AtomicBool,
}

impl<K> ScheduleHandler<K>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + 'static,
{
    /// Start a handler whose executor thread carries `name`
    pub fn new(name: impl Into<String>) -> ScheduleResult<Self> {
        let name = name.into();
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name(name.clone())
            .enable_time()
            .build()
            .map_err(|e| ScheduleError::Executor(e.to_string()))?;
        let handle = runtime.handle().clone();
        info!("Schedule handler '{}' started", name);
        Ok(Self {
            name,
            runtime: Mutex::new(Some(runtime)),
            handle,
            entries: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Handler name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Schedule `action` under `key` at the time computed from `schedule`
    /// and `start_time_millis` (epoch millis).
    ///
    /// Callers are expected to cancel an existing action for the same key
    /// first; one still pending is cancelled along with its entry.
    pub fn schedule_action<F>(
        &self,
        key: K,
        schedule: &JobSchedule,
        action: F,
        start_time_millis: u64,
    ) -> ScheduleResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ScheduleError::Shutdown(self.name.clone()));
        }
        let fire_time = schedule.fire_time_millis(start_time_millis)?;
        let delay = Duration::from_millis(fire_time.saturating_sub(current_time_millis()));
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        // the task removes its own entry, so insert before it can run
        let mut entries = self.entries.lock();
        if self.shut_down.load(Ordering::Acquire) {
            return Err(ScheduleError::Shutdown(self.name.clone()));
        }
        let task = self.handle.spawn(run_action(
            self.entries.clone(),
            self.name.clone(),
            key.clone(),
            generation,
            delay,
            action,
        ));
        if let Some(previous) = entries.insert(key.clone(), ScheduledEntry { generation, task }) {
            previous.task.abort();
            warn!(
                "'{}': action for {:?} replaced a pending one (#{})",
                self.name, key, previous.generation
            );
            metrics::record(|m| m.schedule.actions_cancelled.inc());
        } else {
            metrics::record(|m| m.schedule.actions_pending.inc());
        }
        drop(entries);

        debug!("'{}': action for {:?} fires in {:?}", self.name, key, delay);
        metrics::record(|m| m.schedule.actions_scheduled.inc());
        Ok(())
    }

    /// Cancel the pending action for `key`; no-op for unknown keys.
    ///
    /// Actions are unregistered before they start, so only pending actions
    /// can be cancelled. `may_interrupt_if_running` is accepted for callers
    /// that distinguish both cases.
    pub fn cancel_action(&self, key: &K, may_interrupt_if_running: bool) -> bool {
        let Some(entry) = self.entries.lock().remove(key) else {
            return false;
        };
        entry.task.abort();
        debug!(
            "'{}': cancelled action for {:?} (interrupt={})",
            self.name, key, may_interrupt_if_running
        );
        metrics::record(|m| {
            m.schedule.actions_cancelled.inc();
            m.schedule.actions_pending.dec();
        });
        true
    }

    /// Cancel every pending action; with `shutdown`, also stop the executor for good
    pub fn clear(&self, shutdown: bool) {
        let drained: Vec<(K, ScheduledEntry)> = self.entries.lock().drain().collect();
        let count = drained.len();
        for (_, entry) in drained {
            entry.task.abort();
        }
        metrics::record(|m| {
            m.schedule.actions_cancelled.inc_by(count as u64);
            m.schedule.actions_pending.sub(count as i64);
        });

        if shutdown {
            self.shut_down.store(true, Ordering::Release);
            // taken under the entries lock so no spawn races the shutdown
            let runtime = {
                let _entries = self.entries.lock();
                self.runtime.lock().take()
            };
            if let Some(runtime) = runtime {
                runtime.shutdown_background();
            }
            info!("Schedule handler '{}' shut down", self.name);
        }
    }

    /// Number of pending actions
    pub fn scheduled_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether an action is pending for `key`
    pub fn has_action(&self, key: &K) -> bool {
        self.entries.lock().contains_key(key)
    }
}

async fn run_action<K, F>(
    entries: Arc<Mutex<HashMap<K, ScheduledEntry>>>,
    name: String,
    key: K,
    generation: u64,
    delay: Duration,
    action: F,
) where
    K: Eq + Hash + fmt::Debug,
    F: FnOnce(),
{
    tokio::time::sleep(delay).await;

    {
        let mut entries = entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.generation == generation => {
                entries.remove(&key);
                metrics::record(|m| m.schedule.actions_pending.dec());
            }
            // cancelled or replaced after waking up
            _ => return,
        }
    }

    match catch_unwind(AssertUnwindSafe(action)) {
        Ok(()) => {
            debug!("'{}': action for {:?} executed", name, key);
            metrics::record(|m| m.schedule.actions_executed.inc());
        }
        Err(_) => {
            error!("'{}': action for {:?} panicked", name, key);
            metrics::record(|m| m.schedule.actions_failed.inc());
        }
    }
}

impl<K> fmt::Debug for ScheduleHandler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleHandler")
            .field("name", &self.name)
            .field("scheduled", &self.entries.lock().len())
            .field("shut_down", &self.shut_down.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K> Drop for ScheduleHandler<K> {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.get_mut().take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel;

    fn handler() -> Arc<ScheduleHandler<String>> {
        Arc::new(ScheduleHandler::new("test-schedule").unwrap())
    }

    fn now() -> u64 {
        current_time_millis()
    }

    #[test]
    fn test_action_fires_and_is_unregistered() {
        let handler = handler();
        let (tx, rx) = channel::bounded(1);
        handler
            .schedule_action(
                "job-1".to_string(),
                &JobSchedule::after(Duration::from_millis(20)),
                move || tx.send(()).unwrap(),
                now(),
            )
            .unwrap();
        assert!(handler.has_action(&"job-1".to_string()));

        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        std::thread::sleep(Duration::from_millis(20));
        assert!(!handler.has_action(&"job-1".to_string()));
        assert_eq!(handler.scheduled_count(), 0);
    }

    #[test]
    fn test_cancelled_action_never_runs() {
        let handler = handler();
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        handler
            .schedule_action(
                "job-2".to_string(),
                &JobSchedule::after(Duration::from_millis(100)),
                move || flag.store(true, Ordering::SeqCst),
                now(),
            )
            .unwrap();

        assert!(handler.cancel_action(&"job-2".to_string(), false));
        std::thread::sleep(Duration::from_millis(300));
        assert!(!fired.load(Ordering::SeqCst));

        // unknown keys are a no-op
        assert!(!handler.cancel_action(&"nope".to_string(), true));
    }

    #[test]
    fn test_panicking_action_is_isolated() {
        let handler = handler();
        let (tx, rx) = channel::bounded(1);
        handler
            .schedule_action(
                "bad".to_string(),
                &JobSchedule::after(Duration::from_millis(5)),
                || panic!("boom"),
                now(),
            )
            .unwrap();
        handler
            .schedule_action(
                "good".to_string(),
                &JobSchedule::after(Duration::from_millis(50)),
                move || tx.send("good").unwrap(),
                now(),
            )
            .unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "good");
    }

    #[test]
    fn test_action_can_reschedule_its_own_key() {
        let handler = handler();
        let (tx, rx) = channel::bounded(2);
        let inner = handler.clone();
        handler
            .schedule_action(
                "loop".to_string(),
                &JobSchedule::after(Duration::from_millis(5)),
                move || {
                    // own entry is already gone
                    tx.send(inner.has_action(&"loop".to_string())).unwrap();
                    let tx = tx.clone();
                    inner
                        .schedule_action(
                            "loop".to_string(),
                            &JobSchedule::after(Duration::from_millis(5)),
                            move || tx.send(false).unwrap(),
                            now(),
                        )
                        .unwrap();
                },
                now(),
            )
            .unwrap();

        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert!(!rx.recv_timeout(Duration::from_secs(5)).unwrap());
        handler.clear(true);
    }

    #[test]
    fn test_replacing_cancels_previous_action() {
        let handler = handler();
        let (tx, rx) = channel::unbounded();
        let first = tx.clone();
        handler
            .schedule_action(
                "job".to_string(),
                &JobSchedule::after(Duration::from_millis(30)),
                move || first.send("first").unwrap(),
                now(),
            )
            .unwrap();
        handler
            .schedule_action(
                "job".to_string(),
                &JobSchedule::after(Duration::from_millis(60)),
                move || tx.send("second").unwrap(),
                now(),
            )
            .unwrap();
        assert_eq!(handler.scheduled_count(), 1);

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "second");
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_clear_and_shutdown() {
        let handler = handler();
        for i in 0..5 {
            handler
                .schedule_action(
                    format!("job-{}", i),
                    &JobSchedule::after(Duration::from_secs(60)),
                    || {},
                    now(),
                )
                .unwrap();
        }
        assert_eq!(handler.scheduled_count(), 5);

        handler.clear(false);
        assert_eq!(handler.scheduled_count(), 0);
        assert!(handler
            .schedule_action("again".to_string(), &JobSchedule::after(Duration::from_secs(60)), || {}, now())
            .is_ok());

        handler.clear(true);
        assert!(matches!(
            handler.schedule_action("late".to_string(), &JobSchedule::after(Duration::ZERO), || {}, now()),
            Err(ScheduleError::Shutdown(_))
        ));
    }

    #[test]
    fn test_bad_date_is_reported() {
        let handler = handler();
        let result = handler.schedule_action(
            "dated".to_string(),
            &JobSchedule::date("not a date", "%Y-%m-%d"),
            || {},
            now(),
        );
        assert!(matches!(result, Err(ScheduleError::InvalidDate { .. })));
        assert_eq!(handler.scheduled_count(), 0);
    }

    #[tokio::test]
    async fn test_usable_from_async_context() {
        let handler: ScheduleHandler<u64> = ScheduleHandler::new("async-schedule").unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();
        handler
            .schedule_action(
                7,
                &JobSchedule::after(Duration::from_millis(5)),
                move || {
                    let _ = tx.send(7u64);
                },
                now(),
            )
            .unwrap();
        let fired = tokio::time::timeout(Duration::from_secs(5), rx).await.unwrap();
        assert_eq!(fired.unwrap(), 7);
        drop(handler);
    }
}
