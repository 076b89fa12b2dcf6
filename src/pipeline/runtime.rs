//! Bank-level task runtime.
//!
//! Each bank task runs on the blocking pool (store access is synchronous),
//! bounded by a semaphore and wrapped in a per-task timeout. A timed-out
//! task keeps its thread until it notices abandonment through its
//! [`TaskGuard`]; it must not commit after that point.

use crate::domain::error::CamelsError;
use crate::domain::settings::RuntimeSettings;
use crate::pipeline::context::CancellationFlag;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(CamelsError),
    TimedOut,
    Cancelled,
}

/// Handle a bank task uses to learn that the runtime gave up on it.
#[derive(Debug, Clone)]
pub struct TaskGuard {
    abandoned: Arc<AtomicBool>,
    bank_id: String,
    stage: String,
    timeout_secs: u64,
}

impl TaskGuard {
    fn new(bank_id: &str, stage: &str, timeout: Duration) -> Self {
        Self {
            abandoned: Arc::new(AtomicBool::new(false)),
            bank_id: bank_id.to_string(),
            stage: stage.to_string(),
            timeout_secs: timeout.as_secs(),
        }
    }

    fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned.load(Ordering::SeqCst)
    }

    /// Call before every commit.
    pub fn ensure_active(&self) -> Result<(), CamelsError> {
        if self.is_abandoned() {
            return Err(CamelsError::StageTimeout {
                bank_id: self.bank_id.clone(),
                stage: self.stage.clone(),
                seconds: self.timeout_secs,
            });
        }
        Ok(())
    }
}

pub struct TaskRuntime {
    runtime: Option<Runtime>,
    parallelism: usize,
    task_timeout: Duration,
}

impl TaskRuntime {
    pub fn new(settings: &RuntimeSettings) -> Result<Self, CamelsError> {
        Self::with_limits(
            settings.parallelism,
            Duration::from_secs(settings.task_timeout_secs),
        )
    }

    pub fn with_limits(parallelism: usize, task_timeout: Duration) -> Result<Self, CamelsError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(parallelism.clamp(1, 16))
            .thread_name("camels-worker")
            .enable_all()
            .build()?;
        Ok(Self {
            runtime: Some(runtime),
            parallelism: parallelism.max(1),
            task_timeout,
        })
    }

    pub fn task_timeout(&self) -> Duration {
        self.task_timeout
    }

    /// Set `cancel` when the process receives Ctrl-C.
    pub fn cancel_on_ctrl_c(&self, cancel: CancellationFlag) {
        if let Some(runtime) = self.runtime.as_ref() {
            runtime.spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::warn!("interrupt received; finishing in-flight bank tasks");
                    cancel.cancel();
                }
            });
        }
    }

    /// Run `task` once per bank, at most `parallelism` at a time. Outcomes
    /// come back in the order of `banks`. A failing, panicking or timed-out
    /// task never affects its siblings.
    pub fn run_bank_tasks<T, F>(
        &self,
        stage: &str,
        banks: Vec<String>,
        cancel: &CancellationFlag,
        task: F,
    ) -> Vec<(String, TaskOutcome<T>)>
    where
        T: Send + 'static,
        F: Fn(&str, &TaskGuard) -> Result<T, CamelsError> + Send + Sync + 'static,
    {
        let Some(runtime) = self.runtime.as_ref() else {
            return banks
                .into_iter()
                .map(|b| (b, TaskOutcome::Cancelled))
                .collect();
        };
        let task = Arc::new(task);
        let semaphore = Arc::new(Semaphore::new(self.parallelism));
        let timeout = self.task_timeout;

        runtime.block_on(async {
            let mut handles = Vec::with_capacity(banks.len());
            for bank_id in banks {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) if !cancel.is_cancelled() => permit,
                    _ => {
                        handles.push((bank_id, None));
                        continue;
                    }
                };
                let task = Arc::clone(&task);
                let guard = TaskGuard::new(&bank_id, stage, timeout);
                let id = bank_id.clone();
                let handle = tokio::spawn(async move {
                    let _permit = permit;
                    let task_guard = guard.clone();
                    let blocking = tokio::task::spawn_blocking(move || task(&id, &task_guard));
                    match tokio::time::timeout(timeout, blocking).await {
                        Ok(Ok(Ok(value))) => TaskOutcome::Completed(value),
                        Ok(Ok(Err(err))) => TaskOutcome::Failed(err),
                        Ok(Err(join)) => TaskOutcome::Failed(CamelsError::TaskFailed {
                            bank_id: guard.bank_id.clone(),
                            stage: guard.stage.clone(),
                            reason: join.to_string(),
                        }),
                        Err(_) => {
                            guard.abandon();
                            TaskOutcome::TimedOut
                        }
                    }
                });
                handles.push((bank_id, Some(handle)));
            }

            let mut outcomes = Vec::with_capacity(handles.len());
            for (bank_id, handle) in handles {
                let outcome = match handle {
                    None => TaskOutcome::Cancelled,
                    Some(handle) => handle.await.unwrap_or_else(|join| {
                        TaskOutcome::Failed(CamelsError::TaskFailed {
                            bank_id: bank_id.clone(),
                            stage: stage.to_string(),
                            reason: join.to_string(),
                        })
                    }),
                };
                outcomes.push((bank_id, outcome));
            }
            outcomes
        })
    }
}

impl Drop for TaskRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn banks(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn outcomes_keep_bank_order() {
        let runtime = TaskRuntime::with_limits(2, Duration::from_secs(5)).unwrap();
        let outcomes = runtime.run_bank_tasks(
            "normalize",
            banks(&["B3", "B1", "B2"]),
            &CancellationFlag::new(),
            |bank, _| Ok(bank.len()),
        );
        let ids: Vec<&str> = outcomes.iter().map(|(b, _)| b.as_str()).collect();
        assert_eq!(ids, ["B3", "B1", "B2"]);
        assert!(outcomes
            .iter()
            .all(|(_, o)| matches!(o, TaskOutcome::Completed(2))));
    }

    #[test]
    fn failure_and_panic_are_isolated() {
        let runtime = TaskRuntime::with_limits(2, Duration::from_secs(5)).unwrap();
        let outcomes = runtime.run_bank_tasks(
            "score",
            banks(&["ok", "bad", "boom"]),
            &CancellationFlag::new(),
            |bank, _| match bank {
                "bad" => Err(CamelsError::Cancelled),
                "boom" => panic!("task exploded"),
                _ => Ok(()),
            },
        );
        assert!(matches!(outcomes[0].1, TaskOutcome::Completed(())));
        assert!(matches!(outcomes[1].1, TaskOutcome::Failed(CamelsError::Cancelled)));
        assert!(matches!(
            outcomes[2].1,
            TaskOutcome::Failed(CamelsError::TaskFailed { .. })
        ));
    }

    #[test]
    fn timed_out_task_is_abandoned() {
        let runtime = TaskRuntime::with_limits(2, Duration::from_millis(100)).unwrap();
        let commits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&commits);
        let outcomes = runtime.run_bank_tasks(
            "normalize",
            banks(&["slow", "fast"]),
            &CancellationFlag::new(),
            move |bank, guard| {
                if bank == "slow" {
                    while !guard.is_abandoned() {
                        thread::sleep(Duration::from_millis(10));
                    }
                }
                guard.ensure_active()?;
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        );
        assert!(matches!(outcomes[0].1, TaskOutcome::TimedOut));
        assert!(matches!(outcomes[1].1, TaskOutcome::Completed(())));
        thread::sleep(Duration::from_millis(50));
        assert_eq!(commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_run_starts_nothing() {
        let runtime = TaskRuntime::with_limits(1, Duration::from_secs(5)).unwrap();
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let outcomes =
            runtime.run_bank_tasks("score", banks(&["B1", "B2"]), &cancel, |_, _| Ok(()));
        assert!(outcomes
            .iter()
            .all(|(_, o)| matches!(o, TaskOutcome::Cancelled)));
    }

    #[test]
    fn cancel_lets_in_flight_task_finish() {
        let runtime = TaskRuntime::with_limits(1, Duration::from_secs(5)).unwrap();
        let cancel = CancellationFlag::new();
        let trigger = cancel.clone();
        let outcomes = runtime.run_bank_tasks(
            "normalize",
            banks(&["B1", "B2", "B3"]),
            &cancel,
            move |bank, _| {
                if bank == "B1" {
                    trigger.cancel();
                    thread::sleep(Duration::from_millis(20));
                }
                Ok(bank.to_string())
            },
        );
        assert!(matches!(&outcomes[0].1, TaskOutcome::Completed(b) if b == "B1"));
        assert!(matches!(outcomes[1].1, TaskOutcome::Cancelled));
        assert!(matches!(outcomes[2].1, TaskOutcome::Cancelled));
    }
}
