use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, error, info, warn};
use tokio::spawn;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::types::QueueConfig;
use crate::error::{DeviceError, QueueError};
use crate::queue::types::{CommandId, CommandKind, CommandRecord, CommandStatus};

/// Called with the record after every terminal transition.
pub type CommandObserver = Arc<dyn Fn(&CommandRecord) + Send + Sync>;

type Outcome<T> = Arc<Mutex<Option<Result<T, QueueError>>>>;

struct Job {
    id: CommandId,
    kind: CommandKind,
    device_id: String,
    task: BoxFuture<'static, Result<(), String>>,
    // hands the stored outcome (or the timeout) to the caller once the record is final
    deliver: Box<dyn FnOnce(Option<QueueError>) + Send>,
}

struct Chain {
    // identifies the worker that owns this entry
    generation: u64,
    sender: UnboundedSender<Job>,
}

#[derive(Default)]
struct QueueState {
    chains: HashMap<String, Chain>,
    records: HashMap<CommandId, CommandRecord>,
    next_id: u64,
    next_generation: u64,
}

struct Shared {
    config: QueueConfig,
    observer: Option<CommandObserver>,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().expect("Failed to lock queue state")
    }

    fn timeout_for(&self, kind: CommandKind) -> Duration {
        match kind {
            CommandKind::SetImage => self.config.image_timeout(),
            _ => self.config.command_timeout(),
        }
    }

    /// Takes the next job for a device chain, or removes the chain when it is empty. Both
    /// happen under the lock so an enqueue either reaches this worker or starts a new one.
    fn next_job(&self, device_id: &str, generation: u64, receiver: &mut UnboundedReceiver<Job>) -> Option<Job> {
        let mut state = self.lock();

        match receiver.try_recv() {
            Ok(job) => Some(job),
            Err(_) => {
                let owned = state.chains
                    .get(device_id)
                    .map(|chain| chain.generation == generation)
                    .unwrap_or(false);

                if owned {
                    state.chains.remove(device_id);
                    debug!("Cleaned up queue for device {}", device_id);
                }
                None
            },
        }
    }

    fn mark_processing(&self, id: CommandId) {
        let mut state = self.lock();
        if let Some(record) = state.records.get_mut(&id) {
            record.status = CommandStatus::Processing;
            record.started_at = Some(Utc::now());
        }
    }

    fn finish(&self, id: CommandId, outcome: Result<(), String>, timed_out: bool) {
        let record = {
            let mut state = self.lock();
            let Some(record) = state.records.get_mut(&id) else {
                return;
            };

            match outcome {
                Ok(()) => record.status = CommandStatus::Completed,
                Err(message) => {
                    record.status = CommandStatus::Failed;
                    record.error = Some(message);
                },
            }
            record.timed_out = timed_out;
            record.completed_at = Some(Utc::now());
            record.finished = Some(Instant::now());
            record.clone()
        };

        if let Some(observer) = &self.observer {
            observer(&record);
        }
    }

    async fn execute(&self, job: Job) {
        let Job { id, kind, device_id, task, deliver } = job;
        let limit = self.timeout_for(kind);

        self.mark_processing(id);
        info!("Starting {} for device {} ({})", kind, device_id, id);

        // The task runs on its own so that a timeout only stops the queue from waiting on it;
        // a late result is discarded.
        let handle = spawn(task);

        match timeout(limit, handle).await {
            Ok(Ok(Ok(()))) => {
                info!("Completed {} for device {} ({})", kind, device_id, id);
                self.finish(id, Ok(()), false);
                deliver(None);
            },
            Ok(Ok(Err(message))) => {
                error!("Failed {} for device {} ({}): {}", kind, device_id, id, message);
                self.finish(id, Err(message), false);
                deliver(None);
            },
            Ok(Err(join_error)) => {
                let message = format!("Task aborted: {}", join_error);
                error!("Failed {} for device {} ({}): {}", kind, device_id, id, message);
                self.finish(id, Err(message), false);
                // nothing was stored, so the caller sees the command as abandoned
                deliver(None);
            },
            Err(_) => {
                let err = QueueError::Timeout { kind, timeout: limit };
                let message = err.to_string();
                warn!("{} for device {} ({}); leaving it to finish in the background", message, device_id, id);
                self.finish(id, Err(message), true);
                deliver(Some(err));
            },
        }
    }
}

async fn run_chain(shared: Arc<Shared>, device_id: String, generation: u64, first: Job, mut receiver: UnboundedReceiver<Job>) {
    shared.execute(first).await;

    while let Some(job) = shared.next_job(&device_id, generation, &mut receiver) {
        shared.execute(job).await;
    }
}

/// Handle to an enqueued command. Waiting on it yields the task's own result; dropping it
/// leaves the command running.
pub struct CommandHandle<T> {
    id: CommandId,
    receiver: oneshot::Receiver<Result<T, QueueError>>,
}

impl<T> CommandHandle<T> {
    pub fn id(&self) -> CommandId {
        self.id
    }

    pub async fn wait(self) -> Result<T, QueueError> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(QueueError::Abandoned),
        }
    }
}

/// Serializes commands per device id. Commands for one device run strictly in enqueue order,
/// one at a time; different devices run independently.
#[derive(Clone)]
pub struct DeviceQueue {
    shared: Arc<Shared>,
}

impl DeviceQueue {
    pub fn new(config: QueueConfig) -> Self {
        DeviceQueue::build(config, None)
    }

    pub fn with_observer(config: QueueConfig, observer: CommandObserver) -> Self {
        DeviceQueue::build(config, Some(observer))
    }

    fn build(config: QueueConfig, observer: Option<CommandObserver>) -> Self {
        DeviceQueue {
            shared: Arc::new(Shared {
                config,
                observer,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Appends `task` to the chain of `device_id`. Must be called from within a tokio runtime.
    pub fn enqueue<F, T>(&self, device_id: &str, kind: CommandKind, task: F) -> CommandHandle<T>
    where
        F: Future<Output = Result<T, DeviceError>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue_with_commit(device_id, kind, task, |_: &T| {})
    }

    /// Like [`DeviceQueue::enqueue`], but `commit` is handed the task's value once the command
    /// completes within its timeout, before the caller sees the result. A value produced after
    /// the timeout never reaches `commit`.
    pub fn enqueue_with_commit<F, T, C>(&self, device_id: &str, kind: CommandKind, task: F, commit: C) -> CommandHandle<T>
    where
        F: Future<Output = Result<T, DeviceError>> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(&T) + Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let outcome: Outcome<T> = Arc::new(Mutex::new(None));
        let task_outcome = outcome.clone();

        let task = async move {
            let result = task.await;
            let recorded = match &result {
                Ok(_) => Ok(()),
                Err(err) => Err(err.to_string()),
            };

            *task_outcome.lock().expect("Failed to lock command outcome") = Some(result.map_err(QueueError::from));
            recorded
        }.boxed();

        let deliver = Box::new(move |timed_out: Option<QueueError>| {
            let result = match timed_out {
                Some(err) => Some(Err(err)),
                None => outcome.lock().expect("Failed to lock command outcome").take(),
            };

            if let Some(Ok(value)) = &result {
                commit(value);
            }

            if let Some(result) = result {
                // the caller may have dropped the handle
                let _ = sender.send(result);
            }
        });

        let id = self.submit(device_id, kind, task, deliver);
        CommandHandle { id, receiver }
    }

    /// Enqueues and waits for the outcome, propagating failures and timeouts to the caller.
    pub async fn run<F, T>(&self, device_id: &str, kind: CommandKind, task: F) -> Result<T, QueueError>
    where
        F: Future<Output = Result<T, DeviceError>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(device_id, kind, task).wait().await
    }

    /// Enqueues without waiting. Failures are only recorded on the command record.
    pub fn run_in_background<F, T>(&self, device_id: &str, kind: CommandKind, task: F) -> CommandId
    where
        F: Future<Output = Result<T, DeviceError>> + Send + 'static,
        T: Send + 'static,
    {
        self.enqueue(device_id, kind, task).id()
    }

    fn submit(
        &self,
        device_id: &str,
        kind: CommandKind,
        task: BoxFuture<'static, Result<(), String>>,
        deliver: Box<dyn FnOnce(Option<QueueError>) + Send>,
    ) -> CommandId {
        let mut state = self.shared.lock();

        state.next_id += 1;
        let id = CommandId(state.next_id);
        state.records.insert(id, CommandRecord::pending(id, device_id, kind));

        let job = Job { id, kind, device_id: device_id.to_string(), task, deliver };
        info!("Enqueued {} for device {} ({})", kind, device_id, id);

        let job = match state.chains.get(device_id) {
            Some(chain) => match chain.sender.send(job) {
                Ok(()) => None,
                Err(returned) => Some(returned.0),
            },
            None => Some(job),
        };

        if let Some(job) = job {
            state.next_generation += 1;
            let generation = state.next_generation;
            let (sender, receiver) = unbounded_channel();

            state.chains.insert(device_id.to_string(), Chain { generation, sender });
            spawn(run_chain(self.shared.clone(), device_id.to_string(), generation, job, receiver));
        }

        id
    }

    pub fn record(&self, id: CommandId) -> Option<CommandRecord> {
        self.shared.lock().records.get(&id).cloned()
    }

    /// All retained records of a device, oldest first.
    pub fn records(&self, device_id: &str) -> Vec<CommandRecord> {
        let state = self.shared.lock();
        let mut records: Vec<CommandRecord> = state.records
            .values()
            .filter(|record| record.device_id == device_id)
            .cloned()
            .collect();

        records.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then(a.id.cmp(&b.id)));
        records
    }

    /// Number of devices with a live chain.
    pub fn active_devices(&self) -> usize {
        self.shared.lock().chains.len()
    }

    /// Drops terminal records that finished more than `retention` ago.
    pub fn purge(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let mut state = self.shared.lock();
        let before = state.records.len();

        state.records.retain(|_, record| {
            match record.finished {
                Some(finished) if record.status.is_terminal() => now.duration_since(finished) <= retention,
                _ => true,
            }
        });

        before - state.records.len()
    }

    pub fn spawn_cleanup(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let queue = self.clone();
        let retention = self.shared.config.retention();
        let period = self.shared.config.cleanup_interval().max(Duration::from_secs(1));

        spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            'mainloop: loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        break 'mainloop;
                    },
                    _ = ticker.tick() => {
                        let purged = queue.purge(retention);
                        if purged > 0 {
                            debug!("Purged {} finished command records", purged);
                        }
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use futures::future::pending;

    async fn wait_for_status(queue: &DeviceQueue, id: CommandId, status: CommandStatus) {
        for _ in 0..1000 {
            if queue.record(id).map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("{} never reached {:?}: {:?}", id, status, queue.record(id));
    }

    #[tokio::test]
    async fn test_blocking_mode_returns_result() {
        let queue = DeviceQueue::new(QueueConfig::default());

        let value = queue.run("a", CommandKind::Flash, async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);

        let err = queue
            .run("a", CommandKind::ClearImage, async { Err::<(), _>(DeviceError::NoVendorService) })
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::Task { source: DeviceError::NoVendorService }));

        let records = queue.records("a");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, CommandStatus::Completed);
        assert_eq!(records[1].status, CommandStatus::Failed);
        assert_eq!(records[1].error.as_deref(), Some("No vendor ESL service found on this device"));
        assert!(records[1].completed_at.is_some());
    }

    #[tokio::test]
    async fn test_same_device_waits_for_previous() {
        let queue = DeviceQueue::new(QueueConfig::default());
        let (release, released) = oneshot::channel::<()>();

        let first = queue.run_in_background("a", CommandKind::SetImage, async move {
            let _ = released.await;
            Ok(())
        });
        let second = queue.run_in_background("a", CommandKind::Flash, async { Ok(()) });

        wait_for_status(&queue, first, CommandStatus::Processing).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.record(second).unwrap().status, CommandStatus::Pending);

        release.send(()).unwrap();
        wait_for_status(&queue, second, CommandStatus::Completed).await;
        assert_eq!(queue.record(first).unwrap().status, CommandStatus::Completed);
    }

    #[tokio::test]
    async fn test_same_device_runs_in_order() {
        let queue = DeviceQueue::new(QueueConfig::default());
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let order = order.clone();
                queue.enqueue("a", CommandKind::Flash, async move {
                    tokio::time::sleep(Duration::from_millis(5 - i)).await;
                    order.lock().unwrap().push(i);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            handle.wait().await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_different_devices_run_concurrently() {
        let queue = DeviceQueue::new(QueueConfig::default());
        let (release_a, released_a) = oneshot::channel::<()>();
        let (release_b, released_b) = oneshot::channel::<()>();

        let a = queue.run_in_background("a", CommandKind::Flash, async move {
            let _ = released_a.await;
            Ok(())
        });
        let b = queue.run_in_background("b", CommandKind::Flash, async move {
            let _ = released_b.await;
            Ok(())
        });

        wait_for_status(&queue, a, CommandStatus::Processing).await;
        wait_for_status(&queue, b, CommandStatus::Processing).await;
        assert_eq!(queue.active_devices(), 2);

        release_a.send(()).unwrap();
        release_b.send(()).unwrap();
        wait_for_status(&queue, a, CommandStatus::Completed).await;
        wait_for_status(&queue, b, CommandStatus::Completed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_timeout_unblocks_device() {
        let queue = DeviceQueue::new(QueueConfig::default());

        let stuck = queue.run_in_background("a", CommandKind::SetImage, pending::<Result<(), DeviceError>>());
        let next = queue.run_in_background("a", CommandKind::ClearImage, async { Ok(()) });

        tokio::time::sleep(Duration::from_secs(179)).await;
        assert_eq!(queue.record(stuck).unwrap().status, CommandStatus::Processing);
        assert_eq!(queue.record(next).unwrap().status, CommandStatus::Pending);

        tokio::time::sleep(Duration::from_secs(2)).await;
        let record = queue.record(stuck).unwrap();
        assert_eq!(record.status, CommandStatus::Failed);
        assert!(record.timed_out);
        assert_eq!(record.error.as_deref(), Some("Task setImage timeout after 180 seconds"));

        wait_for_status(&queue, next, CommandStatus::Completed).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_timeout_is_reported() {
        let queue = DeviceQueue::new(QueueConfig::default());

        let err = queue
            .run("a", CommandKind::Flash, pending::<Result<(), DeviceError>>())
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(matches!(err, QueueError::Timeout { kind: CommandKind::Flash, timeout } if timeout == Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_skips_late_results() {
        let queue = DeviceQueue::new(QueueConfig::default());
        let committed = Arc::new(Mutex::new(Vec::new()));

        let on_time = committed.clone();
        queue
            .enqueue_with_commit("a", CommandKind::Flash, async { Ok(1) }, move |value: &i32| {
                on_time.lock().unwrap().push(*value);
            })
            .wait()
            .await
            .unwrap();

        let late = committed.clone();
        let handle = queue.enqueue_with_commit("a", CommandKind::Flash, async {
            tokio::time::sleep(Duration::from_secs(90)).await;
            Ok(2)
        }, move |value: &i32| {
            late.lock().unwrap().push(*value);
        });
        let id = handle.id();
        assert!(handle.wait().await.unwrap_err().is_timeout());

        // give the orphaned task time to finish
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(*committed.lock().unwrap(), vec![1]);
        assert!(queue.record(id).unwrap().timed_out);
    }

    #[tokio::test]
    async fn test_chain_entry_removed_when_idle() {
        let queue = DeviceQueue::new(QueueConfig::default());
        queue.run("a", CommandKind::Flash, async { Ok(()) }).await.unwrap();

        for _ in 0..100 {
            if queue.active_devices() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(queue.active_devices(), 0);

        // a fresh chain is started for the next command
        queue.run("a", CommandKind::Flash, async { Ok(()) }).await.unwrap();
        assert_eq!(queue.records("a").len(), 2);
    }

    #[tokio::test]
    async fn test_observer_sees_terminal_records() {
        let seen = Arc::new(AtomicUsize::new(0));
        let observed = seen.clone();
        let queue = DeviceQueue::with_observer(QueueConfig::default(), Arc::new(move |record: &CommandRecord| {
            assert!(record.status.is_terminal());
            observed.fetch_add(1, Ordering::SeqCst);
        }));

        queue.run("a", CommandKind::Flash, async { Ok(()) }).await.unwrap();
        let _ = queue.run("a", CommandKind::Flash, async { Err::<(), _>(DeviceError::NoAdapter) }).await;

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_after_retention() {
        let queue = DeviceQueue::new(QueueConfig::default());
        let (_keep, never) = oneshot::channel::<()>();

        queue.run("a", CommandKind::Flash, async { Ok(()) }).await.unwrap();
        let waiting = queue.run_in_background("b", CommandKind::Flash, async move {
            let _ = never.await;
            Ok(())
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(queue.purge(Duration::from_secs(60)), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(queue.purge(Duration::from_secs(60)), 1);
        assert!(queue.records("a").is_empty());
        assert_eq!(queue.records("b").len(), 1);
        assert!(queue.record(waiting).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_task_stops_on_cancel() {
        let queue = DeviceQueue::new(QueueConfig::default());
        let cancel = CancellationToken::new();
        let handle = queue.spawn_cleanup(cancel.clone());

        queue.run("a", CommandKind::Flash, async { Ok(()) }).await.unwrap();
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(queue.records("a").is_empty());

        cancel.cancel();
        handle.await.unwrap();
    }
}
