use crate::errors::{AppError, AppResult};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::RwLock;
use tokio::sync::{Mutex, Notify};
use tokio::time::Duration;

/// One-shot unit of work that must not run before `not_before`.
#[derive(Debug, Clone)]
pub struct DeferredJob {
    pub job_id: String,
    pub tag: String,
    pub payload: serde_json::Value,
    pub queued_at: DateTime<Utc>,
    pub not_before: DateTime<Utc>,
}

pub type JobFuture = Pin<Box<dyn Future<Output = bool> + Send>>;
pub type Executor = Arc<dyn Fn(DeferredJob) -> JobFuture + Send + Sync>;

#[derive(Clone)]
pub struct JobQueue {
    queue: Arc<Mutex<Vec<DeferredJob>>>,
    running: Arc<Mutex<usize>>,
    notify: Arc<Notify>,
    executor: Arc<RwLock<Option<Executor>>>,
    stopped: Arc<AtomicBool>,
    worker_limit: usize,
    max_queue_size: usize,
}

impl JobQueue {
    pub fn new(worker_limit: usize, max_queue_size: usize) -> Self {
        Self {
            queue: Arc::new(Mutex::new(Vec::new())),
            running: Arc::new(Mutex::new(0)),
            notify: Arc::new(Notify::new()),
            executor: Arc::new(RwLock::new(None)),
            stopped: Arc::new(AtomicBool::new(false)),
            worker_limit: worker_limit.max(1),
            max_queue_size,
        }
    }

    pub fn set_executor(&self, executor: Executor) {
        match self.executor.write() {
            Ok(mut writer) => *writer = Some(executor),
            Err(_) => tracing::error!("job queue executor lock poisoned"),
        }
    }

    pub async fn enqueue(&self, job: DeferredJob) -> AppResult<()> {
        {
            let mut queue = self.queue.lock().await;
            if queue.iter().any(|queued| queued.job_id == job.job_id) {
                return Ok(());
            }
            if queue.len() >= self.max_queue_size {
                return Err(AppError::Capacity(format!(
                    "Queue capacity exceeded (max {}).",
                    self.max_queue_size
                )));
            }
            queue.push(job);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Drops every pending job carrying `tag`. Jobs already handed to the
    /// executor are not affected.
    pub async fn cancel_by_tag(&self, tag: &str) -> usize {
        let removed = {
            let mut queue = self.queue.lock().await;
            let before = queue.len();
            queue.retain(|job| job.tag != tag);
            before - queue.len()
        };
        if removed > 0 {
            self.notify.notify_one();
        }
        removed
    }

    pub async fn cancel_job(&self, job_id: &str) -> bool {
        let mut queue = self.queue.lock().await;
        let before = queue.len();
        queue.retain(|job| job.job_id != job_id);
        queue.len() != before
    }

    pub async fn pending(&self, tag: &str) -> Vec<DeferredJob> {
        let queue = self.queue.lock().await;
        let mut jobs = queue
            .iter()
            .filter(|job| job.tag == tag)
            .cloned()
            .collect::<Vec<_>>();
        jobs.sort_by_key(|job| job.not_before);
        jobs
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.queue.lock().await.is_empty()
    }

    pub fn start(&self) {
        self.stopped.store(false, Ordering::SeqCst);
        let queue = self.clone();
        tokio::spawn(async move {
            queue.run_loop().await;
        });
        self.notify.notify_one();
    }

    pub async fn shutdown(&self) -> usize {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        let mut queue = self.queue.lock().await;
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Waits for a wakeup or for the earliest pending `not_before`. The sleep
    /// is a future owned by this loop, so there is at most one timer per
    /// queue.
    async fn run_loop(self) {
        let mut next_wake: Option<Duration> = None;
        loop {
            match next_wake.take() {
                Some(delay) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => self.notify.notified().await,
            }
            if self.stopped.load(Ordering::SeqCst) {
                tracing::debug!("job queue loop stopped");
                break;
            }
            loop {
                let (maybe_job, next_delay) = self.pick_next_job().await;
                let Some(job) = maybe_job else {
                    next_wake = next_delay;
                    break;
                };

                if !self.try_reserve_slot().await {
                    let mut queue = self.queue.lock().await;
                    queue.push(job);
                    break;
                }

                let queue = self.clone();
                tokio::spawn(async move {
                    let succeeded = queue.execute(job.clone()).await;
                    queue.release_slot().await;
                    if !succeeded {
                        tracing::warn!(job_id = %job.job_id, tag = %job.tag, "deferred job reported failure");
                    }
                    queue.notify.notify_one();
                });
            }
        }
    }

    async fn execute(&self, job: DeferredJob) -> bool {
        let executor = match self.executor.read() {
            Ok(reader) => reader.clone(),
            Err(_) => None,
        };
        match executor {
            Some(executor) => executor(job).await,
            None => {
                tracing::warn!(job_id = %job.job_id, "no executor installed; dropping deferred job");
                false
            }
        }
    }

    async fn pick_next_job(&self) -> (Option<DeferredJob>, Option<Duration>) {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return (None, None);
        }

        let now = Utc::now();
        let ready_index = queue
            .iter()
            .enumerate()
            .filter(|(_, job)| job.not_before <= now)
            .min_by_key(|(_, job)| (job.not_before, job.queued_at))
            .map(|(index, _)| index);

        match ready_index {
            Some(index) => (Some(queue.remove(index)), None),
            None => {
                let delay = queue
                    .iter()
                    .map(|job| job.not_before)
                    .min()
                    .map(|at| delay_until(at, now));
                (None, delay)
            }
        }
    }

    async fn try_reserve_slot(&self) -> bool {
        let mut running = self.running.lock().await;
        if *running >= self.worker_limit {
            return false;
        }
        *running += 1;
        true
    }

    async fn release_slot(&self) {
        let mut running = self.running.lock().await;
        if *running > 0 {
            *running -= 1;
        }
    }
}

fn delay_until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    let diff = at.signed_duration_since(now).num_milliseconds();
    if diff <= 0 {
        Duration::from_millis(0)
    } else {
        Duration::from_millis(diff as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::{delay_until, DeferredJob, JobFuture, JobQueue};
    use chrono::{DateTime, Duration, Utc};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    fn job(id: &str, tag: &str, not_before: DateTime<Utc>) -> DeferredJob {
        DeferredJob {
            job_id: id.to_string(),
            tag: tag.to_string(),
            payload: serde_json::json!({ "id": id }),
            queued_at: Utc::now(),
            not_before,
        }
    }

    #[test]
    fn past_instants_have_zero_delay() {
        let now = Utc::now();
        assert_eq!(delay_until(now - Duration::seconds(5), now).as_millis(), 0);
        assert_eq!(delay_until(now + Duration::seconds(2), now).as_millis(), 2000);
    }

    #[tokio::test]
    async fn queue_capacity_is_enforced() {
        let queue = JobQueue::new(1, 1);
        let later = Utc::now() + Duration::hours(1);

        queue.enqueue(job("first", "a", later)).await.expect("first enqueue");
        let err = queue
            .enqueue(job("second", "a", later))
            .await
            .expect_err("second enqueue should fail");
        assert!(err.to_string().contains("Queue capacity exceeded"));
    }

    #[tokio::test]
    async fn duplicate_job_ids_are_ignored() {
        let queue = JobQueue::new(1, 8);
        let later = Utc::now() + Duration::hours(1);
        queue.enqueue(job("same", "a", later)).await.expect("enqueue");
        queue.enqueue(job("same", "a", later)).await.expect("enqueue again");
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn cancel_by_tag_only_removes_matching_jobs() {
        let queue = JobQueue::new(1, 8);
        let later = Utc::now() + Duration::hours(1);
        queue.enqueue(job("a1", "a", later)).await.expect("enqueue");
        queue.enqueue(job("a2", "a", later)).await.expect("enqueue");
        queue.enqueue(job("b1", "b", later)).await.expect("enqueue");

        assert_eq!(queue.cancel_by_tag("a").await, 2);
        assert!(queue.pending("a").await.is_empty());
        assert_eq!(queue.pending("b").await.len(), 1);
        assert_eq!(queue.cancel_by_tag("missing").await, 0);
    }

    #[tokio::test]
    async fn due_jobs_run_in_not_before_order() {
        let queue = JobQueue::new(1, 8);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        queue.set_executor(Arc::new(move |job: DeferredJob| -> JobFuture {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push(job.job_id);
                true
            })
        }));

        let now = Utc::now();
        queue.enqueue(job("second", "t", now + Duration::milliseconds(80))).await.expect("enqueue");
        queue.enqueue(job("first", "t", now - Duration::seconds(1))).await.expect("enqueue");
        queue.start();

        for _ in 0..50 {
            if seen.lock().await.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(*seen.lock().await, vec!["first".to_string(), "second".to_string()]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn far_future_jobs_do_not_leave_timer_tasks_behind() {
        let queue = JobQueue::new(1, 512);
        queue.start();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let metrics = tokio::runtime::Handle::current().metrics();
        let base = metrics.num_alive_tasks();

        let later = Utc::now() + Duration::days(7);
        for index in 0..200 {
            queue
                .enqueue(job(&format!("far-{}", index), "far", later))
                .await
                .expect("enqueue");
            tokio::task::yield_now().await;
        }
        assert_eq!(queue.cancel_by_tag("far").await, 200);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(queue.is_empty().await);
        assert_eq!(metrics.num_alive_tasks(), base);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn earlier_job_enqueued_while_sleeping_still_fires_first() {
        let queue = JobQueue::new(1, 8);
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let sink = seen.clone();
        queue.set_executor(Arc::new(move |job: DeferredJob| -> JobFuture {
            let sink = sink.clone();
            Box::pin(async move {
                sink.lock().await.push(job.job_id);
                true
            })
        }));
        queue.start();

        queue
            .enqueue(job("late", "t", Utc::now() + Duration::hours(1)))
            .await
            .expect("enqueue");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        queue
            .enqueue(job("soon", "t", Utc::now() + Duration::milliseconds(40)))
            .await
            .expect("enqueue");

        for _ in 0..50 {
            if !seen.lock().await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(*seen.lock().await, vec!["soon".to_string()]);
        assert_eq!(queue.len().await, 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drops_pending_jobs() {
        let queue = JobQueue::new(1, 8);
        queue.start();
        queue
            .enqueue(job("later", "t", Utc::now() + Duration::hours(1)))
            .await
            .expect("enqueue");
        assert_eq!(queue.shutdown().await, 1);
        assert!(queue.is_empty().await);
    }
}
