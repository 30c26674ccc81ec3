use crate::errors::AppResult;
use crate::models::{NotificationSettings, ReminderOffset};
use crate::scheduler::{DeferredJob, JobQueue};
use chrono::{DateTime, Days, Duration, Local, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const REMINDER_TAG_PREFIX: &str = "calendar_notification_";
pub const REMINDER_BODY: &str = "마감일이 다가옵니다.";

const MAX_GAP_MINUTES: i64 = 24 * 60;

pub fn reminder_tag(event_id: i64) -> String {
    format!("{}{}", REMINDER_TAG_PREFIX, event_id)
}

/// What to do with an offset whose fire instant is already behind us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PastOffsetPolicy {
    /// Schedule nothing and report nothing.
    #[default]
    Skip,
}

/// Job payload read back by the dispatcher. Every field is optional on the
/// wire so a truncated payload still produces a notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReminderPayload {
    pub event_id: Option<i64>,
    pub title: Option<String>,
    pub body: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderPlan {
    pub offset: ReminderOffset,
    pub fire_at: DateTime<Utc>,
    pub body: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledReminder {
    pub job_id: String,
    pub offset: ReminderOffset,
    pub fire_at: DateTime<Utc>,
}

/// Fire instants for every enabled offset of `settings`, in the time zone of
/// `now`.
pub fn plan_reminders<Tz: TimeZone>(
    end_date: NaiveDate,
    settings: &NotificationSettings,
    now: &DateTime<Tz>,
    policy: PastOffsetPolicy,
) -> Vec<ReminderPlan> {
    let zone = now.timezone();
    let mut plans = Vec::new();

    for (offset, time) in settings.offsets() {
        let Some(fire_date) = end_date.checked_sub_days(Days::new(u64::from(offset.days()))) else {
            tracing::warn!(%end_date, days = offset.days(), "reminder offset underflows the calendar");
            continue;
        };
        let local = fire_date.and_time(time.as_naive_time());
        let Some(fire_at) = resolve_local(&zone, local) else {
            tracing::warn!(%local, "no valid instant near reminder time; skipping");
            continue;
        };

        if fire_at <= *now {
            match policy {
                PastOffsetPolicy::Skip => {
                    tracing::debug!(%end_date, offset = %offset.label(), "reminder instant already passed; skipping");
                    continue;
                }
            }
        }

        plans.push(ReminderPlan {
            offset,
            fire_at: fire_at.with_timezone(&Utc),
            body: format!("{} ({})", REMINDER_BODY, offset.label()),
        });
    }

    plans
}

/// A wall-clock time skipped by a DST transition resolves to the first
/// instant after the gap.
fn resolve_local<Tz: TimeZone>(zone: &Tz, local: NaiveDateTime) -> Option<DateTime<Tz>> {
    if let Some(at) = zone.from_local_datetime(&local).earliest() {
        return Some(at);
    }
    let shifted = (1..=MAX_GAP_MINUTES).find_map(|minutes| {
        zone.from_local_datetime(&(local + Duration::minutes(minutes)))
            .earliest()
    });
    if shifted.is_some() {
        tracing::info!(%local, "reminder time falls in a DST gap; firing after the gap");
    }
    shifted
}

#[derive(Clone)]
pub struct ReminderScheduler {
    queue: JobQueue,
    policy: PastOffsetPolicy,
}

impl ReminderScheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self {
            queue,
            policy: PastOffsetPolicy::default(),
        }
    }

    pub fn policy(&self) -> PastOffsetPolicy {
        self.policy
    }

    pub async fn schedule(
        &self,
        event_id: i64,
        title: &str,
        end_date: NaiveDate,
        settings: &NotificationSettings,
    ) -> AppResult<Vec<ScheduledReminder>> {
        self.schedule_at(event_id, title, end_date, settings, &Local::now())
            .await
    }

    /// Enqueues one job per future offset. If any enqueue fails, the jobs
    /// already queued by this call are withdrawn before the error returns.
    pub async fn schedule_at<Tz: TimeZone>(
        &self,
        event_id: i64,
        title: &str,
        end_date: NaiveDate,
        settings: &NotificationSettings,
        now: &DateTime<Tz>,
    ) -> AppResult<Vec<ScheduledReminder>> {
        let tag = reminder_tag(event_id);
        let queued_at = Utc::now();
        let mut scheduled: Vec<ScheduledReminder> = Vec::new();

        for plan in plan_reminders(end_date, settings, now, self.policy) {
            let payload = ReminderPayload {
                event_id: Some(event_id),
                title: Some(title.to_string()),
                body: Some(plan.body.clone()),
            };
            let job = DeferredJob {
                job_id: Uuid::new_v4().to_string(),
                tag: tag.clone(),
                payload: serde_json::to_value(&payload)?,
                queued_at,
                not_before: plan.fire_at,
            };
            let job_id = job.job_id.clone();

            if let Err(error) = self.queue.enqueue(job).await {
                for reminder in &scheduled {
                    self.queue.cancel_job(&reminder.job_id).await;
                }
                tracing::error!(event_id, error = %error, "failed to enqueue reminder");
                return Err(error);
            }

            tracing::info!(event_id, job_id = %job_id, fire_at = %plan.fire_at, "reminder scheduled");
            scheduled.push(ScheduledReminder {
                job_id,
                offset: plan.offset,
                fire_at: plan.fire_at,
            });
        }

        Ok(scheduled)
    }

    pub async fn cancel(&self, event_id: i64) -> usize {
        let removed = self.queue.cancel_by_tag(&reminder_tag(event_id)).await;
        tracing::info!(event_id, removed, "pending reminders canceled");
        removed
    }

    pub async fn pending(&self, event_id: i64) -> Vec<DeferredJob> {
        self.queue.pending(&reminder_tag(event_id)).await
    }
}
