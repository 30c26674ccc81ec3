use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{NewNotification, Notification, NotificationType};
use crate::reminders::ReminderPayload;
use crate::scheduler::{DeferredJob, Executor, JobFuture};
use crate::session::SessionManager;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub const CHANNEL_ID: &str = "calendar_notifications";
pub const CHANNEL_NAME: &str = "캘린더 알림";
pub const CHANNEL_DESCRIPTION: &str = "정책 및 임대주택 마감일 알림";

const FALLBACK_TITLE: &str = "일정 알림";
const FALLBACK_BODY: &str = "일정이 곧 마감됩니다.";
const UNKNOWN_EVENT_ID: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    pub description: String,
}

impl NotificationChannel {
    pub fn calendar() -> Self {
        Self {
            id: CHANNEL_ID.to_string(),
            name: CHANNEL_NAME.to_string(),
            description: CHANNEL_DESCRIPTION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapTarget {
    Calendar,
}

/// A notification as handed to the presenter. `key` is the event id, so a
/// second reminder for the same event replaces the first on screen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresentedNotification {
    pub key: i64,
    pub channel_id: String,
    pub title: String,
    pub body: String,
    pub tap_target: TapTarget,
    pub auto_cancel: bool,
}

pub trait NotificationPresenter: Send + Sync {
    /// Must be idempotent.
    fn ensure_channel(&self, channel: &NotificationChannel) -> AppResult<()>;
    fn present(&self, notification: &PresentedNotification) -> AppResult<()>;
}

/// Presenter for hosts without a notification shade: writes to the log.
#[derive(Debug, Default)]
pub struct TracingPresenter {
    channels: Mutex<HashSet<String>>,
}

impl NotificationPresenter for TracingPresenter {
    fn ensure_channel(&self, channel: &NotificationChannel) -> AppResult<()> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| crate::errors::AppError::Internal("channel registry poisoned".to_string()))?;
        if channels.insert(channel.id.clone()) {
            tracing::info!(channel_id = %channel.id, name = %channel.name, "notification channel created");
        }
        Ok(())
    }

    fn present(&self, notification: &PresentedNotification) -> AppResult<()> {
        tracing::info!(
            key = notification.key,
            channel_id = %notification.channel_id,
            title = %notification.title,
            body = %notification.body,
            "reminder notification presented"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReminderMessage {
    pub event_id: i64,
    pub title: String,
    pub body: String,
}

impl ReminderMessage {
    pub fn from_payload(payload: &serde_json::Value) -> Self {
        let decoded = match serde_json::from_value::<ReminderPayload>(payload.clone()) {
            Ok(decoded) => decoded,
            Err(error) => {
                tracing::warn!(error = %error, "malformed reminder payload; using fallbacks");
                ReminderPayload::default()
            }
        };
        Self {
            event_id: decoded.event_id.unwrap_or(UNKNOWN_EVENT_ID),
            title: decoded.title.unwrap_or_else(|| FALLBACK_TITLE.to_string()),
            body: decoded.body.unwrap_or_else(|| FALLBACK_BODY.to_string()),
        }
    }
}

pub struct ReminderDispatcher {
    db: Arc<Database>,
    sessions: SessionManager,
    presenter: Arc<dyn NotificationPresenter>,
    channel: NotificationChannel,
}

impl ReminderDispatcher {
    pub fn new(db: Arc<Database>, sessions: SessionManager, presenter: Arc<dyn NotificationPresenter>) -> Self {
        Self {
            db,
            sessions,
            presenter,
            channel: NotificationChannel::calendar(),
        }
    }

    /// Adapts the dispatcher to the job queue's executor signature. The queue
    /// only holds a weak reference.
    pub fn executor(self: &Arc<Self>) -> Executor {
        let weak = Arc::downgrade(self);
        Arc::new(move |job: DeferredJob| -> JobFuture {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(dispatcher) => dispatcher.dispatch(job).await,
                    None => {
                        tracing::warn!(job_id = %job.job_id, "dispatcher dropped before reminder fired");
                        true
                    }
                }
            })
        })
    }

    /// Never fails from the queue's point of view; presentation and inbox
    /// errors are logged.
    pub async fn dispatch(&self, job: DeferredJob) -> bool {
        let message = ReminderMessage::from_payload(&job.payload);

        if let Err(error) = self.presenter.ensure_channel(&self.channel) {
            tracing::warn!(error = %error, "failed to ensure notification channel");
        }

        let notification = PresentedNotification {
            key: message.event_id,
            channel_id: self.channel.id.clone(),
            title: message.title.clone(),
            body: message.body.clone(),
            tap_target: TapTarget::Calendar,
            auto_cancel: true,
        };
        match self.presenter.present(&notification) {
            Ok(()) => tracing::info!(event_id = message.event_id, job_id = %job.job_id, "reminder fired"),
            Err(error) => {
                tracing::warn!(event_id = message.event_id, error = %error, "failed to present reminder")
            }
        }

        if let Err(error) = self.record_in_inbox(&message).await {
            tracing::warn!(event_id = message.event_id, error = %error, "failed to store reminder in inbox");
        }

        true
    }

    async fn record_in_inbox(&self, message: &ReminderMessage) -> AppResult<Option<Notification>> {
        let event = if message.event_id > 0 {
            self.db.get_event(message.event_id)?
        } else {
            None
        };

        let user_id = match &event {
            Some(event) => Some(event.user_id.clone()),
            None => self.sessions.current_user_id().await,
        };
        let Some(user_id) = user_id else {
            tracing::debug!(event_id = message.event_id, "no owner for reminder; inbox entry skipped");
            return Ok(None);
        };

        let stored = self.db.insert_notification(&NewNotification {
            user_id,
            title: message.title.clone(),
            body: message.body.clone(),
            notification_type: Some(NotificationType::Calendar),
            event_id: (message.event_id > 0).then_some(message.event_id),
            event_type: event.as_ref().map(|event| event.event_type()),
            organization: event.as_ref().and_then(|event| event.organization.clone()),
            policy_id: event
                .as_ref()
                .and_then(|event| event.content.policy_id().map(ToString::to_string)),
            housing_id: event
                .as_ref()
                .and_then(|event| event.content.housing_id().map(ToString::to_string)),
        })?;
        Ok(Some(stored))
    }
}
