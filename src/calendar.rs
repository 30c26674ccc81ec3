use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{CalendarEvent, ContentRef, EventType, NewCalendarEvent, NotificationSettings};
use crate::reminders::{ReminderScheduler, ScheduledReminder};
use crate::session::SessionManager;
use chrono::NaiveDate;
use std::sync::Arc;

const DEADLINE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%Y.%m.%d", "%Y/%m/%d", "%Y%m%d"];

/// Deadlines arrive in whatever format the catalog used for the listing.
pub fn parse_deadline(raw: &str) -> AppResult<NaiveDate> {
    let trimmed = raw.trim();
    DEADLINE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .ok_or_else(|| {
            AppError::Validation(format!(
                "unsupported deadline {:?} (expected yyyy-MM-dd, yyyy.MM.dd, yyyy/MM/dd or yyyyMMdd)",
                raw
            ))
        })
}

#[derive(Clone)]
pub struct CalendarService {
    db: Arc<Database>,
    reminders: ReminderScheduler,
    sessions: SessionManager,
}

impl CalendarService {
    pub fn new(db: Arc<Database>, reminders: ReminderScheduler, sessions: SessionManager) -> Self {
        Self {
            db,
            reminders,
            sessions,
        }
    }

    /// `Ok(None)` when nobody is signed in.
    pub async fn add_policy_to_calendar(
        &self,
        title: &str,
        organization: Option<&str>,
        deadline: &str,
        policy_id: Option<&str>,
        settings: &NotificationSettings,
    ) -> AppResult<Option<CalendarEvent>> {
        self.add_to_calendar(title, organization, deadline, ContentRef::policy(policy_id), settings)
            .await
    }

    /// `Ok(None)` when nobody is signed in.
    pub async fn add_housing_to_calendar(
        &self,
        title: &str,
        organization: Option<&str>,
        deadline: &str,
        housing_id: Option<&str>,
        settings: &NotificationSettings,
    ) -> AppResult<Option<CalendarEvent>> {
        self.add_to_calendar(title, organization, deadline, ContentRef::housing(housing_id), settings)
            .await
    }

    async fn add_to_calendar(
        &self,
        title: &str,
        organization: Option<&str>,
        deadline: &str,
        content: ContentRef,
        settings: &NotificationSettings,
    ) -> AppResult<Option<CalendarEvent>> {
        let Some(user_id) = self.sessions.current_user_id().await else {
            tracing::debug!(title, "no signed-in user; calendar add ignored");
            return Ok(None);
        };

        let end_date = match parse_deadline(deadline) {
            Ok(end_date) => end_date,
            Err(error) => {
                tracing::error!(title, deadline, error = %error, "calendar add aborted");
                return Err(error);
            }
        };

        let event = self
            .db
            .insert_event(&NewCalendarEvent {
                user_id,
                title: title.to_string(),
                content,
                end_date,
                organization: organization.map(ToString::to_string),
                notification_settings: Some(settings.clone()),
            })
            .map_err(|error| {
                tracing::error!(title, error = %error, "failed to persist calendar event");
                error
            })?;
        tracing::info!(
            event_id = event.id,
            event_type = event.event_type().as_str(),
            %end_date,
            "calendar event added"
        );

        if !self.reminders_enabled()? {
            tracing::info!(event_id = event.id, "reminders disabled; nothing scheduled");
            return Ok(Some(event));
        }

        if let Err(error) = self
            .schedule_notifications(event.id, &event.title, event.end_date, settings)
            .await
        {
            tracing::error!(event_id = event.id, error = %error, "scheduling failed; removing calendar event");
            if let Err(rollback_error) = self.db.delete_event(event.id) {
                tracing::error!(event_id = event.id, error = %rollback_error, "failed to roll back calendar event");
            }
            return Err(error);
        }

        Ok(Some(event))
    }

    pub async fn schedule_notifications(
        &self,
        event_id: i64,
        title: &str,
        end_date: NaiveDate,
        settings: &NotificationSettings,
    ) -> AppResult<Vec<ScheduledReminder>> {
        let scheduled = self.reminders.schedule(event_id, title, end_date, settings).await?;
        tracing::info!(event_id, count = scheduled.len(), "reminders scheduled for event");
        Ok(scheduled)
    }

    /// Deletes the event and withdraws its pending reminders. Returns whether
    /// a row was deleted.
    pub async fn remove_event_from_calendar(&self, event_id: i64) -> AppResult<bool> {
        if self.sessions.current_user_id().await.is_none() {
            tracing::debug!(event_id, "no signed-in user; calendar remove ignored");
            return Ok(false);
        }

        let canceled = self.reminders.cancel(event_id).await;
        let removed = self.db.delete_event(event_id).map_err(|error| {
            tracing::error!(event_id, error = %error, "failed to delete calendar event");
            error
        })?;
        if removed {
            tracing::info!(event_id, canceled, "calendar event removed");
        } else {
            tracing::warn!(event_id, canceled, "calendar event to remove was not found");
        }
        Ok(removed)
    }

    /// Replaces the event's pending reminders and then stores the new
    /// settings. If the new reminders cannot be queued, the old settings stay
    /// stored and their reminders are queued again. `Ok(None)` when nobody is
    /// signed in.
    pub async fn update_notification_settings(
        &self,
        event_id: i64,
        settings: &NotificationSettings,
    ) -> AppResult<Option<Vec<ScheduledReminder>>> {
        if self.sessions.current_user_id().await.is_none() {
            tracing::debug!(event_id, "no signed-in user; settings update ignored");
            return Ok(None);
        }
        let Some(event) = self.db.get_event(event_id)? else {
            return Err(AppError::NotFound(format!("calendar event {}", event_id)));
        };

        let enabled = self.reminders_enabled()?;
        self.reminders.cancel(event_id).await;
        let scheduled = if enabled {
            match self
                .schedule_notifications(event_id, &event.title, event.end_date, settings)
                .await
            {
                Ok(scheduled) => scheduled,
                Err(error) => {
                    tracing::error!(event_id, error = %error, "rescheduling failed; keeping previous settings");
                    self.reschedule_previous(&event).await;
                    return Err(error);
                }
            }
        } else {
            Vec::new()
        };

        if let Err(error) = self.db.update_event_settings(event_id, Some(settings)) {
            tracing::error!(event_id, error = %error, "failed to store settings; keeping previous reminders");
            self.reminders.cancel(event_id).await;
            self.reschedule_previous(&event).await;
            return Err(error);
        }
        Ok(Some(scheduled))
    }

    async fn reschedule_previous(&self, event: &CalendarEvent) {
        let Some(previous) = event.notification_settings.as_ref() else {
            return;
        };
        if let Err(error) = self
            .reminders
            .schedule(event.id, &event.title, event.end_date, previous)
            .await
        {
            tracing::error!(event_id = event.id, error = %error, "failed to restore previous reminders");
        }
    }

    /// Re-enqueues reminders for every stored event. The job queue lives in
    /// memory, so this runs once per start.
    pub async fn restore_pending_reminders(&self) -> AppResult<usize> {
        if !self.reminders_enabled()? {
            return Ok(0);
        }

        let mut restored = 0usize;
        let mut failed = 0usize;
        for event in self.db.list_events()? {
            let Some(settings) = event.notification_settings.as_ref() else {
                continue;
            };
            self.reminders.cancel(event.id).await;
            match self
                .reminders
                .schedule(event.id, &event.title, event.end_date, settings)
                .await
            {
                Ok(scheduled) => restored += scheduled.len(),
                Err(error) => {
                    failed += 1;
                    tracing::warn!(event_id = event.id, error = %error, "failed to restore reminders");
                }
            }
        }
        if failed > 0 {
            tracing::error!(failed, "some events have no pending reminders after restore");
        }
        tracing::info!(restored, "pending reminders restored");
        Ok(restored)
    }

    pub fn get_event(&self, event_id: i64) -> AppResult<Option<CalendarEvent>> {
        self.db.get_event(event_id)
    }

    /// Events of the signed-in user, soonest deadline first.
    pub async fn list_events(&self) -> AppResult<Vec<CalendarEvent>> {
        match self.sessions.current_user_id().await {
            Some(user_id) => self.db.list_events_for_user(&user_id),
            None => Ok(Vec::new()),
        }
    }

    pub fn events_on(&self, date: NaiveDate) -> AppResult<Vec<CalendarEvent>> {
        self.db.list_events_on(date)
    }

    pub fn events_between(&self, start: NaiveDate, end: NaiveDate) -> AppResult<Vec<CalendarEvent>> {
        self.db.list_events_between(start, end)
    }

    pub fn events_by_type(&self, event_type: EventType) -> AppResult<Vec<CalendarEvent>> {
        self.db.list_events_by_type(event_type)
    }

    /// Settings offered for a new event before the user edits them.
    pub fn default_notification_settings(&self) -> AppResult<NotificationSettings> {
        Ok(self.db.get_settings()?.default_notification_settings)
    }

    fn reminders_enabled(&self) -> AppResult<bool> {
        Ok(self.db.get_settings()?.reminders_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_deadline, CalendarService};
    use crate::db::Database;
    use crate::models::{EventType, NotificationSettings};
    use crate::reminders::{reminder_tag, ReminderScheduler};
    use crate::scheduler::JobQueue;
    use crate::session::SessionManager;
    use chrono::{Duration, NaiveDate, Utc};
    use std::sync::Arc;

    struct Fixture {
        _dir: tempfile::TempDir,
        db: Arc<Database>,
        queue: JobQueue,
        sessions: SessionManager,
        service: CalendarService,
    }

    fn fixture(max_queue_size: usize) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("calendar.db")).expect("db"));
        let queue = JobQueue::new(1, max_queue_size);
        let sessions = SessionManager::new();
        let service = CalendarService::new(db.clone(), ReminderScheduler::new(queue.clone()), sessions.clone());
        Fixture {
            _dir: dir,
            db,
            queue,
            sessions,
            service,
        }
    }

    fn future_deadline(days: i64) -> String {
        (Utc::now() + Duration::days(days)).format("%Y.%m.%d").to_string()
    }

    #[test]
    fn deadline_accepts_all_catalog_formats() {
        let expected = NaiveDate::from_ymd_opt(2025, 5, 15).expect("date");
        for raw in ["2025-05-15", "2025.05.15", "2025/05/15", "20250515", " 2025-05-15 "] {
            assert_eq!(parse_deadline(raw).expect("parse"), expected, "format {raw}");
        }
        assert!(parse_deadline("15/05/2025").is_err());
        assert!(parse_deadline("상시 모집").is_err());
    }

    #[tokio::test]
    async fn signed_out_add_is_a_no_op() {
        let fx = fixture(16);
        let added = fx
            .service
            .add_policy_to_calendar("정책", None, &future_deadline(30), None, &NotificationSettings::default())
            .await
            .expect("add");
        assert!(added.is_none());
        assert!(fx.db.list_events().expect("events").is_empty());
        assert!(fx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn add_policy_persists_and_schedules() {
        let fx = fixture(16);
        fx.sessions.sign_in("uid", None).await;

        let event = fx
            .service
            .add_policy_to_calendar(
                "청년 월세 한시 특별지원",
                Some("국토교통부"),
                &future_deadline(30),
                Some("R2025"),
                &NotificationSettings::default(),
            )
            .await
            .expect("add")
            .expect("signed in");

        assert_eq!(event.event_type(), EventType::Policy);
        assert_eq!(event.content.policy_id(), Some("R2025"));
        assert_eq!(fx.queue.pending(&reminder_tag(event.id)).await.len(), 2);
        assert_eq!(fx.service.list_events().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn bad_deadline_is_reported_and_nothing_is_stored() {
        let fx = fixture(16);
        fx.sessions.sign_in("uid", None).await;
        let result = fx
            .service
            .add_housing_to_calendar("주택", None, "someday", Some("H-1"), &NotificationSettings::default())
            .await;
        assert!(result.is_err());
        assert!(fx.db.list_events().expect("events").is_empty());
    }

    #[tokio::test]
    async fn scheduling_failure_rolls_back_the_event() {
        let fx = fixture(1);
        fx.sessions.sign_in("uid", None).await;
        let result = fx
            .service
            .add_housing_to_calendar("주택", None, &future_deadline(30), Some("H-1"), &NotificationSettings::default())
            .await;
        assert!(result.is_err());
        assert!(fx.db.list_events().expect("events").is_empty());
        assert!(fx.queue.is_empty().await);
    }

    #[tokio::test]
    async fn remove_cancels_pending_reminders() {
        let fx = fixture(16);
        fx.sessions.sign_in("uid", None).await;
        let event = fx
            .service
            .add_housing_to_calendar("주택", Some("LH"), &future_deadline(30), Some("H-1"), &NotificationSettings::default())
            .await
            .expect("add")
            .expect("signed in");

        assert!(fx.service.remove_event_from_calendar(event.id).await.expect("remove"));
        assert!(fx.queue.is_empty().await);
        assert!(fx.service.get_event(event.id).expect("get").is_none());
        assert!(!fx.service.remove_event_from_calendar(event.id).await.expect("remove again"));
    }

    #[tokio::test]
    async fn updating_settings_replaces_pending_reminders() {
        let fx = fixture(16);
        fx.sessions.sign_in("uid", None).await;
        let event = fx
            .service
            .add_policy_to_calendar("정책", None, &future_deadline(30), None, &NotificationSettings::default())
            .await
            .expect("add")
            .expect("signed in");

        let only_custom = NotificationSettings {
            seven_days: false,
            one_day: false,
            custom: true,
            custom_days: 5,
            ..NotificationSettings::default()
        };
        let scheduled = fx
            .service
            .update_notification_settings(event.id, &only_custom)
            .await
            .expect("update")
            .expect("signed in");
        assert_eq!(scheduled.len(), 1);
        assert_eq!(fx.queue.pending(&reminder_tag(event.id)).await.len(), 1);

        let stored = fx.service.get_event(event.id).expect("get").expect("exists");
        assert_eq!(stored.notification_settings, Some(only_custom));

        assert!(fx.service.update_notification_settings(9999, &NotificationSettings::default()).await.is_err());
    }

    #[tokio::test]
    async fn failed_settings_update_keeps_previous_settings_and_reminders() {
        let fx = fixture(2);
        fx.sessions.sign_in("uid", None).await;
        let event = fx
            .service
            .add_policy_to_calendar("정책", None, &future_deadline(30), None, &NotificationSettings::default())
            .await
            .expect("add")
            .expect("signed in");
        assert_eq!(fx.queue.pending(&reminder_tag(event.id)).await.len(), 2);

        let three_offsets = NotificationSettings {
            custom: true,
            custom_days: 3,
            ..NotificationSettings::default()
        };
        let result = fx.service.update_notification_settings(event.id, &three_offsets).await;
        assert!(result.is_err());

        let stored = fx.service.get_event(event.id).expect("get").expect("exists");
        assert_eq!(stored.notification_settings, Some(NotificationSettings::default()));
        assert_eq!(fx.queue.pending(&reminder_tag(event.id)).await.len(), 2);
    }

    #[tokio::test]
    async fn signed_out_settings_update_is_a_no_op() {
        let fx = fixture(16);
        fx.sessions.sign_in("uid", None).await;
        let event = fx
            .service
            .add_policy_to_calendar("정책", None, &future_deadline(30), None, &NotificationSettings::default())
            .await
            .expect("add")
            .expect("signed in");
        fx.sessions.sign_out().await;

        let only_custom = NotificationSettings {
            seven_days: false,
            one_day: false,
            custom: true,
            ..NotificationSettings::default()
        };
        let updated = fx
            .service
            .update_notification_settings(event.id, &only_custom)
            .await
            .expect("update");
        assert!(updated.is_none());
        assert_eq!(fx.queue.pending(&reminder_tag(event.id)).await.len(), 2);
    }

    #[tokio::test]
    async fn disabled_reminders_store_event_without_jobs() {
        let fx = fixture(16);
        fx.db
            .update_settings(serde_json::json!({ "remindersEnabled": false }))
            .expect("settings");
        fx.sessions.sign_in("uid", None).await;
        let event = fx
            .service
            .add_policy_to_calendar("정책", None, &future_deadline(30), None, &NotificationSettings::default())
            .await
            .expect("add")
            .expect("signed in");
        assert!(fx.service.get_event(event.id).expect("get").is_some());
        assert!(fx.queue.is_empty().await);
    }

    #[test]
    fn default_settings_follow_the_settings_table() {
        let fx = fixture(16);
        assert_eq!(
            fx.service.default_notification_settings().expect("defaults"),
            NotificationSettings::default()
        );

        fx.db
            .update_settings(serde_json::json!({
                "defaultNotificationSettings": { "oneDay": false, "customDays": 2 }
            }))
            .expect("settings");
        let defaults = fx.service.default_notification_settings().expect("defaults");
        assert!(!defaults.one_day);
        assert_eq!(defaults.custom_days, 2);
        assert!(defaults.seven_days);
    }

    #[tokio::test]
    async fn restore_re_enqueues_without_duplicates() {
        let fx = fixture(16);
        fx.sessions.sign_in("uid", None).await;
        let event = fx
            .service
            .add_policy_to_calendar("정책", None, &future_deadline(30), None, &NotificationSettings::default())
            .await
            .expect("add")
            .expect("signed in");

        assert_eq!(fx.service.restore_pending_reminders().await.expect("restore"), 2);
        assert_eq!(fx.queue.pending(&reminder_tag(event.id)).await.len(), 2);
    }
}
