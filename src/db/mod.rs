use crate::errors::{AppError, AppResult};
use crate::models::{
    AppSettings, CalendarEvent, ContentRef, EventType, NewCalendarEvent, NewNotification, Notification,
    NotificationSettings, NotificationSettingsForm, NotificationType,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const SCHEMA_SQL: &str = include_str!("schema.sql");

const EVENT_COLUMNS: &str = "id, user_id, title, event_type, end_date, organization, policy_id, housing_id,
     notification_settings_json, synced, created_at";

const NOTIFICATION_COLUMNS: &str = "id, user_id, title, body, notification_type, event_id, event_type,
     organization, policy_id, housing_id, is_read, created_at";

const DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_default_settings()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    pub fn insert_event(&self, event: &NewCalendarEvent) -> AppResult<CalendarEvent> {
        let now = Utc::now();
        let settings_json = event
            .notification_settings
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO calendar_events (
               user_id, title, event_type, end_date, organization, policy_id, housing_id,
               notification_settings_json, synced, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9)",
            params![
                event.user_id,
                event.title,
                event.content.event_type().as_str(),
                event.end_date.format(DATE_FORMAT).to_string(),
                event.organization,
                event.content.policy_id(),
                event.content.housing_id(),
                settings_json,
                now.to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();

        Ok(CalendarEvent {
            id,
            user_id: event.user_id.clone(),
            title: event.title.clone(),
            content: event.content.clone(),
            end_date: event.end_date,
            organization: event.organization.clone(),
            notification_settings: event.notification_settings.clone(),
            synced: false,
            created_at: now,
        })
    }

    pub fn get_event(&self, event_id: i64) -> AppResult<Option<CalendarEvent>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let event = conn
            .query_row(
                &format!("SELECT {} FROM calendar_events WHERE id = ?1", EVENT_COLUMNS),
                [event_id],
                parse_event_row,
            )
            .optional()?;
        Ok(event)
    }

    pub fn list_events(&self) -> AppResult<Vec<CalendarEvent>> {
        self.query_events("1 = 1", &[])
    }

    pub fn list_events_for_user(&self, user_id: &str) -> AppResult<Vec<CalendarEvent>> {
        self.query_events("user_id = ?1", &[&user_id])
    }

    pub fn list_events_on(&self, date: NaiveDate) -> AppResult<Vec<CalendarEvent>> {
        let date = date.format(DATE_FORMAT).to_string();
        self.query_events("end_date = ?1", &[&date])
    }

    pub fn list_events_between(&self, start: NaiveDate, end: NaiveDate) -> AppResult<Vec<CalendarEvent>> {
        let start = start.format(DATE_FORMAT).to_string();
        let end = end.format(DATE_FORMAT).to_string();
        self.query_events("end_date BETWEEN ?1 AND ?2", &[&start, &end])
    }

    pub fn list_events_by_type(&self, event_type: EventType) -> AppResult<Vec<CalendarEvent>> {
        self.query_events("event_type = ?1", &[&event_type.as_str()])
    }

    pub fn list_unsynced_events(&self) -> AppResult<Vec<CalendarEvent>> {
        self.query_events("synced = 0", &[])
    }

    fn query_events(&self, predicate: &str, args: &[&dyn rusqlite::ToSql]) -> AppResult<Vec<CalendarEvent>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let query = format!(
            "SELECT {} FROM calendar_events WHERE {} ORDER BY end_date ASC, id ASC",
            EVENT_COLUMNS, predicate
        );
        let mut statement = conn.prepare(&query)?;
        let rows = statement.query_map(args, parse_event_row)?;
        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn update_event_settings(
        &self,
        event_id: i64,
        settings: Option<&NotificationSettings>,
    ) -> AppResult<bool> {
        let settings_json = settings.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE calendar_events SET notification_settings_json = ?1 WHERE id = ?2",
            params![settings_json, event_id],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_synced(&self, event_id: i64) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("UPDATE calendar_events SET synced = 1 WHERE id = ?1", [event_id])?;
        Ok(changed > 0)
    }

    pub fn delete_event(&self, event_id: i64) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("DELETE FROM calendar_events WHERE id = ?1", [event_id])?;
        Ok(changed > 0)
    }

    pub fn insert_notification(&self, notification: &NewNotification) -> AppResult<Notification> {
        let now = Utc::now();
        let notification_type = notification.notification_type.unwrap_or(NotificationType::Calendar);

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO notifications (
               user_id, title, body, notification_type, event_id, event_type,
               organization, policy_id, housing_id, is_read, created_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10)",
            params![
                notification.user_id,
                notification.title,
                notification.body,
                notification_type.as_str(),
                notification.event_id,
                notification.event_type.map(EventType::as_str),
                notification.organization,
                notification.policy_id,
                notification.housing_id,
                now.to_rfc3339(),
            ],
        )?;

        Ok(Notification {
            id: conn.last_insert_rowid(),
            user_id: notification.user_id.clone(),
            title: notification.title.clone(),
            body: notification.body.clone(),
            notification_type,
            event_id: notification.event_id,
            event_type: notification.event_type,
            organization: notification.organization.clone(),
            policy_id: notification.policy_id.clone(),
            housing_id: notification.housing_id.clone(),
            is_read: false,
            created_at: now,
        })
    }

    pub fn list_notifications(&self, user_id: &str) -> AppResult<Vec<Notification>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM notifications WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
            NOTIFICATION_COLUMNS
        ))?;
        let rows = statement.query_map([user_id], parse_notification_row)?;
        let mut notifications = Vec::new();
        for row in rows {
            notifications.push(row?);
        }
        Ok(notifications)
    }

    pub fn unread_count(&self, user_id: &str) -> AppResult<i64> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count = conn.query_row(
            "SELECT COUNT(1) FROM notifications WHERE user_id = ?1 AND is_read = 0",
            [user_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn mark_notification_read(&self, notification_id: i64) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("UPDATE notifications SET is_read = 1 WHERE id = ?1", [notification_id])?;
        Ok(changed > 0)
    }

    pub fn mark_all_notifications_read(&self, user_id: &str) -> AppResult<usize> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "UPDATE notifications SET is_read = 1 WHERE user_id = ?1 AND is_read = 0",
            [user_id],
        )?;
        Ok(changed)
    }

    pub fn delete_notification(&self, notification_id: i64) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("DELETE FROM notifications WHERE id = ?1", [notification_id])?;
        Ok(changed > 0)
    }

    pub fn delete_all_notifications(&self, user_id: &str) -> AppResult<usize> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("DELETE FROM notifications WHERE user_id = ?1", [user_id])?;
        Ok(changed)
    }

    pub fn delete_notifications_before(&self, before: DateTime<Utc>) -> AppResult<usize> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute(
            "DELETE FROM notifications WHERE created_at < ?1",
            [before.to_rfc3339()],
        )?;
        Ok(changed)
    }

    pub fn get_settings(&self) -> AppResult<AppSettings> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = 'app'",
                [],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        let Some(raw) = raw else {
            return Ok(AppSettings::default());
        };
        match serde_json::from_str::<AppSettings>(&raw) {
            Ok(settings) => Ok(settings),
            Err(error) => {
                tracing::warn!(error = %error, "stored app settings are unreadable; using defaults");
                Ok(AppSettings::default())
            }
        }
    }

    pub fn update_settings(&self, update: serde_json::Value) -> AppResult<AppSettings> {
        let current = self.get_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: AppSettings =
            serde_json::from_value(merged).map_err(|error| AppError::Validation(error.to_string()))?;

        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES ('app', ?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![serde_json::to_string(&settings)?, Utc::now().to_rfc3339()],
        )?;

        Ok(settings)
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM settings WHERE key = 'app'", [], |row| row.get(0))?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES ('app', ?1, ?2)",
                params![
                    serde_json::to_string(&AppSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    pub fn get_preference(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let value = conn
            .query_row("SELECT value FROM preferences WHERE key = ?1", [key], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn set_preference(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        conn.execute(
            "INSERT INTO preferences (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn remove_preference(&self, key: &str) -> AppResult<bool> {
        let conn = self.conn.lock().map_err(|_| AppError::Internal("database mutex poisoned".to_string()))?;
        let changed = conn.execute("DELETE FROM preferences WHERE key = ?1", [key])?;
        Ok(changed > 0)
    }
}

fn parse_event_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CalendarEvent> {
    let event_type = parse_event_type(&row.get::<_, String>(3)?)?;
    let content = match event_type {
        EventType::Policy => ContentRef::Policy {
            policy_id: row.get(6)?,
        },
        EventType::Housing => ContentRef::Housing {
            housing_id: row.get(7)?,
        },
    };
    Ok(CalendarEvent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        content,
        end_date: parse_date(&row.get::<_, String>(4)?)?,
        organization: row.get(5)?,
        notification_settings: row
            .get::<_, Option<String>>(8)?
            .and_then(|raw| decode_settings(&raw)),
        synced: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_notification_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        body: row.get(3)?,
        notification_type: NotificationType::parse(&row.get::<_, String>(4)?)
            .map_err(|error| conversion_error(error.to_string()))?,
        event_id: row.get(5)?,
        event_type: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_event_type(&raw))
            .transpose()?,
        organization: row.get(7)?,
        policy_id: row.get(8)?,
        housing_id: row.get(9)?,
        is_read: row.get(10)?,
        created_at: parse_time(&row.get::<_, String>(11)?)?,
    })
}

/// Settings written before time validation existed are coerced instead of
/// dropped.
fn decode_settings(raw: &str) -> Option<NotificationSettings> {
    match serde_json::from_str::<NotificationSettings>(raw) {
        Ok(settings) => Some(settings),
        Err(strict_error) => match serde_json::from_str::<NotificationSettingsForm>(raw) {
            Ok(form) => {
                tracing::warn!(error = %strict_error, "coercing legacy notification settings");
                Some(form.coerce())
            }
            Err(error) => {
                tracing::warn!(error = %error, "discarding unreadable notification settings");
                None
            }
        },
    }
}

fn parse_event_type(raw: &str) -> rusqlite::Result<EventType> {
    EventType::parse(raw).map_err(|error| conversion_error(error.to_string()))
}

fn parse_date(raw: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, DATE_FORMAT).map_err(|error| conversion_error(error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}
