use crate::errors::{AppError, AppResult};
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static TIME_OF_DAY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{1,2}):(\d{1,2})$").expect("valid time-of-day regex"));

const DEFAULT_REMINDER_HOUR: u8 = 9;
const DEFAULT_REMINDER_MINUTE: u8 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Policy,
    Housing,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Policy => "policy",
            Self::Housing => "housing",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "policy" => Ok(Self::Policy),
            "housing" => Ok(Self::Housing),
            other => Err(AppError::Validation(format!("unknown event type: {}", other))),
        }
    }
}

/// Link from a calendar event into the external content catalog.
///
/// An event points at either a policy or a housing listing, never both. The
/// catalog id itself is optional because some listings are tracked by title
/// only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ContentRef {
    Policy {
        #[serde(rename = "policyId")]
        policy_id: Option<String>,
    },
    Housing {
        #[serde(rename = "housingId")]
        housing_id: Option<String>,
    },
}

impl ContentRef {
    pub fn policy(policy_id: Option<&str>) -> Self {
        Self::Policy {
            policy_id: policy_id.map(ToString::to_string),
        }
    }

    pub fn housing(housing_id: Option<&str>) -> Self {
        Self::Housing {
            housing_id: housing_id.map(ToString::to_string),
        }
    }

    pub fn event_type(&self) -> EventType {
        match self {
            Self::Policy { .. } => EventType::Policy,
            Self::Housing { .. } => EventType::Housing,
        }
    }

    pub fn policy_id(&self) -> Option<&str> {
        match self {
            Self::Policy { policy_id } => policy_id.as_deref(),
            Self::Housing { .. } => None,
        }
    }

    pub fn housing_id(&self) -> Option<&str> {
        match self {
            Self::Housing { housing_id } => housing_id.as_deref(),
            Self::Policy { .. } => None,
        }
    }
}

/// A validated 24-hour wall-clock time, written as `HH:mm`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    pub fn new(hour: u8, minute: u8) -> AppResult<Self> {
        if hour > 23 || minute > 59 {
            return Err(AppError::Validation(format!(
                "time of day out of range: {}:{}",
                hour, minute
            )));
        }
        Ok(Self { hour, minute })
    }

    /// Strict parse. Accepts one or two digits per component.
    pub fn parse(raw: &str) -> AppResult<Self> {
        let Some(caps) = TIME_OF_DAY_RE.captures(raw) else {
            return Err(AppError::Validation(format!(
                "expected HH:mm time of day, got {:?}",
                raw
            )));
        };
        let hour = caps[1]
            .parse::<u8>()
            .map_err(|error| AppError::Validation(error.to_string()))?;
        let minute = caps[2]
            .parse::<u8>()
            .map_err(|error| AppError::Validation(error.to_string()))?;
        Self::new(hour, minute)
    }

    /// Legacy coercion for settings captured before times were validated.
    ///
    /// The value is split on `:`. A component that is missing, non-numeric,
    /// or out of range takes its default (hour 9, minute 0) on its own, so
    /// `"9:5"` is 09:05 and `"abc:00"` is 09:00.
    pub fn parse_lenient(raw: &str) -> Self {
        let mut parts = raw.split(':');
        let hour = parts
            .next()
            .and_then(|part| part.parse::<u8>().ok())
            .filter(|hour| *hour <= 23)
            .unwrap_or(DEFAULT_REMINDER_HOUR);
        let minute = parts
            .next()
            .and_then(|part| part.parse::<u8>().ok())
            .filter(|minute| *minute <= 59)
            .unwrap_or(DEFAULT_REMINDER_MINUTE);
        Self { hour, minute }
    }

    pub fn hour(self) -> u8 {
        self.hour
    }

    pub fn minute(self) -> u8 {
        self.minute
    }

    pub fn as_naive_time(self) -> NaiveTime {
        NaiveTime::from_hms_opt(u32::from(self.hour), u32::from(self.minute), 0).unwrap_or_default()
    }
}

impl Default for TimeOfDay {
    fn default() -> Self {
        Self {
            hour: DEFAULT_REMINDER_HOUR,
            minute: DEFAULT_REMINDER_MINUTE,
        }
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<TimeOfDay> for String {
    fn from(value: TimeOfDay) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderOffset {
    SevenDays,
    OneDay,
    Custom(u32),
}

impl ReminderOffset {
    pub fn days(self) -> u32 {
        match self {
            Self::SevenDays => 7,
            Self::OneDay => 1,
            Self::Custom(days) => days,
        }
    }

    pub fn label(self) -> String {
        format!("{}일 전", self.days())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettings {
    pub seven_days: bool,
    pub seven_days_time: TimeOfDay,
    pub one_day: bool,
    pub one_day_time: TimeOfDay,
    pub custom: bool,
    pub custom_days: u32,
    pub custom_time: TimeOfDay,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self {
            seven_days: true,
            seven_days_time: TimeOfDay { hour: 9, minute: 0 },
            one_day: true,
            one_day_time: TimeOfDay { hour: 10, minute: 0 },
            custom: false,
            custom_days: 3,
            custom_time: TimeOfDay { hour: 9, minute: 0 },
        }
    }
}

impl NotificationSettings {
    /// Enabled offsets in firing order. A custom offset of zero days is
    /// ignored.
    pub fn offsets(&self) -> Vec<(ReminderOffset, TimeOfDay)> {
        let mut offsets = Vec::with_capacity(3);
        if self.seven_days {
            offsets.push((ReminderOffset::SevenDays, self.seven_days_time));
        }
        if self.one_day {
            offsets.push((ReminderOffset::OneDay, self.one_day_time));
        }
        if self.custom && self.custom_days > 0 {
            offsets.push((ReminderOffset::Custom(self.custom_days), self.custom_time));
        }
        offsets
    }
}

/// Raw reminder settings as entered by a user, before validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationSettingsForm {
    pub seven_days: bool,
    pub seven_days_time: String,
    pub one_day: bool,
    pub one_day_time: String,
    pub custom: bool,
    pub custom_days: i64,
    pub custom_time: String,
}

impl Default for NotificationSettingsForm {
    fn default() -> Self {
        let defaults = NotificationSettings::default();
        Self {
            seven_days: defaults.seven_days,
            seven_days_time: defaults.seven_days_time.to_string(),
            one_day: defaults.one_day,
            one_day_time: defaults.one_day_time.to_string(),
            custom: defaults.custom,
            custom_days: i64::from(defaults.custom_days),
            custom_time: defaults.custom_time.to_string(),
        }
    }
}

impl NotificationSettingsForm {
    pub fn validate(&self) -> AppResult<NotificationSettings> {
        let custom_days = u32::try_from(self.custom_days).map_err(|_| {
            AppError::Validation(format!("customDays must be >= 0, got {}", self.custom_days))
        })?;
        Ok(NotificationSettings {
            seven_days: self.seven_days,
            seven_days_time: TimeOfDay::parse(&self.seven_days_time)?,
            one_day: self.one_day,
            one_day_time: TimeOfDay::parse(&self.one_day_time)?,
            custom: self.custom,
            custom_days,
            custom_time: TimeOfDay::parse(&self.custom_time)?,
        })
    }

    pub fn coerce(&self) -> NotificationSettings {
        NotificationSettings {
            seven_days: self.seven_days,
            seven_days_time: TimeOfDay::parse_lenient(&self.seven_days_time),
            one_day: self.one_day,
            one_day_time: TimeOfDay::parse_lenient(&self.one_day_time),
            custom: self.custom,
            custom_days: u32::try_from(self.custom_days).unwrap_or(0),
            custom_time: TimeOfDay::parse_lenient(&self.custom_time),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub content: ContentRef,
    pub end_date: NaiveDate,
    pub organization: Option<String>,
    pub notification_settings: Option<NotificationSettings>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
}

impl CalendarEvent {
    pub fn event_type(&self) -> EventType {
        self.content.event_type()
    }
}

#[derive(Debug, Clone)]
pub struct NewCalendarEvent {
    pub user_id: String,
    pub title: String,
    pub content: ContentRef,
    pub end_date: NaiveDate,
    pub organization: Option<String>,
    pub notification_settings: Option<NotificationSettings>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NotificationType {
    Calendar,
    Fcm,
}

impl NotificationType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Calendar => "calendar",
            Self::Fcm => "fcm",
        }
    }

    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw {
            "calendar" => Ok(Self::Calendar),
            "fcm" => Ok(Self::Fcm),
            other => Err(AppError::Validation(format!("unknown notification type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: i64,
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub notification_type: NotificationType,
    pub event_id: Option<i64>,
    pub event_type: Option<EventType>,
    pub organization: Option<String>,
    pub policy_id: Option<String>,
    pub housing_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewNotification {
    pub user_id: String,
    pub title: String,
    pub body: String,
    pub notification_type: Option<NotificationType>,
    pub event_id: Option<i64>,
    pub event_type: Option<EventType>,
    pub organization: Option<String>,
    pub policy_id: Option<String>,
    pub housing_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BookmarkType {
    Policy,
    Housing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookmarkItem {
    pub id: i64,
    #[serde(rename = "type")]
    pub bookmark_type: BookmarkType,
    pub title: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub deposit: Option<String>,
    #[serde(default)]
    pub monthly_rent: Option<String>,
    #[serde(default)]
    pub area: Option<String>,
    #[serde(default)]
    pub deadline: String,
}

impl BookmarkItem {
    pub fn new(id: i64, bookmark_type: BookmarkType, title: &str, deadline: &str) -> Self {
        Self {
            id,
            bookmark_type,
            title: title.to_string(),
            organization: None,
            period: None,
            content: None,
            address: None,
            deposit: None,
            monthly_rent: None,
            area: None,
            deadline: deadline.to_string(),
        }
    }

    /// Key used to match the same item across the server and the local cache.
    pub fn merge_key(&self) -> (&str, BookmarkType) {
        (self.title.as_str(), self.bookmark_type)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ThemeMode {
    #[default]
    System,
    Light,
    Dark,
}

impl ThemeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::Light => "light",
            Self::Dark => "dark",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "light" => Some(Self::Light),
            "dark" => Some(Self::Dark),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppSettings {
    pub reminders_enabled: bool,
    pub inbox_retention_days: u32,
    pub default_notification_settings: NotificationSettings,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            reminders_enabled: true,
            inbox_retention_days: 90,
            default_notification_settings: NotificationSettings::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        ContentRef, EventType, NotificationSettings, NotificationSettingsForm, ReminderOffset, TimeOfDay,
    };

    #[test]
    fn strict_parse_accepts_short_components() {
        let time = TimeOfDay::parse("9:5").expect("parse");
        assert_eq!((time.hour(), time.minute()), (9, 5));
        assert_eq!(time.to_string(), "09:05");
    }

    #[test]
    fn strict_parse_rejects_garbage_and_out_of_range() {
        assert!(TimeOfDay::parse("abc:00").is_err());
        assert!(TimeOfDay::parse("24:00").is_err());
        assert!(TimeOfDay::parse("10:60").is_err());
        assert!(TimeOfDay::parse("1000").is_err());
    }

    #[test]
    fn lenient_parse_defaults_each_component_independently() {
        assert_eq!(TimeOfDay::parse_lenient("9:5").to_string(), "09:05");
        assert_eq!(TimeOfDay::parse_lenient("abc:00").to_string(), "09:00");
        assert_eq!(TimeOfDay::parse_lenient("14:xx").to_string(), "14:00");
        assert_eq!(TimeOfDay::parse_lenient("").to_string(), "09:00");
        assert_eq!(TimeOfDay::parse_lenient("31:75").to_string(), "09:00");
    }

    #[test]
    fn settings_round_trip_through_json_blob() {
        let settings = NotificationSettings::default();
        let raw = serde_json::to_string(&settings).expect("serialize");
        assert!(raw.contains("\"sevenDaysTime\":\"09:00\""));
        let parsed: NotificationSettings = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, settings);
    }

    #[test]
    fn settings_blob_with_bad_time_is_rejected() {
        let err = serde_json::from_str::<NotificationSettings>(r#"{"sevenDaysTime":"nine"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn offsets_skip_zero_day_custom() {
        let settings = NotificationSettings {
            seven_days: false,
            one_day: true,
            custom: true,
            custom_days: 0,
            ..NotificationSettings::default()
        };
        let offsets = settings.offsets();
        assert_eq!(offsets.len(), 1);
        assert_eq!(offsets[0].0, ReminderOffset::OneDay);
    }

    #[test]
    fn form_validation_and_coercion_disagree_on_bad_input() {
        let form = NotificationSettingsForm {
            seven_days_time: "abc:00".to_string(),
            ..NotificationSettingsForm::default()
        };
        assert!(form.validate().is_err());
        assert_eq!(form.coerce().seven_days_time.to_string(), "09:00");

        let negative = NotificationSettingsForm {
            custom_days: -2,
            ..NotificationSettingsForm::default()
        };
        assert!(negative.validate().is_err());
        assert_eq!(negative.coerce().custom_days, 0);
    }

    #[test]
    fn content_ref_exposes_only_its_own_id() {
        let content = ContentRef::housing(Some("H-1"));
        assert_eq!(content.event_type(), EventType::Housing);
        assert_eq!(content.housing_id(), Some("H-1"));
        assert_eq!(content.policy_id(), None);
    }
}
