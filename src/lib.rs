pub mod bookmarks;
pub mod calendar;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod errors;
pub mod models;
pub mod preferences;
pub mod reminders;
pub mod scheduler;
pub mod session;

use crate::bookmarks::{BookmarkBoard, BookmarkRemote};
use crate::calendar::CalendarService;
use crate::config::AppConfig;
use crate::db::Database;
use crate::dispatcher::{NotificationPresenter, ReminderDispatcher};
use crate::errors::{AppError, AppResult};
use crate::preferences::Preferences;
use crate::reminders::ReminderScheduler;
use crate::scheduler::JobQueue;
use crate::session::SessionManager;
use chrono::{Duration, Utc};
use std::path::Path;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: std::sync::OnceLock<WorkerGuard> = std::sync::OnceLock::new();

/// Everything the client needs for deadline tracking, opened once at start
/// and shut down on exit.
pub struct AppCore {
    config: AppConfig,
    db: Arc<Database>,
    queue: JobQueue,
    sessions: SessionManager,
    preferences: Preferences,
    calendar: CalendarService,
    _dispatcher: Arc<ReminderDispatcher>,
}

impl AppCore {
    pub async fn open(config: AppConfig, presenter: Arc<dyn NotificationPresenter>) -> AppResult<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let db = Arc::new(Database::new(&config.database_path())?);
        let queue = JobQueue::new(config.worker_limit, config.max_queue_size);
        let sessions = SessionManager::new();

        let dispatcher = Arc::new(ReminderDispatcher::new(db.clone(), sessions.clone(), presenter));
        queue.set_executor(dispatcher.executor());

        let calendar = CalendarService::new(
            db.clone(),
            ReminderScheduler::new(queue.clone()),
            sessions.clone(),
        );
        let preferences = Preferences::new(db.clone());

        let core = Self {
            config,
            db,
            queue,
            sessions,
            preferences,
            calendar,
            _dispatcher: dispatcher,
        };

        if let Err(error) = core.prune_inbox() {
            tracing::warn!(error = %error, "inbox retention maintenance failed");
        }

        core.queue.start();
        if let Err(error) = core.calendar.restore_pending_reminders().await {
            tracing::warn!(error = %error, "failed to restore pending reminders");
        }

        tracing::info!(
            database = %core.db.path().to_string_lossy(),
            worker_limit = core.config.worker_limit,
            "reminder core opened"
        );
        Ok(core)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn calendar(&self) -> &CalendarService {
        &self.calendar
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn preferences(&self) -> &Preferences {
        &self.preferences
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn bookmark_board(&self, remote: Arc<dyn BookmarkRemote>) -> AppResult<BookmarkBoard> {
        BookmarkBoard::new(self.preferences.bookmarks(), remote)
    }

    /// Stops the job queue. Pending reminders are dropped here and rebuilt
    /// from the event store by the next `open`.
    pub async fn shutdown(&self) {
        let dropped = self.queue.shutdown().await;
        tracing::info!(dropped, "reminder core shut down");
    }

    fn prune_inbox(&self) -> AppResult<usize> {
        let settings = self.db.get_settings()?;
        let cutoff = Utc::now() - Duration::days(i64::from(settings.inbox_retention_days));
        let removed = self.db.delete_notifications_before(cutoff)?;
        if removed > 0 {
            tracing::info!(removed, "pruned old inbox notifications");
        }
        Ok(removed)
    }
}

pub fn init_tracing(config: &AppConfig) -> AppResult<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_filter));

    if !config.log_to_file {
        return tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
            .map_err(|error| AppError::Internal(error.to_string()));
    }

    init_file_tracing(&config.log_dir(), filter)
}

fn init_file_tracing(log_dir: &Path, filter: tracing_subscriber::EnvFilter) -> AppResult<()> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "reminders.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let _ = LOG_GUARD.set(guard);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_writer(non_blocking)
        .try_init()
        .map_err(|error| AppError::Internal(error.to_string()))
}
