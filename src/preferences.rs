use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{BookmarkItem, BookmarkType, ThemeMode};
use std::sync::Arc;

const KEY_BOOKMARKS: &str = "bookmarks";
const KEY_PROFILE_COMPLETED: &str = "profile_completed";
const KEY_FIRST_LOGIN: &str = "first_login";
const KEY_THEME_MODE: &str = "theme_mode";

/// Device-local flags kept in the `preferences` table.
#[derive(Debug, Clone)]
pub struct Preferences {
    db: Arc<Database>,
}

impl Preferences {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn bookmarks(&self) -> BookmarkStore {
        BookmarkStore { db: self.db.clone() }
    }

    pub fn profile_completed(&self) -> AppResult<bool> {
        Ok(self.get_flag(KEY_PROFILE_COMPLETED)?.unwrap_or(false))
    }

    pub fn set_profile_completed(&self, completed: bool) -> AppResult<()> {
        self.set_flag(KEY_PROFILE_COMPLETED, completed)
    }

    pub fn is_first_login(&self) -> AppResult<bool> {
        Ok(self.get_flag(KEY_FIRST_LOGIN)?.unwrap_or(true))
    }

    pub fn set_first_login(&self, first_login: bool) -> AppResult<()> {
        self.set_flag(KEY_FIRST_LOGIN, first_login)
    }

    pub fn theme_mode(&self) -> AppResult<ThemeMode> {
        let raw = self.db.get_preference(KEY_THEME_MODE)?;
        Ok(raw
            .as_deref()
            .and_then(ThemeMode::parse)
            .unwrap_or_default())
    }

    pub fn set_theme_mode(&self, mode: ThemeMode) -> AppResult<()> {
        self.db.set_preference(KEY_THEME_MODE, mode.as_str())
    }

    fn get_flag(&self, key: &str) -> AppResult<Option<bool>> {
        Ok(self.db.get_preference(key)?.map(|raw| raw == "true"))
    }

    fn set_flag(&self, key: &str, value: bool) -> AppResult<()> {
        self.db.set_preference(key, if value { "true" } else { "false" })
    }
}

/// Locally cached bookmark list, stored as one JSON array.
#[derive(Debug, Clone)]
pub struct BookmarkStore {
    db: Arc<Database>,
}

impl BookmarkStore {
    pub fn list(&self) -> AppResult<Vec<BookmarkItem>> {
        let Some(raw) = self.db.get_preference(KEY_BOOKMARKS)? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str::<Vec<BookmarkItem>>(&raw) {
            Ok(items) => Ok(items),
            Err(error) => {
                tracing::warn!(error = %error, "bookmark cache is unreadable; treating as empty");
                Ok(Vec::new())
            }
        }
    }

    pub fn save(&self, items: &[BookmarkItem]) -> AppResult<()> {
        self.db
            .set_preference(KEY_BOOKMARKS, &serde_json::to_string(items)?)
    }

    /// Returns false when an item with the same title and type is already
    /// cached.
    pub fn add(&self, item: BookmarkItem) -> AppResult<bool> {
        let mut items = self.list()?;
        if items.iter().any(|existing| existing.merge_key() == item.merge_key()) {
            return Ok(false);
        }
        items.push(item);
        self.save(&items)?;
        Ok(true)
    }

    pub fn remove(&self, title: &str, bookmark_type: BookmarkType) -> AppResult<usize> {
        let mut items = self.list()?;
        let before = items.len();
        items.retain(|item| item.merge_key() != (title, bookmark_type));
        let removed = before - items.len();
        self.save(&items)?;
        Ok(removed)
    }

    pub fn is_bookmarked(&self, title: &str, bookmark_type: BookmarkType) -> AppResult<bool> {
        Ok(self
            .list()?
            .iter()
            .any(|item| item.merge_key() == (title, bookmark_type)))
    }

    pub fn clear(&self) -> AppResult<()> {
        self.db.remove_preference(KEY_BOOKMARKS)?;
        Ok(())
    }
}
