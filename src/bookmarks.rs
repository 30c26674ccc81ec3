use crate::errors::AppResult;
use crate::models::{BookmarkItem, BookmarkType};
use crate::preferences::BookmarkStore;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::task::JoinHandle;

pub type RemoteFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;

/// Server side of the bookmark list. Only deletion is needed here; fetching
/// is done by the caller and handed to [`BookmarkBoard::reload`].
pub trait BookmarkRemote: Send + Sync {
    fn delete_bookmark(&self, bookmark_id: i64) -> RemoteFuture;
}

/// Server bookmarks followed by every cached bookmark whose (title, type)
/// the server list does not already contain.
pub fn merge_bookmarks(server: &[BookmarkItem], local: &[BookmarkItem]) -> Vec<BookmarkItem> {
    let mut seen = server
        .iter()
        .map(|item| (item.title.clone(), item.bookmark_type))
        .collect::<HashSet<_>>();

    let mut merged = server.to_vec();
    for item in local {
        if seen.insert((item.title.clone(), item.bookmark_type)) {
            merged.push(item.clone());
        }
    }
    merged
}

/// The bookmark list as displayed. Removal is local-first: the cache and the
/// list change immediately and the server delete runs on its own.
pub struct BookmarkBoard {
    items: Vec<BookmarkItem>,
    server: Vec<BookmarkItem>,
    store: BookmarkStore,
    remote: Arc<dyn BookmarkRemote>,
}

impl BookmarkBoard {
    pub fn new(store: BookmarkStore, remote: Arc<dyn BookmarkRemote>) -> AppResult<Self> {
        let items = store.list()?;
        Ok(Self {
            items,
            server: Vec::new(),
            store,
            remote,
        })
    }

    pub fn items(&self) -> &[BookmarkItem] {
        &self.items
    }

    pub fn items_of(&self, bookmark_type: BookmarkType) -> Vec<&BookmarkItem> {
        self.items
            .iter()
            .filter(|item| item.bookmark_type == bookmark_type)
            .collect()
    }

    pub fn reload(&mut self, server: &[BookmarkItem]) -> AppResult<()> {
        self.server = server.to_vec();
        self.refresh_local()
    }

    /// Re-reads the local cache after it changed underneath us, merged with
    /// the server list from the last `reload`.
    pub fn refresh_local(&mut self) -> AppResult<()> {
        let local = self.store.list()?;
        self.items = merge_bookmarks(&self.server, &local);
        Ok(())
    }

    /// The returned handle resolves once the server delete finished; dropping
    /// it is fine. Without a tokio runtime the server delete is skipped.
    pub fn remove(&mut self, item: &BookmarkItem) -> Option<JoinHandle<()>> {
        let handle = if item.id > 0 {
            self.spawn_remote_delete(item.id)
        } else {
            None
        };

        if let Err(error) = self.store.remove(&item.title, item.bookmark_type) {
            tracing::warn!(title = %item.title, error = %error, "failed to remove cached bookmark");
        }
        self.items
            .retain(|existing| existing.merge_key() != item.merge_key());
        self.server
            .retain(|existing| existing.merge_key() != item.merge_key());

        handle
    }

    fn spawn_remote_delete(&self, bookmark_id: i64) -> Option<JoinHandle<()>> {
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(error) => {
                tracing::warn!(bookmark_id, error = %error, "no async runtime; server bookmark delete skipped");
                return None;
            }
        };
        let request = self.remote.delete_bookmark(bookmark_id);
        Some(runtime.spawn(async move {
            match request.await {
                Ok(()) => tracing::info!(bookmark_id, "server bookmark deleted"),
                Err(error) => {
                    tracing::warn!(bookmark_id, error = %error, "server bookmark delete failed")
                }
            }
        }))
    }
}
