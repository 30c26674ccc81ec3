use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: String,
    pub display_name: Option<String>,
}

/// Holds the signed-in user. Calendar writes and inbox rows are attributed
/// to whoever is signed in here.
#[derive(Clone, Default)]
pub struct SessionManager {
    current: Arc<RwLock<Option<SessionUser>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sign_in(&self, user_id: &str, display_name: Option<&str>) -> SessionUser {
        let user = SessionUser {
            user_id: user_id.to_string(),
            display_name: display_name.map(ToString::to_string),
        };
        let mut current = self.current.write().await;
        if let Some(previous) = current.replace(user.clone()) {
            if previous.user_id != user.user_id {
                tracing::info!(previous = %previous.user_id, user_id = %user.user_id, "session switched user");
            }
        }
        user
    }

    pub async fn sign_out(&self) -> Option<SessionUser> {
        let mut current = self.current.write().await;
        current.take()
    }

    pub async fn current_user(&self) -> Option<SessionUser> {
        self.current.read().await.clone()
    }

    pub async fn current_user_id(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .map(|user| user.user_id.clone())
    }
}
