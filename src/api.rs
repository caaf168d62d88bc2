//! REST boundary of the notification service.
//!
//! The hub only talks to the server through [`PushApi`], so tests can swap
//! in a scripted implementation. [`HttpPushApi`] is the `reqwest` client
//! used in production.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::constants::HTTP_REQUEST_TIMEOUT;
use crate::notifications::{Notification, NotificationId, NotificationList};
use crate::session::Identity;

/// Server calls made by the sync hub.
#[async_trait]
pub trait PushApi: Send + Sync {
    /// Fetch every notification for the identity's member.
    async fn fetch_notifications(&self, identity: &Identity) -> Result<Vec<Notification>>;

    /// Mark one notification as read upstream.
    async fn confirm(&self, identity: &Identity, id: NotificationId) -> Result<()>;

    /// Invalidate the refresh token server-side.
    async fn logout(&self, identity: &Identity) -> Result<()>;
}

/// Shared handle used by the hub's background tasks.
pub type SharedPushApi = Arc<dyn PushApi>;

/// `reqwest`-backed [`PushApi`].
#[derive(Debug, Clone)]
pub struct HttpPushApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPushApi {
    /// Create a client rooted at `base_url` (e.g. `http://localhost:8080`).
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

#[async_trait]
impl PushApi for HttpPushApi {
    async fn fetch_notifications(&self, identity: &Identity) -> Result<Vec<Notification>> {
        let response = self
            .client
            .get(self.url("/pushs"))
            .query(&[("memberId", identity.subject_id.as_str())])
            .bearer_auth(&identity.access_token)
            .send()
            .await
            .context("Failed to fetch notifications")?;

        if !response.status().is_success() {
            anyhow::bail!("Notification fetch failed: {}", response.status());
        }

        let list: NotificationList = response
            .json()
            .await
            .context("Failed to parse notification list")?;
        let notifications = list.into_notifications();

        log::debug!(
            "[Api] Fetched {} notifications for member {}",
            notifications.len(),
            identity.subject_id
        );
        Ok(notifications)
    }

    async fn confirm(&self, identity: &Identity, id: NotificationId) -> Result<()> {
        let response = self
            .client
            .put(self.url(&format!("/pushs/{id}/confirm")))
            .bearer_auth(&identity.access_token)
            .send()
            .await
            .with_context(|| format!("Failed to confirm notification {id}"))?;

        if !response.status().is_success() {
            anyhow::bail!("Confirm of notification {id} failed: {}", response.status());
        }
        Ok(())
    }

    async fn logout(&self, identity: &Identity) -> Result<()> {
        let payload = serde_json::json!({
            "refreshToken": identity.refresh_token,
            "memberId": identity.subject_id,
        });

        let response = self
            .client
            .post(self.url("/auth/logout"))
            .bearer_auth(&identity.access_token)
            .json(&payload)
            .send()
            .await
            .context("Failed to send logout")?;

        if !response.status().is_success() {
            anyhow::bail!("Logout failed: {}", response.status());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let api = HttpPushApi::new("http://localhost:8080/").unwrap();
        assert_eq!(api.url("/pushs"), "http://localhost:8080/pushs");
    }
}
