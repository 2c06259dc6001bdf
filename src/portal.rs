//! Collaborator seams and the HTTP client for the portal API.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::config::Config;
use crate::model::{NotificationDelivery, PopupCandidate, Tier, Trigger};

/// Where the popup selector is being asked to look.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerContext {
    pub trigger: Trigger,
    pub target_page: Option<String>,
    pub target_video_id: Option<String>,
    pub target_course_id: Option<String>,
}

impl TriggerContext {
    pub fn new(trigger: Trigger) -> Self {
        Self {
            trigger,
            target_page: None,
            target_video_id: None,
            target_course_id: None,
        }
    }

    pub fn page(page: impl Into<String>) -> Self {
        Self {
            target_page: Some(page.into()),
            ..Self::new(Trigger::PageSpecific)
        }
    }

    pub fn with_video(mut self, video_id: impl Into<String>) -> Self {
        self.target_video_id = Some(video_id.into());
        self
    }

    pub fn with_course(mut self, course_id: impl Into<String>) -> Self {
        self.target_course_id = Some(course_id.into());
        self
    }
}

#[async_trait]
pub trait PopupSource: Send + Sync {
    /// Server-side pre-filtered candidates. Not a trust boundary.
    async fn fetch_candidates(&self, ctx: &TriggerContext) -> Result<Vec<PopupCandidate>>;

    async fn record_view(&self, popup_id: &str) -> Result<()>;
}

#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    async fn current_tier(&self, viewer_id: &str) -> Result<Tier>;
}

#[async_trait]
pub trait NotificationApi: Send + Sync {
    async fn list_notifications(&self) -> Result<Vec<NotificationDelivery>>;

    /// Idempotent: marking an already-read notification succeeds.
    async fn mark_read(&self, notification_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct PortalClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for PortalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct SubscriptionStatus {
    tier: Tier,
}

impl PortalClient {
    pub fn new(base_url: Url, token: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("promo-gate/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.api.base_url).context("invalid api.base_url")?;
        Self::new(
            base_url,
            cfg.api.token.clone(),
            Duration::from_millis(cfg.api.timeout_ms),
        )
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path {path}"))?;
        self.http
            .request(method, endpoint)
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .query(query)
            .build()
            .context("failed to build portal request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response> {
        debug!(method = %request.method(), url = %request.url(), "portal request");
        let res = self
            .http
            .execute(request)
            .await
            .context("failed to reach portal API")?;
        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("received 429 from portal: {}", body));
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(anyhow!("portal error {}: {}", status, body));
        }
        Ok(res)
    }
}

pub fn candidate_query(ctx: &TriggerContext) -> Vec<(&'static str, &str)> {
    let mut query = vec![("trigger", ctx.trigger.as_str())];
    if let Some(page) = ctx.target_page.as_deref() {
        query.push(("page", page));
    }
    if let Some(video) = ctx.target_video_id.as_deref() {
        query.push(("videoId", video));
    }
    if let Some(course) = ctx.target_course_id.as_deref() {
        query.push(("courseId", course));
    }
    query
}

#[async_trait]
impl PopupSource for PortalClient {
    async fn fetch_candidates(&self, ctx: &TriggerContext) -> Result<Vec<PopupCandidate>> {
        let query = candidate_query(ctx);
        let request = self.build_request(Method::GET, "popups/active", &query)?;
        let res = self.execute(request).await?;
        res.json().await.context("invalid popup list response")
    }

    async fn record_view(&self, popup_id: &str) -> Result<()> {
        let request = self.build_request(Method::POST, &format!("popups/{popup_id}/view"), &[])?;
        self.execute(request).await?;
        Ok(())
    }
}

#[async_trait]
impl SubscriptionLookup for PortalClient {
    async fn current_tier(&self, viewer_id: &str) -> Result<Tier> {
        let request = self.build_request(
            Method::GET,
            &format!("subscriptions/{viewer_id}/status"),
            &[],
        )?;
        let res = self.execute(request).await?;
        let status: SubscriptionStatus = res.json().await.context("invalid subscription response")?;
        Ok(status.tier)
    }
}

#[async_trait]
impl NotificationApi for PortalClient {
    async fn list_notifications(&self) -> Result<Vec<NotificationDelivery>> {
        let request = self.build_request(Method::GET, "notifications", &[])?;
        let res = self.execute(request).await?;
        res.json().await.context("invalid notification list response")
    }

    async fn mark_read(&self, notification_id: &str) -> Result<()> {
        let request = self.build_request(
            Method::PATCH,
            &format!("notifications/{notification_id}/read"),
            &[],
        )?;
        self.execute(request).await?;
        Ok(())
    }
}
