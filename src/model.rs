use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type EntityId = String;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    #[default]
    All,
    Free,
    Premium,
}

impl Audience {
    /// Banners, coupons and pop-ups only carry an `isExclusive` flag.
    pub fn from_exclusive(is_exclusive: bool) -> Self {
        if is_exclusive {
            Audience::Premium
        } else {
            Audience::All
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Audience::All => "all",
            Audience::Free => "free",
            Audience::Premium => "premium",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

/// Shape shared by every promotional entity the engine evaluates.
pub trait Schedulable {
    fn id(&self) -> &str;
    fn is_active(&self) -> bool;
    fn start_raw(&self) -> Option<&str>;
    fn end_raw(&self) -> Option<&str>;
    fn audience(&self) -> Audience;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Banner {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub link_url: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub is_exclusive: bool,
    #[serde(default)]
    pub start_date_time: Option<String>,
    #[serde(default)]
    pub end_date_time: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Coupon {
    pub id: EntityId,
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub is_exclusive: bool,
    #[serde(default)]
    pub start_date_time: Option<String>,
    #[serde(default)]
    pub end_date_time: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Login,
    Logout,
    PageSpecific,
    Scheduled,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Login => "login",
            Trigger::Logout => "logout",
            Trigger::PageSpecific => "page_specific",
            Trigger::Scheduled => "scheduled",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShowFrequency {
    #[default]
    Always,
    OncePerSession,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PopupCandidate {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub is_exclusive: bool,
    #[serde(default)]
    pub start_date_time: Option<String>,
    #[serde(default)]
    pub end_date_time: Option<String>,
    pub trigger: Trigger,
    #[serde(default)]
    pub target_page: Option<String>,
    #[serde(default)]
    pub target_video_id: Option<String>,
    #[serde(default)]
    pub target_course_id: Option<String>,
    #[serde(default)]
    pub show_frequency: ShowFrequency,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub link_url: Option<String>,
    pub is_active: bool,
    #[serde(default)]
    pub audience: Audience,
    #[serde(default)]
    pub start_date_time: Option<String>,
    #[serde(default)]
    pub end_date_time: Option<String>,
}

/// A notification together with the current viewer's read state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDelivery {
    pub notification: Notification,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

impl NotificationDelivery {
    /// Fold a newer server snapshot into this one. Read state never reverts.
    pub fn merge_from(&mut self, newer: NotificationDelivery) {
        let was_read = self.is_read;
        let read_at = self.read_at;
        *self = newer;
        if was_read {
            self.is_read = true;
            self.read_at = read_at.or(self.read_at);
        }
        if self.is_read && self.read_at.is_none() {
            self.read_at = Some(Utc::now());
        }
    }

    pub fn mark_read_at(&mut self, at: DateTime<Utc>) {
        if !self.is_read {
            self.is_read = true;
            self.read_at = Some(at);
        }
    }
}

macro_rules! exclusive_schedulable {
    ($ty:ty) => {
        impl Schedulable for $ty {
            fn id(&self) -> &str {
                &self.id
            }
            fn is_active(&self) -> bool {
                self.is_active
            }
            fn start_raw(&self) -> Option<&str> {
                self.start_date_time.as_deref()
            }
            fn end_raw(&self) -> Option<&str> {
                self.end_date_time.as_deref()
            }
            fn audience(&self) -> Audience {
                Audience::from_exclusive(self.is_exclusive)
            }
        }
    };
}

exclusive_schedulable!(Banner);
exclusive_schedulable!(Coupon);
exclusive_schedulable!(PopupCandidate);

impl Schedulable for Notification {
    fn id(&self) -> &str {
        &self.id
    }
    fn is_active(&self) -> bool {
        self.is_active
    }
    fn start_raw(&self) -> Option<&str> {
        self.start_date_time.as_deref()
    }
    fn end_raw(&self) -> Option<&str> {
        self.end_date_time.as_deref()
    }
    fn audience(&self) -> Audience {
        self.audience
    }
}

impl Schedulable for NotificationDelivery {
    fn id(&self) -> &str {
        self.notification.id()
    }
    fn is_active(&self) -> bool {
        self.notification.is_active()
    }
    fn start_raw(&self) -> Option<&str> {
        self.notification.start_raw()
    }
    fn end_raw(&self) -> Option<&str> {
        self.notification.end_raw()
    }
    fn audience(&self) -> Audience {
        self.notification.audience()
    }
}
