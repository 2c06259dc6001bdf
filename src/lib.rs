//! Time-windowed eligibility and delivery for portal promotions.
//!
//! - `window`: lifecycle state of anything with an activation window.
//! - `audience`: premium/free/admin-simulated visibility.
//! - `popup`: picks at most one popup per trigger and tracks what was shown.
//! - `notify`: mark-read over push with a REST fallback, and the unread view.
//! - `countdown`: remaining time and urgency for banners and coupons.

pub mod audience;
pub mod config;
pub mod countdown;
pub mod error;
pub mod model;
pub mod notify;
pub mod popup;
pub mod portal;
pub mod window;

pub use audience::{is_visible, visible_now, TierSimulation, ViewerContext};
pub use countdown::{project_countdown, Countdown, CountdownTicker, TimeParts, Urgency};
pub use error::{ChannelError, EngineError};
pub use notify::{MarkReadOutcome, Reconciler};
pub use popup::{select_popup, PopupSession, TriggerOutcome};
pub use portal::TriggerContext;
pub use window::{evaluate, evaluate_window, LifecycleState};
