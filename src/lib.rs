//! Notify Gate - 通知准入控制与分组批量发送
//!
//! Sits between event producers and a rate-limited delivery channel:
//! - `throttle` decides ALLOW / BLOCK / DELAY per request
//! - `grouping` batches admitted events into summaries
//! - `notification` renders and delivers them

pub mod config;
pub mod error;
pub mod grouping;
pub mod notification;
pub mod throttle;

pub use config::{GateConfig, GroupingConfig, ThrottleConfig};
pub use error::{GateError, Result};
pub use grouping::{GroupAction, GroupingDecision, GroupingEngine, GroupingStrategy, MessageGroup};
pub use notification::{
    DeliveryChannel, DispatchOutcome, NotificationDispatcher, NotificationRequest, Priority,
    SendResult,
};
pub use throttle::{AdmissionController, ThrottleAction, ThrottleDecision, ThrottleStats};
