//! 准入控制 - 多层限流、去重和负载卸载

pub mod controller;
pub mod decision;
pub mod delay_queue;
pub mod duplicate;
pub mod history;
pub mod stats;

pub use controller::AdmissionController;
pub use decision::{ThrottleAction, ThrottleDecision};
pub use delay_queue::{DelayQueue, DelayedEntry};
pub use duplicate::{DuplicateCache, DuplicateCheck};
pub use history::RateHistory;
pub use stats::{LoadStatus, ThrottleCounters, ThrottleStats};
