//! 通知抽象层 - 请求模型、渲染和投递渠道
//!
//! # 使用示例
//! ```ignore
//! use std::sync::Arc;
//! use notify_gate::notification::{NotificationDispatcher, NotificationRequest, Priority, StdoutChannel};
//!
//! let mut dispatcher = NotificationDispatcher::new(admission, grouping);
//! dispatcher.register_channel(Arc::new(StdoutChannel::new()));
//!
//! let request = NotificationRequest::new("document_change", "ops", Priority::Normal, content);
//! dispatcher.submit(request);
//! dispatcher.tick();
//! ```

pub mod channel;
pub mod channels;
pub mod dispatcher;
pub mod fingerprint;
pub mod formatter;
pub mod priority;
pub mod request;

pub use channel::{priority_meets_threshold, DeliveryChannel, PayloadRenderer, SendResult};
pub use channels::{JsonlFileChannel, StdoutChannel};
pub use dispatcher::{DispatchOutcome, NotificationDispatcher, TickReport};
pub use fingerprint::generate_fingerprint;
pub use formatter::TextRenderer;
pub use priority::Priority;
pub use request::{NotificationRequest, NotificationRequestBuilder};
