//! 具体渠道实现

pub mod jsonl_file;
pub mod stdout;

pub use jsonl_file::{DeliveryRecord, JsonlFileChannel};
pub use stdout::StdoutChannel;
