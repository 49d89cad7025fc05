//! 标准输出渠道 - 每条通知一行 JSON

use anyhow::Result;
use serde_json::Value;
use std::io::Write;
use tracing::debug;

use crate::notification::channel::{DeliveryChannel, SendResult};

/// Prints each payload as one JSON line on stdout
pub struct StdoutChannel;

impl StdoutChannel {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StdoutChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryChannel for StdoutChannel {
    fn name(&self) -> &str {
        "stdout"
    }

    fn deliver(&self, payload: &Value, event_type: &str) -> Result<SendResult> {
        let line = serde_json::to_string(payload)?;
        let mut out = std::io::stdout().lock();
        writeln!(out, "{}", line)?;
        out.flush()?;
        debug!(channel = "stdout", event_type = %event_type, "Payload written");
        Ok(SendResult::Sent)
    }
}
