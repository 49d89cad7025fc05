//! 本地文件渠道 - 将所有通知追加写入 JSONL 文件

use anyhow::Result;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::notification::channel::{DeliveryChannel, SendResult};
use crate::notification::Priority;

/// 通知记录（JSONL 格式）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub ts: DateTime<Utc>,
    pub event_type: String,
    pub payload: Value,
}

/// 本地文件渠道 - 记录通知到 JSONL 文件
pub struct JsonlFileChannel {
    path: PathBuf,
    min_priority: Priority,
}

impl JsonlFileChannel {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            min_priority: Priority::Low,
        }
    }

    /// 默认文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("notify-gate")
            .join("deliveries.jsonl")
    }

    pub fn with_min_priority(mut self, min_priority: Priority) -> Self {
        self.min_priority = min_priority;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加记录（带文件锁）
    fn append(&self, record: &DeliveryRecord) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.lock_exclusive()?;
        let mut file = file;
        let written = writeln!(file, "{}", serde_json::to_string(record)?);
        file.unlock()?;
        written?;
        Ok(())
    }

    /// 读取最近 N 条记录
    pub fn read_recent(&self, n: usize) -> Vec<DeliveryRecord> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };

        let records: Vec<DeliveryRecord> = BufReader::new(file)
            .lines()
            .map_while(|line| line.ok())
            .filter_map(|line| serde_json::from_str(&line).ok())
            .collect();

        let start = records.len().saturating_sub(n);
        records[start..].to_vec()
    }
}

impl DeliveryChannel for JsonlFileChannel {
    fn name(&self) -> &str {
        "jsonl_file"
    }

    fn should_deliver(&self, priority: Priority) -> bool {
        priority >= self.min_priority
    }

    fn deliver(&self, payload: &Value, event_type: &str) -> Result<SendResult> {
        let record = DeliveryRecord {
            ts: Utc::now(),
            event_type: event_type.to_string(),
            payload: payload.clone(),
        };

        match self.append(&record) {
            Ok(()) => {
                debug!(channel = "jsonl_file", event_type = %event_type, "Notification recorded");
                Ok(SendResult::Sent)
            }
            Err(e) => {
                warn!(
                    channel = "jsonl_file",
                    path = %self.path.display(),
                    error = %e,
                    "Failed to write notification to file"
                );
                Ok(SendResult::Failed(e.to_string()))
            }
        }
    }
}
