//! Constructor-time configuration for the admission controller and the grouping engine
//!
//! Every field has a default, so an empty JSON object is a valid config file.

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::GateError;
use crate::grouping::GroupingStrategy;
use crate::notification::Priority;

/// Sliding-window maxima for one bucket
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_per_minute: u32,
    #[serde(default)]
    pub max_per_hour: Option<u32>,
}

/// Per event type budget and cooldown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventLimit {
    #[serde(default)]
    pub max_per_minute: Option<u32>,
    /// Minimum spacing between two admitted events of this type
    #[serde(default)]
    pub cooldown_secs: Option<u64>,
}

/// Load tolerance per priority: the request is shed once load exceeds its weight
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityWeights {
    pub critical: f64,
    pub high: f64,
    pub normal: f64,
    pub low: f64,
}

impl Default for PriorityWeights {
    fn default() -> Self {
        Self {
            critical: 1.0,
            high: 0.95,
            normal: 0.85,
            low: 0.5,
        }
    }
}

impl PriorityWeights {
    pub fn weight(&self, priority: Priority) -> f64 {
        match priority {
            Priority::Critical => self.critical,
            Priority::High => self.high,
            Priority::Normal => self.normal,
            Priority::Low => self.low,
        }
    }
}

/// 准入控制配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub global_max_per_minute: u32,
    pub global_max_per_hour: u32,
    pub duplicate_window_secs: u64,
    /// Channels without an entry are unlimited
    pub channel_limits: HashMap<String, RateLimit>,
    pub event_limits: HashMap<String, EventLimit>,
    pub priority_weights: PriorityWeights,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_max_per_minute: 30,
            global_max_per_hour: 500,
            duplicate_window_secs: 300,
            channel_limits: HashMap::new(),
            event_limits: HashMap::new(),
            priority_weights: PriorityWeights::default(),
        }
    }
}

impl ThrottleConfig {
    pub fn duplicate_window(&self) -> Duration {
        Duration::seconds(self.duplicate_window_secs as i64)
    }

    /// 设置全局限额
    pub fn with_global_limits(mut self, per_minute: u32, per_hour: u32) -> Self {
        self.global_max_per_minute = per_minute;
        self.global_max_per_hour = per_hour;
        self
    }

    /// 设置去重窗口
    pub fn with_duplicate_window_secs(mut self, secs: u64) -> Self {
        self.duplicate_window_secs = secs;
        self
    }

    /// 设置渠道限额
    pub fn with_channel_limit(mut self, channel: impl Into<String>, limit: RateLimit) -> Self {
        self.channel_limits.insert(channel.into(), limit);
        self
    }

    /// 设置事件类型限额
    pub fn with_event_limit(mut self, event_type: impl Into<String>, limit: EventLimit) -> Self {
        self.event_limits.insert(event_type.into(), limit);
        self
    }

    pub fn validate(&self) -> Result<(), GateError> {
        if self.global_max_per_minute == 0 {
            return Err(GateError::Configuration(
                "global_max_per_minute must be positive".to_string(),
            ));
        }
        if self.global_max_per_hour == 0 {
            return Err(GateError::Configuration(
                "global_max_per_hour must be positive".to_string(),
            ));
        }
        for (channel, limit) in &self.channel_limits {
            if limit.max_per_minute == 0 || limit.max_per_hour == Some(0) {
                return Err(GateError::Configuration(format!(
                    "channel '{}' has a zero rate maximum",
                    channel
                )));
            }
        }
        for (event_type, limit) in &self.event_limits {
            if limit.max_per_minute == Some(0) {
                return Err(GateError::Configuration(format!(
                    "event type '{}' has a zero rate maximum",
                    event_type
                )));
            }
        }
        let weights = self.priority_weights;
        for (name, weight) in [
            ("critical", weights.critical),
            ("high", weights.high),
            ("normal", weights.normal),
            ("low", weights.low),
        ] {
            if !(0.0..=1.0).contains(&weight) {
                return Err(GateError::Configuration(format!(
                    "priority weight '{}' must be within 0.0..=1.0, got {}",
                    name, weight
                )));
            }
        }
        Ok(())
    }
}

/// 分组引擎配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupingConfig {
    pub enabled: bool,
    pub group_window_secs: u64,
    pub max_group_size: usize,
    pub max_active_groups: usize,
    pub send_threshold: usize,
    pub send_timeout_secs: u64,
    pub similarity_threshold: f64,
    pub default_strategy: GroupingStrategy,
    pub strategy_overrides: HashMap<String, GroupingStrategy>,
    /// Event types that are never batched
    pub bypass_event_types: HashSet<String>,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group_window_secs: 300,
            max_group_size: 10,
            max_active_groups: 50,
            send_threshold: 5,
            send_timeout_secs: 60,
            similarity_threshold: 0.3,
            default_strategy: GroupingStrategy::Exact,
            strategy_overrides: HashMap::new(),
            bypass_event_types: HashSet::new(),
        }
    }
}

impl GroupingConfig {
    pub fn group_window(&self) -> Duration {
        Duration::seconds(self.group_window_secs as i64)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::seconds(self.send_timeout_secs as i64)
    }

    /// Groups older than this are reclaimed without being delivered
    pub fn expiry_age(&self) -> Duration {
        self.send_timeout() * 3
    }

    pub fn strategy_for(&self, event_type: &str) -> GroupingStrategy {
        self.strategy_overrides
            .get(event_type)
            .copied()
            .unwrap_or(self.default_strategy)
    }

    pub fn validate(&self) -> Result<(), GateError> {
        if self.max_group_size == 0 {
            return Err(GateError::Configuration(
                "max_group_size must be positive".to_string(),
            ));
        }
        if self.send_threshold == 0 {
            return Err(GateError::Configuration(
                "send_threshold must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(GateError::Configuration(format!(
                "similarity_threshold must be within 0.0..=1.0, got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// Full configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    pub throttle: ThrottleConfig,
    pub grouping: GroupingConfig,
}

impl GateConfig {
    /// 默认配置文件路径
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("notify-gate")
            .join("config.json")
    }

    /// Read and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: GateConfig = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        config.validate()?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Load an explicit path, else the default path if present, else defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }

        let default_path = Self::default_path();
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            debug!(path = %default_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<(), GateError> {
        self.throttle.validate()?;
        self.grouping.validate()
    }
}
