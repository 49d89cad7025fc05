//! 消息分组 - 把同类事件合并成一条摘要消息发送
//!
//! `GroupingEngine` decides where an admitted event goes; `SummarizerRegistry`
//! turns a ready `MessageGroup` into one `GroupSummary`.

pub mod engine;
pub mod group;
pub mod similarity;
pub mod summarizer;

pub use engine::{GroupingCounters, GroupingEngine, GroupingStats};
pub use group::{FlushReason, GroupAction, GroupingDecision, GroupingStrategy, MessageGroup};
pub use similarity::{best_similarity, event_tokens, jaccard, tokenize};
pub use summarizer::{
    DocumentChangeSummarizer, ErrorSummarizer, GenericSummarizer, GroupSummarizer, GroupSummary,
    SummarizerRegistry, SyncProgressSummarizer,
};
