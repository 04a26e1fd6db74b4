//! Conversational memory keyed by dataset fingerprint.

pub mod record;
pub mod store;

pub use record::{AnswerSource, ConversationContext, MemoryRecord};
pub use store::{ClearScope, DatasetSummary, MemoryStats, MemoryStore, RetentionPolicy};
