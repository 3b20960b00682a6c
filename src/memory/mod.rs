//! 记忆层：对话消息、会话快照持久化、消息与用量仓库

pub mod conversation;
pub mod persistence;
pub mod repository;

pub use conversation::{last_user_message, Message, MessageMetadata, Role};
pub use persistence::{InMemorySnapshotStore, JsonFileSnapshotStore, SnapshotStore};
pub use repository::{InMemoryMessageRepository, MessageRepository, StoredConversation, UsageRecord};
