pub mod cache;
pub mod types;


pub use cache::ConversationContextCache;
pub use types::{
    CacheContextRequest, CacheError, CacheStats, ChatMessageId, ContextMessage,
    ConversationContextEntry, GroupId, MAX_TTL_MINUTES, MIN_TTL_MINUTES,
};
