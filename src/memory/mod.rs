//! Shared memory: record store, per-session context, real-time sync.

pub mod context;
pub mod store;
pub mod sync;

pub use context::{ContextManager, ContextSnapshot};
pub use store::{
    Embedder, InMemoryVectorIndex, MemoryRecord, MemoryStore, MemoryType, RecordFilter, StoreStats,
    VectorIndex, EMBEDDING_DIM,
};
pub use sync::{
    AgentMemoryBridge, MemorySyncBus, RedisBridge, Subscription, SyncCallback, SyncEvent,
    SyncEventKind,
};
