pub mod memory;
pub mod store;
pub mod types;

pub use memory::MemoryHistoryStore;
pub use store::{HistoryStore, StoreError, StoreResult};
pub use types::{ChatMessage, ChatRole, SessionId, Task, TaskId, TaskStatus, ToolKind, now_millis};
