//! Link to the remote execution agent.
//!
//! [`TransportLink`] keeps a reconnecting WebSocket to the agent process and
//! republishes its traffic; [`CompletionSynchronizer`] turns that traffic into
//! exactly-once task completions for dispatched prompts.

pub mod dispatch;
pub mod errors;
pub mod link;
pub mod protocol;
pub mod sync;

pub use dispatch::*;
pub use errors::*;
pub use link::*;
pub use protocol::*;
pub use sync::*;
