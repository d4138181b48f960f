//! Callback-driven sound server client plus an in-process server to talk to.

mod daemon;
mod error;
mod mainloop;
mod output;
pub mod protocol;

pub use daemon::{
    ClientId, ClientSender, LocalServer, ServerConfig, ServerLink, ServerStats,
    DEFAULT_BUFFER_BYTES, MAX_UPLOAD_BYTES,
};
pub use error::ServerError;
pub use mainloop::{
    ContextStateCallback, Deferred, LoopCtx, LoopGuard, Mainloop, Operation, OperationState,
    ReplyCallback, StreamHandle, StreamStateCallback, StreamWriteCallback, SubscribeCallback,
};
pub use output::{AlsaOutput, NullOutput, OutputSink, OutputStream};
pub use protocol::{
    ContextState, EventKind, Facility, Reply, StreamId, StreamState, SubscriptionEvent,
    SubscriptionMask, UpdateMode,
};
