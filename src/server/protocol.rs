//! Messages exchanged between a client event loop and the sound server.

use super::error::ServerError;
use crate::proplist::Proplist;
use crate::sound::{SampleSpec, Volume};
use bytes::Bytes;

/// Client-chosen identifier correlating a request with its reply.
pub type Tag = u32;

/// Client-local stream identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Unconnected,
    Connecting,
    Ready,
    Failed,
    Terminated,
}

impl ContextState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ContextState::Failed | ContextState::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Unconnected,
    Creating,
    Ready,
    Failed,
    Terminated,
}

impl StreamState {
    pub fn is_terminal(self) -> bool {
        matches!(self, StreamState::Failed | StreamState::Terminated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamDirection {
    Playback,
    /// Upload into the sample cache; exactly `length` bytes are expected.
    Upload { length: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateMode {
    Set,
    Merge,
    Replace,
}

/// Bit mask of event facilities a client listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubscriptionMask(pub u32);

impl SubscriptionMask {
    pub const NONE: SubscriptionMask = SubscriptionMask(0);
    pub const SINK_INPUT: SubscriptionMask = SubscriptionMask(1 << 2);

    pub fn contains(self, facility: Facility) -> bool {
        self.0 & facility.mask().0 != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Facility {
    SinkInput,
}

impl Facility {
    pub fn mask(self) -> SubscriptionMask {
        match self {
            Facility::SinkInput => SubscriptionMask::SINK_INPUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    New,
    Change,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionEvent {
    pub facility: Facility,
    pub kind: EventKind,
    pub index: u32,
}

/// Successful operation results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Ack,
    /// Server-side object index, e.g. the sink input created by a play request.
    Index(u32),
}

#[derive(Debug, Clone)]
pub enum Request {
    Hello {
        props: Proplist,
    },
    PlaySample {
        tag: Tag,
        name: String,
        device: Option<String>,
        volume: Option<Volume>,
        props: Proplist,
    },
    KillSinkInput {
        tag: Tag,
        index: u32,
    },
    Subscribe {
        tag: Tag,
        mask: SubscriptionMask,
    },
    UpdateProplist {
        tag: Tag,
        mode: UpdateMode,
        props: Proplist,
    },
    CreateStream {
        stream: StreamId,
        name: String,
        spec: SampleSpec,
        props: Proplist,
        device: Option<String>,
        direction: StreamDirection,
    },
    Write {
        stream: StreamId,
        data: Bytes,
    },
    FinishUpload {
        stream: StreamId,
    },
    Drain {
        tag: Tag,
        stream: StreamId,
    },
    DeleteStream {
        stream: StreamId,
    },
    Goodbye,
}

#[derive(Debug, Clone)]
pub enum ServerMessage {
    ContextState(ContextState, Option<ServerError>),
    Reply {
        tag: Tag,
        result: Result<Reply, ServerError>,
    },
    StreamState {
        stream: StreamId,
        state: StreamState,
        index: Option<u32>,
        error: Option<ServerError>,
    },
    /// The server can accept `bytes` more bytes on `stream`.
    StreamRequest {
        stream: StreamId,
        bytes: usize,
    },
    Subscription(SubscriptionEvent),
}
