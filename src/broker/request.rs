//! One in-flight request and its state machine.

use crate::error::ErrorKind;
use crate::server::StreamHandle;
use crate::sound::{SoundFile, Volume};
use std::fmt;
use tracing::trace;

const LOG_TARGET: &str = "r_chime::broker::request";

/// Called exactly once with the caller's request id and the terminal outcome.
pub type FinishCallback = Box<dyn FnOnce(u32, Result<(), ErrorKind>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Plays a sample from the server cache.
    TriggerSample,
    /// Streams decoded audio to a playback stream.
    DirectStream,
    /// Uploads decoded audio into the server cache.
    CacheUpload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Success,
    /// The sample is not cached; the only retryable outcome.
    NotFound,
    Error(ErrorKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    Created,
    Submitted,
    Resolved(Resolution),
    StreamConnecting,
    StreamReady,
    Writing,
    Draining,
    Completed,
    Failed(ErrorKind),
    Cancelled,
    Destroyed,
}

impl RequestState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestState::Resolved(Resolution::Error(_))
                | RequestState::Completed
                | RequestState::Failed(_)
                | RequestState::Cancelled
                | RequestState::Destroyed
        )
    }

    /// The transition table.
    pub fn can_advance_to(self, next: RequestState) -> bool {
        use RequestState::*;
        if self.is_terminal() {
            return false;
        }
        if matches!(next, Failed(_) | Cancelled | Destroyed) {
            return true;
        }
        match (self, next) {
            (Created, Submitted) | (Created, StreamConnecting) => true,
            (Submitted, Resolved(_)) => true,
            (Resolved(Resolution::NotFound), Submitted)
            | (Resolved(Resolution::NotFound), StreamConnecting) => true,
            (Resolved(Resolution::Success), Completed) => true,
            (StreamConnecting, StreamReady) => true,
            (StreamReady, Writing) | (StreamReady, Draining) => true,
            (Writing, Writing) | (Writing, Draining) => true,
            (StreamReady, Completed) | (Writing, Completed) | (Draining, Completed) => true,
            _ => false,
        }
    }
}

/// Tracking record for one request. Owns the request's stream and sound source.
pub struct OutstandingRequest {
    pub kind: RequestKind,
    pub request_id: u32,
    pub server_object_id: Option<u32>,
    pub stream: Option<StreamHandle>,
    pub file: Option<Box<dyn SoundFile>>,
    pub volume: Option<Volume>,
    pub pending_error: Option<ErrorKind>,
    /// Bytes handed to the stream so far.
    pub written: usize,
    /// The playing instance was removed before this record was tracked.
    pub early_finish: bool,
    pub(super) tracked: bool,
    state: RequestState,
    completion: Option<FinishCallback>,
}

impl OutstandingRequest {
    pub fn new(kind: RequestKind, request_id: u32, completion: Option<FinishCallback>) -> Self {
        OutstandingRequest {
            kind,
            request_id,
            server_object_id: None,
            stream: None,
            file: None,
            volume: None,
            pending_error: None,
            written: 0,
            early_finish: false,
            tracked: false,
            state: RequestState::Created,
            completion,
        }
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn is_tracked(&self) -> bool {
        self.tracked
    }

    pub fn has_completion(&self) -> bool {
        self.completion.is_some()
    }

    /// Moves to `next`, rejecting transitions outside the table with `State`.
    pub fn advance(&mut self, next: RequestState) -> Result<(), ErrorKind> {
        if !self.state.can_advance_to(next) {
            trace!(
                target: LOG_TARGET,
                "Rejected transition {:?} -> {:?} for request {}", self.state, next, self.request_id
            );
            return Err(ErrorKind::State);
        }
        self.state = next;
        Ok(())
    }

    /// Records the server's answer to a play-sample submission.
    pub fn resolve(&mut self, result: Result<u32, ErrorKind>) {
        let resolution = match result {
            Ok(index) => {
                self.server_object_id.get_or_insert(index);
                self.pending_error = None;
                Resolution::Success
            }
            Err(ErrorKind::NotFound) => {
                self.pending_error = Some(ErrorKind::NotFound);
                Resolution::NotFound
            }
            Err(e) => {
                self.pending_error = Some(e);
                Resolution::Error(e)
            }
        };
        let _ = self.advance(RequestState::Resolved(resolution));
    }

    /// Delivers the terminal outcome, then releases the stream and the sound source.
    pub fn complete(mut self, outcome: Result<(), ErrorKind>) {
        let terminal = match outcome {
            Ok(()) => RequestState::Completed,
            Err(ErrorKind::Canceled) => RequestState::Cancelled,
            Err(ErrorKind::Destroyed) => RequestState::Destroyed,
            Err(e) => RequestState::Failed(e),
        };
        if self.advance(terminal).is_err() {
            self.state = terminal;
        }
        trace!(
            target: LOG_TARGET,
            "Request {} ({:?}) finished: {:?}", self.request_id, self.kind, outcome
        );
        if let Some(callback) = self.completion.take() {
            callback(self.request_id, outcome);
        }
    }

    /// Releases the record without invoking its callback.
    pub fn dispose(self) {
        trace!(target: LOG_TARGET, "Request {} ({:?}) disposed", self.request_id, self.kind);
    }
}

impl fmt::Debug for OutstandingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutstandingRequest")
            .field("kind", &self.kind)
            .field("request_id", &self.request_id)
            .field("server_object_id", &self.server_object_id)
            .field("state", &self.state)
            .field("tracked", &self.tracked)
            .field("has_stream", &self.stream.is_some())
            .field("has_file", &self.file.is_some())
            .field("pending_error", &self.pending_error)
            .finish()
    }
}
