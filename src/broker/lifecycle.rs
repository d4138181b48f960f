//! Drives requests from submission to their terminal outcome.
//!
//! The issuing thread owns a record until it is tracked. After that only the
//! event-loop callbacks built here, cancellation and teardown may take it, and
//! whichever removes it from the registry first delivers its outcome.

use super::connection::ConnectionHandle;
use super::registry::{OutstandingRegistry, RequestKey};
use super::request::{FinishCallback, OutstandingRequest, RequestKind, RequestState, Resolution};
use super::subscription::SubscriptionGate;
use super::translate::{errno_kind, translate};
use crate::error::{ErrorKind, Result};
use crate::proplist::{self, Proplist};
use crate::server::{
    ContextState, ContextStateCallback, EventKind, Facility, LoopCtx, OperationState, Reply,
    ReplyCallback, ServerError, StreamId, StreamState, StreamStateCallback, StreamWriteCallback,
    SubscribeCallback,
};
use crate::sound::{SoundFile, SoundResolver, ThemeState, Volume};
use bytes::Bytes;
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "r_chime::broker::lifecycle";

/// Play-sample submissions per request before falling back to streaming.
pub const MAX_PLAY_ATTEMPTS: u32 = 3;

/// Whether a sample missing from the server cache may be uploaded on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheControl {
    Never,
    Permanent,
    Volatile,
}

impl FromStr for CacheControl {
    type Err = ErrorKind;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "never" => Ok(CacheControl::Never),
            "permanent" => Ok(CacheControl::Permanent),
            "volatile" => Ok(CacheControl::Volatile),
            _ => Err(ErrorKind::Invalid),
        }
    }
}

/// Parses a decibel string such as `"-6.5"`.
pub fn parse_volume(value: &str) -> Result<Volume> {
    let db: f64 = value.trim().parse().map_err(|_| ErrorKind::Invalid)?;
    // -inf is silence; anything else must be finite.
    if db.is_nan() || db == f64::INFINITY {
        return Err(ErrorKind::Invalid);
    }
    Ok(Volume::from_db(db))
}

/// What a play or cache request sends to the server.
#[derive(Debug, Clone)]
pub(super) struct RequestParams {
    pub name: String,
    pub volume: Option<Volume>,
    pub cache_control: Option<CacheControl>,
    /// Event properties without the reserved namespace.
    pub props: Proplist,
}

impl RequestParams {
    pub fn from_event(event: &Proplist) -> Result<Self> {
        let name = event
            .gets(proplist::EVENT_ID)
            .filter(|id| !id.is_empty())
            .ok_or(ErrorKind::Invalid)?
            .to_string();
        let volume = match event.get(proplist::VOLUME) {
            Some(_) => Some(parse_volume(
                event.gets(proplist::VOLUME).ok_or(ErrorKind::Invalid)?,
            )?),
            None => None,
        };
        let cache_control = match event.get(proplist::CACHE_CONTROL) {
            Some(_) => Some(
                event
                    .gets(proplist::CACHE_CONTROL)
                    .ok_or(ErrorKind::Invalid)?
                    .parse::<CacheControl>()?,
            ),
            None => None,
        };
        let props = event.strip_internal();
        Ok(RequestParams {
            name,
            volume,
            cache_control,
            props,
        })
    }
}

/// Borrowed view of a session for the duration of one request.
pub(super) struct Lifecycle<'a> {
    pub connection: &'a ConnectionHandle,
    pub registry: &'a Arc<OutstandingRegistry>,
    pub gate: &'a SubscriptionGate,
    pub resolver: &'a dyn SoundResolver,
    pub theme: &'a Mutex<ThemeState>,
    pub base: Proplist,
    pub device: Option<String>,
}

impl Lifecycle<'_> {
    fn ensure_blocking_allowed(&self) -> Result<()> {
        if self.connection.is_closed() || self.connection.in_loop_thread() {
            return Err(ErrorKind::State);
        }
        Ok(())
    }

    fn lookup(&self, event: &Proplist) -> Result<Box<dyn SoundFile>> {
        let mut theme = self.theme.lock();
        self.resolver.lookup(&mut theme, &self.base, event)
    }

    pub fn play(
        &self,
        request_id: u32,
        event: &Proplist,
        completion: Option<FinishCallback>,
    ) -> Result<()> {
        self.ensure_blocking_allowed()?;
        let params = RequestParams::from_event(event)?;

        if completion.is_some() {
            self.connection
                .run_exclusive(|guard| self.gate.ensure(guard))?;
        }

        let record = OutstandingRequest::new(RequestKind::TriggerSample, request_id, completion);
        let key = self.registry.create(record);
        match self.drive_play(key, &params, event) {
            Ok(()) => Ok(()),
            Err(e) => {
                if let Some(record) = self.registry.take_untracked(key) {
                    record.dispose();
                }
                debug!(target: LOG_TARGET, "Request {} failed: {}", request_id, e);
                Err(e)
            }
        }
    }

    fn drive_play(&self, key: RequestKey, params: &RequestParams, event: &Proplist) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match self.submit_play(key, params)? {
                Resolution::Success => return self.settle_sample(key),
                Resolution::Error(e) => return Err(e),
                Resolution::NotFound => {}
            }
            let cache_control = params.cache_control.unwrap_or(CacheControl::Never);
            if cache_control == CacheControl::Never || attempts >= MAX_PLAY_ATTEMPTS {
                break;
            }
            debug!(
                target: LOG_TARGET,
                "Sample {} not cached, uploading (attempt {})", params.name, attempts
            );
            self.cache(event)?;
        }
        debug!(target: LOG_TARGET, "Streaming {} directly", params.name);
        self.direct_stream(key, params, event)
    }

    fn submit_play(&self, key: RequestKey, params: &RequestParams) -> Result<Resolution> {
        self.registry
            .with(key, |r| {
                r.pending_error = None;
                r.advance(RequestState::Submitted)
            })
            .unwrap_or(Err(ErrorKind::Destroyed))?;

        self.connection.run_exclusive(|guard| {
            let registry = Arc::clone(self.registry);
            let callback: ReplyCallback = Box::new(move |_ctx, result| {
                let result = match result {
                    Ok(Reply::Index(index)) => Ok(index),
                    Ok(Reply::Ack) => Err(ErrorKind::IO),
                    Err(e) => Err(translate(e)),
                };
                registry.with(key, |r| r.resolve(result));
            });
            let op = guard
                .play_sample(
                    &params.name,
                    self.device.as_deref(),
                    params.volume,
                    &params.props,
                    callback,
                )
                .map_err(|e| submit_error(&**guard, e))?;
            while op.state() == OperationState::Running {
                guard.wait();
            }
            if op.state() == OperationState::Cancelled {
                return Err(ErrorKind::Destroyed);
            }
            Ok(())
        })?;

        match self.registry.with(key, |r| r.state()) {
            Some(RequestState::Resolved(resolution)) => Ok(resolution),
            Some(_) => Err(ErrorKind::State),
            None => Err(ErrorKind::Destroyed),
        }
    }

    /// A sample is playing. Track it if someone waits for its end.
    fn settle_sample(&self, key: RequestKey) -> Result<()> {
        if !self.registry.with(key, |r| r.has_completion()).unwrap_or(false) {
            if let Some(record) = self.registry.take_untracked(key) {
                record.dispose();
            }
            return Ok(());
        }
        // Under the loop lock no removal event or teardown can slip in between the check and tracking.
        let finished = self.connection.run_exclusive(|guard| {
            if guard.state().is_terminal() {
                return Err(ErrorKind::Destroyed);
            }
            let early = self.registry.with(key, |r| r.early_finish).unwrap_or(false);
            if early {
                Ok(self.registry.take_untracked(key))
            } else {
                self.registry.track(key);
                Ok(None)
            }
        })?;
        if let Some(record) = finished {
            trace!(target: LOG_TARGET, "Sample finished before it was tracked");
            record.complete(Ok(()));
        }
        Ok(())
    }

    fn direct_stream(&self, key: RequestKey, params: &RequestParams, event: &Proplist) -> Result<()> {
        let file = self.lookup(event)?;
        let spec = file.spec();
        self.registry
            .with(key, |r| {
                r.kind = RequestKind::DirectStream;
                r.file = Some(file);
                r.volume = params.volume.filter(|v| !v.is_norm());
                r.advance(RequestState::StreamConnecting)
            })
            .unwrap_or(Err(ErrorKind::Destroyed))?;

        self.connection.run_exclusive(|guard| {
            let stream = guard
                .stream_new(&params.name, spec, &params.props)
                .map_err(|e| submit_error(&**guard, e))?;
            let id = stream.id();
            guard.set_stream_state_callback(id, stream_state_callback(Arc::clone(self.registry), key));
            guard.set_stream_write_callback(id, stream_write_callback(Arc::clone(self.registry), key));
            self.registry.with(key, |r| r.stream = Some(stream));

            guard
                .connect_playback(id, self.device.as_deref())
                .map_err(|e| submit_error(&**guard, e))?;

            loop {
                let Some(pending) = self.registry.with(key, |r| r.pending_error) else {
                    // Already drained and delivered by the loop thread.
                    return Ok(());
                };
                match guard.stream_state(id) {
                    StreamState::Ready => break,
                    StreamState::Failed => return Err(stream_error(&**guard, id)),
                    StreamState::Terminated => return Err(pending.unwrap_or(ErrorKind::Destroyed)),
                    StreamState::Unconnected | StreamState::Creating => guard.wait(),
                }
            }

            if guard.state().is_terminal() {
                return Err(submit_error(&**guard, ServerError::Killed));
            }
            let index = guard
                .stream_index(id)
                .ok_or_else(|| errno_kind(guard.errno()))?;
            self.registry.with(key, |r| {
                r.server_object_id.get_or_insert(index);
            });
            self.registry.track(key);
            trace!(target: LOG_TARGET, "Streaming {} as sink input {}", params.name, index);
            Ok(())
        })
    }

    /// Uploads the event's sound into the server cache and waits for it to land.
    pub fn cache(&self, event: &Proplist) -> Result<()> {
        self.ensure_blocking_allowed()?;
        let params = RequestParams::from_event(event)?;
        if params.cache_control.unwrap_or(CacheControl::Permanent) == CacheControl::Never {
            return Err(ErrorKind::Invalid);
        }

        let file = self.lookup(event)?;
        let spec = file.spec();
        let length = file.byte_len();
        let mut record = OutstandingRequest::new(RequestKind::CacheUpload, 0, None);
        record.file = Some(file);
        let key = self.registry.create(record);

        let result = self.connection.run_exclusive(|guard| {
            let stream = guard
                .stream_new(&params.name, spec, &params.props)
                .map_err(|e| submit_error(&**guard, e))?;
            let id = stream.id();
            guard.set_stream_state_callback(id, stream_state_callback(Arc::clone(self.registry), key));
            guard.set_stream_write_callback(id, stream_write_callback(Arc::clone(self.registry), key));
            self.registry.with(key, |r| {
                r.stream = Some(stream);
                r.advance(RequestState::StreamConnecting)
            });

            guard
                .connect_upload(id, length)
                .map_err(|e| submit_error(&**guard, e))?;

            loop {
                match guard.stream_state(id) {
                    StreamState::Terminated if guard.state().is_terminal() => {
                        return Err(submit_error(&**guard, ServerError::Killed));
                    }
                    StreamState::Terminated => {
                        let pending = self.registry.with(key, |r| r.pending_error).flatten();
                        return pending.map_or(Ok(()), Err);
                    }
                    StreamState::Failed => return Err(stream_error(&**guard, id)),
                    _ => guard.wait(),
                }
            }
        });

        if let Some(mut record) = self.registry.take_untracked(key) {
            if result.is_ok() {
                let _ = record.advance(RequestState::Completed);
            }
            record.dispose();
        }
        match result {
            Ok(()) => debug!(target: LOG_TARGET, "Cached {} ({} bytes)", params.name, length),
            Err(e) => warn!(target: LOG_TARGET, "Uploading {} failed: {}", params.name, e),
        }
        result
    }
}

/// Kills every tracked playback of `request_id` that has a server-side handle.
pub(super) fn cancel(
    connection: &ConnectionHandle,
    registry: &OutstandingRegistry,
    request_id: u32,
) -> Result<()> {
    if connection.is_closed() {
        return Err(ErrorKind::State);
    }
    let (cancelled, first_error) = connection.run_exclusive(|guard| {
        let matched = registry.remove_if(|r| {
            r.kind != RequestKind::CacheUpload
                && r.request_id == request_id
                && r.server_object_id.is_some()
        });
        let mut first_error = None;
        for index in matched.iter().filter_map(|r| r.server_object_id) {
            if let Err(e) = guard.kill_sink_input(index, Box::new(|_, _| {})) {
                let error = submit_error(&**guard, e);
                first_error.get_or_insert(error);
            }
        }
        (matched, first_error)
    });

    debug!(
        target: LOG_TARGET,
        "Cancelled {} requests with id {}", cancelled.len(), request_id
    );
    for record in cancelled {
        record.complete(Err(ErrorKind::Canceled));
    }
    first_error.map_or(Ok(()), Err)
}

/// Error for a failed submission, preferring what the context last reported.
fn submit_error(ctx: &LoopCtx, error: ServerError) -> ErrorKind {
    if ctx.state().is_terminal() && ctx.errno() != 0 {
        errno_kind(ctx.errno())
    } else {
        translate(error)
    }
}

fn stream_error(ctx: &LoopCtx, stream: StreamId) -> ErrorKind {
    match ctx.stream_errno(stream) {
        0 => errno_kind(ctx.errno()),
        code => errno_kind(code),
    }
}

/// Drains the registry when the connection dies.
pub(super) fn context_state_callback(registry: Arc<OutstandingRegistry>) -> ContextStateCallback {
    Box::new(move |ctx| {
        if !matches!(ctx.state(), ContextState::Failed | ContextState::Terminated) {
            return;
        }
        let error = errno_kind(ctx.errno());
        let mut failed = 0;
        while let Some(record) = registry.pop_tracked() {
            ctx.defer(move || record.complete(Err(error)));
            failed += 1;
        }
        warn!(
            target: LOG_TARGET,
            "Connection lost ({}), failing {} requests", error, failed
        );
    })
}

/// Completes sample triggers whose sink input went away.
pub(super) fn subscribe_callback(registry: Arc<OutstandingRegistry>) -> SubscribeCallback {
    Box::new(move |ctx, event| {
        if event.facility != Facility::SinkInput || event.kind != EventKind::Remove {
            return;
        }
        let finished = registry.remove_if(|r| {
            r.kind == RequestKind::TriggerSample && r.server_object_id == Some(event.index)
        });
        if finished.is_empty() {
            registry.note_removed(event.index);
            return;
        }
        for record in finished {
            ctx.defer(move || record.complete(Ok(())));
        }
    })
}

fn stream_state_callback(registry: Arc<OutstandingRegistry>, key: RequestKey) -> StreamStateCallback {
    Box::new(move |ctx, stream| match ctx.stream_state(stream) {
        StreamState::Ready => {
            registry.with(key, |r| {
                if r.state() == RequestState::StreamConnecting {
                    let _ = r.advance(RequestState::StreamReady);
                }
            });
        }
        state @ (StreamState::Failed | StreamState::Terminated) => {
            let Some(record) = registry.remove_tracked(key) else {
                return;
            };
            let outcome = if state == StreamState::Failed {
                Err(stream_error(ctx, stream))
            } else {
                Err(ErrorKind::Destroyed)
            };
            ctx.defer(move || record.complete(outcome));
        }
        StreamState::Unconnected | StreamState::Creating => {}
    })
}

enum Step {
    Data(Bytes),
    EndOfData(RequestKind),
    Idle,
}

/// Pulls the next frame-aligned chunk from the record's sound source.
fn next_step(record: &mut OutstandingRequest, writable: usize) -> Result<Step> {
    if record.state() == RequestState::Draining {
        return Ok(Step::Idle);
    }
    let (kind, written) = (record.kind, record.written);
    let Some(file) = record.file.as_mut() else {
        return Err(ErrorKind::State);
    };
    let spec = file.spec();
    let frame = spec.frame_size().max(1);
    let max = writable - writable % frame;

    // An upload is finished once its declared length is written; no further write requests follow.
    let chunk = if kind == RequestKind::CacheUpload && written >= file.byte_len() {
        Bytes::new()
    } else if max == 0 {
        return Ok(Step::Idle);
    } else {
        file.read_chunk(max)?
    };

    if record.state() == RequestState::StreamConnecting {
        let _ = record.advance(RequestState::StreamReady);
    }
    if chunk.is_empty() {
        let _ = record.advance(RequestState::Draining);
        return Ok(Step::EndOfData(record.kind));
    }
    let _ = record.advance(RequestState::Writing);
    record.written += chunk.len();
    match record.volume {
        Some(volume) if record.kind == RequestKind::DirectStream => {
            Ok(Step::Data(Bytes::from(volume.apply(spec.format, &chunk))))
        }
        _ => Ok(Step::Data(chunk)),
    }
}

fn pump(
    ctx: &mut LoopCtx,
    registry: &Arc<OutstandingRegistry>,
    key: RequestKey,
    stream: StreamId,
) -> Result<()> {
    loop {
        let writable = ctx.writable_size(stream);
        let Some(step) = registry.with(key, |r| next_step(r, writable)) else {
            return Ok(());
        };
        match step? {
            Step::Data(chunk) => ctx.write(stream, chunk).map_err(|e| submit_error(&*ctx, e))?,
            Step::EndOfData(RequestKind::CacheUpload) => {
                ctx.finish_upload(stream)
                    .map_err(|e| submit_error(&*ctx, e))?;
                return Ok(());
            }
            Step::EndOfData(_) => {
                ctx.drain(stream, drain_callback(Arc::clone(registry), key))
                    .map_err(|e| submit_error(&*ctx, e))?;
                return Ok(());
            }
            Step::Idle => return Ok(()),
        }
    }
}

fn stream_write_callback(registry: Arc<OutstandingRegistry>, key: RequestKey) -> StreamWriteCallback {
    Box::new(move |ctx, stream, _writable| {
        let Err(error) = pump(ctx, &registry, key, stream) else {
            return;
        };
        match registry.remove_tracked(key) {
            Some(record) => ctx.defer(move || record.complete(Err(error))),
            None => {
                // The issuing thread is still waiting on this stream.
                registry.with(key, |r| r.pending_error = Some(error));
                ctx.disconnect_stream(stream);
            }
        }
    })
}

fn drain_callback(registry: Arc<OutstandingRegistry>, key: RequestKey) -> ReplyCallback {
    Box::new(move |ctx, result| {
        let Some(record) = registry.take(key) else {
            return;
        };
        let outcome = result.map(|_| ()).map_err(translate);
        ctx.defer(move || record.complete(outcome));
    })
}
