//! Client side of the sound server: a threaded event loop driving one context.
//!
//! Everything the loop thread touches lives in [`LoopCtx`], guarded by the loop
//! lock. Callers take the lock with [`Mainloop::lock`], submit requests and
//! block in [`LoopGuard::wait`] until the loop thread signals a change. All
//! callbacks run on the loop thread with the lock held; work that must run
//! without it is queued with [`LoopCtx::defer`].

use super::daemon::{ClientSender, ServerLink};
use super::error::ServerError;
use super::protocol::{
    ContextState, Reply, Request, ServerMessage, StreamDirection, StreamId, StreamState,
    SubscriptionEvent, SubscriptionMask, Tag, UpdateMode,
};
use crate::proplist::Proplist;
use crate::sound::{SampleSpec, Volume};
use bytes::Bytes;
use crossbeam_channel::{never, select, unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, trace, warn};

const LOG_TARGET: &str = "r_chime::server::mainloop";

pub type ReplyCallback = Box<dyn FnOnce(&mut LoopCtx, Result<Reply, ServerError>) + Send>;
pub type ContextStateCallback = Box<dyn FnMut(&mut LoopCtx) + Send>;
pub type SubscribeCallback = Box<dyn FnMut(&mut LoopCtx, SubscriptionEvent) + Send>;
pub type StreamStateCallback = Box<dyn FnMut(&mut LoopCtx, StreamId) + Send>;
/// Receives the number of bytes the server currently accepts.
pub type StreamWriteCallback = Box<dyn FnMut(&mut LoopCtx, StreamId, usize) + Send>;
pub type Deferred = Box<dyn FnOnce() + Send>;

const OP_RUNNING: u8 = 0;
const OP_DONE: u8 = 1;
const OP_CANCELLED: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationState {
    Running,
    Done,
    Cancelled,
}

/// Handle on a submitted request. Poll [`Operation::state`] under the loop lock.
#[derive(Debug)]
pub struct Operation {
    tag: Tag,
    state: Arc<AtomicU8>,
}

impl Operation {
    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn state(&self) -> OperationState {
        match self.state.load(Ordering::Acquire) {
            OP_RUNNING => OperationState::Running,
            OP_DONE => OperationState::Done,
            _ => OperationState::Cancelled,
        }
    }

    /// Drops the pending callback. The reply, if it still arrives, is ignored.
    pub fn cancel(&self, ctx: &mut LoopCtx) {
        if ctx.ops.remove(&self.tag).is_some() {
            self.state.store(OP_CANCELLED, Ordering::Release);
        }
    }
}

struct PendingOp {
    state: Arc<AtomicU8>,
    callback: Option<ReplyCallback>,
}

struct StreamSlot {
    name: String,
    spec: SampleSpec,
    props: Proplist,
    state: StreamState,
    index: Option<u32>,
    errno: u32,
    writable: usize,
    state_cb: Option<StreamStateCallback>,
    write_cb: Option<StreamWriteCallback>,
}

enum Control {
    Release(StreamId),
    Quit,
}

/// Exclusive owner of one client stream. Dropping it releases the stream on
/// the loop thread.
#[derive(Debug)]
pub struct StreamHandle {
    id: StreamId,
    control: Sender<Control>,
}

impl StreamHandle {
    pub fn id(&self) -> StreamId {
        self.id
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        trace!(target: LOG_TARGET, "Releasing stream {:?}", self.id);
        let _ = self.control.send(Control::Release(self.id));
    }
}

/// State shared between the loop thread and lock holders.
pub struct LoopCtx {
    link: ClientSender,
    control: Sender<Control>,
    state: ContextState,
    errno: u32,
    next_tag: Tag,
    next_stream: u32,
    ops: HashMap<Tag, PendingOp>,
    streams: HashMap<StreamId, StreamSlot>,
    state_cb: Option<ContextStateCallback>,
    subscribe_cb: Option<SubscribeCallback>,
    deferred: Vec<Deferred>,
}

impl LoopCtx {
    fn new(link: ClientSender, control: Sender<Control>) -> Self {
        LoopCtx {
            link,
            control,
            state: ContextState::Unconnected,
            errno: 0,
            next_tag: 1,
            next_stream: 1,
            ops: HashMap::new(),
            streams: HashMap::new(),
            state_cb: None,
            subscribe_cb: None,
            deferred: Vec::new(),
        }
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Last error code reported for this context, `0` if none.
    pub fn errno(&self) -> u32 {
        self.errno
    }

    pub fn set_state_callback(&mut self, cb: ContextStateCallback) {
        self.state_cb = Some(cb);
    }

    pub fn set_subscribe_callback(&mut self, cb: SubscribeCallback) {
        self.subscribe_cb = Some(cb);
    }

    /// Queues `job` to run once the loop lock has been released.
    pub fn defer(&mut self, job: impl FnOnce() + Send + 'static) {
        self.deferred.push(Box::new(job));
    }

    pub fn connect(&mut self, props: &Proplist) -> Result<(), ServerError> {
        if self.state != ContextState::Unconnected {
            return Err(ServerError::BadState);
        }
        self.send(Request::Hello {
            props: props.clone(),
        })?;
        self.state = ContextState::Connecting;
        self.fire_state_callback();
        Ok(())
    }

    /// Closes the connection from the client side. Pending callbacks are dropped
    /// without being invoked and every live stream fails with `Killed`, so a
    /// waiter never mistakes teardown for a finished upload.
    pub fn disconnect(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        debug!(target: LOG_TARGET, "Disconnecting context");
        let _ = self.link.send(Request::Goodbye);
        self.state = ContextState::Terminated;
        if self.errno == 0 {
            self.errno = ServerError::Killed.code();
        }
        for (_, op) in self.ops.drain() {
            op.state.store(OP_CANCELLED, Ordering::Release);
        }
        for slot in self.streams.values_mut() {
            if !slot.state.is_terminal() {
                slot.state = StreamState::Failed;
                slot.errno = ServerError::Killed.code();
            }
        }
    }

    fn ensure_ready(&self) -> Result<(), ServerError> {
        if self.state == ContextState::Ready {
            Ok(())
        } else {
            Err(ServerError::BadState)
        }
    }

    fn send(&mut self, request: Request) -> Result<(), ServerError> {
        self.link.send(request).map_err(|e| {
            self.errno = e.code();
            e
        })
    }

    fn submit(
        &mut self,
        callback: ReplyCallback,
        build: impl FnOnce(Tag) -> Request,
    ) -> Result<Operation, ServerError> {
        self.ensure_ready()?;
        let tag = self.next_tag;
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        self.send(build(tag))?;
        let state = Arc::new(AtomicU8::new(OP_RUNNING));
        self.ops.insert(
            tag,
            PendingOp {
                state: Arc::clone(&state),
                callback: Some(callback),
            },
        );
        Ok(Operation { tag, state })
    }

    /// Plays a cached sample. Replies with the new sink input index.
    pub fn play_sample(
        &mut self,
        name: &str,
        device: Option<&str>,
        volume: Option<Volume>,
        props: &Proplist,
        callback: ReplyCallback,
    ) -> Result<Operation, ServerError> {
        self.submit(callback, |tag| Request::PlaySample {
            tag,
            name: name.to_string(),
            device: device.map(str::to_string),
            volume,
            props: props.clone(),
        })
    }

    pub fn kill_sink_input(
        &mut self,
        index: u32,
        callback: ReplyCallback,
    ) -> Result<Operation, ServerError> {
        self.submit(callback, |tag| Request::KillSinkInput { tag, index })
    }

    pub fn subscribe(
        &mut self,
        mask: SubscriptionMask,
        callback: ReplyCallback,
    ) -> Result<Operation, ServerError> {
        self.submit(callback, |tag| Request::Subscribe { tag, mask })
    }

    pub fn update_proplist(
        &mut self,
        mode: UpdateMode,
        props: &Proplist,
        callback: ReplyCallback,
    ) -> Result<Operation, ServerError> {
        self.submit(callback, |tag| Request::UpdateProplist {
            tag,
            mode,
            props: props.clone(),
        })
    }

    pub fn stream_new(
        &mut self,
        name: &str,
        spec: SampleSpec,
        props: &Proplist,
    ) -> Result<StreamHandle, ServerError> {
        self.ensure_ready()?;
        if !spec.is_valid() {
            return Err(ServerError::Invalid);
        }
        let id = StreamId(self.next_stream);
        self.next_stream = self.next_stream.wrapping_add(1);
        self.streams.insert(
            id,
            StreamSlot {
                name: name.to_string(),
                spec,
                props: props.clone(),
                state: StreamState::Unconnected,
                index: None,
                errno: 0,
                writable: 0,
                state_cb: None,
                write_cb: None,
            },
        );
        Ok(StreamHandle {
            id,
            control: self.control.clone(),
        })
    }

    pub fn set_stream_state_callback(&mut self, stream: StreamId, cb: StreamStateCallback) {
        if let Some(slot) = self.streams.get_mut(&stream) {
            slot.state_cb = Some(cb);
        }
    }

    pub fn set_stream_write_callback(&mut self, stream: StreamId, cb: StreamWriteCallback) {
        if let Some(slot) = self.streams.get_mut(&stream) {
            slot.write_cb = Some(cb);
        }
    }

    fn connect_stream(
        &mut self,
        stream: StreamId,
        device: Option<&str>,
        direction: StreamDirection,
    ) -> Result<(), ServerError> {
        self.ensure_ready()?;
        let slot = self.streams.get(&stream).ok_or(ServerError::NoEntity)?;
        if slot.state != StreamState::Unconnected {
            return Err(ServerError::BadState);
        }
        let request = Request::CreateStream {
            stream,
            name: slot.name.clone(),
            spec: slot.spec,
            props: slot.props.clone(),
            device: device.map(str::to_string),
            direction,
        };
        self.send(request)?;
        if let Some(slot) = self.streams.get_mut(&stream) {
            slot.state = StreamState::Creating;
        }
        self.fire_stream_state(stream);
        Ok(())
    }

    pub fn connect_playback(
        &mut self,
        stream: StreamId,
        device: Option<&str>,
    ) -> Result<(), ServerError> {
        self.connect_stream(stream, device, StreamDirection::Playback)
    }

    pub fn connect_upload(&mut self, stream: StreamId, length: usize) -> Result<(), ServerError> {
        self.connect_stream(stream, None, StreamDirection::Upload { length })
    }

    /// `Terminated` for streams that were released.
    pub fn stream_state(&self, stream: StreamId) -> StreamState {
        self.streams
            .get(&stream)
            .map_or(StreamState::Terminated, |s| s.state)
    }

    pub fn stream_index(&self, stream: StreamId) -> Option<u32> {
        self.streams.get(&stream).and_then(|s| s.index)
    }

    pub fn stream_errno(&self, stream: StreamId) -> u32 {
        self.streams.get(&stream).map_or(0, |s| s.errno)
    }

    pub fn writable_size(&self, stream: StreamId) -> usize {
        self.streams.get(&stream).map_or(0, |s| s.writable)
    }

    pub fn write(&mut self, stream: StreamId, data: Bytes) -> Result<(), ServerError> {
        let slot = self.streams.get_mut(&stream).ok_or(ServerError::NoEntity)?;
        if slot.state != StreamState::Ready {
            return Err(ServerError::BadState);
        }
        slot.writable = slot.writable.saturating_sub(data.len());
        self.send(Request::Write { stream, data })
    }

    pub fn finish_upload(&mut self, stream: StreamId) -> Result<(), ServerError> {
        let slot = self.streams.get(&stream).ok_or(ServerError::NoEntity)?;
        if slot.state != StreamState::Ready {
            return Err(ServerError::BadState);
        }
        self.send(Request::FinishUpload { stream })
    }

    /// Replies once everything written so far has been played.
    pub fn drain(
        &mut self,
        stream: StreamId,
        callback: ReplyCallback,
    ) -> Result<Operation, ServerError> {
        let slot = self.streams.get(&stream).ok_or(ServerError::NoEntity)?;
        if slot.state != StreamState::Ready {
            return Err(ServerError::BadState);
        }
        self.submit(callback, |tag| Request::Drain { tag, stream })
    }

    /// Tears the stream down without invoking its callbacks.
    pub fn disconnect_stream(&mut self, stream: StreamId) {
        let Some(slot) = self.streams.get_mut(&stream) else {
            return;
        };
        let was_live = matches!(slot.state, StreamState::Creating | StreamState::Ready);
        if !slot.state.is_terminal() {
            slot.state = StreamState::Terminated;
        }
        if was_live {
            let _ = self.link.send(Request::DeleteStream { stream });
        }
    }

    fn release_stream(&mut self, stream: StreamId) {
        if let Some(slot) = self.streams.remove(&stream) {
            trace!(target: LOG_TARGET, "Stream {:?} released in state {:?}", stream, slot.state);
            if matches!(slot.state, StreamState::Creating | StreamState::Ready) {
                let _ = self.link.send(Request::DeleteStream { stream });
            }
        }
    }

    fn fire_state_callback(&mut self) {
        if let Some(mut cb) = self.state_cb.take() {
            cb(self);
            if self.state_cb.is_none() {
                self.state_cb = Some(cb);
            }
        }
    }

    fn fire_stream_state(&mut self, stream: StreamId) {
        let Some(mut cb) = self.streams.get_mut(&stream).and_then(|s| s.state_cb.take()) else {
            return;
        };
        cb(self, stream);
        if let Some(slot) = self.streams.get_mut(&stream) {
            if slot.state_cb.is_none() {
                slot.state_cb = Some(cb);
            }
        }
    }

    fn fire_stream_write(&mut self, stream: StreamId, writable: usize) {
        let Some(mut cb) = self.streams.get_mut(&stream).and_then(|s| s.write_cb.take()) else {
            return;
        };
        cb(self, stream, writable);
        if let Some(slot) = self.streams.get_mut(&stream) {
            if slot.write_cb.is_none() {
                slot.write_cb = Some(cb);
            }
        }
    }

    fn set_context_state(&mut self, state: ContextState, error: Option<ServerError>) {
        if self.state.is_terminal() {
            return;
        }
        debug!(target: LOG_TARGET, "Context state {:?} -> {:?} ({:?})", self.state, state, error);
        self.state = state;
        if let Some(e) = error {
            self.errno = e.code();
        }

        if state.is_terminal() {
            let err = error.unwrap_or(ServerError::ConnectionTerminated);
            if self.errno == 0 {
                self.errno = err.code();
            }
            let ops: Vec<PendingOp> = self.ops.drain().map(|(_, op)| op).collect();
            for mut op in ops {
                op.state.store(OP_DONE, Ordering::Release);
                if let Some(cb) = op.callback.take() {
                    cb(self, Err(err));
                }
            }
            let ids: Vec<StreamId> = self.streams.keys().copied().collect();
            for id in ids {
                let Some(slot) = self.streams.get_mut(&id) else {
                    continue;
                };
                if slot.state.is_terminal() {
                    continue;
                }
                slot.state = StreamState::Failed;
                slot.errno = err.code();
                self.fire_stream_state(id);
            }
        }
        self.fire_state_callback();
    }

    fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ContextState(state, error) => self.set_context_state(state, error),
            ServerMessage::Reply { tag, result } => {
                let Some(mut op) = self.ops.remove(&tag) else {
                    trace!(target: LOG_TARGET, "Reply for unknown tag {}", tag);
                    return;
                };
                if let Err(e) = result {
                    self.errno = e.code();
                }
                op.state.store(OP_DONE, Ordering::Release);
                if let Some(cb) = op.callback.take() {
                    cb(self, result);
                }
            }
            ServerMessage::StreamState {
                stream,
                state,
                index,
                error,
            } => {
                let Some(slot) = self.streams.get_mut(&stream) else {
                    return;
                };
                if slot.state.is_terminal() {
                    return;
                }
                slot.state = state;
                if index.is_some() {
                    slot.index = index;
                }
                if let Some(e) = error {
                    slot.errno = e.code();
                    self.errno = e.code();
                }
                self.fire_stream_state(stream);
            }
            ServerMessage::StreamRequest { stream, bytes } => {
                let Some(slot) = self.streams.get_mut(&stream) else {
                    return;
                };
                if slot.state != StreamState::Ready {
                    return;
                }
                slot.writable += bytes;
                let writable = slot.writable;
                self.fire_stream_write(stream, writable);
            }
            ServerMessage::Subscription(event) => {
                if self.state.is_terminal() {
                    return;
                }
                if let Some(mut cb) = self.subscribe_cb.take() {
                    cb(self, event);
                    if self.subscribe_cb.is_none() {
                        self.subscribe_cb = Some(cb);
                    }
                }
            }
        }
    }
}

struct Shared {
    ctx: Mutex<LoopCtx>,
    cond: Condvar,
    thread_id: OnceLock<ThreadId>,
}

/// Exclusive access to the loop state. Deferred jobs run when it is dropped,
/// after the lock has been released.
pub struct LoopGuard<'a> {
    guard: MutexGuard<'a, LoopCtx>,
    cond: &'a Condvar,
}

impl<'a> LoopGuard<'a> {
    /// Releases the lock until the loop thread signals, then re-acquires it.
    pub fn wait(&mut self) {
        self.cond.wait(&mut self.guard);
    }

    pub fn signal(&self) {
        self.cond.notify_all();
    }
}

impl Deref for LoopGuard<'_> {
    type Target = LoopCtx;

    fn deref(&self) -> &LoopCtx {
        &self.guard
    }
}

impl DerefMut for LoopGuard<'_> {
    fn deref_mut(&mut self) -> &mut LoopCtx {
        &mut self.guard
    }
}

impl Drop for LoopGuard<'_> {
    fn drop(&mut self) {
        loop {
            let jobs = std::mem::take(&mut self.guard.deferred);
            if jobs.is_empty() {
                break;
            }
            MutexGuard::unlocked(&mut self.guard, || {
                for job in jobs {
                    job();
                }
            });
        }
    }
}

/// Background thread delivering server messages to a [`LoopCtx`].
pub struct Mainloop {
    shared: Arc<Shared>,
    control: Sender<Control>,
    pending: Mutex<Option<(Receiver<ServerMessage>, Receiver<Control>)>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Mainloop {
    pub fn new(link: ServerLink) -> Self {
        let (sender, events) = link.into_parts();
        let (control, control_rx) = unbounded();
        Mainloop {
            shared: Arc::new(Shared {
                ctx: Mutex::new(LoopCtx::new(sender, control.clone())),
                cond: Condvar::new(),
                thread_id: OnceLock::new(),
            }),
            control,
            pending: Mutex::new(Some((events, control_rx))),
            thread: Mutex::new(None),
        }
    }

    pub fn lock(&self) -> LoopGuard<'_> {
        LoopGuard {
            guard: self.shared.ctx.lock(),
            cond: &self.shared.cond,
        }
    }

    /// Spawns the loop thread. May be called while holding the loop lock.
    pub fn start(&self) -> Result<(), ServerError> {
        let (events, control_rx) = self.pending.lock().take().ok_or(ServerError::BadState)?;
        let shared = Arc::clone(&self.shared);
        let handle = thread::Builder::new()
            .name("chime-mainloop".to_string())
            .spawn(move || run(shared, events, control_rx))
            .map_err(|e| {
                warn!(target: LOG_TARGET, "Failed to spawn event loop thread: {}", e);
                ServerError::Internal
            })?;
        let _ = self.shared.thread_id.set(handle.thread().id());
        *self.thread.lock() = Some(handle);
        Ok(())
    }

    pub fn in_loop_thread(&self) -> bool {
        self.shared
            .thread_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }

    /// Stops the loop thread. From the loop thread itself this only requests exit.
    /// Must not be called while holding the loop lock.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Quit);
        if self.in_loop_thread() {
            return;
        }
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                warn!(target: LOG_TARGET, "Event loop thread panicked");
            }
        }
    }
}

impl Drop for Mainloop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(shared: Arc<Shared>, events: Receiver<ServerMessage>, control: Receiver<Control>) {
    debug!(target: LOG_TARGET, "Event loop running");
    let lost: Receiver<ServerMessage> = never();
    let mut connected = true;
    loop {
        let source = if connected { &events } else { &lost };
        select! {
            recv(source) -> message => {
                let mut guard = LoopGuard { guard: shared.ctx.lock(), cond: &shared.cond };
                match message {
                    Ok(message) => guard.dispatch(message),
                    Err(_) => {
                        warn!(target: LOG_TARGET, "Server connection lost");
                        connected = false;
                        guard.set_context_state(
                            ContextState::Failed,
                            Some(ServerError::ConnectionTerminated),
                        );
                    }
                }
                guard.signal();
            }
            recv(control) -> command => match command {
                Ok(Control::Release(stream)) => {
                    let mut guard = LoopGuard { guard: shared.ctx.lock(), cond: &shared.cond };
                    guard.release_stream(stream);
                    guard.signal();
                }
                Ok(Control::Quit) | Err(_) => break,
            },
        }
    }
    debug!(target: LOG_TARGET, "Event loop exited");
}
