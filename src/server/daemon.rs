//! In-process sound server.
//!
//! One daemon thread owns the sample cache, the client table and every playing
//! instance (sink input). Each sink input is rendered by its own player thread
//! into an [`OutputSink`]. Clients talk to it through [`ServerLink`]s.

use super::error::ServerError;
use super::output::{NullOutput, OutputSink};
use super::protocol::{
    ContextState, EventKind, Facility, Reply, Request, ServerMessage, StreamDirection, StreamId,
    StreamState, SubscriptionEvent, SubscriptionMask, Tag, UpdateMode,
};
use crate::proplist::Proplist;
use crate::sound::{SampleSpec, Volume};
use bytes::Bytes;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

const LOG_TARGET: &str = "r_chime::server::daemon";

/// Largest sample accepted into the cache.
pub const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;
/// Bytes a fresh playback stream may write before the first consumption.
pub const DEFAULT_BUFFER_BYTES: usize = 16 * 1024;
const PLAYER_CHUNK_FRAMES: usize = 1024;

pub type ClientId = u64;

pub(crate) enum DaemonMsg {
    Attach {
        client: ClientId,
        events: Sender<ServerMessage>,
    },
    Request {
        client: ClientId,
        request: Request,
    },
    Detach {
        client: ClientId,
    },
    Player {
        index: u32,
        event: PlayerEvent,
    },
    DropClients,
    Shutdown,
}

pub(crate) enum PlayerEvent {
    Consumed(usize),
    Drained(Tag),
    Finished,
    Failed(ServerError),
}

/// Sending half of a client connection. Dropping it detaches the client.
pub struct ClientSender {
    client: ClientId,
    daemon: Sender<DaemonMsg>,
}

impl ClientSender {
    pub fn client_id(&self) -> ClientId {
        self.client
    }

    pub fn send(&self, request: Request) -> Result<(), ServerError> {
        self.daemon
            .send(DaemonMsg::Request {
                client: self.client,
                request,
            })
            .map_err(|_| ServerError::ConnectionTerminated)
    }
}

impl Drop for ClientSender {
    fn drop(&mut self) {
        let _ = self.daemon.send(DaemonMsg::Detach {
            client: self.client,
        });
    }
}

/// A client connection before it is handed to an event loop.
pub struct ServerLink {
    sender: ClientSender,
    events: Receiver<ServerMessage>,
}

impl ServerLink {
    pub fn into_parts(self) -> (ClientSender, Receiver<ServerMessage>) {
        (self.sender, self.events)
    }
}

/// Behaviour knobs of a [`LocalServer`].
#[derive(Clone)]
pub struct ServerConfig {
    /// Answer every connection attempt with `ConnectionRefused`.
    pub refuse_connections: bool,
    /// Store finished uploads in the cache. When false uploads succeed but are forgotten.
    pub retain_uploads: bool,
    pub output: Arc<dyn OutputSink>,
    pub buffer_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            refuse_connections: false,
            retain_uploads: true,
            output: Arc::new(NullOutput::new()),
            buffer_bytes: DEFAULT_BUFFER_BYTES,
        }
    }
}

impl ServerConfig {
    pub fn with_output(output: Arc<dyn OutputSink>) -> Self {
        ServerConfig {
            output,
            ..Self::default()
        }
    }
}

/// Request counters, mostly for tests.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub play_requests: usize,
    pub uploads: usize,
    pub subscribe_requests: usize,
    pub kill_requests: usize,
    pub streams_created: usize,
    pub streams_deleted: usize,
    pub active_sink_inputs: usize,
    /// Property lists received through proplist updates, in arrival order.
    pub proplist_updates: Vec<Proplist>,
}

#[derive(Clone)]
struct CachedSample {
    spec: SampleSpec,
    data: Bytes,
    #[allow(dead_code)]
    props: Proplist,
}

type SampleCache = Arc<Mutex<HashMap<String, CachedSample>>>;

struct ServerInner {
    tx: Sender<DaemonMsg>,
    next_client: AtomicU64,
    stats: Arc<Mutex<ServerStats>>,
    cache: SampleCache,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let _ = self.tx.send(DaemonMsg::Shutdown);
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!(target: LOG_TARGET, "Server thread panicked");
            }
        }
    }
}

/// Handle on a running in-process server. Clones share the same server.
#[derive(Clone)]
pub struct LocalServer {
    inner: Arc<ServerInner>,
}

impl LocalServer {
    pub fn new(config: ServerConfig) -> io::Result<Self> {
        let (tx, rx) = unbounded();
        let stats = Arc::new(Mutex::new(ServerStats::default()));
        let cache: SampleCache = Arc::new(Mutex::new(HashMap::new()));
        let daemon = Daemon {
            config,
            inbox: tx.clone(),
            clients: HashMap::new(),
            cache: Arc::clone(&cache),
            sink_inputs: HashMap::new(),
            streams: HashMap::new(),
            next_index: 0,
            stats: Arc::clone(&stats),
        };
        let handle = thread::Builder::new()
            .name("chime-server".to_string())
            .spawn(move || daemon.run(rx))?;
        info!(target: LOG_TARGET, "Local sound server started");
        Ok(LocalServer {
            inner: Arc::new(ServerInner {
                tx,
                next_client: AtomicU64::new(1),
                stats,
                cache,
                thread: Mutex::new(Some(handle)),
            }),
        })
    }

    /// Opens a new client connection. The context is established by sending `Hello`.
    pub fn attach(&self) -> ServerLink {
        let client = self.inner.next_client.fetch_add(1, Ordering::Relaxed);
        let (events_tx, events) = unbounded();
        let _ = self.inner.tx.send(DaemonMsg::Attach {
            client,
            events: events_tx,
        });
        ServerLink {
            sender: ClientSender {
                client,
                daemon: self.inner.tx.clone(),
            },
            events,
        }
    }

    pub fn stats(&self) -> ServerStats {
        self.inner.stats.lock().clone()
    }

    pub fn has_sample(&self, name: &str) -> bool {
        self.inner.cache.lock().contains_key(name)
    }

    /// Puts a sample straight into the cache.
    pub fn insert_sample(&self, name: &str, spec: SampleSpec, data: Bytes) {
        self.inner.cache.lock().insert(
            name.to_string(),
            CachedSample {
                spec,
                data,
                props: Proplist::new(),
            },
        );
    }

    /// Fails every connected client as if the connection had dropped.
    pub fn drop_clients(&self) {
        let _ = self.inner.tx.send(DaemonMsg::DropClients);
    }

    /// Stops the server thread. Connected clients see their connection terminate.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(DaemonMsg::Shutdown);
        let handle = self.inner.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!(target: LOG_TARGET, "Server thread panicked");
            }
        }
    }
}

struct Client {
    events: Sender<ServerMessage>,
    ready: bool,
    mask: SubscriptionMask,
    props: Proplist,
}

struct SinkInput {
    stop: Arc<AtomicBool>,
    owner: Option<(ClientId, StreamId)>,
    feed: Option<Sender<Feed>>,
}

enum Feed {
    Data(Bytes),
    Drain(Tag),
}

enum ServerStream {
    Upload {
        name: String,
        spec: SampleSpec,
        props: Proplist,
        length: usize,
        data: Vec<u8>,
    },
    Playback {
        index: u32,
    },
}

struct Daemon {
    config: ServerConfig,
    inbox: Sender<DaemonMsg>,
    clients: HashMap<ClientId, Client>,
    cache: SampleCache,
    sink_inputs: HashMap<u32, SinkInput>,
    streams: HashMap<(ClientId, StreamId), ServerStream>,
    next_index: u32,
    stats: Arc<Mutex<ServerStats>>,
}

impl Daemon {
    fn run(mut self, rx: Receiver<DaemonMsg>) {
        while let Ok(msg) = rx.recv() {
            match msg {
                DaemonMsg::Attach { client, events } => {
                    trace!(target: LOG_TARGET, "Client {} attached", client);
                    self.clients.insert(
                        client,
                        Client {
                            events,
                            ready: false,
                            mask: SubscriptionMask::NONE,
                            props: Proplist::new(),
                        },
                    );
                }
                DaemonMsg::Request { client, request } => self.handle_request(client, request),
                DaemonMsg::Detach { client } => self.detach(client),
                DaemonMsg::Player { index, event } => self.handle_player(index, event),
                DaemonMsg::DropClients => {
                    let ids: Vec<ClientId> = self.clients.keys().copied().collect();
                    info!(target: LOG_TARGET, "Dropping {} clients", ids.len());
                    for id in ids {
                        self.send_to(
                            id,
                            ServerMessage::ContextState(
                                ContextState::Failed,
                                Some(ServerError::ConnectionTerminated),
                            ),
                        );
                        self.detach(id);
                    }
                }
                DaemonMsg::Shutdown => break,
            }
        }
        for (_, input) in self.sink_inputs.drain() {
            input.stop.store(true, Ordering::Release);
        }
        self.stats.lock().active_sink_inputs = 0;
        info!(target: LOG_TARGET, "Local sound server stopped");
    }

    fn send_to(&self, client: ClientId, msg: ServerMessage) {
        if let Some(c) = self.clients.get(&client) {
            let _ = c.events.send(msg);
        }
    }

    fn reply(&self, client: ClientId, tag: Tag, result: Result<Reply, ServerError>) {
        self.send_to(client, ServerMessage::Reply { tag, result });
    }

    fn stream_state(
        &self,
        client: ClientId,
        stream: StreamId,
        state: StreamState,
        index: Option<u32>,
        error: Option<ServerError>,
    ) {
        self.send_to(
            client,
            ServerMessage::StreamState {
                stream,
                state,
                index,
                error,
            },
        );
    }

    fn broadcast(&self, kind: EventKind, index: u32) {
        let event = SubscriptionEvent {
            facility: Facility::SinkInput,
            kind,
            index,
        };
        for client in self.clients.values() {
            if client.ready && client.mask.contains(event.facility) {
                let _ = client.events.send(ServerMessage::Subscription(event));
            }
        }
    }

    fn alloc_index(&mut self) -> u32 {
        let index = self.next_index;
        self.next_index = self.next_index.wrapping_add(1);
        index
    }

    fn add_sink_input(&mut self, index: u32, input: SinkInput) {
        self.sink_inputs.insert(index, input);
        self.stats.lock().active_sink_inputs = self.sink_inputs.len();
        self.broadcast(EventKind::New, index);
    }

    fn remove_sink_input(&mut self, index: u32) -> Option<SinkInput> {
        let input = self.sink_inputs.remove(&index)?;
        input.stop.store(true, Ordering::Release);
        self.stats.lock().active_sink_inputs = self.sink_inputs.len();
        self.broadcast(EventKind::Remove, index);
        Some(input)
    }

    fn detach(&mut self, client: ClientId) {
        if self.clients.remove(&client).is_none() {
            return;
        }
        trace!(target: LOG_TARGET, "Client {} detached", client);
        let owned: Vec<(ClientId, StreamId)> = self
            .streams
            .keys()
            .filter(|(c, _)| *c == client)
            .copied()
            .collect();
        for key in owned {
            if let Some(ServerStream::Playback { index }) = self.streams.remove(&key) {
                self.remove_sink_input(index);
            }
            self.stats.lock().streams_deleted += 1;
        }
    }

    fn handle_request(&mut self, client: ClientId, request: Request) {
        match request {
            Request::Hello { props } => {
                if self.config.refuse_connections {
                    debug!(target: LOG_TARGET, "Refusing client {}", client);
                    self.send_to(
                        client,
                        ServerMessage::ContextState(
                            ContextState::Failed,
                            Some(ServerError::ConnectionRefused),
                        ),
                    );
                    self.clients.remove(&client);
                    return;
                }
                if let Some(c) = self.clients.get_mut(&client) {
                    c.ready = true;
                    c.props = props;
                }
                self.send_to(client, ServerMessage::ContextState(ContextState::Ready, None));
            }
            Request::PlaySample {
                tag,
                name,
                device,
                volume,
                props: _,
            } => {
                self.stats.lock().play_requests += 1;
                let sample = self.cache.lock().get(&name).cloned();
                let Some(sample) = sample else {
                    trace!(target: LOG_TARGET, "Sample '{}' not cached", name);
                    self.reply(client, tag, Err(ServerError::NoEntity));
                    return;
                };
                let index = self.alloc_index();
                debug!(
                    target: LOG_TARGET,
                    "Playing sample '{}' as sink input {} (device {:?})", name, index, device
                );
                let stop = Arc::new(AtomicBool::new(false));
                let spawned = self.spawn_player(index, {
                    let output = Arc::clone(&self.config.output);
                    let stop = Arc::clone(&stop);
                    move || play_sample(output.as_ref(), sample, volume.unwrap_or(Volume::NORM), &stop)
                });
                if let Err(e) = spawned {
                    self.reply(client, tag, Err(e));
                    return;
                }
                self.reply(client, tag, Ok(Reply::Index(index)));
                self.add_sink_input(
                    index,
                    SinkInput {
                        stop,
                        owner: None,
                        feed: None,
                    },
                );
            }
            Request::KillSinkInput { tag, index } => {
                self.stats.lock().kill_requests += 1;
                let Some(input) = self.remove_sink_input(index) else {
                    self.reply(client, tag, Err(ServerError::NoEntity));
                    return;
                };
                debug!(target: LOG_TARGET, "Killed sink input {}", index);
                if let Some((owner, stream)) = input.owner {
                    self.streams.remove(&(owner, stream));
                    self.stream_state(
                        owner,
                        stream,
                        StreamState::Failed,
                        None,
                        Some(ServerError::Killed),
                    );
                }
                self.reply(client, tag, Ok(Reply::Ack));
            }
            Request::Subscribe { tag, mask } => {
                self.stats.lock().subscribe_requests += 1;
                if let Some(c) = self.clients.get_mut(&client) {
                    c.mask = mask;
                }
                self.reply(client, tag, Ok(Reply::Ack));
            }
            Request::UpdateProplist { tag, mode, props } => {
                self.stats.lock().proplist_updates.push(props.clone());
                if let Some(c) = self.clients.get_mut(&client) {
                    match mode {
                        UpdateMode::Set => c.props = props,
                        UpdateMode::Replace => c.props.merge(&props),
                        UpdateMode::Merge => {
                            for (key, value) in props.iter() {
                                if !c.props.contains(key) {
                                    let _ = c.props.set(key, value.to_vec());
                                }
                            }
                        }
                    }
                }
                self.reply(client, tag, Ok(Reply::Ack));
            }
            Request::CreateStream {
                stream,
                name,
                spec,
                props,
                device,
                direction,
            } => self.create_stream(client, stream, name, spec, props, device, direction),
            Request::Write { stream, data } => self.write(client, stream, data),
            Request::FinishUpload { stream } => {
                let Some(ServerStream::Upload {
                    name,
                    spec,
                    props,
                    length,
                    data,
                }) = self.streams.remove(&(client, stream))
                else {
                    return;
                };
                if data.len() != length {
                    debug!(
                        target: LOG_TARGET,
                        "Upload '{}' short: {} of {} bytes", name, data.len(), length
                    );
                    self.stream_state(client, stream, StreamState::Failed, None, Some(ServerError::Invalid));
                    return;
                }
                debug!(target: LOG_TARGET, "Upload '{}' complete ({} bytes)", name, length);
                self.stats.lock().uploads += 1;
                if self.config.retain_uploads {
                    self.cache.lock().insert(
                        name,
                        CachedSample {
                            spec,
                            data: Bytes::from(data),
                            props,
                        },
                    );
                }
                self.stream_state(client, stream, StreamState::Terminated, None, None);
            }
            Request::Drain { tag, stream } => match self.streams.get(&(client, stream)) {
                Some(ServerStream::Playback { index }) => {
                    let feed = self.sink_inputs.get(index).and_then(|i| i.feed.as_ref());
                    match feed {
                        Some(feed) if feed.send(Feed::Drain(tag)).is_ok() => {}
                        _ => self.reply(client, tag, Err(ServerError::NoEntity)),
                    }
                }
                _ => self.reply(client, tag, Err(ServerError::BadState)),
            },
            Request::DeleteStream { stream } => {
                if let Some(removed) = self.streams.remove(&(client, stream)) {
                    self.stats.lock().streams_deleted += 1;
                    if let ServerStream::Playback { index } = removed {
                        self.remove_sink_input(index);
                    }
                }
            }
            Request::Goodbye => self.detach(client),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_stream(
        &mut self,
        client: ClientId,
        stream: StreamId,
        name: String,
        spec: SampleSpec,
        props: Proplist,
        device: Option<String>,
        direction: StreamDirection,
    ) {
        self.stats.lock().streams_created += 1;
        if !spec.is_valid() {
            self.stream_state(client, stream, StreamState::Failed, None, Some(ServerError::Invalid));
            return;
        }
        match direction {
            StreamDirection::Upload { length } => {
                if length == 0 {
                    self.stream_state(client, stream, StreamState::Failed, None, Some(ServerError::Invalid));
                    return;
                }
                if length > MAX_UPLOAD_BYTES {
                    self.stream_state(client, stream, StreamState::Failed, None, Some(ServerError::TooLarge));
                    return;
                }
                debug!(target: LOG_TARGET, "Upload stream '{}' for {} bytes", name, length);
                self.streams.insert(
                    (client, stream),
                    ServerStream::Upload {
                        name,
                        spec,
                        props,
                        length,
                        data: Vec::with_capacity(length),
                    },
                );
                self.stream_state(client, stream, StreamState::Ready, None, None);
                self.send_to(client, ServerMessage::StreamRequest { stream, bytes: length });
            }
            StreamDirection::Playback => {
                let index = self.alloc_index();
                let stop = Arc::new(AtomicBool::new(false));
                let (feed_tx, feed_rx) = unbounded();
                let spawned = self.spawn_player(index, {
                    let output = Arc::clone(&self.config.output);
                    let stop = Arc::clone(&stop);
                    let inbox = self.inbox.clone();
                    move || play_stream(output.as_ref(), spec, feed_rx, &stop, index, &inbox)
                });
                if let Err(e) = spawned {
                    self.stream_state(client, stream, StreamState::Failed, None, Some(e));
                    return;
                }
                debug!(
                    target: LOG_TARGET,
                    "Playback stream '{}' as sink input {} (device {:?})", name, index, device
                );
                self.streams
                    .insert((client, stream), ServerStream::Playback { index });
                self.stream_state(client, stream, StreamState::Ready, Some(index), None);
                self.send_to(
                    client,
                    ServerMessage::StreamRequest {
                        stream,
                        bytes: self.config.buffer_bytes,
                    },
                );
                self.add_sink_input(
                    index,
                    SinkInput {
                        stop,
                        owner: Some((client, stream)),
                        feed: Some(feed_tx),
                    },
                );
            }
        }
    }

    fn write(&mut self, client: ClientId, stream: StreamId, data: Bytes) {
        match self.streams.get_mut(&(client, stream)) {
            Some(ServerStream::Upload { length, data: buf, name, .. }) => {
                if buf.len() + data.len() > *length {
                    debug!(target: LOG_TARGET, "Upload '{}' overflowed its declared length", name);
                    self.streams.remove(&(client, stream));
                    self.stream_state(client, stream, StreamState::Failed, None, Some(ServerError::TooLarge));
                    return;
                }
                buf.extend_from_slice(&data);
            }
            Some(ServerStream::Playback { index }) => {
                if let Some(feed) = self.sink_inputs.get(index).and_then(|i| i.feed.as_ref()) {
                    let _ = feed.send(Feed::Data(data));
                }
            }
            None => trace!(target: LOG_TARGET, "Write to unknown stream {:?}", stream),
        }
    }

    /// Runs `body` on a new player thread and reports its outcome for sink input `index`.
    fn spawn_player<F>(&self, index: u32, body: F) -> Result<(), ServerError>
    where
        F: FnOnce() -> Option<PlayerEvent> + Send + 'static,
    {
        let inbox = self.inbox.clone();
        thread::Builder::new()
            .name(format!("chime-sink-input-{}", index))
            .spawn(move || {
                if let Some(event) = body() {
                    let _ = inbox.send(DaemonMsg::Player { index, event });
                }
            })
            .map(|_| ())
            .map_err(|e| {
                warn!(target: LOG_TARGET, "Failed to spawn player thread: {}", e);
                ServerError::Internal
            })
    }

    fn handle_player(&mut self, index: u32, event: PlayerEvent) {
        let Some(owner) = self.sink_inputs.get(&index).map(|i| i.owner) else {
            return;
        };
        match event {
            PlayerEvent::Consumed(bytes) => {
                if let Some((client, stream)) = owner {
                    self.send_to(client, ServerMessage::StreamRequest { stream, bytes });
                }
            }
            PlayerEvent::Drained(tag) => {
                if let Some((client, _)) = owner {
                    self.reply(client, tag, Ok(Reply::Ack));
                }
            }
            PlayerEvent::Finished => {
                trace!(target: LOG_TARGET, "Sink input {} finished", index);
                self.remove_sink_input(index);
            }
            PlayerEvent::Failed(error) => {
                warn!(target: LOG_TARGET, "Sink input {} failed: {}", index, error);
                self.remove_sink_input(index);
                if let Some((client, stream)) = owner {
                    self.streams.remove(&(client, stream));
                    self.stream_state(client, stream, StreamState::Failed, None, Some(error));
                }
            }
        }
    }
}

fn play_sample(
    output: &dyn OutputSink,
    sample: CachedSample,
    volume: Volume,
    stop: &AtomicBool,
) -> Option<PlayerEvent> {
    let mut out = match output.open(&sample.spec) {
        Ok(out) => out,
        Err(e) => return Some(PlayerEvent::Failed(e)),
    };
    let chunk_bytes = sample.spec.frame_size() * PLAYER_CHUNK_FRAMES;
    for chunk in sample.data.chunks(chunk_bytes) {
        if stop.load(Ordering::Acquire) {
            return None;
        }
        let written = if volume.is_norm() {
            out.write(chunk)
        } else {
            out.write(&volume.apply(sample.spec.format, chunk))
        };
        if let Err(e) = written {
            return Some(PlayerEvent::Failed(e));
        }
    }
    if stop.load(Ordering::Acquire) {
        return None;
    }
    match out.drain() {
        Ok(()) => Some(PlayerEvent::Finished),
        Err(e) => Some(PlayerEvent::Failed(e)),
    }
}

fn play_stream(
    output: &dyn OutputSink,
    spec: SampleSpec,
    feed: Receiver<Feed>,
    stop: &AtomicBool,
    index: u32,
    inbox: &Sender<DaemonMsg>,
) -> Option<PlayerEvent> {
    let mut out = match output.open(&spec) {
        Ok(out) => out,
        Err(e) => return Some(PlayerEvent::Failed(e)),
    };
    while let Ok(item) = feed.recv() {
        if stop.load(Ordering::Acquire) {
            return None;
        }
        let event = match item {
            Feed::Data(data) => match out.write(&data) {
                Ok(()) => PlayerEvent::Consumed(data.len()),
                Err(e) => return Some(PlayerEvent::Failed(e)),
            },
            Feed::Drain(tag) => match out.drain() {
                Ok(()) => PlayerEvent::Drained(tag),
                Err(e) => return Some(PlayerEvent::Failed(e)),
            },
        };
        let _ = inbox.send(DaemonMsg::Player { index, event });
    }
    None
}
