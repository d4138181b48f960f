//! Playback-request broker.
//!
//! A [`Session`] owns one server connection and turns the callback-driven
//! server API into blocking calls that report exactly one terminal outcome
//! per request, either synchronously or through a [`FinishCallback`].

mod connection;
mod lifecycle;
mod registry;
mod request;
mod subscription;
pub mod translate;
#[cfg(test)]
mod tests;

pub use connection::ConnectionHandle;
pub use lifecycle::{parse_volume, CacheControl, MAX_PLAY_ATTEMPTS};
pub use registry::{OutstandingRegistry, RequestKey};
pub use request::{FinishCallback, OutstandingRequest, RequestKind, RequestState, Resolution};
pub use subscription::SubscriptionGate;

use crate::error::{ErrorKind, Result};
use crate::proplist::{self, Proplist};
use crate::server::{LocalServer, UpdateMode};
use crate::sound::{SoundResolver, ThemeResolver, ThemeState};
use lifecycle::Lifecycle;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const LOG_TARGET: &str = "r_chime::broker";

/// The only backend this broker drives.
pub const LOCAL_DRIVER: &str = "local";

/// How to open a [`Session`].
#[derive(Clone, Default)]
pub struct SessionOptions {
    /// Backend selector. `None` or `"local"`.
    pub driver: Option<String>,
    /// Server-side sink for new playbacks.
    pub device: Option<String>,
    /// Client properties sent on connect and used as the base for theme lookup.
    pub properties: Proplist,
    /// Defaults to a [`ThemeResolver`] over the XDG data directories.
    pub resolver: Option<Arc<dyn SoundResolver>>,
}

impl fmt::Debug for SessionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionOptions")
            .field("driver", &self.driver)
            .field("device", &self.device)
            .field("properties", &self.properties)
            .field("custom_resolver", &self.resolver.is_some())
            .finish()
    }
}

struct SessionShared {
    connection: ConnectionHandle,
    registry: Arc<OutstandingRegistry>,
    gate: SubscriptionGate,
    resolver: Arc<dyn SoundResolver>,
    theme: Mutex<ThemeState>,
    base: Mutex<Proplist>,
    device: Mutex<Option<String>>,
}

impl SessionShared {
    fn lifecycle(&self) -> Lifecycle<'_> {
        Lifecycle {
            connection: &self.connection,
            registry: &self.registry,
            gate: &self.gate,
            resolver: self.resolver.as_ref(),
            theme: &self.theme,
            base: self.base.lock().clone(),
            device: self.device.lock().clone(),
        }
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if !self.connection.is_closed() {
            debug!(target: LOG_TARGET, "Session dropped without close");
            let _ = self.connection.close(&self.registry);
        }
    }
}

/// A connection to the sound server plus the requests in flight on it.
///
/// Clones share the same connection. Dropping the last clone closes it.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Connects to `server`, blocking until the connection is ready.
    pub fn open(server: &LocalServer, device: Option<&str>, properties: &Proplist) -> Result<Self> {
        Self::open_with(
            server,
            SessionOptions {
                device: device.map(str::to_string),
                properties: properties.clone(),
                ..SessionOptions::default()
            },
        )
    }

    #[instrument(skip(server, options))]
    pub fn open_with(server: &LocalServer, options: SessionOptions) -> Result<Self> {
        match options.driver.as_deref() {
            None | Some(LOCAL_DRIVER) => {}
            Some(other) => {
                warn!(target: LOG_TARGET, "Unsupported driver '{}'", other);
                return Err(ErrorKind::NoDriver);
            }
        }

        let base = options.properties;
        let client_props = client_properties(&base)?;
        let registry = Arc::new(OutstandingRegistry::new());
        let connection = ConnectionHandle::open(
            server.attach(),
            &client_props.strip_internal(),
            lifecycle::context_state_callback(Arc::clone(&registry)),
            lifecycle::subscribe_callback(Arc::clone(&registry)),
        )?;
        let resolver = options
            .resolver
            .unwrap_or_else(|| Arc::new(ThemeResolver::new()));

        info!(target: LOG_TARGET, "Session opened");
        Ok(Session {
            shared: Arc::new(SessionShared {
                connection,
                registry,
                gate: SubscriptionGate::new(),
                resolver,
                theme: Mutex::new(ThemeState::new()),
                base: Mutex::new(base),
                device: Mutex::new(options.device),
            }),
        })
    }

    /// Destroys every outstanding request and disconnects. Fails with `State` when already closed.
    #[instrument(skip(self))]
    pub fn close(&self) -> Result<()> {
        self.shared.connection.close(&self.shared.registry)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.connection.is_closed()
    }

    /// Selects the sink for future playbacks. Sounds already playing stay where they are.
    pub fn change_output_device(&self, device: Option<&str>) -> Result<()> {
        debug!(target: LOG_TARGET, "Output device set to {:?}", device);
        *self.shared.device.lock() = device.map(str::to_string);
        Ok(())
    }

    pub fn output_device(&self) -> Option<String> {
        self.shared.device.lock().clone()
    }

    /// Pushes changed client properties to the server without waiting for the reply.
    #[instrument(skip(self, changed))]
    pub fn update_properties(&self, changed: &Proplist) -> Result<()> {
        let shared = &self.shared;
        if shared.connection.is_closed() {
            return Err(ErrorKind::State);
        }
        let outgoing = changed.strip_internal();
        shared.connection.run_exclusive(|guard| {
            guard
                .update_proplist(UpdateMode::Replace, &outgoing, Box::new(|_, _| {}))
                .map(|_| ())
                .map_err(ErrorKind::from)
        })?;
        shared.base.lock().merge(changed);
        Ok(())
    }

    /// Client properties as last merged by [`Session::update_properties`].
    pub fn properties(&self) -> Proplist {
        self.shared.base.lock().clone()
    }

    /// Plays an event sound. See [`Session::play_with`].
    pub fn play(&self, request_id: u32, event: &Proplist) -> Result<()> {
        self.play_with(request_id, event, None)
    }

    /// Plays an event sound, trying the server cache first, uploading on a
    /// miss when the cache-control property allows it, and streaming the
    /// file directly as the last resort.
    ///
    /// An error return means `completion` will never run. On success it runs
    /// exactly once, possibly before this call returns.
    #[instrument(skip(self, event, completion))]
    pub fn play_with(
        &self,
        request_id: u32,
        event: &Proplist,
        completion: Option<FinishCallback>,
    ) -> Result<()> {
        self.shared.lifecycle().play(request_id, event, completion)
    }

    /// Cancels every tracked playback started with `request_id`.
    #[instrument(skip(self))]
    pub fn cancel(&self, request_id: u32) -> Result<()> {
        lifecycle::cancel(&self.shared.connection, &self.shared.registry, request_id)
    }

    /// Uploads the event's sound into the server cache.
    #[instrument(skip(self, event))]
    pub fn cache(&self, event: &Proplist) -> Result<()> {
        self.shared.lifecycle().cache(event)
    }

    /// Number of requests currently awaiting an asynchronous outcome.
    pub fn outstanding(&self) -> usize {
        self.shared.registry.tracked_len()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("closed", &self.is_closed())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// `base` plus the process properties the server uses to identify the client.
fn client_properties(base: &Proplist) -> Result<Proplist> {
    let mut props = Proplist::new();
    props.sets(proplist::APPLICATION_PROCESS_ID, &std::process::id().to_string())?;
    if let Ok(host) = hostname::get() {
        if let Some(host) = host.to_str() {
            props.sets(proplist::APPLICATION_PROCESS_HOST, host)?;
        }
    }
    if let Some(binary) = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().and_then(|n| n.to_str()).map(str::to_string))
    {
        props.sets(proplist::APPLICATION_PROCESS_BINARY, &binary)?;
    }
    props.merge(base);
    Ok(props)
}
