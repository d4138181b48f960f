use super::registry::OutstandingRegistry;
use super::translate::errno_kind;
use crate::error::{ErrorKind, Result};
use crate::proplist::Proplist;
use crate::server::{
    ContextState, ContextStateCallback, LoopGuard, Mainloop, ServerLink, SubscribeCallback,
};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, instrument};

const LOG_TARGET: &str = "r_chime::broker::connection";

/// The session's single server connection and the event loop driving it.
pub struct ConnectionHandle {
    mainloop: Mainloop,
    closed: AtomicBool,
}

impl ConnectionHandle {
    /// Connects and blocks until the context is ready or has failed.
    #[instrument(skip_all)]
    pub fn open(
        link: ServerLink,
        props: &Proplist,
        on_state: ContextStateCallback,
        on_event: SubscribeCallback,
    ) -> Result<Self> {
        let mainloop = Mainloop::new(link);
        {
            let mut guard = mainloop.lock();
            guard.set_state_callback(on_state);
            guard.set_subscribe_callback(on_event);
            guard.connect(props).map_err(ErrorKind::from)?;

            // Started under the lock so the first state change cannot be missed.
            mainloop.start().map_err(|_| ErrorKind::OutOfMemory)?;
            loop {
                match guard.state() {
                    ContextState::Ready => break,
                    ContextState::Failed | ContextState::Terminated => {
                        let error = errno_kind(guard.errno());
                        drop(guard);
                        mainloop.stop();
                        debug!(target: LOG_TARGET, "Connection failed: {}", error);
                        return Err(error);
                    }
                    ContextState::Unconnected | ContextState::Connecting => guard.wait(),
                }
            }
        }
        info!(target: LOG_TARGET, "Connected to sound server");
        Ok(ConnectionHandle {
            mainloop,
            closed: AtomicBool::new(false),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn in_loop_thread(&self) -> bool {
        self.mainloop.in_loop_thread()
    }

    /// Runs `op` with the loop lock held. Jobs `op` defers run after the lock is released.
    pub fn run_exclusive<R>(&self, op: impl FnOnce(&mut LoopGuard<'_>) -> R) -> R {
        let mut guard = self.mainloop.lock();
        op(&mut guard)
    }

    /// Disconnects, stops the loop and completes every tracked record with
    /// `Destroyed`. A second call fails with `State`.
    ///
    /// Nothing is tracked once the context is terminal, so the drain below
    /// sees every record that will ever need a teardown outcome.
    #[instrument(skip_all)]
    pub fn close(&self, registry: &OutstandingRegistry) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ErrorKind::State);
        }
        {
            let mut guard = self.mainloop.lock();
            guard.disconnect();
            guard.signal();
        }
        self.mainloop.stop();
        let drained = registry.drain_all(Err(ErrorKind::Destroyed));
        debug!(target: LOG_TARGET, "Destroyed {} outstanding requests", drained);
        info!(target: LOG_TARGET, "Connection closed");
        Ok(())
    }
}
