use crate::error::ErrorKind;
use crate::server::{LoopCtx, SubscriptionMask};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::debug;

const LOG_TARGET: &str = "r_chime::broker::subscription";

/// Enables sink-input event delivery the first time a caller needs it.
#[derive(Debug, Default)]
pub struct SubscriptionGate {
    enabled: AtomicBool,
}

impl SubscriptionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Submits the subscription once. Must be called with the loop lock held,
    /// which serialises concurrent callers.
    pub fn ensure(&self, ctx: &mut LoopCtx) -> Result<(), ErrorKind> {
        if self.is_enabled() {
            return Ok(());
        }
        ctx.subscribe(SubscriptionMask::SINK_INPUT, Box::new(|_, _| {}))
            .map_err(ErrorKind::from)?;
        self.enabled.store(true, Ordering::Release);
        debug!(target: LOG_TARGET, "Subscribed to sink input events");
        Ok(())
    }
}
