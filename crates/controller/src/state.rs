//! Handles shared between the worker, listener and watchdog threads.

use std::sync::Arc;
use std::time::Instant;

use crate::command::CommandQueue;
use crate::mqtt::LinkHealth;
use crate::watchdog::{LivenessReader, LivenessWriter, WatchdogState};

// ---------------------------------------------------------------------------
// Shared runtime state
// ---------------------------------------------------------------------------

/// Everything the threads share. Cloned into each thread; the liveness
/// writer is handed out separately because only the worker may hold it.
#[derive(Clone)]
pub(crate) struct SharedState {
    pub(crate) booted: Instant,
    pub(crate) queue: Arc<CommandQueue>,
    pub(crate) link: Arc<LinkHealth>,
    pub(crate) liveness: LivenessReader,
}

impl SharedState {
    pub(crate) fn new() -> (Self, LivenessWriter) {
        let (writer, reader) = WatchdogState::create();
        let state = Self {
            booted: Instant::now(),
            queue: Arc::new(CommandQueue::new()),
            link: Arc::new(LinkHealth::new()),
            liveness: reader,
        };
        (state, writer)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
