//! Readiness multiplexer
//!
//! One [`Multiplexer::tick`] drives every container through a single
//! readiness wait: pre-select hooks run first (deadline checks may push
//! updates of their own), interests are re-armed (write interest only for
//! containers holding pending output), then one bounded wait dispatches
//! ready streams: reads before writes before exceptional conditions, in
//! token order, for deterministic output.

use std::time::{Duration, Instant};

use mio::{Events, Interest, Poll, Token};
use tracing::{debug, warn};

use crate::container::ContainerSet;
use crate::error::{Error, Result};
use crate::update::{ErrorKind, Update, UpdateQueue};

/// Default readiness event capacity per tick
const EVENT_CAPACITY: usize = 256;

/// Readiness selection over a set of stream containers
pub struct Multiplexer {
    poll: Poll,
    events: Events,
}

impl Multiplexer {
    /// Create a multiplexer with its own poll instance
    pub fn new() -> Result<Self> {
        Ok(Multiplexer {
            poll: Poll::new().map_err(Error::Io)?,
            events: Events::with_capacity(EVENT_CAPACITY),
        })
    }

    /// Run one tick over `set`, splicing yielded updates into `updates`
    ///
    /// `timeout` follows the wait contract: `None` waits indefinitely,
    /// `Some(0)` polls. A failed wait yields `Error{SELECT_FAILED}` and
    /// returns; per-container failures never abort the tick.
    pub fn tick(
        &mut self,
        set: &mut dyn ContainerSet,
        timeout: Option<Duration>,
        updates: &mut UpdateQueue,
    ) {
        let now = Instant::now();
        set.for_each(&mut |container| {
            container.before_stream_select(now, updates);
        });

        let registry = self.poll.registry();
        set.for_each(&mut |container| {
            if !container.is_live() {
                return;
            }
            let mut interest = Interest::READABLE;
            if !container.is_write_buffer_empty() {
                interest = interest.add(Interest::WRITABLE);
            }
            if let Err(e) = container.update_registration(registry, interest) {
                warn!(token = container.token().0, error = %e, "could not arm stream");
            }
        });

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            warn!(error = %e, "readiness wait failed");
            updates.push_back(Update::error(ErrorKind::SelectFailed));
            return;
        }

        // Partition before dispatching: handlers mutate containers and may
        // release streams, so the event list is snapshotted into tokens.
        let mut readable: Vec<Token> = Vec::new();
        let mut writable: Vec<Token> = Vec::new();
        let mut exceptional: Vec<Token> = Vec::new();

        for event in self.events.iter() {
            let token = event.token();
            if event.is_readable() || event.is_read_closed() {
                readable.push(token);
            }
            if event.is_writable() {
                writable.push(token);
            }
            if event.is_error() {
                exceptional.push(token);
            }
        }

        readable.sort_unstable_by_key(|t| t.0);
        writable.sort_unstable_by_key(|t| t.0);
        exceptional.sort_unstable_by_key(|t| t.0);

        for token in readable {
            match set.get_mut(token) {
                Some(container) if container.is_live() => container.handle_read(updates),
                _ => debug!(token = token.0, "read event for a gone stream, skipped"),
            }
        }
        for token in writable {
            match set.get_mut(token) {
                Some(container) if container.is_live() => container.handle_write(updates),
                _ => debug!(token = token.0, "write event for a gone stream, skipped"),
            }
        }
        for token in exceptional {
            match set.get_mut(token) {
                Some(container) if container.is_live() => container.handle_exceptional(updates),
                _ => debug!(token = token.0, "error event for a gone stream, skipped"),
            }
        }
    }
}
