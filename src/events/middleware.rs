//! Dispatch middleware
//!
//! Each middleware receives the event and a [`Next`] handle for the rest of the
//! chain. Calling `next.run(event)` continues propagation; returning without
//! calling it drops the event silently. Some hosts rely on that to filter
//! events, so the bus does not guard against it.

use std::sync::Arc;
use std::time::Instant;

use super::{Event, EventBus};

pub trait Middleware: Send + Sync {
    fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()>;
}

/// The remainder of the middleware chain, ending in handler delivery
#[derive(Clone, Copy)]
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    bus: &'a EventBus,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], bus: &'a EventBus) -> Self {
        Self { chain, bus }
    }

    pub fn run(&self, event: &Event) -> anyhow::Result<()> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(
                event,
                Next {
                    chain: rest,
                    bus: self.bus,
                },
            ),
            None => self.bus.deliver(event),
        }
    }
}

/* ===================== Built-in Middleware ===================== */

/// Logs every dispatched event at debug level
#[derive(Debug, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        tracing::debug!(event = %event.name, source = %event.source, id = %event.id, "dispatching event");
        next.run(event)
    }
}

/// Measures how long the rest of the chain takes
#[derive(Debug, Default)]
pub struct TimingMiddleware;

impl Middleware for TimingMiddleware {
    fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = next.run(event);
        tracing::debug!(
            event = %event.name,
            elapsed_us = started.elapsed().as_micros() as u64,
            "event dispatched"
        );
        result
    }
}

/// Re-runs the rest of the chain while it reports handler failures
///
/// A retry re-delivers to every downstream handler, including the ones that
/// already succeeded.
#[derive(Debug)]
pub struct RetryMiddleware {
    max_attempts: usize,
}

impl RetryMiddleware {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl Middleware for RetryMiddleware {
    fn handle(&self, event: &Event, next: Next<'_>) -> anyhow::Result<()> {
        let mut attempt = 1;
        loop {
            match next.run(event) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.max_attempts => return Err(e),
                Err(e) => {
                    tracing::debug!(event = %event.name, attempt, error = %e, "retrying dispatch");
                    attempt += 1;
                }
            }
        }
    }
}
