//! Event sink for transaction, admin and error messages.
//!
//! Messages arrive as [`fmt::Arguments`] so neither the heap nor a sink that
//! writes to a file descriptor needs to allocate.

use core::fmt;

/// Receives one message per call, without a trailing newline.
pub trait EventSink {
    fn record(&mut self, args: fmt::Arguments<'_>);
}

/// Drops every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&mut self, _args: fmt::Arguments<'_>) {}
}

impl<F: FnMut(fmt::Arguments<'_>)> EventSink for F {
    fn record(&mut self, args: fmt::Arguments<'_>) {
        self(args);
    }
}

/// Sink that only forwards while `enabled`; used for per-flag logging.
pub(crate) struct Gated<'s> {
    sink: &'s mut dyn EventSink,
    enabled: bool,
}

impl<'s> Gated<'s> {
    pub(crate) fn new(sink: &'s mut dyn EventSink, enabled: bool) -> Self {
        Self { sink, enabled }
    }

    pub(crate) fn record(&mut self, args: fmt::Arguments<'_>) {
        if self.enabled {
            self.sink.record(args);
        }
    }
}
