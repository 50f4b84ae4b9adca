//! Explicit logger handle for the session and its channel.
//!
//! Nothing in this crate logs through an implicit global subscriber: a [`Logger`]
//! wraps a `tracing::Dispatch` and every session/channel operation runs under it.
//! [`Logger::capture`] builds a dispatcher backed by [`LogCapture`], which
//! accumulates formatted events in memory through an unbounded mpsc channel.

use std::fmt::Write as _;
use std::future::Future;

use tokio::sync::mpsc;
use tracing::instrument::{WithDispatch, WithSubscriber};
use tracing::{Dispatch, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(dispatch: Dispatch) -> Self {
        Self { dispatch }
    }

    /// Logger that discards every event.
    pub fn none() -> Self {
        Self::new(Dispatch::none())
    }

    /// Logger backed by an in-memory capture.
    pub fn capture() -> (Self, LogCapture) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = tracing_subscriber::registry().with(CaptureLayer { tx });
        (Self::new(Dispatch::new(subscriber)), LogCapture { rx })
    }

    /// Run `future` with this logger as the default dispatcher on every poll.
    pub fn scope<F: Future>(&self, future: F) -> WithDispatch<F> {
        future.with_subscriber(self.dispatch.clone())
    }

    /// Run a synchronous closure with this logger as the default dispatcher.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        tracing::dispatcher::with_default(&self.dispatch, f)
    }
}

/// Receiving side of [`Logger::capture`].
pub struct LogCapture {
    rx: mpsc::UnboundedReceiver<String>,
}

impl LogCapture {
    /// Take every line captured so far, oldest first.
    pub fn drain(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Ok(line) = self.rx.try_recv() {
            lines.push(line);
        }
        lines
    }
}

struct CaptureLayer {
    tx: mpsc::UnboundedSender<String>,
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if self.tx.is_closed() {
            return;
        }

        let metadata = event.metadata();
        let mut visitor = LineVisitor::default();
        event.record(&mut visitor);

        let line = format!(
            "{} [{}] {}{}",
            metadata.level(),
            metadata.target(),
            visitor.message,
            visitor.fields
        );
        let _ = self.tx.send(line);
    }
}

/// Renders `message` verbatim and every other field as ` key=value`.
#[derive(Default)]
struct LineVisitor {
    message: String,
    fields: String,
}

impl tracing::field::Visit for LineVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }
}
