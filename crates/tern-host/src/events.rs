//! The debugger event bus.
//!
//! Events are delivered to subscribers in the order they were published,
//! over per-subscriber unbounded channels. A subscriber that attaches after
//! initialization already completed receives a synthetic
//! `InitialInitializationComplete` first, so late DevTools clients observe
//! the same prefix as early ones. Completion (VM disconnect) closes every
//! stream.

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::pause::StackFrameView;
use crate::script::Script;
use crate::values::ErrorValue;

#[derive(Clone, Debug)]
pub enum DebuggerEvent {
    ScriptAdded(Arc<Script>),
    HitBreakpoint(Vec<StackFrameView>),
    Resumed,
    UncaughtError(ErrorValue),
    InitialInitializationComplete,
}

/// A fatal bus error. Terminates every stream after delivery.
pub type BusError = String;

pub type BusItem = Result<DebuggerEvent, BusError>;

pub struct EventStream {
    rx: mpsc::UnboundedReceiver<BusItem>,
}

impl EventStream {
    /// The next event, or `None` once the stream completed (VM disconnect).
    pub async fn next(&mut self) -> Option<BusItem> {
        self.rx.recv().await
    }
}

#[derive(Default)]
struct BusInner {
    subscribers: Vec<mpsc::UnboundedSender<BusItem>>,
    initialized: bool,
    completed: bool,
}

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// A panicking publisher cannot leave `BusInner` half-updated (the state
    /// is only ever appended to, retained, or flag-flipped), so a poisoned
    /// lock is safe to keep using.
    fn guard(&self) -> MutexGuard<'_, BusInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(
                target = "tern.host",
                "event bus lock poisoned; delivery continues"
            );
            poisoned.into_inner()
        })
    }

    pub fn subscribe(&self) -> EventStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.guard();
        if inner.completed {
            // Leave the sender out so the stream reports completion at once.
            return EventStream { rx };
        }
        if inner.initialized {
            let _ = tx.send(Ok(DebuggerEvent::InitialInitializationComplete));
        }
        inner.subscribers.push(tx);
        EventStream { rx }
    }

    pub fn publish(&self, event: DebuggerEvent) {
        let mut inner = self.guard();
        if inner.completed {
            return;
        }
        if matches!(event, DebuggerEvent::InitialInitializationComplete) {
            inner.initialized = true;
        }
        inner
            .subscribers
            .retain(|tx| tx.send(Ok(event.clone())).is_ok());
    }

    pub fn publish_error(&self, error: BusError) {
        let mut inner = self.guard();
        if inner.completed {
            return;
        }
        inner.completed = true;
        for tx in inner.subscribers.drain(..) {
            let _ = tx.send(Err(error.clone()));
        }
    }

    /// Complete every stream; further publishes are dropped.
    pub fn complete(&self) {
        let mut inner = self.guard();
        inner.completed = true;
        inner.subscribers.clear();
    }

    pub fn is_completed(&self) -> bool {
        self.guard().completed
    }
}
