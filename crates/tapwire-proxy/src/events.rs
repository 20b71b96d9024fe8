//! Typed event bus.
//!
//! External consumers (UIs, test harnesses) subscribe for exchange
//! completion, breakpoint hits and engine-level errors. Events ride a
//! broadcast channel: the proxy never blocks on a slow subscriber, and a
//! lagging receiver observes `RecvError::Lagged` rather than stalling
//! capture.

use crate::breakpoint::InterceptedMessage;
use crate::store::CapturedExchange;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 256;

/// Events emitted by the engine. Variant semantics are stable contracts.
#[derive(Debug, Clone)]
pub enum ProxyEvent {
  /// An exchange reached its final state. Emitted exactly once per
  /// exchange, after the store row was finalized; reading the row back at
  /// this point always observes the final state.
  RequestComplete(CapturedExchange),
  /// A message was paused at a breakpoint and awaits a verdict.
  BreakpointHit(InterceptedMessage),
  /// A transport or accept-loop error worth surfacing to the UI.
  Error(String),
}

/// Handle for publishing and subscribing to [`ProxyEvent`]s.
#[derive(Clone)]
pub struct EventBus {
  tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
  /// Create a bus with the default capacity.
  pub fn new() -> Self {
    let (tx, _) = broadcast::channel(EVENT_CAPACITY);
    Self { tx }
  }

  /// Subscribe to all future events.
  pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
    self.tx.subscribe()
  }

  /// Publish an event. A bus without subscribers drops it silently.
  pub fn emit(&self, event: ProxyEvent) {
    let _ = self.tx.send(event);
  }
}

impl Default for EventBus {
  fn default() -> Self {
    Self::new()
  }
}
