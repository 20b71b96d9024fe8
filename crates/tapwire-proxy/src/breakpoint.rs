//! Breakpoint rendezvous.
//!
//! When armed, a matching in-flight message is snapshotted, handed to an
//! external controller through a `breakpoint:hit` event, and its connection
//! task parks on a one-shot reply slot. The controller resumes the message
//! (optionally edited), drops it, or does nothing — in which case a watchdog
//! resumes the original after five minutes so a forgotten breakpoint can
//! never wedge a connection forever.

use crate::error::{Error, Result};
use crate::events::{EventBus, ProxyEvent};
use parking_lot::{Mutex, RwLock};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Watchdog for unanswered pauses.
const PAUSE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Which half of the exchange a message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
  /// Client-to-origin message.
  Request,
  /// Origin-to-client message.
  Response,
}

/// Process-wide breakpoint arming state.
#[derive(Debug, Clone, Default)]
pub struct BreakpointConfig {
  /// Master switch.
  pub enabled: bool,
  /// Pause outbound requests.
  pub break_on_request: bool,
  /// Pause inbound responses.
  pub break_on_response: bool,
  /// Optional case-insensitive URL regex; absent means every URL matches.
  pub url_pattern: Option<String>,
}

/// Snapshot of a paused message, as handed to the controller.
#[derive(Debug, Clone)]
pub struct InterceptedMessage {
  /// Pause id; pass it back to `resume` or `drop_message`.
  pub id: u64,
  /// Message direction.
  pub direction: Direction,
  /// Request method.
  pub method: String,
  /// Absolute URL.
  pub url: String,
  /// Headers at pause time.
  pub headers: Vec<(String, String)>,
  /// Body at pause time.
  pub body: Option<Vec<u8>>,
  /// Status code, present for response-direction pauses.
  pub status: Option<u16>,
}

enum Verdict {
  Resume(Option<InterceptedMessage>),
  Drop,
}

struct ArmedConfig {
  config: BreakpointConfig,
  pattern: Option<Regex>,
  pattern_valid: bool,
}

struct Inner {
  config: RwLock<ArmedConfig>,
  pending: Mutex<HashMap<u64, oneshot::Sender<Verdict>>>,
  next_id: AtomicU64,
  events: EventBus,
}

/// Shared rendezvous state. Cheap to clone.
#[derive(Clone)]
pub struct BreakpointManager {
  inner: Arc<Inner>,
}

impl BreakpointManager {
  /// Create a manager publishing hits on `events`.
  pub fn new(events: EventBus) -> Self {
    Self {
      inner: Arc::new(Inner {
        config: RwLock::new(ArmedConfig {
          config: BreakpointConfig::default(),
          pattern: None,
          pattern_valid: true,
        }),
        pending: Mutex::new(HashMap::new()),
        next_id: AtomicU64::new(1),
        events,
      }),
    }
  }

  /// Replace the arming config. Only future matches are affected; already
  /// paused messages keep waiting for their verdicts.
  pub fn set_config(&self, config: BreakpointConfig) {
    let (pattern, pattern_valid) = match config.url_pattern.as_deref() {
      None => (None, true),
      Some(raw) => match RegexBuilder::new(raw).case_insensitive(true).build() {
        Ok(regex) => (Some(regex), true),
        Err(e) => {
          warn!("breakpoint url pattern {raw:?} is invalid, disarming: {e}");
          (None, false)
        }
      },
    };
    *self.inner.config.write() = ArmedConfig {
      config,
      pattern,
      pattern_valid,
    };
  }

  /// Current arming config.
  pub fn config(&self) -> BreakpointConfig {
    self.inner.config.read().config.clone()
  }

  /// Whether a message in `direction` for `url` should pause.
  pub fn should_break(&self, direction: Direction, url: &str) -> bool {
    let armed = self.inner.config.read();
    if !armed.config.enabled || !armed.pattern_valid {
      return false;
    }
    let direction_armed = match direction {
      Direction::Request => armed.config.break_on_request,
      Direction::Response => armed.config.break_on_response,
    };
    if !direction_armed {
      return false;
    }
    match &armed.pattern {
      Some(pattern) => pattern.is_match(url),
      None => true,
    }
  }

  /// Park the caller until the controller answers.
  ///
  /// Resolves to the message the caller should proceed with: the
  /// controller's edit, or the original snapshot on a bare resume or
  /// watchdog expiry. A drop resolves to [`Error::Dropped`].
  pub async fn pause(
    &self,
    direction: Direction,
    method: String,
    url: String,
    headers: Vec<(String, String)>,
    body: Option<Vec<u8>>,
    status: Option<u16>,
  ) -> Result<InterceptedMessage> {
    let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
    let snapshot = InterceptedMessage {
      id,
      direction,
      method,
      url,
      headers,
      body,
      status,
    };

    let (tx, rx) = oneshot::channel();
    self.inner.pending.lock().insert(id, tx);
    self
      .inner
      .events
      .emit(ProxyEvent::BreakpointHit(snapshot.clone()));

    match timeout(PAUSE_TIMEOUT, rx).await {
      Ok(Ok(Verdict::Resume(Some(edited)))) => Ok(edited),
      Ok(Ok(Verdict::Resume(None))) => Ok(snapshot),
      Ok(Ok(Verdict::Drop)) => Err(Error::Dropped),
      // Reply slot vanished without a verdict; behave like a bare resume.
      Ok(Err(_)) => Ok(snapshot),
      Err(_) => {
        debug!("breakpoint {id} timed out, auto-resuming original");
        self.inner.pending.lock().remove(&id);
        Ok(snapshot)
      }
    }
  }

  /// Resume a paused message, optionally substituting an edited snapshot.
  /// Unknown ids are a silent no-op.
  pub fn resume(&self, id: u64, modified: Option<InterceptedMessage>) {
    if let Some(tx) = self.inner.pending.lock().remove(&id) {
      let _ = tx.send(Verdict::Resume(modified));
    }
  }

  /// Drop a paused message; its handler answers the client with a `499`.
  /// Unknown ids are a silent no-op.
  pub fn drop_message(&self, id: u64) {
    if let Some(tx) = self.inner.pending.lock().remove(&id) {
      let _ = tx.send(Verdict::Drop);
    }
  }

  /// Resume every outstanding pause with its original message. Called on
  /// shutdown so teardown never waits on the watchdog.
  pub fn clear_pending(&self) {
    let drained: Vec<_> = self.inner.pending.lock().drain().collect();
    for (_, tx) in drained {
      let _ = tx.send(Verdict::Resume(None));
    }
  }

  /// Number of currently paused messages.
  pub fn pending_count(&self) -> usize {
    self.inner.pending.lock().len()
  }
}
