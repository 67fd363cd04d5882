//! Start/stop bookkeeping for the periodic loops.

use std::sync::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Observable state of a periodic loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
  /// Never started.
  Idle,
  /// Loop task is alive.
  Running,
  /// Loop task finished.
  Stopped,
}

/// Cancellation handle plus published state of one loop task.
pub(crate) struct LoopControl {
  cancel: Mutex<CancellationToken>,
  state: watch::Sender<LoopState>,
}

impl LoopControl {
  pub(crate) fn new() -> Self {
    let (state, _) = watch::channel(LoopState::Idle);
    Self {
      cancel: Mutex::new(CancellationToken::new()),
      state,
    }
  }

  /// Marks the loop running and hands out a fresh stop token.
  ///
  /// Returns `None` if the loop is already running. The token is stored
  /// before `Running` is published, both under the cancel lock.
  pub(crate) fn start(&self) -> Option<CancellationToken> {
    let mut cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
    if self.is_running() {
      return None;
    }
    let token = CancellationToken::new();
    *cancel = token.clone();
    self.state.send_replace(LoopState::Running);
    Some(token)
  }

  pub(crate) fn state(&self) -> LoopState {
    *self.state.borrow()
  }

  pub(crate) fn is_running(&self) -> bool {
    self.state() == LoopState::Running
  }

  pub(crate) fn mark_stopped(&self) {
    self.state.send_replace(LoopState::Stopped);
  }

  /// Requests the loop to stop and waits until it did. Returns at once if it is not running.
  pub(crate) async fn stop(&self) {
    {
      let cancel = self.cancel.lock().unwrap_or_else(|e| e.into_inner());
      if !self.is_running() {
        return;
      }
      cancel.cancel();
    }
    let mut rx = self.state.subscribe();
    let _ = rx.wait_for(|state| *state != LoopState::Running).await;
  }
}
