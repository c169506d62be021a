// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Read-only cancellation handles for stream lifecycles.

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// The observer half of a [`CancellationToken`].
///
/// Handed to code that must react to a stream ending but must not be able to
/// end it; only the holder of the paired token can trigger cancellation.
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  /// A fresh token together with its observer half.
  pub fn pair() -> (CancellationToken, CancellationListener) {
    let token = CancellationToken::new();
    let listener = CancellationListener {
      token: token.clone(),
    };
    (token, listener)
  }

  pub fn is_cancelled(&self) -> bool {
    self.token.is_cancelled()
  }

  /// Resolves once the paired token is cancelled; immediately if it already
  /// was.
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn listener_observes_paired_token() {
    let (token, listener) = CancellationListener::pair();
    assert!(!listener.is_cancelled());
    token.cancel();
    assert!(listener.is_cancelled());
    listener.cancelled().await;
  }
}
