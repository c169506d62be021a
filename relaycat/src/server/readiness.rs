// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Readiness reporting for load balancers and health probes.

use std::sync::Arc;

use crate::server::backend::BackendStorage;

/// Ready means the server has at least one agent to route dials through.
///
/// This is a connectivity statement, not a health one: the agents are the
/// side that actively checks stream liveness, so a "ready" server may still
/// hold streams that are about to fail.
pub struct ReadinessManager {
  storage: Arc<BackendStorage>,
}

impl ReadinessManager {
  pub fn new(storage: Arc<BackendStorage>) -> Self {
    Self { storage }
  }

  pub fn ready(&self) -> bool {
    self.storage.num_backends() > 0
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc;

  use crate::common::tunnel::ChannelPacketSender;

  #[tokio::test]
  async fn ready_tracks_backend_presence() {
    let storage = Arc::new(BackendStorage::new());
    let readiness = ReadinessManager::new(Arc::clone(&storage));
    assert!(!readiness.ready());

    let (tx, _rx) = mpsc::channel(1);
    let backend = storage.add_backend("agent-a", Arc::new(ChannelPacketSender::new(tx)));
    assert!(readiness.ready());

    storage.remove_backend("agent-a", &backend);
    assert!(!readiness.ready());
  }
}
