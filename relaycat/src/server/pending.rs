// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Short-lived dial state between DIAL_REQ and the agent's DIAL_RSP.

use std::sync::Arc;

use dashmap::DashMap;

use super::frontend::FrontendConnection;

/// Records keyed by the frontend-chosen dial nonce. A record is inserted
/// before its DIAL_REQ is sent, so it is always present by the time the
/// matching DIAL_RSP can arrive.
#[derive(Default)]
pub struct PendingDialTable {
  pending: DashMap<i64, Arc<FrontendConnection>>,
}

impl PendingDialTable {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&self, random: i64, connection: Arc<FrontendConnection>) {
    self.pending.insert(random, connection);
  }

  pub fn get(&self, random: i64) -> Option<Arc<FrontendConnection>> {
    self.pending.get(&random).map(|entry| Arc::clone(&entry))
  }

  pub fn remove(&self, random: i64) {
    self.pending.remove(&random);
  }

  pub fn len(&self) -> usize {
    self.pending.len()
  }

  pub fn is_empty(&self) -> bool {
    self.pending.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::sync::mpsc;

  use crate::common::tunnel::ChannelPacketSender;
  use crate::server::backend::BackendStorage;

  fn record() -> Arc<FrontendConnection> {
    let (tx, _rx) = mpsc::channel(1);
    let sink = Arc::new(ChannelPacketSender::new(tx));
    let backend = BackendStorage::new().add_backend("agent-a", sink.clone());
    FrontendConnection::proxy(sink, backend)
  }

  #[tokio::test]
  async fn add_get_remove() {
    let table = PendingDialTable::new();
    assert!(table.get(7).is_none());

    let pending = record();
    table.add(7, Arc::clone(&pending));
    assert!(Arc::ptr_eq(&table.get(7).unwrap(), &pending));
    assert_eq!(table.len(), 1);

    table.remove(7);
    assert!(table.get(7).is_none());
    assert!(table.is_empty());
  }
}
