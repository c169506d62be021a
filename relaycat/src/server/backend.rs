// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Backend handles over agent streams, their storage, and dial-time selection.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::common::protocol::Packet;
use crate::common::tunnel::{PacketSender, TransportError};
use crate::util::cancellation::CancellationListener;

/// Stable identity of one backend handle, distinct from the agent's id: an
/// agent that reconnects gets a new handle with a new id.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct BackendId(u64);

impl std::fmt::Debug for BackendId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "backend-{}", self.0)
  }
}

impl std::fmt::Display for BackendId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "backend-{}", self.0)
  }
}

struct MonotonicIdGenerator {
  next: AtomicU64,
}

impl MonotonicIdGenerator {
  fn new() -> Self {
    Self {
      next: AtomicU64::new(1),
    }
  }

  fn next(&self) -> BackendId {
    BackendId(self.next.fetch_add(1, Ordering::Relaxed))
  }
}

/// One live stream to one agent.
///
/// Many frontends may send toward the same agent concurrently; the handle
/// serialises them so packets reach the stream whole and in some order.
pub struct Backend {
  id: BackendId,
  sink: Arc<dyn PacketSender>,
  send_lock: tokio::sync::Mutex<()>,
  lifecycle: CancellationToken,
  cancellation: CancellationListener,
}

impl Backend {
  fn new(id: BackendId, sink: Arc<dyn PacketSender>) -> Self {
    let (lifecycle, cancellation) = CancellationListener::pair();
    Self {
      id,
      sink,
      send_lock: tokio::sync::Mutex::new(()),
      lifecycle,
      cancellation,
    }
  }

  pub fn id(&self) -> BackendId {
    self.id
  }

  pub async fn send(&self, packet: Packet) -> Result<(), TransportError> {
    let _guard = self.send_lock.lock().await;
    self.sink.send(packet).await
  }

  /// Fires when the underlying agent stream has ended; sends will fail from
  /// then on.
  pub fn cancellation(&self) -> &CancellationListener {
    &self.cancellation
  }

  /// Marks the underlying stream as ended. Called by the stream's handler,
  /// never by send-side users.
  pub(crate) fn mark_closed(&self) {
    self.lifecycle.cancel();
  }

  fn shares_sink_with(&self, sink: &Arc<dyn PacketSender>) -> bool {
    Arc::ptr_eq(&self.sink, sink)
  }
}

impl std::fmt::Debug for Backend {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Backend").field("id", &self.id).finish()
  }
}

struct StorageInner {
  /// For a given agent, index 0 is preferred for sending: agents tear down
  /// later duplicate streams themselves, so the oldest one lives longest.
  backends: HashMap<String, Vec<Arc<Backend>>>,
  /// Parallel record of which agents exist. Map iteration order is
  /// unreliable, so uniform random selection indexes this instead.
  agent_ids: Vec<String>,
}

/// The set of currently connected agents and their stream handles.
pub struct BackendStorage {
  inner: RwLock<StorageInner>,
  ids: MonotonicIdGenerator,
}

impl Default for BackendStorage {
  fn default() -> Self {
    Self::new()
  }
}

impl BackendStorage {
  pub fn new() -> Self {
    Self {
      inner: RwLock::new(StorageInner {
        backends: HashMap::new(),
        agent_ids: Vec::new(),
      }),
      ids: MonotonicIdGenerator::new(),
    }
  }

  /// Wraps `sink` in a new handle registered under `agent_id`. Re-adding a
  /// sink that is already registered returns its existing handle unchanged.
  pub fn add_backend(&self, agent_id: &str, sink: Arc<dyn PacketSender>) -> Arc<Backend> {
    let mut inner = self.inner.write().expect("backend storage lock poisoned");
    if let Some(existing) = inner.backends.get(agent_id) {
      if let Some(backend) = existing.iter().find(|b| b.shares_sink_with(&sink)) {
        tracing::warn!(
          agent_id,
          id = %backend.id(),
          "this should not happen: stream is already registered for this agent"
        );
        return Arc::clone(backend);
      }
    }
    let backend = Arc::new(Backend::new(self.ids.next(), sink));
    tracing::info!(agent_id, id = %backend.id(), "register backend");
    match inner.backends.get_mut(agent_id) {
      Some(handles) => handles.push(Arc::clone(&backend)),
      None => {
        inner
          .backends
          .insert(agent_id.to_string(), vec![Arc::clone(&backend)]);
        inner.agent_ids.push(agent_id.to_string());
      }
    }
    backend
  }

  /// Removes the matching handle, preserving the order of the remainder.
  /// When the agent's last handle goes, the agent itself is forgotten.
  pub fn remove_backend(&self, agent_id: &str, backend: &Arc<Backend>) {
    tracing::info!(agent_id, id = %backend.id(), "remove backend");
    let mut inner = self.inner.write().expect("backend storage lock poisoned");
    let Some(handles) = inner.backends.get_mut(agent_id) else {
      tracing::warn!(agent_id, "agent is not in the backend storage");
      return;
    };
    let Some(index) = handles.iter().position(|b| Arc::ptr_eq(b, backend)) else {
      tracing::error!(
        agent_id,
        id = %backend.id(),
        "stream is not registered for this agent"
      );
      return;
    };
    handles.remove(index);
    if index == 0 && !handles.is_empty() {
      tracing::warn!(
        agent_id,
        remaining = handles.len(),
        "removed the preferred stream while later duplicates remain"
      );
    }
    if handles.is_empty() {
      inner.backends.remove(agent_id);
      // Order of agents is unobservable, so swap-remove is fine.
      if let Some(index) = inner.agent_ids.iter().position(|id| id == agent_id) {
        inner.agent_ids.swap_remove(index);
      }
    }
  }

  pub fn get_backend(&self, agent_id: &str) -> Option<Arc<Backend>> {
    let inner = self.inner.read().expect("backend storage lock poisoned");
    inner
      .backends
      .get(agent_id)
      .and_then(|handles| handles.first())
      .map(Arc::clone)
  }

  /// A uniformly random agent's preferred handle.
  pub fn get_random_backend(&self) -> Option<Arc<Backend>> {
    let inner = self.inner.read().expect("backend storage lock poisoned");
    if inner.agent_ids.is_empty() {
      return None;
    }
    let pick = rand::thread_rng().gen_range(0..inner.agent_ids.len());
    let agent_id = &inner.agent_ids[pick];
    tracing::debug!(agent_id = %agent_id, "picked agent as backend");
    inner
      .backends
      .get(agent_id)
      .and_then(|handles| handles.first())
      .map(Arc::clone)
  }

  /// Number of distinct connected agents.
  pub fn num_backends(&self) -> usize {
    let inner = self.inner.read().expect("backend storage lock poisoned");
    inner.backends.len()
  }

  #[cfg(test)]
  pub(crate) fn handles(&self, agent_id: &str) -> Vec<Arc<Backend>> {
    let inner = self.inner.read().expect("backend storage lock poisoned");
    inner.backends.get(agent_id).cloned().unwrap_or_default()
  }
}

/// How the server picks an agent for a new dial. Chosen once at server
/// construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyStrategy {
  /// Uniformly random over connected agents.
  Default,
  /// The destination host names the agent: traffic for a node goes through
  /// the agent running on it.
  DestinationAffinity,
}

impl FromStr for ProxyStrategy {
  type Err = String;

  fn from_str(value: &str) -> Result<Self, Self::Err> {
    match value {
      "default" => Ok(Self::Default),
      "destination-affinity" => Ok(Self::DestinationAffinity),
      other => Err(format!("unknown proxy strategy {other:?}")),
    }
  }
}

/// Request-scoped inputs to backend selection.
#[derive(Debug, Clone, Default)]
pub struct DialContext {
  pub dest_ip: Option<String>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendSelectionError {
  #[error("no backend available")]
  NoBackendAvailable,
  #[error("no destination address in the dial context")]
  NoDestination,
}

/// Selection policy over [`BackendStorage`].
pub struct BackendManager {
  strategy: ProxyStrategy,
  storage: Arc<BackendStorage>,
}

impl BackendManager {
  pub fn new(strategy: ProxyStrategy, storage: Arc<BackendStorage>) -> Self {
    Self { strategy, storage }
  }

  pub fn strategy(&self) -> ProxyStrategy {
    self.strategy
  }

  pub fn backend(&self, context: &DialContext) -> Result<Arc<Backend>, BackendSelectionError> {
    match self.strategy {
      ProxyStrategy::Default => self
        .storage
        .get_random_backend()
        .ok_or(BackendSelectionError::NoBackendAvailable),
      ProxyStrategy::DestinationAffinity => {
        let agent_id = context
          .dest_ip
          .as_deref()
          .ok_or(BackendSelectionError::NoDestination)?;
        self
          .storage
          .get_backend(agent_id)
          .ok_or(BackendSelectionError::NoBackendAvailable)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;
  use tokio::sync::mpsc;

  use crate::common::tunnel::ChannelPacketSender;

  fn sink() -> Arc<dyn PacketSender> {
    let (tx, _rx) = mpsc::channel(1);
    Arc::new(ChannelPacketSender::new(tx))
  }

  #[tokio::test]
  async fn registration_tracks_distinct_agents() {
    let storage = BackendStorage::new();
    let a1 = storage.add_backend("agent-a", sink());
    let a2 = storage.add_backend("agent-a", sink());
    let b1 = storage.add_backend("agent-b", sink());
    assert_eq!(storage.num_backends(), 2);

    // Preferred handle is the oldest registration.
    assert!(Arc::ptr_eq(&storage.get_backend("agent-a").unwrap(), &a1));

    storage.remove_backend("agent-a", &a1);
    assert_eq!(storage.num_backends(), 2);
    assert!(Arc::ptr_eq(&storage.get_backend("agent-a").unwrap(), &a2));

    storage.remove_backend("agent-a", &a2);
    assert_eq!(storage.num_backends(), 1);
    assert!(storage.get_backend("agent-a").is_none());

    storage.remove_backend("agent-b", &b1);
    assert_eq!(storage.num_backends(), 0);
    assert!(storage.get_random_backend().is_none());
  }

  #[tokio::test]
  async fn re_adding_a_registered_sink_returns_the_existing_handle() {
    let storage = BackendStorage::new();
    let shared = sink();
    let first = storage.add_backend("agent-a", Arc::clone(&shared));
    let second = storage.add_backend("agent-a", shared);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(storage.handles("agent-a").len(), 1);
  }

  #[tokio::test]
  async fn removing_an_unknown_handle_changes_nothing() {
    let storage = BackendStorage::new();
    let registered = storage.add_backend("agent-a", sink());
    let other = BackendStorage::new().add_backend("agent-a", sink());
    storage.remove_backend("agent-a", &other);
    storage.remove_backend("agent-b", &registered);
    assert_eq!(storage.num_backends(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn concurrent_adds_are_all_visible() {
    let storage = Arc::new(BackendStorage::new());
    let mut tasks = Vec::new();
    for index in 0..1000 {
      let storage = Arc::clone(&storage);
      tasks.push(tokio::spawn(async move {
        storage.add_backend(&format!("agent-{index}"), sink());
      }));
    }
    for task in tasks {
      task.await.unwrap();
    }
    assert_eq!(storage.num_backends(), 1000);
    for _ in 0..1000 {
      assert!(storage.get_random_backend().is_some());
    }
  }

  #[tokio::test]
  async fn random_selection_is_roughly_uniform() {
    let storage = BackendStorage::new();
    let mut handles = HashMap::new();
    for index in 0..10 {
      let agent_id = format!("agent-{index}");
      let handle = storage.add_backend(&agent_id, sink());
      handles.insert(handle.id(), 0u32);
    }
    const DRAWS: u32 = 5000;
    for _ in 0..DRAWS {
      let picked = storage.get_random_backend().unwrap();
      *handles.get_mut(&picked.id()).unwrap() += 1;
    }
    let expected = DRAWS / 10;
    for (id, count) in handles {
      assert!(
        count.abs_diff(expected) < expected / 2,
        "{id:?} picked {count} times, expected about {expected}"
      );
    }
  }

  #[tokio::test]
  async fn default_strategy_requires_a_connected_agent() {
    let storage = Arc::new(BackendStorage::new());
    let manager = BackendManager::new(ProxyStrategy::Default, Arc::clone(&storage));
    assert_eq!(
      manager.backend(&DialContext::default()).unwrap_err(),
      BackendSelectionError::NoBackendAvailable
    );
    let handle = storage.add_backend("agent-a", sink());
    assert!(Arc::ptr_eq(
      &manager.backend(&DialContext::default()).unwrap(),
      &handle
    ));
  }

  #[tokio::test]
  async fn destination_affinity_follows_the_dial_context() {
    let storage = Arc::new(BackendStorage::new());
    let manager = BackendManager::new(ProxyStrategy::DestinationAffinity, Arc::clone(&storage));
    storage.add_backend("agent-a", sink());
    let wanted = storage.add_backend("agent-b", sink());

    assert_eq!(
      manager.backend(&DialContext::default()).unwrap_err(),
      BackendSelectionError::NoDestination
    );
    assert_eq!(
      manager
        .backend(&DialContext {
          dest_ip: Some("agent-c".to_string()),
        })
        .unwrap_err(),
      BackendSelectionError::NoBackendAvailable
    );
    let selected = manager
      .backend(&DialContext {
        dest_ip: Some("agent-b".to_string()),
      })
      .unwrap();
    assert!(Arc::ptr_eq(&selected, &wanted));
  }

  #[tokio::test]
  async fn handles_report_stream_end_through_cancellation() {
    let storage = BackendStorage::new();
    let backend = storage.add_backend("agent-a", sink());
    assert!(!backend.cancellation().is_cancelled());
    backend.mark_closed();
    assert!(backend.cancellation().is_cancelled());
    backend.cancellation().cancelled().await;
  }
}
