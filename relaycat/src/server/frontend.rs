// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Per-connection routing records for frontends, and the registry that routes
//! established traffic back to them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, Instant};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::common::protocol::{Packet, PacketKind, Payload};
use crate::common::tunnel::{PacketSender, TransportError};
use crate::server::backend::Backend;

/// Where an established record routes to, as chosen by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendRoute {
  pub agent_id: String,
  pub connect_id: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum FrontendSendError {
  #[error("frontend stream rejected packet: {0}")]
  Transport(#[from] TransportError),
  #[error("I/O failure on hijacked connection: {0}")]
  Io(#[from] std::io::Error),
  #[error("{0:?} packets cannot be sent on a hijacked connection")]
  UnsupportedPacket(PacketKind),
}

/// The two ways a frontend can be attached to the server.
enum FrontendSink {
  /// A typed-message proxy stream; packets pass through unchanged.
  Proxy(Arc<dyn PacketSender>),
  /// A hijacked HTTP CONNECT socket. Only the byte-level meaning of a packet
  /// survives: DATA becomes raw bytes, teardown packets become a socket
  /// close, and a successful DIAL_RSP is a no-op since the 200 response
  /// already told the client to start streaming.
  HttpConnect {
    writer: tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    closed: CancellationToken,
  },
}

/// One frontend connection's routing record.
///
/// Lives in the pending-dial table from DIAL_REQ until DIAL_RSP, then in the
/// frontend registry under `(agent_id, connect_id)` until teardown. The
/// established latch fires exactly once, after the record has been promoted.
pub struct FrontendConnection {
  sink: FrontendSink,
  backend: Arc<Backend>,
  started_at: Instant,
  route: OnceLock<FrontendRoute>,
  established_trigger: triggered::Trigger,
  established: triggered::Listener,
}

impl FrontendConnection {
  pub fn proxy(sink: Arc<dyn PacketSender>, backend: Arc<Backend>) -> Arc<Self> {
    Arc::new(Self::new(FrontendSink::Proxy(sink), backend))
  }

  pub fn hijacked(
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    closed: CancellationToken,
    backend: Arc<Backend>,
  ) -> Arc<Self> {
    Arc::new(Self::new(
      FrontendSink::HttpConnect {
        writer: tokio::sync::Mutex::new(writer),
        closed,
      },
      backend,
    ))
  }

  fn new(sink: FrontendSink, backend: Arc<Backend>) -> Self {
    let (established_trigger, established) = triggered::trigger();
    Self {
      sink,
      backend,
      started_at: Instant::now(),
      route: OnceLock::new(),
      established_trigger,
      established,
    }
  }

  /// The backend chosen at dial time. It may have terminated since; sends
  /// through it will fail in that case.
  pub fn backend(&self) -> &Arc<Backend> {
    &self.backend
  }

  pub fn route(&self) -> Option<&FrontendRoute> {
    self.route.get()
  }

  /// Records the agent-chosen route. Set once, immediately before promotion
  /// into the frontend registry.
  pub fn set_route(&self, agent_id: impl Into<String>, connect_id: i64) {
    let route = FrontendRoute {
      agent_id: agent_id.into(),
      connect_id,
    };
    if self.route.set(route).is_err() {
      tracing::error!("route for an established frontend was set twice; keeping the first");
    }
  }

  pub fn mark_established(&self) {
    self.established_trigger.trigger();
  }

  /// Resolves once the record has been promoted. Never resolves for dials
  /// that fail or whose agent stream ends first.
  pub fn established(&self) -> triggered::Listener {
    self.established.clone()
  }

  pub fn dial_latency(&self) -> Duration {
    self.started_at.elapsed()
  }

  /// Routes `packet` onto the frontend's transport, interpreting it
  /// according to the attachment mode.
  pub async fn send(&self, packet: Packet) -> Result<(), FrontendSendError> {
    match &self.sink {
      FrontendSink::Proxy(sender) => Ok(sender.send(packet).await?),
      FrontendSink::HttpConnect { writer, closed } => match packet.payload {
        Some(Payload::Data(data)) => {
          let mut writer = writer.lock().await;
          writer.write_all(&data.data).await?;
          writer.flush().await?;
          Ok(())
        }
        Some(Payload::CloseResponse(_)) => Self::close_socket(writer, closed).await,
        Some(Payload::DialResponse(response)) => {
          if response.error.is_empty() {
            Ok(())
          } else {
            // Destination unreachable; the raw socket has no way to say so.
            Self::close_socket(writer, closed).await
          }
        }
        _ => Err(FrontendSendError::UnsupportedPacket(packet.kind())),
      },
    }
  }

  /// Closes a hijacked socket; a no-op for proxy-stream attachments.
  pub async fn close(&self) {
    if let FrontendSink::HttpConnect { writer, closed } = &self.sink {
      let _ = Self::close_socket(writer, closed).await;
    }
  }

  async fn close_socket(
    writer: &tokio::sync::Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    closed: &CancellationToken,
  ) -> Result<(), FrontendSendError> {
    let result = writer.lock().await.shutdown().await;
    closed.cancel();
    Ok(result?)
  }
}

#[derive(thiserror::Error, Debug)]
pub enum FrontendRegistryError {
  #[error("agent {0:?} has no registered frontends")]
  AgentNotFound(String),
  #[error("no frontend for connection {1} on agent {0:?}")]
  ConnectionNotFound(String, i64),
}

/// Established records keyed by `(agent_id, connect_id)`. One writer lock
/// guards both levels; the listing used for disconnect cleanup runs under the
/// reader lock.
#[derive(Default)]
pub struct FrontendRegistry {
  frontends: RwLock<HashMap<String, HashMap<i64, Arc<FrontendConnection>>>>,
}

impl FrontendRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_frontend(
    &self,
    agent_id: &str,
    connect_id: i64,
    connection: Arc<FrontendConnection>,
  ) {
    tracing::info!(agent_id, connect_id, "register frontend");
    let mut frontends = self.frontends.write().expect("frontend registry poisoned");
    frontends
      .entry(agent_id.to_string())
      .or_default()
      .insert(connect_id, connection);
  }

  pub fn remove_frontend(&self, agent_id: &str, connect_id: i64) {
    let mut frontends = self.frontends.write().expect("frontend registry poisoned");
    let Some(connections) = frontends.get_mut(agent_id) else {
      tracing::warn!(agent_id, "agent has no frontends to remove");
      return;
    };
    if connections.remove(&connect_id).is_none() {
      tracing::warn!(agent_id, connect_id, "frontend connection is not registered");
      return;
    }
    tracing::info!(agent_id, connect_id, "remove frontend");
    if connections.is_empty() {
      frontends.remove(agent_id);
    }
  }

  pub fn get_frontend(
    &self,
    agent_id: &str,
    connect_id: i64,
  ) -> Result<Arc<FrontendConnection>, FrontendRegistryError> {
    let frontends = self.frontends.read().expect("frontend registry poisoned");
    let connections = frontends
      .get(agent_id)
      .ok_or_else(|| FrontendRegistryError::AgentNotFound(agent_id.to_string()))?;
    connections
      .get(&connect_id)
      .map(Arc::clone)
      .ok_or_else(|| FrontendRegistryError::ConnectionNotFound(agent_id.to_string(), connect_id))
  }

  /// Every record under `agent_id` that was dialed through this specific
  /// handle. Records bound to other handles for the same agent, such as a
  /// reconnect's replacement stream, are left alone.
  pub fn frontends_for_backend(
    &self,
    agent_id: &str,
    backend: &Arc<Backend>,
  ) -> Vec<Arc<FrontendConnection>> {
    let frontends = self.frontends.read().expect("frontend registry poisoned");
    frontends
      .get(agent_id)
      .map(|connections| {
        connections
          .values()
          .filter(|connection| Arc::ptr_eq(connection.backend(), backend))
          .map(Arc::clone)
          .collect()
      })
      .unwrap_or_default()
  }

  pub fn num_frontends(&self) -> usize {
    let frontends = self.frontends.read().expect("frontend registry poisoned");
    frontends.values().map(HashMap::len).sum()
  }
}
