// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The proxy server core: accepts frontend and agent streams and routes
//! packets between them.
//!
//! Each stream is driven by two cooperating tasks: a reader that pushes
//! inbound packets onto a bounded channel and closes it when the peer goes
//! away, and a handler that drains the channel. The channel closing is the
//! only end-of-stream signal the handlers ever see.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::common::protocol::headers::{self, MetadataError, StreamMetadata};
use crate::common::protocol::{Packet, Payload};
use crate::common::tunnel::{AgentStream, PacketSender, PacketSource, TransportError};

pub mod auth;
pub mod backend;
pub mod frontend;
pub mod pending;
pub mod readiness;
pub mod tunnel;

use auth::{authenticate_agent, AgentAuthenticationOptions, AuthenticationError};
use backend::{Backend, BackendManager, BackendStorage, DialContext, ProxyStrategy};
use frontend::{FrontendConnection, FrontendRegistry};
use pending::PendingDialTable;
use readiness::ReadinessManager;

/// Inbound packets queue at most this deep per stream before the reader
/// stops pulling from the transport.
const RECV_CHANNEL_DEPTH: usize = 10;

pub struct ProxyServerConfig {
  pub strategy: ProxyStrategy,
  /// Identity of this server instance, returned to agents.
  pub server_id: String,
  /// Size of the server fleet, returned to agents as a hint for how many
  /// parallel streams to open.
  pub server_count: usize,
  /// Agent authentication; `None` disables it.
  pub agent_auth: Option<AgentAuthenticationOptions>,
}

#[derive(thiserror::Error, Debug)]
pub enum BackendStreamError {
  #[error(transparent)]
  Metadata(#[from] MetadataError),
  #[error(transparent)]
  Authentication(#[from] AuthenticationError),
  #[error("failed to send stream header to agent: {0}")]
  Header(#[source] TransportError),
}

pub struct ProxyServer {
  backend_manager: BackendManager,
  storage: Arc<BackendStorage>,
  readiness: ReadinessManager,
  frontends: FrontendRegistry,
  pending_dial: PendingDialTable,
  server_id: String,
  server_count: usize,
  agent_auth: Option<AgentAuthenticationOptions>,
}

impl ProxyServer {
  pub fn new(config: ProxyServerConfig) -> Self {
    let storage = Arc::new(BackendStorage::new());
    Self {
      backend_manager: BackendManager::new(config.strategy, Arc::clone(&storage)),
      readiness: ReadinessManager::new(Arc::clone(&storage)),
      storage,
      frontends: FrontendRegistry::new(),
      pending_dial: PendingDialTable::new(),
      server_id: config.server_id,
      server_count: config.server_count,
      agent_auth: config.agent_auth,
    }
  }

  pub fn readiness(&self) -> &ReadinessManager {
    &self.readiness
  }

  /// Serves one frontend proxy stream until the peer closes it.
  ///
  /// The first packet is expected to be a DIAL_REQ; the backend it selects is
  /// latched for the remaining lifetime of the stream. A DIAL_REQ that finds
  /// no backend is dropped without a reply, leaving the frontend waiting for
  /// a DIAL_RSP that never comes.
  pub async fn serve_frontend(&self, sink: Arc<dyn PacketSender>, source: PacketSource) {
    let span = tracing::span!(tracing::Level::DEBUG, "frontend_stream");
    self
      .serve_frontend_inner(sink, source)
      .instrument(span)
      .await
  }

  async fn serve_frontend_inner(&self, sink: Arc<dyn PacketSender>, source: PacketSource) {
    tracing::debug!("start serving frontend stream");
    let mut packets = spawn_reader(source);
    let mut backend: Option<Arc<Backend>> = None;
    let mut first_connect_id: i64 = 0;

    while let Some(packet) = packets.recv().await {
      match &packet.payload {
        Some(Payload::DialRequest(request)) => {
          let selected = match self.backend_manager.backend(&DialContext::default()) {
            Ok(selected) => selected,
            Err(error) => {
              tracing::error!(%error, "failed to get a backend");
              continue;
            }
          };
          self.pending_dial.add(
            request.random,
            FrontendConnection::proxy(Arc::clone(&sink), Arc::clone(&selected)),
          );
          if let Err(error) = selected.send(packet.clone()).await {
            tracing::warn!(%error, "DIAL_REQ to backend failed");
          }
          backend = Some(selected);
        }
        Some(Payload::Data(data)) => {
          if first_connect_id == 0 {
            first_connect_id = data.connect_id;
          } else if first_connect_id != data.connect_id {
            tracing::warn!(
              connect_id = data.connect_id,
              first_connect_id,
              "DATA does not match the first connection id on this stream"
            );
          }
          let Some(backend) = &backend else {
            tracing::error!(
              connect_id = data.connect_id,
              "no backend latched; a dial request must come first"
            );
            continue;
          };
          if let Err(error) = backend.send(packet.clone()).await {
            tracing::warn!(%error, "DATA to backend failed");
          }
        }
        Some(Payload::CloseRequest(request)) => {
          let Some(backend) = &backend else {
            tracing::error!(
              connect_id = request.connect_id,
              "no backend latched; a dial request must come first"
            );
            continue;
          };
          if let Err(error) = backend.send(packet.clone()).await {
            tracing::warn!(%error, "CLOSE_REQ to backend failed");
          }
        }
        _ => {
          tracing::debug!(kind = ?packet.kind(), "ignoring packet from frontend");
        }
      }
    }

    // The frontend is gone; tell the agent to terminate the downstream
    // connection it was serving.
    tracing::debug!(connect_id = first_connect_id, "frontend stream closed");
    let Some(backend) = backend else {
      return;
    };
    if let Err(error) = backend.send(Packet::close_request(first_connect_id)).await {
      tracing::warn!(%error, "CLOSE_REQ to backend failed");
    }
  }

  /// Serves one agent stream until the peer closes it, then tears down every
  /// frontend that was routed through this specific stream.
  pub async fn serve_backend<S>(
    &self,
    stream: Arc<S>,
    source: PacketSource,
    metadata: StreamMetadata,
  ) -> Result<(), BackendStreamError>
  where
    S: AgentStream + 'static,
  {
    let agent_id = metadata.exactly_one(headers::AGENT_ID)?.to_string();
    let span = tracing::span!(tracing::Level::DEBUG, "backend_stream", agent_id = %agent_id);
    self
      .serve_backend_inner(stream, source, metadata, agent_id.clone())
      .instrument(span)
      .await
  }

  async fn serve_backend_inner<S>(
    &self,
    stream: Arc<S>,
    source: PacketSource,
    metadata: StreamMetadata,
    agent_id: String,
  ) -> Result<(), BackendStreamError>
  where
    S: AgentStream + 'static,
  {
    tracing::info!("connect request from agent");
    if let Some(options) = &self.agent_auth {
      if let Err(error) = authenticate_agent(options, &metadata).await {
        tracing::info!(%error, "agent authentication failed");
        return Err(error.into());
      }
    }

    let sink: Arc<dyn PacketSender> = stream.clone();
    let backend = self.storage.add_backend(&agent_id, sink);

    let mut header = StreamMetadata::new();
    header.append(headers::SERVER_ID, self.server_id.clone());
    header.append(headers::SERVER_COUNT, self.server_count.to_string());
    if let Err(error) = stream.send_header(header).await {
      self.storage.remove_backend(&agent_id, &backend);
      backend.mark_closed();
      return Err(BackendStreamError::Header(error));
    }

    let mut packets = spawn_reader(source);
    while let Some(packet) = packets.recv().await {
      self.route_backend_packet(&agent_id, packet).await;
    }

    tracing::info!(id = %backend.id(), "agent stream closed");
    backend.mark_closed();
    self.storage.remove_backend(&agent_id, &backend);
    self.close_backend_frontends(&agent_id, &backend).await;
    Ok(())
  }

  /// Routes one inbound agent packet back to the frontend it belongs to.
  async fn route_backend_packet(&self, agent_id: &str, packet: Packet) {
    match &packet.payload {
      Some(Payload::DialResponse(response)) => {
        let random = response.random;
        let connect_id = response.connect_id;
        tracing::debug!(random, connect_id, "received DIAL_RSP");
        let Some(frontend) = self.pending_dial.get(random) else {
          tracing::warn!(random, "DIAL_RSP not recognized; dropped");
          return;
        };
        let mut dial_failed = false;
        if !response.error.is_empty() {
          tracing::warn!(error = %response.error, "DIAL_RSP carries a dial failure");
          dial_failed = true;
        }
        let forwarded = frontend.send(packet.clone()).await;
        self.pending_dial.remove(random);
        if let Err(error) = forwarded {
          tracing::warn!(%error, "DIAL_RSP send to frontend failed");
          dial_failed = true;
        }
        // A failed dial never becomes an established route; the frontend
        // tears itself down from the forwarded response.
        if dial_failed {
          return;
        }
        frontend.set_route(agent_id, connect_id);
        self
          .frontends
          .add_frontend(agent_id, connect_id, Arc::clone(&frontend));
        frontend.mark_established();
        tracing::info!(
          connect_id,
          latency_ms = frontend.dial_latency().as_millis() as u64,
          "dial established"
        );
      }
      Some(Payload::Data(data)) => {
        tracing::debug!(
          connect_id = data.connect_id,
          bytes = data.data.len(),
          "received DATA from agent"
        );
        let frontend = match self.frontends.get_frontend(agent_id, data.connect_id) {
          Ok(frontend) => frontend,
          Err(error) => {
            tracing::warn!(%error, "DATA for unknown frontend; dropped");
            return;
          }
        };
        if let Err(error) = frontend.send(packet.clone()).await {
          tracing::warn!(%error, "DATA send to frontend failed");
        }
      }
      Some(Payload::CloseResponse(response)) => {
        let connect_id = response.connect_id;
        tracing::debug!(connect_id, "received CLOSE_RSP");
        let frontend = match self.frontends.get_frontend(agent_id, connect_id) {
          Ok(frontend) => frontend,
          Err(error) => {
            tracing::warn!(%error, "CLOSE_RSP for unknown frontend; dropped");
            return;
          }
        };
        if let Err(error) = frontend.send(packet.clone()).await {
          // Expected when the frontend closed first.
          tracing::info!(%error, "CLOSE_RSP send to frontend failed");
        }
        self.frontends.remove_frontend(agent_id, connect_id);
      }
      _ => {
        tracing::warn!(kind = ?packet.kind(), "unrecognized packet from agent");
      }
    }
  }

  /// Closes every frontend whose dial went through `backend`. Dials still
  /// pending on this handle are left in place and will never complete; their
  /// frontends only find out through their own stream ending.
  async fn close_backend_frontends(&self, agent_id: &str, backend: &Arc<Backend>) {
    let orphaned = self.frontends.frontends_for_backend(agent_id, backend);
    tracing::info!(
      count = orphaned.len(),
      "closing frontends connected to disconnected agent"
    );
    for frontend in orphaned {
      let Some(route) = frontend.route() else {
        continue;
      };
      self.frontends.remove_frontend(agent_id, route.connect_id);
      if let Err(error) = frontend.send(Packet::close_response(route.connect_id)).await {
        tracing::warn!(%error, "CLOSE_RSP to frontend failed");
      }
    }
  }
}

/// Spawns the blocking reader half of a stream pair. The returned channel
/// closes when the peer goes away, which is the handler's only stop signal.
fn spawn_reader(mut source: PacketSource) -> mpsc::Receiver<Packet> {
  let (tx, rx) = mpsc::channel(RECV_CHANNEL_DEPTH);
  tokio::spawn(async move {
    while let Some(next) = source.next().await {
      match next {
        Ok(packet) => {
          if tx.send(packet).await.is_err() {
            break;
          }
        }
        Err(error) => {
          tracing::warn!(%error, "stream read error");
          break;
        }
      }
    }
  });
  rx
}
