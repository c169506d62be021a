// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP CONNECT entry point: tunnels a raw client socket to an agent.

use std::sync::Arc;

use rand::Rng;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;

use crate::common::protocol::Packet;
use crate::common::tunnel::TransportError;
use crate::server::backend::{BackendSelectionError, DialContext, ProxyStrategy};
use crate::server::frontend::FrontendConnection;
use crate::server::ProxyServer;

/// Tunnel reads are chunked at 4 KiB; each chunk becomes one DATA packet.
const READ_CHUNK: usize = 1 << 12;
/// Request heads beyond this are rejected rather than buffered.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum TunnelError {
  #[error("I/O failure on client connection: {0}")]
  Io(#[from] std::io::Error),
  #[error("malformed request head")]
  MalformedRequest,
  #[error("request head too large")]
  HeadTooLarge,
  #[error("this proxy only supports CONNECT passthrough")]
  MethodNotAllowed,
  #[error("currently no tunnels available: {0}")]
  NoBackend(#[from] BackendSelectionError),
  #[error("failed to forward the dial request: {0}")]
  Dial(TransportError),
}

struct RequestHead {
  method: String,
  target: String,
}

/// Serves HTTP CONNECT clients over raw sockets.
///
/// After the 200 response the socket is an opaque byte stream in both
/// directions: client bytes become DATA packets toward the agent, and agent
/// packets reach the socket through the routing record's adapter.
pub struct Tunnel {
  server: Arc<ProxyServer>,
}

impl Tunnel {
  pub fn new(server: Arc<ProxyServer>) -> Self {
    Self { server }
  }

  pub async fn serve<S>(&self, socket: S) -> Result<(), TunnelError>
  where
    S: AsyncRead + AsyncWrite + Send + 'static,
  {
    let (read_half, mut write_half) = tokio::io::split(socket);
    let mut reader = BufReader::new(read_half);

    let request = read_request_head(&mut reader).await?;
    tracing::info!(method = %request.method, host = %request.target, "received tunnel request");
    if request.method != "CONNECT" {
      respond(
        &mut write_half,
        "405 Method Not Allowed",
        "this proxy only supports CONNECT passthrough",
      )
      .await?;
      return Err(TunnelError::MethodNotAllowed);
    }

    let mut context = DialContext::default();
    if self.server.backend_manager.strategy() == ProxyStrategy::DestinationAffinity {
      // The host part of the CONNECT target names the agent.
      let host = request
        .target
        .split(':')
        .next()
        .unwrap_or(request.target.as_str());
      context.dest_ip = Some(host.to_string());
    }
    let backend = match self.server.backend_manager.backend(&context) {
      Ok(backend) => backend,
      Err(error) => {
        respond(
          &mut write_half,
          "500 Internal Server Error",
          &format!("currently no tunnels available: {error}"),
        )
        .await?;
        return Err(error.into());
      }
    };

    write_half
      .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
      .await?;
    write_half.flush().await?;

    let random = rand::thread_rng().gen_range(0..i64::MAX);
    let closed = CancellationToken::new();
    let connection = FrontendConnection::hijacked(
      Box::new(write_half),
      closed.clone(),
      Arc::clone(&backend),
    );
    tracing::debug!(random, "registering pending tunnel dial");
    self.server.pending_dial.add(random, Arc::clone(&connection));
    let dial = Packet::dial_request("tcp", request.target.clone(), random);
    if let Err(error) = backend.send(dial).await {
      tracing::error!(%error, "failed to tunnel dial request");
      return Err(TunnelError::Dial(error));
    }
    if backend.cancellation().is_cancelled() {
      tracing::error!("agent stream already ended after accepting the dial");
    }

    // Wait for the dial to be established. A failed dial closes the socket
    // through the adapter instead of firing the latch.
    tokio::select! {
      _ = connection.established() => {}
      _ = closed.cancelled() => {
        tracing::debug!(random, "tunnel closed before the dial was established");
        return Ok(());
      }
    }
    let route = match connection.route() {
      Some(route) => route.clone(),
      None => {
        tracing::error!("established tunnel has no route; dropping the connection");
        connection.close().await;
        return Ok(());
      }
    };

    tracing::info!(
      agent_id = %route.agent_id,
      connect_id = route.connect_id,
      host = %request.target,
      "starting tunnel proxying"
    );
    let mut buffer = [0u8; READ_CHUNK];
    let mut total: usize = 0;
    loop {
      tokio::select! {
        _ = closed.cancelled() => break,
        read = reader.read(&mut buffer) => match read {
          Ok(0) => {
            tracing::warn!(host = %request.target, "EOF from client");
            break;
          }
          Ok(count) => {
            total += count;
            let packet = Packet::data(route.connect_id, buffer[..count].to_vec());
            if let Err(error) = backend.send(packet).await {
              tracing::error!(%error, "error sending DATA to backend");
              break;
            }
            tracing::debug!(bytes = count, total, "forwarded tunnel bytes");
          }
          Err(error) => {
            tracing::error!(%error, "error reading from client connection");
            break;
          }
        }
      }
    }
    connection.close().await;
    tracing::info!(
      host = %request.target,
      agent_id = %route.agent_id,
      connect_id = route.connect_id,
      "stopping tunnel transfer"
    );
    Ok(())
  }
}

/// Reads the request line and drains the headers up to the blank line; the
/// header contents are irrelevant to tunneling.
async fn read_request_head<R>(reader: &mut R) -> Result<RequestHead, TunnelError>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = String::new();
  let mut consumed = reader.read_line(&mut line).await?;
  if consumed == 0 {
    return Err(TunnelError::MalformedRequest);
  }
  let mut parts = line.split_whitespace();
  let (Some(method), Some(target)) = (parts.next(), parts.next()) else {
    return Err(TunnelError::MalformedRequest);
  };
  let head = RequestHead {
    method: method.to_string(),
    target: target.to_string(),
  };
  loop {
    let mut header = String::new();
    let count = reader.read_line(&mut header).await?;
    if count == 0 {
      // EOF before the blank line that ends the head.
      return Err(TunnelError::MalformedRequest);
    }
    consumed += count;
    if consumed > MAX_REQUEST_HEAD {
      return Err(TunnelError::HeadTooLarge);
    }
    if header == "\r\n" || header == "\n" {
      return Ok(head);
    }
  }
}

async fn respond<W>(writer: &mut W, status: &str, body: &str) -> std::io::Result<()>
where
  W: AsyncWrite + Unpin,
{
  let response = format!(
    "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {length}\r\n\r\n{body}",
    length = body.len(),
  );
  writer.write_all(response.as_bytes()).await?;
  writer.flush().await
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  use tokio::io::DuplexStream;
  use tokio::sync::mpsc;
  use tokio::time::timeout;

  use crate::common::protocol::headers::{StreamMetadata, AGENT_ID};
  use crate::common::protocol::Payload;
  use crate::common::tunnel::{receiver_source, ChannelAgentStream};
  use crate::server::{ProxyServerConfig, ProxyServer};

  fn test_server(strategy: ProxyStrategy) -> Arc<ProxyServer> {
    Arc::new(ProxyServer::new(ProxyServerConfig {
      strategy,
      server_id: "server-1".to_string(),
      server_count: 1,
      agent_auth: None,
    }))
  }

  struct TestAgent {
    to_server: mpsc::Sender<Packet>,
    from_server: mpsc::Receiver<Packet>,
    _task: tokio::task::JoinHandle<()>,
  }

  async fn connect_agent(server: &Arc<ProxyServer>, agent_id: &str) -> TestAgent {
    let (to_agent_tx, from_server) = mpsc::channel(16);
    let (header_tx, mut headers) = mpsc::unbounded_channel();
    let stream = Arc::new(ChannelAgentStream::new(to_agent_tx, header_tx));
    let (to_server, from_agent) = mpsc::channel(16);
    let metadata = StreamMetadata::from_pairs([(AGENT_ID, agent_id)]);
    let server = Arc::clone(server);
    let task = tokio::spawn(async move {
      server
        .serve_backend(stream, receiver_source(from_agent), metadata)
        .await
        .unwrap();
    });
    timeout(Duration::from_secs(5), headers.recv())
      .await
      .expect("timed out waiting for the stream header")
      .expect("agent stream ended before its header");
    TestAgent {
      to_server,
      from_server,
      _task: task,
    }
  }

  fn serve_tunnel(
    server: &Arc<ProxyServer>,
  ) -> (DuplexStream, tokio::task::JoinHandle<Result<(), TunnelError>>) {
    let (client, socket) = tokio::io::duplex(4096);
    let server = Arc::clone(server);
    let task = tokio::spawn(async move { Tunnel::new(server).serve(socket).await });
    (client, task)
  }

  async fn read_response_head(client: &mut (impl AsyncRead + Unpin)) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    timeout(Duration::from_secs(5), async {
      while !head.ends_with(b"\r\n\r\n") {
        let count = client.read(&mut byte).await.unwrap();
        if count == 0 {
          break;
        }
        head.push(byte[0]);
      }
    })
    .await
    .expect("timed out reading the response head");
    String::from_utf8(head).unwrap()
  }

  async fn recv(receiver: &mut mpsc::Receiver<Packet>) -> Packet {
    timeout(Duration::from_secs(5), receiver.recv())
      .await
      .expect("timed out waiting for a packet")
      .expect("stream ended while waiting for a packet")
  }

  #[tokio::test]
  async fn non_connect_requests_get_405() {
    let server = test_server(ProxyStrategy::Default);
    let (mut client, task) = serve_tunnel(&server);
    client
      .write_all(b"GET /metrics HTTP/1.1\r\nhost: example\r\n\r\n")
      .await
      .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 405"), "{head}");
    assert!(matches!(
      task.await.unwrap(),
      Err(TunnelError::MethodNotAllowed)
    ));
  }

  #[tokio::test]
  async fn connect_without_agents_gets_500() {
    let server = test_server(ProxyStrategy::Default);
    let (mut client, task) = serve_tunnel(&server);
    client
      .write_all(b"CONNECT node-1:443 HTTP/1.1\r\nhost: node-1:443\r\n\r\n")
      .await
      .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 500"), "{head}");
    assert!(matches!(task.await.unwrap(), Err(TunnelError::NoBackend(_))));
    assert!(server.pending_dial.is_empty());
  }

  #[tokio::test]
  async fn destination_affinity_routes_to_the_named_agent() {
    let server = test_server(ProxyStrategy::DestinationAffinity);
    let mut agent_a = connect_agent(&server, "agent-a").await;
    let mut agent_b = connect_agent(&server, "agent-b").await;

    let (mut client, task) = serve_tunnel(&server);
    client
      .write_all(b"CONNECT agent-b:443 HTTP/1.1\r\nhost: agent-b:443\r\n\r\n")
      .await
      .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let dial = recv(&mut agent_b.from_server).await;
    let random = match &dial.payload {
      Some(Payload::DialRequest(request)) => {
        assert_eq!(request.address, "agent-b:443");
        assert_eq!(request.protocol, "tcp");
        request.random
      }
      other => panic!("expected a DIAL_REQ, got {other:?}"),
    };
    assert!(
      agent_a.from_server.try_recv().is_err(),
      "the dial must never reach the other agent"
    );

    agent_b
      .to_server
      .send(Packet::dial_response(random, 201, ""))
      .await
      .unwrap();

    client.write_all(b"ping").await.unwrap();
    assert_eq!(
      recv(&mut agent_b.from_server).await,
      Packet::data(201, b"ping".to_vec())
    );

    agent_b
      .to_server
      .send(Packet::data(201, b"pong".to_vec()))
      .await
      .unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"pong");

    drop(client);
    task.await.unwrap().unwrap();
  }

  #[tokio::test]
  async fn failed_dials_close_the_client_socket() {
    let server = test_server(ProxyStrategy::Default);
    let mut agent = connect_agent(&server, "agent-a").await;

    let (mut client, task) = serve_tunnel(&server);
    client
      .write_all(b"CONNECT node-1:443 HTTP/1.1\r\n\r\n")
      .await
      .unwrap();
    let head = read_response_head(&mut client).await;
    assert!(head.starts_with("HTTP/1.1 200"), "{head}");

    let dial = recv(&mut agent.from_server).await;
    let random = match &dial.payload {
      Some(Payload::DialRequest(request)) => request.random,
      other => panic!("expected a DIAL_REQ, got {other:?}"),
    };
    agent
      .to_server
      .send(Packet::dial_response(random, 0, "unreachable"))
      .await
      .unwrap();

    // The client observes the socket closing, not a reply.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    task.await.unwrap().unwrap();
    assert!(server.pending_dial.is_empty());
    assert_eq!(server.frontends.num_frontends(), 0);
  }
}
