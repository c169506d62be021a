// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Listener plumbing: accepts the three kinds of connections and hands each
//! stream to the routing core.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use relaycat::common::tunnel::{framed, framed_source, FramedPacketSender};
use relaycat::server::backend::ProxyStrategy;
use relaycat::server::tunnel::Tunnel;
use relaycat::server::{ProxyServer, ProxyServerConfig};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug)]
pub struct ServerArgs {
  pub strategy: ProxyStrategy,
  pub server_id: String,
  pub server_count: usize,
  pub agent_bind: SocketAddr,
  pub proxy_bind: SocketAddr,
  pub tunnel_bind: SocketAddr,
}

pub async fn server_main(args: ServerArgs) -> Result<()> {
  let server = Arc::new(ProxyServer::new(ProxyServerConfig {
    strategy: args.strategy,
    server_id: args.server_id,
    server_count: args.server_count,
    // Token authentication needs a binding to an identity service; the
    // standalone binary runs with it disabled.
    agent_auth: None,
  }));

  let (shutdown_trigger, shutdown) = triggered::trigger();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::info!("shutdown requested");
      shutdown_trigger.trigger();
    }
  });

  let agent_listener = TcpListener::bind(args.agent_bind)
    .await
    .context("binding the agent listener")?;
  let proxy_listener = TcpListener::bind(args.proxy_bind)
    .await
    .context("binding the proxy listener")?;
  let tunnel_listener = TcpListener::bind(args.tunnel_bind)
    .await
    .context("binding the tunnel listener")?;
  tracing::info!(
    agents = %args.agent_bind,
    proxies = %args.proxy_bind,
    tunnels = %args.tunnel_bind,
    "listening"
  );

  tokio::try_join!(
    serve_agents(Arc::clone(&server), agent_listener, shutdown.clone()),
    serve_proxies(Arc::clone(&server), proxy_listener, shutdown.clone()),
    serve_tunnels(server, tunnel_listener, shutdown),
  )?;
  Ok(())
}

async fn serve_agents(
  server: Arc<ProxyServer>,
  listener: TcpListener,
  shutdown: triggered::Listener,
) -> Result<()> {
  loop {
    tokio::select! {
      _ = shutdown.clone() => return Ok(()),
      accepted = listener.accept() => {
        let (socket, peer) = match accepted {
          Ok(accepted) => accepted,
          Err(error) => {
            tracing::warn!(%error, "agent accept failed");
            continue;
          }
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
          if let Err(error) = serve_agent_socket(server, socket).await {
            tracing::debug!(%error, %peer, "agent stream ended with error");
          }
        });
      }
    }
  }
}

async fn serve_agent_socket(server: Arc<ProxyServer>, socket: TcpStream) -> Result<()> {
  let (mut read_half, write_half) = socket.into_split();
  // Agents open their stream with a metadata frame; everything after is
  // packets.
  let metadata = framed::read_metadata(&mut read_half).await?;
  let stream = Arc::new(FramedPacketSender::new(write_half));
  server
    .serve_backend(stream, framed_source(read_half), metadata)
    .await?;
  Ok(())
}

async fn serve_proxies(
  server: Arc<ProxyServer>,
  listener: TcpListener,
  shutdown: triggered::Listener,
) -> Result<()> {
  loop {
    tokio::select! {
      _ = shutdown.clone() => return Ok(()),
      accepted = listener.accept() => {
        let (socket, peer) = match accepted {
          Ok(accepted) => accepted,
          Err(error) => {
            tracing::warn!(%error, "proxy accept failed");
            continue;
          }
        };
        tracing::debug!(%peer, "proxy stream accepted");
        let server = Arc::clone(&server);
        tokio::spawn(async move {
          let (read_half, write_half) = socket.into_split();
          let sink = Arc::new(FramedPacketSender::new(write_half));
          server.serve_frontend(sink, framed_source(read_half)).await;
        });
      }
    }
  }
}

async fn serve_tunnels(
  server: Arc<ProxyServer>,
  listener: TcpListener,
  shutdown: triggered::Listener,
) -> Result<()> {
  loop {
    tokio::select! {
      _ = shutdown.clone() => return Ok(()),
      accepted = listener.accept() => {
        let (socket, peer) = match accepted {
          Ok(accepted) => accepted,
          Err(error) => {
            tracing::warn!(%error, "tunnel accept failed");
            continue;
          }
        };
        let server = Arc::clone(&server);
        tokio::spawn(async move {
          if let Err(error) = Tunnel::new(server).serve(socket).await {
            tracing::debug!(%error, %peer, "tunnel ended with error");
          }
        });
      }
    }
  }
}
