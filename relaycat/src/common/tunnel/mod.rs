// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The transport seam between the routing core and whatever carries packets.
//!
//! The core only requires a reliable, ordered, typed-message stream: a
//! [`PacketSender`] for the outbound half and a [`PacketSource`] for the
//! inbound half. [`FramedPacketSender`]/[`framed_source`] realise the seam
//! over any byte transport; the channel-backed variants provide entangled
//! in-memory pairs.

use std::sync::Arc;

use futures::{
  future::BoxFuture,
  stream::{self, BoxStream},
  FutureExt, StreamExt,
};
use tokio::{
  io::{AsyncRead, AsyncWrite},
  sync::mpsc,
};
use tokio_stream::wrappers::ReceiverStream;

use crate::common::protocol::headers::StreamMetadata;
use crate::common::protocol::Packet;

pub mod framed;

use framed::{FrameReadError, FrameWriteError};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("stream closed by peer")]
  StreamClosed,
  #[error(transparent)]
  Read(#[from] FrameReadError),
  #[error(transparent)]
  Write(#[from] FrameWriteError),
}

/// Send half of a typed-message stream. Implementations must tolerate
/// concurrent callers; packets may interleave only at message boundaries.
pub trait PacketSender: Send + Sync {
  fn send(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Send half of an agent stream, which additionally accepts the one-time
/// response header emitted when the server accepts the stream.
pub trait AgentStream: PacketSender {
  fn send_header(&self, header: StreamMetadata) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// Inbound half of a typed-message stream; ends when the peer goes away.
pub type PacketSource = BoxStream<'static, Result<Packet, TransportError>>;

/// [`PacketSender`] over the write half of a byte transport, one frame per
/// packet. The internal lock makes concurrent sends frame-atomic.
pub struct FramedPacketSender<W> {
  writer: tokio::sync::Mutex<W>,
}

impl<W> FramedPacketSender<W>
where
  W: AsyncWrite + Send + Unpin,
{
  pub fn new(writer: W) -> Self {
    Self {
      writer: tokio::sync::Mutex::new(writer),
    }
  }
}

impl<W> PacketSender for FramedPacketSender<W>
where
  W: AsyncWrite + Send + Unpin,
{
  fn send(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let mut writer = self.writer.lock().await;
      framed::write_packet(&mut *writer, &packet)
        .await
        .map_err(Into::into)
    }
    .boxed()
  }
}

impl<W> AgentStream for FramedPacketSender<W>
where
  W: AsyncWrite + Send + Unpin,
{
  fn send_header(&self, header: StreamMetadata) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      let mut writer = self.writer.lock().await;
      framed::write_metadata(&mut *writer, &header)
        .await
        .map_err(Into::into)
    }
    .boxed()
  }
}

/// Reads packets off the read half of a byte transport until it closes.
pub fn framed_source<R>(reader: R) -> PacketSource
where
  R: AsyncRead + Send + Unpin + 'static,
{
  stream::try_unfold(reader, |mut reader| async move {
    match framed::read_packet(&mut reader).await {
      Ok(Some(packet)) => Ok(Some((packet, reader))),
      Ok(None) => Ok(None),
      Err(error) => Err(TransportError::from(error)),
    }
  })
  .boxed()
}

/// [`PacketSender`] over an in-process channel.
pub struct ChannelPacketSender {
  packets: mpsc::Sender<Packet>,
}

impl ChannelPacketSender {
  pub fn new(packets: mpsc::Sender<Packet>) -> Self {
    Self { packets }
  }
}

impl PacketSender for ChannelPacketSender {
  fn send(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>> {
    async move {
      self
        .packets
        .send(packet)
        .await
        .map_err(|_| TransportError::StreamClosed)
    }
    .boxed()
  }
}

/// [`AgentStream`] over in-process channels, with headers delivered on a
/// dedicated channel so harness code can observe them.
pub struct ChannelAgentStream {
  packets: ChannelPacketSender,
  headers: mpsc::UnboundedSender<StreamMetadata>,
}

impl ChannelAgentStream {
  pub fn new(
    packets: mpsc::Sender<Packet>,
    headers: mpsc::UnboundedSender<StreamMetadata>,
  ) -> Self {
    Self {
      packets: ChannelPacketSender::new(packets),
      headers,
    }
  }
}

impl PacketSender for ChannelAgentStream {
  fn send(&self, packet: Packet) -> BoxFuture<'_, Result<(), TransportError>> {
    self.packets.send(packet)
  }
}

impl AgentStream for ChannelAgentStream {
  fn send_header(&self, header: StreamMetadata) -> BoxFuture<'_, Result<(), TransportError>> {
    futures::future::ready(
      self
        .headers
        .send(header)
        .map_err(|_| TransportError::StreamClosed),
    )
    .boxed()
  }
}

/// Adapts a receiver into a [`PacketSource`] that ends when every paired
/// sender is dropped.
pub fn receiver_source(receiver: mpsc::Receiver<Packet>) -> PacketSource {
  ReceiverStream::new(receiver).map(Ok).boxed()
}

/// One side of an entangled in-memory stream pair: packets pushed into
/// `sender` surface on the opposite side's `incoming`.
pub struct PacketChannelEnd {
  pub sender: Arc<ChannelPacketSender>,
  pub incoming: PacketSource,
}

/// Builds two entangled typed-message stream ends.
pub fn entangled(buffer: usize) -> (PacketChannelEnd, PacketChannelEnd) {
  let (left_tx, right_rx) = mpsc::channel(buffer);
  let (right_tx, left_rx) = mpsc::channel(buffer);
  (
    PacketChannelEnd {
      sender: Arc::new(ChannelPacketSender::new(left_tx)),
      incoming: receiver_source(left_rx),
    },
    PacketChannelEnd {
      sender: Arc::new(ChannelPacketSender::new(right_tx)),
      incoming: receiver_source(right_rx),
    },
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn entangled_ends_cross_deliver() {
    let (mut left, mut right) = entangled(4);
    left.sender.send(Packet::close_request(3)).await.unwrap();
    let at_right = right.incoming.next().await.unwrap().unwrap();
    assert_eq!(at_right, Packet::close_request(3));

    right.sender.send(Packet::close_request(4)).await.unwrap();
    let at_left = left.incoming.next().await.unwrap().unwrap();
    assert_eq!(at_left, Packet::close_request(4));
  }

  #[tokio::test]
  async fn dropping_a_sender_ends_the_opposite_source() {
    let (left, mut right) = entangled(4);
    drop(left.sender);
    assert!(right.incoming.next().await.is_none());
  }

  #[tokio::test]
  async fn framed_sender_and_source_interoperate() {
    let (near, far) = tokio::io::duplex(1024);
    let (far_read, _far_write) = tokio::io::split(far);
    let (_near_read, near_write) = tokio::io::split(near);

    let sender = FramedPacketSender::new(near_write);
    let mut source = framed_source(far_read);

    sender.send(Packet::data(7, b"abc".to_vec())).await.unwrap();
    let received = source.next().await.unwrap().unwrap();
    assert_eq!(received, Packet::data(7, b"abc".to_vec()));
  }
}
