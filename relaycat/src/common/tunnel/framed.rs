// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Length-prefixed framing for typed-message streams over raw byte transports.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes of
//! payload. Packet frames carry protobuf-encoded [`Packet`]s; the one-time
//! metadata exchange at agent-stream start uses JSON frames, so the handshake
//! stays debuggable with nothing more than a socket dump.

use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::protocol::headers::StreamMetadata;
use crate::common::protocol::Packet;

/// Frames beyond this length indicate a corrupt or hostile peer.
pub const MAX_FRAME_LENGTH: usize = 1 << 22;

#[derive(thiserror::Error, Debug)]
pub enum FrameReadError {
  #[error("frame length {received} exceeds the {limit} byte limit")]
  MaxLengthExceeded { limit: usize, received: usize },
  #[error("unexpected end of stream while reading a frame")]
  UnexpectedEnd(#[source] std::io::Error),
  #[error("frame payload failed to decode: {0}")]
  Decode(#[from] prost::DecodeError),
  #[error("metadata frame failed to deserialize: {0}")]
  Metadata(#[from] serde_json::Error),
}

#[derive(thiserror::Error, Debug)]
pub enum FrameWriteError {
  #[error("stream write failure: {0}")]
  Io(#[from] std::io::Error),
  #[error("metadata frame failed to serialize: {0}")]
  Metadata(#[from] serde_json::Error),
}

/// Reads one frame. `None` marks a clean end of stream at a frame boundary;
/// an end of stream inside a frame is an error.
async fn read_frame<R>(reader: &mut R) -> Result<Option<Vec<u8>>, FrameReadError>
where
  R: AsyncRead + Unpin,
{
  let length = match reader.read_u32().await {
    Ok(length) => length as usize,
    Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(error) => return Err(FrameReadError::UnexpectedEnd(error)),
  };
  if length > MAX_FRAME_LENGTH {
    return Err(FrameReadError::MaxLengthExceeded {
      limit: MAX_FRAME_LENGTH,
      received: length,
    });
  }
  let mut buffer = vec![0u8; length];
  reader
    .read_exact(buffer.as_mut_slice())
    .await
    .map_err(FrameReadError::UnexpectedEnd)?;
  Ok(Some(buffer))
}

async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameWriteError>
where
  W: AsyncWrite + Unpin,
{
  writer.write_u32(payload.len() as u32).await?;
  writer.write_all(payload).await?;
  writer.flush().await?;
  Ok(())
}

pub async fn read_packet<R>(reader: &mut R) -> Result<Option<Packet>, FrameReadError>
where
  R: AsyncRead + Unpin,
{
  match read_frame(reader).await? {
    Some(buffer) => Ok(Some(Packet::decode(buffer.as_slice())?)),
    None => Ok(None),
  }
}

pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), FrameWriteError>
where
  W: AsyncWrite + Unpin,
{
  write_frame(writer, &packet.encode_to_vec()).await
}

/// Reads the metadata frame that opens an agent stream. The stream ending
/// here is a protocol violation, not a clean close.
pub async fn read_metadata<R>(reader: &mut R) -> Result<StreamMetadata, FrameReadError>
where
  R: AsyncRead + Unpin,
{
  match read_frame(reader).await? {
    Some(buffer) => Ok(serde_json::from_slice(&buffer)?),
    None => Err(FrameReadError::UnexpectedEnd(
      std::io::ErrorKind::UnexpectedEof.into(),
    )),
  }
}

pub async fn write_metadata<W>(
  writer: &mut W,
  metadata: &StreamMetadata,
) -> Result<(), FrameWriteError>
where
  W: AsyncWrite + Unpin,
{
  write_frame(writer, &serde_json::to_vec(metadata)?).await
}
