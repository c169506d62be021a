// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Wire messages exchanged between frontends, the proxy server, and agents.
//!
//! The schema is fixed by the remote peers; the message types here are
//! declared by hand rather than generated, but stay wire-compatible with the
//! protobuf framing the agents speak. `random` correlates a dial request with
//! its response before a connection id exists and is chosen by the frontend
//! side; `connect_id` is chosen by the agent once the dial succeeds.

pub mod headers;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
  #[prost(oneof = "Payload", tags = "1, 2, 3, 4, 5")]
  pub payload: ::core::option::Option<Payload>,
}

#[derive(Clone, PartialEq, ::prost::Oneof)]
pub enum Payload {
  #[prost(message, tag = "1")]
  DialRequest(DialRequest),
  #[prost(message, tag = "2")]
  DialResponse(DialResponse),
  #[prost(message, tag = "3")]
  Data(Data),
  #[prost(message, tag = "4")]
  CloseRequest(CloseRequest),
  #[prost(message, tag = "5")]
  CloseResponse(CloseResponse),
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DialRequest {
  /// Protocol the agent should dial with; only "tcp" is in use today.
  #[prost(string, tag = "1")]
  pub protocol: String,
  /// Destination address, as host:port, resolvable from the agent's network.
  #[prost(string, tag = "2")]
  pub address: String,
  #[prost(int64, tag = "3")]
  pub random: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DialResponse {
  /// Empty on success; otherwise the agent's reason the dial failed.
  #[prost(string, tag = "1")]
  pub error: String,
  #[prost(int64, tag = "2")]
  pub connect_id: i64,
  #[prost(int64, tag = "3")]
  pub random: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Data {
  #[prost(int64, tag = "1")]
  pub connect_id: i64,
  #[prost(bytes = "vec", tag = "2")]
  pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseRequest {
  #[prost(int64, tag = "1")]
  pub connect_id: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseResponse {
  #[prost(string, tag = "1")]
  pub error: String,
  #[prost(int64, tag = "2")]
  pub connect_id: i64,
}

/// Variant discriminant, for routing decisions and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
  DialRequest,
  DialResponse,
  Data,
  CloseRequest,
  CloseResponse,
  /// A frame whose payload was absent; peers never send these on purpose.
  Empty,
}

impl Packet {
  pub fn kind(&self) -> PacketKind {
    match &self.payload {
      Some(Payload::DialRequest(_)) => PacketKind::DialRequest,
      Some(Payload::DialResponse(_)) => PacketKind::DialResponse,
      Some(Payload::Data(_)) => PacketKind::Data,
      Some(Payload::CloseRequest(_)) => PacketKind::CloseRequest,
      Some(Payload::CloseResponse(_)) => PacketKind::CloseResponse,
      None => PacketKind::Empty,
    }
  }

  pub fn dial_request(
    protocol: impl Into<String>,
    address: impl Into<String>,
    random: i64,
  ) -> Self {
    Self {
      payload: Some(Payload::DialRequest(DialRequest {
        protocol: protocol.into(),
        address: address.into(),
        random,
      })),
    }
  }

  pub fn dial_response(random: i64, connect_id: i64, error: impl Into<String>) -> Self {
    Self {
      payload: Some(Payload::DialResponse(DialResponse {
        error: error.into(),
        connect_id,
        random,
      })),
    }
  }

  pub fn data(connect_id: i64, data: Vec<u8>) -> Self {
    Self {
      payload: Some(Payload::Data(Data { connect_id, data })),
    }
  }

  pub fn close_request(connect_id: i64) -> Self {
    Self {
      payload: Some(Payload::CloseRequest(CloseRequest { connect_id })),
    }
  }

  pub fn close_response(connect_id: i64) -> Self {
    Self {
      payload: Some(Payload::CloseResponse(CloseResponse {
        error: String::new(),
        connect_id,
      })),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use prost::Message;

  #[test]
  fn kind_follows_payload() {
    assert_eq!(
      Packet::dial_request("tcp", "node-1:443", 7).kind(),
      PacketKind::DialRequest
    );
    assert_eq!(Packet::close_response(9).kind(), PacketKind::CloseResponse);
    assert_eq!(Packet::default().kind(), PacketKind::Empty);
  }

  #[test]
  fn encoding_round_trips() {
    let original = Packet::data(101, b"hello".to_vec());
    let decoded = Packet::decode(original.encode_to_vec().as_slice())
      .expect("own encoding must decode");
    assert_eq!(original, decoded);
  }
}
