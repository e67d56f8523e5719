// Copyright 2025 Sandflow (https://github.com/sandflow)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Wire codec.
//!
//! Frames are `(length: u32 BE, type_tag: u16 BE, payload)`; the payload
//! is a JSON-encoded tagged union over the closed record set (payloads
//! carry opaque structured blobs, so the encoding must be
//! self-describing). The type tag is redundant with the union
//! discriminant and is verified on read; a mismatch, an oversized
//! length, or a truncated payload is a `FrameError` that fails the
//! connection (the producer reconnects and resends).

use sandflow_core::{ProducerId, Result, SandflowError, TelemetryMessage, UveFragment};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this fail the connection.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Version this collector speaks; the handshake negotiates down.
pub const PROTOCOL_VERSION: u32 = 2;

pub const TAG_HANDSHAKE: u16 = 1;
pub const TAG_HANDSHAKE_ACK: u16 = 2;
pub const TAG_TELEMETRY: u16 = 3;
pub const TAG_UVE_FRAGMENT: u16 = 4;
pub const TAG_TRACE_BUFFER_REQUEST: u16 = 5;
pub const TAG_TRACE_BUFFER_RESPONSE: u16 = 6;

/// The closed set of wire records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WirePayload {
    Handshake {
        producer_id: ProducerId,
        version: u32,
        capabilities: Vec<String>,
    },
    HandshakeAck {
        assigned_sequence: u64,
        negotiated_version: u32,
    },
    Telemetry(Box<TelemetryMessage>),
    UveFragment(UveFragment),
    TraceBufferRequest {
        buffer_name: String,
    },
    TraceBufferResponse {
        buffer_name: String,
        messages: Vec<TelemetryMessage>,
    },
}

impl WirePayload {
    pub fn type_tag(&self) -> u16 {
        match self {
            WirePayload::Handshake { .. } => TAG_HANDSHAKE,
            WirePayload::HandshakeAck { .. } => TAG_HANDSHAKE_ACK,
            WirePayload::Telemetry(_) => TAG_TELEMETRY,
            WirePayload::UveFragment(_) => TAG_UVE_FRAGMENT,
            WirePayload::TraceBufferRequest { .. } => TAG_TRACE_BUFFER_REQUEST,
            WirePayload::TraceBufferResponse { .. } => TAG_TRACE_BUFFER_RESPONSE,
        }
    }
}

/// Read one frame; `None` at clean end-of-stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<WirePayload>> {
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(SandflowError::Frame(format!("length read: {}", e))),
    };
    if len > MAX_FRAME_LEN {
        return Err(SandflowError::Frame(format!(
            "frame length {} exceeds maximum {}",
            len, MAX_FRAME_LEN
        )));
    }

    let type_tag = reader
        .read_u16()
        .await
        .map_err(|e| SandflowError::Frame(format!("type tag read: {}", e)))?;

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| SandflowError::Frame(format!("truncated payload: {}", e)))?;

    let decoded: WirePayload = serde_json::from_slice(&payload)
        .map_err(|e| SandflowError::Frame(format!("payload decode: {}", e)))?;

    if decoded.type_tag() != type_tag {
        return Err(SandflowError::Frame(format!(
            "type tag {} does not match payload kind {}",
            type_tag,
            decoded.type_tag()
        )));
    }

    Ok(Some(decoded))
}

/// Write one frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    payload: &WirePayload,
) -> Result<()> {
    let encoded =
        serde_json::to_vec(payload).map_err(|e| SandflowError::Serialization(e.to_string()))?;
    if encoded.len() as u32 > MAX_FRAME_LEN {
        return Err(SandflowError::Frame(format!(
            "outbound frame length {} exceeds maximum",
            encoded.len()
        )));
    }
    writer
        .write_u32(encoded.len() as u32)
        .await
        .map_err(|e| SandflowError::Frame(e.to_string()))?;
    writer
        .write_u16(payload.type_tag())
        .await
        .map_err(|e| SandflowError::Frame(e.to_string()))?;
    writer
        .write_all(&encoded)
        .await
        .map_err(|e| SandflowError::Frame(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| SandflowError::Frame(e.to_string()))?;
    Ok(())
}

/// Perform the server side of the handshake: the first frame must be a
/// `Handshake`; the reply carries the assigned sequence and the
/// negotiated (minimum) version.
pub async fn accept<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    assigned_sequence: u64,
) -> Result<(ProducerId, u32, Vec<String>)> {
    let first = read_frame(stream)
        .await
        .map_err(|e| SandflowError::Handshake(e.to_string()))?
        .ok_or_else(|| SandflowError::Handshake("connection closed before handshake".into()))?;

    let WirePayload::Handshake {
        producer_id,
        version,
        capabilities,
    } = first
    else {
        return Err(SandflowError::Handshake(format!(
            "expected handshake frame, got tag {}",
            first.type_tag()
        )));
    };

    let negotiated_version = version.min(PROTOCOL_VERSION);
    write_frame(
        stream,
        &WirePayload::HandshakeAck {
            assigned_sequence,
            negotiated_version,
        },
    )
    .await?;

    Ok((producer_id, negotiated_version, capabilities))
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandflow_core::message::MessageBuilder;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let msg = MessageBuilder::new("h1", "Agent")
            .timestamp(1_000_000)
            .message_type("AgentInfo")
            .build();
        let payload = WirePayload::Telemetry(Box::new(msg));

        write_frame(&mut client, &payload).await.unwrap();
        let decoded = read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(decoded, payload);
    }

    #[tokio::test]
    async fn test_clean_eof_is_none() {
        let (client, mut server) = tokio::io::duplex(1024);
        drop(client);
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        tokio::spawn(async move {
            let _ = client.write_u32(MAX_FRAME_LEN + 1).await;
            let _ = client.write_u16(TAG_TELEMETRY).await;
        });
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, SandflowError::Frame(_)));
    }

    #[tokio::test]
    async fn test_tag_mismatch_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let payload = WirePayload::TraceBufferRequest {
            buffer_name: "b".into(),
        };
        let encoded = serde_json::to_vec(&payload).unwrap();
        tokio::spawn(async move {
            client.write_u32(encoded.len() as u32).await.unwrap();
            client.write_u16(TAG_TELEMETRY).await.unwrap(); // wrong tag
            client.write_all(&encoded).await.unwrap();
        });
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[tokio::test]
    async fn test_handshake_negotiates_down() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        let producer = ProducerId::new("h1", "Agent", "0", "Compute");

        let client_producer = producer.clone();
        let client_task = tokio::spawn(async move {
            write_frame(
                &mut client,
                &WirePayload::Handshake {
                    producer_id: client_producer,
                    version: PROTOCOL_VERSION + 5,
                    capabilities: vec!["uve".into()],
                },
            )
            .await
            .unwrap();
            match read_frame(&mut client).await.unwrap().unwrap() {
                WirePayload::HandshakeAck {
                    negotiated_version, ..
                } => negotiated_version,
                other => panic!("unexpected reply {:?}", other),
            }
        });

        let (peer, version, caps) = accept(&mut server, 7).await.unwrap();
        assert_eq!(peer, producer);
        assert_eq!(version, PROTOCOL_VERSION);
        assert_eq!(caps, vec!["uve".to_string()]);
        assert_eq!(client_task.await.unwrap(), PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_non_handshake_first_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            write_frame(
                &mut client,
                &WirePayload::TraceBufferRequest {
                    buffer_name: "b".into(),
                },
            )
            .await
            .unwrap();
        });
        let err = accept(&mut server, 0).await.unwrap_err();
        assert!(matches!(err, SandflowError::Handshake(_)));
    }
}
