//! Length-prefixed CBOR wire protocol for peer RPC.
//!
//! Frame format: [4-byte length (u32 little-endian)][CBOR payload]
//! Maximum frame size: 4MB (prevents memory exhaustion attacks)
//!
//! Decoding is split from reading so a malformed payload can be answered
//! with a protocol error while the stream itself stays usable.

use crate::constants::rpc::{INITIAL_BUFFER_SIZE, MAX_FRAME_SIZE};
use crate::network::rpc::RpcError;
use bytes::BytesMut;
use ciborium::Value;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Encode a CBOR value into a length-prefixed frame.
pub fn serialize_frame(value: &Value) -> Result<Vec<u8>, RpcError> {
    let mut frame = vec![0u8; 4];
    ciborium::into_writer(value, &mut frame).map_err(|e| RpcError::Encode(e.to_string()))?;

    let len = (frame.len() - 4) as u32;
    if len > MAX_FRAME_SIZE {
        return Err(RpcError::FrameTooLarge(len));
    }
    frame[..4].copy_from_slice(&len.to_le_bytes());
    Ok(frame)
}

/// Decode a payload holding exactly one CBOR item.
pub fn decode_payload(payload: &[u8]) -> Result<Value, RpcError> {
    let mut cursor = std::io::Cursor::new(payload);
    let value = ciborium::from_reader(&mut cursor).map_err(|e| RpcError::Decode(e.to_string()))?;
    let consumed = cursor.position() as usize;
    if consumed != payload.len() {
        return Err(RpcError::Decode(format!(
            "{} trailing bytes after item",
            payload.len() - consumed
        )));
    }
    Ok(value)
}

/// Reads frames from one stream half into a buffer reused across frames.
pub struct FrameReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(INITIAL_BUFFER_SIZE),
        }
    }

    /// Read the next frame payload.
    /// Returns Ok(None) on clean EOF (stream finished).
    pub async fn read_frame(&mut self) -> Result<Option<&[u8]>, RpcError> {
        let mut len_buf = [0u8; 4];
        match self.reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(RpcError::Io(e)),
        }

        let len = u32::from_le_bytes(len_buf);
        if len > MAX_FRAME_SIZE {
            return Err(RpcError::FrameTooLarge(len));
        }

        // Grows only when the payload exceeds the current capacity
        self.buf.clear();
        self.buf.resize(len as usize, 0);
        self.reader.read_exact(&mut self.buf[..]).await?;

        Ok(Some(&self.buf[..]))
    }

    pub fn capacity(&self) -> usize {
        self.buf.capacity()
    }
}
