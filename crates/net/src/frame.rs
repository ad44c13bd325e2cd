//! Length-prefixed frame encoding/decoding for the TCP transport
//!
//! Wire format: [4-byte big-endian length][1-byte kind][payload]
//! The length covers kind and payload. Kind 0 is a UTF-8 text frame,
//! kind 1 a binary frame.
//! Maximum frame size: 1MB (sanity limit)

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::transport::Frame;

/// Maximum allowed frame size (1MB)
const MAX_FRAME_SIZE: u32 = 1024 * 1024;

const KIND_TEXT: u8 = 0;
const KIND_BINARY: u8 = 1;

fn eof_to_closed(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read a length-prefixed frame from a stream
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(eof_to_closed)?;

    let len = u32::from_be_bytes(len_buf);

    if len == 0 {
        return Err(Error::Protocol("Empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await.map_err(eof_to_closed)?;

    let payload = body.split_off(1);
    match body[0] {
        KIND_TEXT => String::from_utf8(payload)
            .map(Frame::Text)
            .map_err(|e| Error::Protocol(format!("Text frame is not UTF-8: {}", e))),
        KIND_BINARY => Ok(Frame::Binary(payload)),
        other => Err(Error::Protocol(format!("Unknown frame kind {}", other))),
    }
}

/// Write a length-prefixed frame to a stream
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let (kind, payload) = match frame {
        Frame::Text(text) => (KIND_TEXT, text.as_bytes()),
        Frame::Binary(bytes) => (KIND_BINARY, bytes.as_slice()),
    };

    let len = payload.len() + 1;
    if len > MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }
    let len = len as u32;

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&[kind]).await?;
    writer.write_all(payload).await?;

    // Flush to ensure delivery
    writer.flush().await?;

    Ok(())
}
