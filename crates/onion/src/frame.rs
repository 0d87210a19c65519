//! Frame codec
//!
//! One frame carries one serialized message:
//!
//! ```text
//! compression : u8    (0 = none, 1 = gzip)
//! length      : u64 big-endian
//! payload     : length bytes
//! ```
//!
//! The writer compresses with gzip at the highest ratio and sends whichever
//! representation is smaller. The whole frame is built in one buffer and
//! written with a single `write_all`, so a connection dying mid-frame never
//! leaves the reader misaligned with a partial header.

use std::io::{Read as _, Write as _};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use futures::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::error::{OnionError, Result};

const COMPRESSION_NONE: u8 = 0;
const COMPRESSION_GZIP: u8 = 1;

/// Frames above this are fatal to the conduit.
pub const MAX_FRAME_LEN: u64 = 16 * 1024 * 1024;

/// Write one frame carrying `data`.
pub async fn write_frame<W: AsyncWrite + Unpin>(io: &mut W, data: &[u8]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(data).map_err(OnionError::Io)?;
    let compressed = encoder.finish().map_err(OnionError::Io)?;

    let (compression, payload) = if compressed.len() < data.len() {
        (COMPRESSION_GZIP, compressed.as_slice())
    } else {
        (COMPRESSION_NONE, data)
    };

    let mut buf = Vec::with_capacity(1 + 8 + payload.len());
    buf.push(compression);
    buf.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    buf.extend_from_slice(payload);

    io.write_all(&buf).await?;
    io.flush().await?;
    Ok(())
}

/// Read one frame and return the decompressed payload.
pub async fn read_frame<R: AsyncRead + Unpin>(io: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 9];
    read_exact_or_truncated(io, &mut header, 9).await?;

    let compression = header[0];
    let length = u64::from_be_bytes(header[1..9].try_into().expect("8-byte slice"));

    if length > MAX_FRAME_LEN {
        return Err(OnionError::ProtocolViolation(format!(
            "frame length {length} exceeds {MAX_FRAME_LEN}"
        )));
    }

    let mut payload = vec![0u8; length as usize];
    read_exact_or_truncated(io, &mut payload, length).await?;

    match compression {
        COMPRESSION_NONE => Ok(payload),
        COMPRESSION_GZIP => {
            // Bound the decompressed size as well; the extra byte detects
            // overflow without reading an unbounded stream.
            let mut decoder = GzDecoder::new(&payload[..]).take(MAX_FRAME_LEN + 1);
            let mut data = Vec::new();
            decoder
                .read_to_end(&mut data)
                .map_err(|e| OnionError::ProtocolViolation(format!("gzip: {e}")))?;
            if data.len() as u64 > MAX_FRAME_LEN {
                return Err(OnionError::ProtocolViolation(
                    "decompressed frame exceeds limit".to_string(),
                ));
            }
            Ok(data)
        }
        other => Err(OnionError::ProtocolViolation(format!(
            "unknown compression byte 0x{other:02x}"
        ))),
    }
}

async fn read_exact_or_truncated<R: AsyncRead + Unpin>(
    io: &mut R,
    buf: &mut [u8],
    expected: u64,
) -> Result<()> {
    io.read_exact(buf).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            OnionError::Truncated { expected }
        } else {
            OnionError::Io(e)
        }
    })
}
