//! Length-prefixed JSON framing for IPC connections.
//!
//! Every frame is a 4-byte big-endian length followed by a serde_json body.
//! Works over any AsyncRead/AsyncWrite (unix sockets, TCP streams).

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Frames larger than this are rejected on both ends.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

const LARGE_FRAME_BYTES: usize = 256 * 1024;

/// Codec that frames messages with a length prefix and serializes with JSON.
pub struct FrameCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(bytes) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = json.len();
        tracing::trace!(frame_bytes = len, "Encoding frame");
        if len > LARGE_FRAME_BYTES {
            tracing::info!(
                frame_bytes = len,
                frame_kb = len / 1024,
                "Large IPC frame being encoded"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
