//! Length-prefixed message framing.
//!
//! Every gRPC message on the wire is a 5 byte header (1 byte compression
//! flag, 4 byte big-endian length) followed by the payload. The decoder here
//! only tracks boundaries so a stream can be validated while it passes
//! through; it never copies or alters payload bytes.

use thiserror::Error;

/// Size of the per-message prefix.
pub const HEADER_LEN: usize = 5;

/// A framing violation in a caller stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("invalid compression flag {0}")]
    CompressionFlag(u8),
    #[error("message of {len} bytes exceeds the {limit} byte limit")]
    TooLarge { len: u32, limit: usize },
    #[error("stream ended in the middle of a message")]
    Truncated,
}

/// Incremental validator for a stream of length-prefixed messages.
#[derive(Debug)]
pub struct FrameDecoder {
    max_message_len: usize,
    header: [u8; HEADER_LEN],
    header_filled: usize,
    payload_remaining: usize,
    messages: u64,
    first_message_len: Option<u32>,
}

impl FrameDecoder {
    pub fn new(max_message_len: usize) -> Self {
        Self {
            max_message_len,
            header: [0; HEADER_LEN],
            header_filled: 0,
            payload_remaining: 0,
            messages: 0,
            first_message_len: None,
        }
    }

    /// Advance over the next chunk of the stream.
    pub fn feed(&mut self, mut data: &[u8]) -> Result<(), FrameError> {
        while !data.is_empty() {
            if self.payload_remaining > 0 {
                let skip = self.payload_remaining.min(data.len());
                self.payload_remaining -= skip;
                data = &data[skip..];
                continue;
            }

            let take = (HEADER_LEN - self.header_filled).min(data.len());
            self.header[self.header_filled..self.header_filled + take].copy_from_slice(&data[..take]);
            self.header_filled += take;
            data = &data[take..];

            if self.header_filled == HEADER_LEN {
                self.header_filled = 0;
                self.begin_message()?;
            }
        }
        Ok(())
    }

    fn begin_message(&mut self) -> Result<(), FrameError> {
        let flag = self.header[0];
        if flag > 1 {
            return Err(FrameError::CompressionFlag(flag));
        }
        let len = u32::from_be_bytes([self.header[1], self.header[2], self.header[3], self.header[4]]);
        if len as usize > self.max_message_len {
            return Err(FrameError::TooLarge {
                len,
                limit: self.max_message_len,
            });
        }
        self.payload_remaining = len as usize;
        self.messages += 1;
        self.first_message_len.get_or_insert(len);
        Ok(())
    }

    /// Check the stream did not stop inside a message.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.header_filled > 0 || self.payload_remaining > 0 {
            Err(FrameError::Truncated)
        } else {
            Ok(())
        }
    }

    /// Declared length of the first message, once its header has been seen.
    pub fn first_message_len(&self) -> Option<u32> {
        self.first_message_len
    }

    /// Number of message headers seen so far.
    pub fn messages_seen(&self) -> u64 {
        self.messages
    }
}

/// Prefix `payload` with an uncompressed message header.
pub fn encode_message(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    framed.push(0);
    framed.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}
