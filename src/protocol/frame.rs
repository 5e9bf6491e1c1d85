use bytes::{Buf, BytesMut};
use log::debug;
use serde::{Deserialize, Serialize};

use super::command::LOOPBACK_REPLY;

/// First byte of every data reply.
pub const DATA_PREFIX: u8 = 0xC8;
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024;
pub const DEFAULT_ERROR_CODE_MIN: u8 = 0x80;
pub const DEFAULT_ERROR_CODE_MAX: u8 = 0x88;

/// A classified unit of the response stream. Only `FrameDecoder` builds these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    Data { value: u8 },
    Error { code: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorFrameWidth {
    /// The error code stands alone.
    Single,
    /// The error code is followed by one trailing byte.
    WithTrailer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameDecoderConfig {
    pub buffer_capacity: usize,
    pub error_code_min: u8,
    pub error_code_max: u8,
    pub error_frame_width: ErrorFrameWidth,
}

impl Default for FrameDecoderConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            error_code_min: DEFAULT_ERROR_CODE_MIN,
            error_code_max: DEFAULT_ERROR_CODE_MAX,
            error_frame_width: ErrorFrameWidth::Single,
        }
    }
}

impl FrameDecoderConfig {
    pub fn is_error_code(&self, byte: u8) -> bool {
        (self.error_code_min..=self.error_code_max).contains(&byte)
    }
}

/// Splits the raw reply stream into frames.
///
/// Classification looks only at the head byte: the data prefix starts a
/// two-byte data frame, a byte inside the error range starts an error frame,
/// anything else is dropped so the parser resynchronises on its own. There are
/// no delimiters or addresses on the wire, so a stray byte that happens to
/// equal the prefix or an error code is taken at face value.
///
/// The loopback reply is always a lone byte. It decodes as an error frame
/// whatever the configured range and width.
#[derive(Debug)]
pub struct FrameDecoder {
    config: FrameDecoderConfig,
    buffer: BytesMut,
    discarded: u64,
}

impl FrameDecoder {
    pub fn new(config: FrameDecoderConfig) -> Self {
        let capacity = config.buffer_capacity.max(2);
        Self {
            config: FrameDecoderConfig {
                buffer_capacity: capacity,
                ..config
            },
            buffer: BytesMut::with_capacity(capacity),
            discarded: 0,
        }
    }

    pub fn config(&self) -> &FrameDecoderConfig {
        &self.config
    }

    /// Feeds a chunk of any size and returns every complete frame found.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        // The buffer only ever holds an unfinished frame after decoding, so
        // slicing the input keeps it within capacity.
        let slice_len = self.config.buffer_capacity - 1;
        for piece in chunk.chunks(slice_len) {
            self.buffer.extend_from_slice(piece);
            self.decode_into(&mut frames);
        }
        frames
    }

    fn decode_into(&mut self, frames: &mut Vec<Frame>) {
        while let Some(&head) = self.buffer.first() {
            if head == DATA_PREFIX {
                if self.buffer.len() < 2 {
                    break;
                }
                let value = self.buffer[1];
                self.buffer.advance(2);
                frames.push(Frame::Data { value });
            } else if head == LOOPBACK_REPLY {
                self.buffer.advance(1);
                frames.push(Frame::Error { code: head });
            } else if self.config.is_error_code(head) {
                match self.config.error_frame_width {
                    ErrorFrameWidth::Single => {
                        self.buffer.advance(1);
                    }
                    ErrorFrameWidth::WithTrailer => {
                        if self.buffer.len() < 2 {
                            break;
                        }
                        debug!("Error frame 0x{:02x} trailer 0x{:02x}", head, self.buffer[1]);
                        self.buffer.advance(2);
                    }
                }
                frames.push(Frame::Error { code: head });
            } else {
                self.buffer.advance(1);
                self.discarded += 1;
            }
        }
    }

    /// Drops any partial frame left over from a previous connection.
    pub fn reset(&mut self) {
        if !self.buffer.is_empty() {
            debug!("Dropping {} buffered byte(s) on reset", self.buffer.len());
            self.discarded += self.buffer.len() as u64;
        }
        self.buffer.clear();
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(FrameDecoderConfig::default())
    }
}
