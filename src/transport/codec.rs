//! Delimiter framing for everything that crosses a socket or a worker pipe.
//!
//! A frame is `base64(json(envelope))` followed by `\n`. The base64 layer
//! guarantees the payload never contains the delimiter.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder, LinesCodec, LinesCodecError};

use crate::error::{BuckError, Result};
use crate::scheduler::{Job, JobResult};

pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Typed message carried by a frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum Envelope {
    /// A job or a notice job.
    Job(Job),
    /// Worker to supervisor only; never sent over the network.
    Result(Box<JobResult>),
}

impl Envelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::Job(job) if job.notice_ref().is_some() => "notice",
            Envelope::Job(_) => "job",
            Envelope::Result(_) => "result",
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvelopeCodec {
    lines: LinesCodec,
    max_message_size: usize,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl EnvelopeCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            lines: LinesCodec::new_with_max_length(max_message_size),
            max_message_size,
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a complete frame, delimiter included.
    pub fn frame(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(envelope)?;
        let mut frame = BASE64.encode(json).into_bytes();
        frame.push(b'\n');
        if frame.len() > self.max_message_size {
            return Err(BuckError::MessageTooLarge {
                size: frame.len(),
                limit: self.max_message_size,
            });
        }
        Ok(frame)
    }

    fn map_line(&self, line: std::result::Result<Option<String>, LinesCodecError>) -> Result<Option<String>> {
        match line {
            Ok(line) => Ok(line),
            Err(LinesCodecError::MaxLineLengthExceeded) => Err(BuckError::MessageTooLarge {
                size: self.max_message_size + 1,
                limit: self.max_message_size,
            }),
            Err(LinesCodecError::Io(e)) => Err(e.into()),
        }
    }
}

pub fn decode_line(line: &str) -> Result<Envelope> {
    let json = BASE64
        .decode(line.trim_end_matches('\r'))
        .map_err(|e| BuckError::MalformedFrame(e.to_string()))?;
    serde_json::from_slice(&json).map_err(|e| BuckError::MalformedFrame(e.to_string()))
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = BuckError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        loop {
            let line = self.lines.decode(src);
            match self.map_line(line)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode_line(&line).map(Some),
                None => return Ok(None),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        loop {
            let line = self.lines.decode_eof(src);
            match self.map_line(line)? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return decode_line(&line).map(Some),
                None => return Ok(None),
            }
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = BuckError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let frame = self.frame(&item)?;
        dst.reserve(frame.len());
        dst.put_slice(&frame);
        Ok(())
    }
}
