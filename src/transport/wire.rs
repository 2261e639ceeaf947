//! Binary frame format for TCP links.
//!
//! Each frame is length-delimited (4-byte big-endian prefix, handled by
//! `LengthDelimitedCodec`) and carries one envelope:
//!
//! ```text
//! kind: u8 | source: u32 | body
//! ```
//!
//! Bodies: `SizeReport` has a `u64`; `WorkBatch` has a `u32` item count then
//! each item as `u32` length + bytes; `Collective` is the raw payload. Every
//! other kind has an empty body.
//!
//! A well-formed frame with an unknown kind is logged and skipped; anything
//! else that does not parse is a [`DlmlError::Frame`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::{BarrierMessage, Envelope, Message, ProtocolMessage};
use crate::error::{DlmlError, Result};

/// Largest accepted frame; a work batch larger than this is a bug upstream.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

const LOCAL_QUEUE_EMPTY: u8 = 1;
const SIZE_QUERY: u8 = 2;
const SIZE_REPORT_REQUEST: u8 = 3;
const SIZE_REPORT: u8 = 4;
const WORK_BATCH: u8 = 5;
const LOCAL_QUEUE_HAS_DATA: u8 = 6;
const DONATION_REQUEST: u8 = 7;
const NO_DATA: u8 = 8;
const TERMINATION_DECLARED: u8 = 9;
const COLLECTIVE: u8 = 20;
const BARRIER_ARRIVE: u8 = 30;
const BARRIER_RELEASE: u8 = 31;

pub fn encode_envelope(envelope: &Envelope, dst: &mut BytesMut) -> Result<()> {
    let source = u32::try_from(envelope.source)
        .map_err(|_| DlmlError::Frame(format!("rank {} does not fit", envelope.source)))?;

    let kind = match &envelope.message {
        Message::Protocol(p) => match p {
            ProtocolMessage::LocalQueueEmpty => LOCAL_QUEUE_EMPTY,
            ProtocolMessage::SizeQuery => SIZE_QUERY,
            ProtocolMessage::SizeReportRequest => SIZE_REPORT_REQUEST,
            ProtocolMessage::SizeReport { .. } => SIZE_REPORT,
            ProtocolMessage::WorkBatch { .. } => WORK_BATCH,
            ProtocolMessage::LocalQueueHasData => LOCAL_QUEUE_HAS_DATA,
            ProtocolMessage::DonationRequest => DONATION_REQUEST,
            ProtocolMessage::NoData => NO_DATA,
            ProtocolMessage::TerminationDeclared => TERMINATION_DECLARED,
        },
        Message::Collective(_) => COLLECTIVE,
        Message::Barrier(BarrierMessage::Arrive) => BARRIER_ARRIVE,
        Message::Barrier(BarrierMessage::Release) => BARRIER_RELEASE,
    };
    dst.put_u8(kind);
    dst.put_u32(source);

    match &envelope.message {
        Message::Protocol(ProtocolMessage::SizeReport { size }) => dst.put_u64(*size),
        Message::Protocol(ProtocolMessage::WorkBatch { items }) => {
            dst.put_u32(len_u32(items.len())?);
            for item in items {
                dst.put_u32(len_u32(item.len())?);
                dst.put_slice(item);
            }
        }
        Message::Collective(payload) => dst.put_slice(payload),
        _ => {}
    }
    Ok(())
}

/// Parse one frame. `Ok(None)` means the kind is unknown and the frame was
/// dropped.
pub fn decode_envelope(mut src: Bytes) -> Result<Option<Envelope>> {
    need(&src, 5, "header")?;
    let kind = src.get_u8();
    let source = src.get_u32() as usize;

    let message = match kind {
        LOCAL_QUEUE_EMPTY => Message::Protocol(ProtocolMessage::LocalQueueEmpty),
        SIZE_QUERY => Message::Protocol(ProtocolMessage::SizeQuery),
        SIZE_REPORT_REQUEST => Message::Protocol(ProtocolMessage::SizeReportRequest),
        SIZE_REPORT => {
            need(&src, 8, "size report")?;
            Message::Protocol(ProtocolMessage::SizeReport {
                size: src.get_u64(),
            })
        }
        WORK_BATCH => {
            need(&src, 4, "batch count")?;
            let count = src.get_u32() as usize;
            let mut items = Vec::with_capacity(count.min(src.remaining() / 4));
            for _ in 0..count {
                need(&src, 4, "item length")?;
                let len = src.get_u32() as usize;
                need(&src, len, "item body")?;
                items.push(src.split_to(len));
            }
            Message::Protocol(ProtocolMessage::WorkBatch { items })
        }
        LOCAL_QUEUE_HAS_DATA => Message::Protocol(ProtocolMessage::LocalQueueHasData),
        DONATION_REQUEST => Message::Protocol(ProtocolMessage::DonationRequest),
        NO_DATA => Message::Protocol(ProtocolMessage::NoData),
        TERMINATION_DECLARED => Message::Protocol(ProtocolMessage::TerminationDeclared),
        COLLECTIVE => Message::Collective(src.split_to(src.remaining())),
        BARRIER_ARRIVE => Message::Barrier(BarrierMessage::Arrive),
        BARRIER_RELEASE => Message::Barrier(BarrierMessage::Release),
        other => {
            tracing::warn!(
                kind = other,
                source,
                len = src.remaining(),
                "Ignoring frame with unknown message kind"
            );
            return Ok(None);
        }
    };

    if src.has_remaining() {
        return Err(DlmlError::Frame(format!(
            "{} trailing bytes after kind {kind}",
            src.remaining()
        )));
    }
    Ok(Some(Envelope { source, message }))
}

fn need(src: &Bytes, len: usize, what: &str) -> Result<()> {
    if src.remaining() < len {
        return Err(DlmlError::Frame(format!("truncated {what}")));
    }
    Ok(())
}

fn len_u32(len: usize) -> Result<u32> {
    u32::try_from(len).map_err(|_| DlmlError::Frame(format!("length {len} does not fit")))
}

/// `tokio_util` codec turning a byte stream into envelopes.
#[derive(Debug)]
pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl EnvelopeCodec {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
        }
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = DlmlError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        while let Some(frame) = self.frames.decode(src)? {
            if let Some(envelope) = decode_envelope(frame.freeze())? {
                return Ok(Some(envelope));
            }
        }
        Ok(None)
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = DlmlError;

    fn encode(&mut self, envelope: Envelope, dst: &mut BytesMut) -> Result<()> {
        let mut body = BytesMut::new();
        encode_envelope(&envelope, &mut body)?;
        self.frames.encode(body.freeze(), dst)?;
        Ok(())
    }
}
