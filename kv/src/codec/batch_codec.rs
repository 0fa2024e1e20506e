//! Encodes the proposal batcher's flush output: either a raw single
//! proposal (backwards-compatible with a pre-batching wire format) or a
//! structured envelope carrying several proposals in order.
//!
//! Uses the same length-prefixed framing convention as [`BytesCodec`]: an
//! 8-byte big-endian length prefix followed by a JSON payload.

use std::io::{Cursor, Read};

use byteorder::{BigEndian, ReadBytesExt};
use serde_derive::{Deserialize, Serialize};
use tokio_util::bytes::{BufMut, BytesMut};

use crate::codec::Codec;
use crate::error::{CResult, Error};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    /// Always `true` for a structured envelope; lets the decoder tell a
    /// batch apart from a raw single proposal that happens to also be valid
    /// JSON.
    batch: bool,
    proposals: Vec<Vec<u8>>,
}

#[derive(Clone, Copy)]
pub struct BatchCodec {}

impl BatchCodec {
    pub fn new() -> Self {
        BatchCodec {}
    }

    fn frame(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(8 + payload.len());
        buf.put_u64(payload.len() as u64);
        buf.put(payload);
        buf.to_vec()
    }

    /// Encodes one proposal with no envelope, for the common single-item
    /// flush.
    pub fn encode_single(&self, proposal: &[u8]) -> Vec<u8> {
        self.frame(proposal)
    }

    /// Encodes several proposals as one structured, order-preserving
    /// envelope.
    pub fn encode_batch(&self, proposals: &[Vec<u8>]) -> CResult<Vec<u8>> {
        let envelope = Envelope { batch: true, proposals: proposals.to_vec() };
        let json = serde_json::to_vec(&envelope).map_err(|e| Error::Internal(e.to_string()))?;
        Ok(self.frame(&json))
    }

    /// Encodes a flush: a single proposal is elided to its raw form, more
    /// than one is wrapped in an envelope. An empty batch has nothing
    /// meaningful to frame and is rejected rather than silently producing
    /// zero bytes.
    pub fn encode_flush(&self, proposals: &[Vec<u8>]) -> CResult<Vec<u8>> {
        match proposals {
            [] => Err(Error::Parse("cannot encode an empty proposal batch".to_string())),
            [only] => Ok(self.encode_single(only)),
            many => self.encode_batch(many),
        }
    }

    /// Decodes one length-prefixed frame into its ordered list of
    /// proposals. A structured envelope decodes to its `proposals` list; any
    /// other framed payload (missing or false discriminator, or JSON decode
    /// failure) is treated as a single opaque proposal.
    pub fn decode_frame(&self, frame: &[u8]) -> CResult<Vec<Vec<u8>>> {
        let mut cursor = Cursor::new(frame);
        let len = cursor.read_u64::<BigEndian>().map_err(|e| Error::Parse(e.to_string()))? as usize;
        let mut payload = vec![0u8; len];
        cursor.read_exact(&mut payload).map_err(|e| Error::Parse(e.to_string()))?;
        Ok(self.decode_payload(&payload))
    }

    fn decode_payload(&self, payload: &[u8]) -> Vec<Vec<u8>> {
        match serde_json::from_slice::<Envelope>(payload) {
            Ok(envelope) if envelope.batch => envelope.proposals,
            _ => vec![payload.to_vec()],
        }
    }

    /// Decodes every frame in a cursor, preserving input order.
    pub fn decode_all(&self, bytes: &[u8]) -> CResult<Vec<Vec<u8>>> {
        let mut cursor = Cursor::new(bytes);
        let mut out = Vec::new();
        loop {
            if cursor.position() >= cursor.get_ref().len() as u64 {
                break;
            }
            let len = cursor.read_u64::<BigEndian>().map_err(|e| Error::Parse(e.to_string()))? as usize;
            let mut payload = vec![0u8; len];
            cursor.read_exact(&mut payload).map_err(|e| Error::Parse(e.to_string()))?;
            out.extend(self.decode_payload(&payload));
        }
        Ok(out)
    }
}

impl Default for BatchCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Codec for BatchCodec {
    fn codec_name<T>(&self) -> String {
        "BatchCodec".to_string()
    }
}
