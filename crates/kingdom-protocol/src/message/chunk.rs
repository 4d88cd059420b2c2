//! Chunking of payloads larger than one frame.
//!
//! Chunks share a sender-chosen id and are numbered from 1. A chunk
//! shorter than the maximum is the last one; when the payload divides
//! evenly an empty terminator chunk closes the sequence.

use std::collections::{BTreeMap, HashMap};

use bytes::{Bytes, BytesMut};

use super::{ChunkHeader, Message};
use crate::error::KingdomError;

/// Split `msg` into chunk frames of at most `max` payload bytes.
///
/// Always yields `len / max + 1` chunks; the caller decides whether a
/// message needs chunking at all.
pub fn split(msg: &Message, chunk_id: u16, max: usize) -> Result<Vec<Message>, KingdomError> {
    let max = max.max(1);
    let count = msg.payload.len() / max + 1;
    if count > u16::MAX as usize {
        return Err(KingdomError::PayloadTooLarge(msg.payload.len()));
    }

    let mut chunks = Vec::with_capacity(count);
    for index in 0..count {
        let start = index * max;
        let end = (start + max).min(msg.payload.len());
        let mut piece = msg.clone();
        piece.payload = msg.payload.slice(start..end);
        piece.chunk = Some(ChunkHeader {
            chunk_id,
            chunk_no: (index + 1) as u16,
        });
        chunks.push(piece);
    }
    Ok(chunks)
}

/// Per-connection reassembly buffer.
#[derive(Debug)]
pub struct Reassembler {
    max: usize,
    partial: HashMap<u16, Partial>,
}

#[derive(Debug)]
struct Partial {
    template: Message,
    pieces: BTreeMap<u16, Bytes>,
    sum: u64,
    last: Option<u16>,
}

impl Partial {
    fn is_complete(&self) -> bool {
        match self.last {
            Some(last) => {
                let last = last as u64;
                self.pieces.len() as u64 == last && self.sum == last * (last + 1) / 2
            }
            None => false,
        }
    }
}

impl Reassembler {
    pub fn new(max: usize) -> Self {
        Self {
            max: max.max(1),
            partial: HashMap::new(),
        }
    }

    /// Add one chunk. Returns the whole message once every piece is in.
    ///
    /// Duplicate chunk numbers are ignored. Out-of-range numbers or
    /// oversized pieces discard the partial message and fail.
    pub fn push(&mut self, chunk: Message) -> Result<Option<Message>, KingdomError> {
        let Some(header) = chunk.chunk else {
            return Ok(Some(chunk));
        };
        if header.chunk_no == 0 {
            self.partial.remove(&header.chunk_id);
            return Err(KingdomError::malformed("chunk number 0"));
        }
        if chunk.payload.len() > self.max {
            self.partial.remove(&header.chunk_id);
            return Err(KingdomError::malformed(format!(
                "chunk of {} bytes exceeds {}",
                chunk.payload.len(),
                self.max
            )));
        }

        let terminal = chunk.payload.len() < self.max;
        let entry = self.partial.entry(header.chunk_id).or_insert_with(|| Partial {
            template: Message {
                chunk: None,
                payload: Bytes::new(),
                ..chunk.clone()
            },
            pieces: BTreeMap::new(),
            sum: 0,
            last: None,
        });

        let beyond_last = entry.last.is_some_and(|last| header.chunk_no > last);
        let early_terminal = terminal
            && entry
                .pieces
                .keys()
                .next_back()
                .is_some_and(|&highest| highest > header.chunk_no);
        if beyond_last || early_terminal {
            self.partial.remove(&header.chunk_id);
            return Err(KingdomError::malformed(format!(
                "chunk {} of id {} lies past the terminal chunk",
                header.chunk_no, header.chunk_id
            )));
        }
        if entry.pieces.contains_key(&header.chunk_no) {
            tracing::debug!(chunk_id = header.chunk_id, chunk_no = header.chunk_no, "duplicate chunk ignored");
            return Ok(None);
        }

        entry.sum += header.chunk_no as u64;
        entry.pieces.insert(header.chunk_no, chunk.payload);
        if terminal {
            entry.last = Some(header.chunk_no);
        }

        if !entry.is_complete() {
            return Ok(None);
        }
        let Some(done) = self.partial.remove(&header.chunk_id) else {
            return Ok(None);
        };
        let total = done.pieces.values().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total);
        for piece in done.pieces.values() {
            payload.extend_from_slice(piece);
        }
        let mut message = done.template;
        message.payload = payload.freeze();
        Ok(Some(message))
    }

    /// Number of messages still waiting for chunks.
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Drop every partial message.
    pub fn clear(&mut self) {
        self.partial.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Priority;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn split_numbers_from_one_and_shares_id() {
        let msg = Message::channel(3, Priority::Normal, payload(25));
        let chunks = split(&msg, 77, 10).unwrap();
        assert_eq!(chunks.len(), 3);
        for (i, c) in chunks.iter().enumerate() {
            let h = c.chunk.unwrap();
            assert_eq!(h.chunk_id, 77);
            assert_eq!(h.chunk_no as usize, i + 1);
            assert_eq!(c.channel_id(), Some(3));
        }
        assert_eq!(chunks[2].payload.len(), 5);
    }

    #[test]
    fn exact_multiple_gets_empty_terminator() {
        let msg = Message::channel(1, Priority::Low, payload(20));
        let chunks = split(&msg, 1, 10).unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[2].payload.is_empty());
        assert!(!chunks[2].has_payload());
    }

    #[test]
    fn reassembles_out_of_order() {
        let msg = Message::channel(2, Priority::High, payload(35)).with_first_hop(true);
        let mut chunks = split(&msg, 5, 10).unwrap();
        chunks.reverse();

        let mut r = Reassembler::new(10);
        let mut out = None;
        for c in chunks {
            if let Some(m) = r.push(c).unwrap() {
                out = Some(m);
            }
        }
        assert_eq!(out.unwrap(), msg);
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn duplicate_chunks_are_ignored() {
        let msg = Message::channel(2, Priority::High, payload(15));
        let chunks = split(&msg, 9, 10).unwrap();
        let mut r = Reassembler::new(10);
        assert!(r.push(chunks[0].clone()).unwrap().is_none());
        assert!(r.push(chunks[0].clone()).unwrap().is_none());
        assert_eq!(r.push(chunks[1].clone()).unwrap().unwrap(), msg);
    }

    #[test]
    fn interleaved_ids_do_not_mix() {
        let a = Message::channel(1, Priority::Normal, payload(12));
        let b = Message::channel(1, Priority::Normal, vec![7u8; 14]);
        let ca = split(&a, 1, 10).unwrap();
        let cb = split(&b, 2, 10).unwrap();

        let mut r = Reassembler::new(10);
        assert!(r.push(ca[0].clone()).unwrap().is_none());
        assert!(r.push(cb[0].clone()).unwrap().is_none());
        assert_eq!(r.push(cb[1].clone()).unwrap().unwrap(), b);
        assert_eq!(r.push(ca[1].clone()).unwrap().unwrap(), a);
    }

    #[test]
    fn chunk_past_terminal_is_malformed() {
        let msg = Message::channel(1, Priority::Normal, payload(15));
        let chunks = split(&msg, 4, 10).unwrap();
        let mut r = Reassembler::new(10);
        // Terminal (no. 2) first, then a forged no. 3.
        assert!(r.push(chunks[1].clone()).unwrap().is_none());
        let mut forged = chunks[0].clone();
        forged.chunk = Some(ChunkHeader {
            chunk_id: 4,
            chunk_no: 3,
        });
        assert!(r.push(forged).is_err());
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn clear_drops_partials() {
        let msg = Message::channel(1, Priority::Normal, payload(30));
        let chunks = split(&msg, 4, 10).unwrap();
        let mut r = Reassembler::new(10);
        r.push(chunks[0].clone()).unwrap();
        assert_eq!(r.pending(), 1);
        r.clear();
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn unchunked_message_passes_through() {
        let msg = Message::keep_alive();
        let mut r = Reassembler::new(10);
        assert_eq!(r.push(msg.clone()).unwrap(), Some(msg));
    }
}
