//! Length-prefixed framing of inner protocol messages.
//!
//! Each message is a 4-byte big-endian length followed by that many bytes of
//! protobuf. Messages may be split across chunks at any byte boundary.

use crate::error::{JobError, Result};

pub const LENGTH_PREFIX_BYTES: usize = 4;

/// One reassembled message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InnerMessage {
    pub bytes: Vec<u8>,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cursor {
    AwaitingPrefix,
    AwaitingBody(usize),
    FinalSeen,
}

#[derive(Debug)]
pub struct Reassembler {
    buffer: Vec<u8>,
    cursor: Cursor,
    max_message_size: usize,
}

impl Reassembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            cursor: Cursor::AwaitingPrefix,
            max_message_size,
        }
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.cursor == Cursor::FinalSeen
    }

    /// Feed one fragment and return every message it completes.
    pub fn append(&mut self, fragment: &[u8], is_final: bool) -> Result<Vec<InnerMessage>> {
        if self.cursor == Cursor::FinalSeen {
            return Err(JobError::ReceivedAdditionalChunkAfterFinalChunk);
        }
        self.buffer.extend_from_slice(fragment);

        let mut out = Vec::new();
        let mut consumed = 0;
        loop {
            let available = self.buffer.len() - consumed;
            match self.cursor {
                Cursor::AwaitingPrefix if available >= LENGTH_PREFIX_BYTES => {
                    let mut prefix = [0u8; LENGTH_PREFIX_BYTES];
                    prefix.copy_from_slice(&self.buffer[consumed..consumed + LENGTH_PREFIX_BYTES]);
                    let size = u32::from_be_bytes(prefix) as usize;
                    if size > self.max_message_size {
                        return Err(JobError::ExceedingMaxMessageSize {
                            size,
                            max: self.max_message_size,
                        });
                    }
                    consumed += LENGTH_PREFIX_BYTES;
                    self.cursor = Cursor::AwaitingBody(size);
                }
                Cursor::AwaitingBody(size) if available >= size => {
                    out.push(InnerMessage {
                        bytes: self.buffer[consumed..consumed + size].to_vec(),
                        is_final: false,
                    });
                    consumed += size;
                    self.cursor = Cursor::AwaitingPrefix;
                }
                _ => break,
            }
        }
        self.buffer.drain(..consumed);

        if is_final {
            if !self.buffer.is_empty() || matches!(self.cursor, Cursor::AwaitingBody(_)) {
                return Err(JobError::FinalChunkContainsIncompleteMessage);
            }
            match out.last_mut() {
                Some(last) => last.is_final = true,
                None => out.push(InnerMessage {
                    bytes: Vec::new(),
                    is_final: true,
                }),
            }
            self.cursor = Cursor::FinalSeen;
        }
        Ok(out)
    }
}

/// Prefix `body` with its length.
pub fn frame(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(body);
    out
}

/// Encode and frame a protobuf message.
pub fn frame_message(msg: &impl prost::Message) -> Vec<u8> {
    frame(&msg.encode_to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_all(messages: &[&[u8]]) -> Vec<u8> {
        messages.iter().flat_map(|m| frame(m)).collect()
    }

    #[test]
    fn reassembles_across_arbitrary_splits() {
        let messages: Vec<&[u8]> = vec![
            &b"alpha"[..],
            &b""[..],
            &b"a much longer message body"[..],
            &b"z"[..],
        ];
        let stream = encode_all(&messages);

        for split in 1..stream.len() {
            let mut reassembler = Reassembler::new(1024);
            let mut got = Vec::new();
            let pieces: Vec<&[u8]> = stream.chunks(split).collect();
            for (i, piece) in pieces.iter().enumerate() {
                let last = i + 1 == pieces.len();
                got.extend(reassembler.append(piece, last).unwrap());
            }
            let bodies: Vec<&[u8]> = got.iter().map(|m| m.bytes.as_slice()).collect();
            assert_eq!(bodies, messages, "split {split}");
            let finals: Vec<bool> = got.iter().map(|m| m.is_final).collect();
            assert_eq!(finals, vec![false, false, false, true], "split {split}");
            assert!(reassembler.is_finished());
        }
    }

    #[test]
    fn several_messages_in_one_final_chunk() {
        let mut reassembler = Reassembler::new(1024);
        let got = reassembler
            .append(&encode_all(&[&b"one"[..], &b"two"[..]]), true)
            .unwrap();
        assert_eq!(
            got,
            vec![
                InnerMessage {
                    bytes: b"one".to_vec(),
                    is_final: false
                },
                InnerMessage {
                    bytes: b"two".to_vec(),
                    is_final: true
                },
            ]
        );
    }

    #[test]
    fn rejects_oversized_prefix() {
        let mut reassembler = Reassembler::new(8);
        assert_eq!(
            reassembler.append(&9u32.to_be_bytes(), false).unwrap_err(),
            JobError::ExceedingMaxMessageSize { size: 9, max: 8 }
        );
    }

    #[test]
    fn final_with_partial_prefix_or_body() {
        let mut reassembler = Reassembler::new(64);
        assert_eq!(
            reassembler.append(&[0, 0], true).unwrap_err(),
            JobError::FinalChunkContainsIncompleteMessage
        );

        let mut reassembler = Reassembler::new(64);
        assert_eq!(
            reassembler.append(&[0, 0, 0, 5, b'a'], true).unwrap_err(),
            JobError::FinalChunkContainsIncompleteMessage
        );
    }

    #[test]
    fn input_after_final_is_rejected() {
        let mut reassembler = Reassembler::new(64);
        reassembler.append(&frame(b"x"), true).unwrap();
        assert_eq!(
            reassembler.append(&[], false).unwrap_err(),
            JobError::ReceivedAdditionalChunkAfterFinalChunk
        );
    }

    #[test]
    fn empty_final_fragment_emits_empty_final_message() {
        let mut reassembler = Reassembler::new(64);
        let first = reassembler.append(&frame(b"x"), false).unwrap();
        assert_eq!(first.len(), 1);
        assert!(!first[0].is_final);
        let end = reassembler.append(&[], true).unwrap();
        assert_eq!(
            end,
            vec![InnerMessage {
                bytes: Vec::new(),
                is_final: true
            }]
        );
    }
}
