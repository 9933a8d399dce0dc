use crate::error::CoreError;
use crate::protocol::Message;

/// Hard cap on a single wire frame (one line), including the newline.
///
/// A frame past this limit means the worker is emitting garbage; we must not
/// resynchronize by dropping a partial line, so the stream is torn down.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Splits an unbounded byte stream into newline-delimited frames.
///
/// Feed bytes in with `extend`, then drain complete frames with `next_frame`.
/// The codec knows nothing about methods; it only frames and parses.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    poisoned: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read bytes to the frame buffer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Returns the next complete message, if a full line is buffered.
    ///
    /// `Err(FrameTooLarge)` is stream-fatal and sticky: once returned, the
    /// decoder refuses further frames. A per-message parse failure is returned
    /// as a recoverable error and the offending line is consumed.
    pub fn next_frame(&mut self) -> Result<Option<Message>, CoreError> {
        if self.poisoned {
            return Err(CoreError::FrameTooLarge {
                len: self.buf.len(),
                max: MAX_FRAME_BYTES,
            });
        }

        // Blank keepalive lines are tolerated in any quantity; drop them in
        // one pass so a flood of them costs a single drain.
        let blanks = self.buf.iter().take_while(|&&b| b == b'\n').count();
        if blanks > 0 {
            self.buf.drain(..blanks);
        }

        match self.buf.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos + 1 > MAX_FRAME_BYTES {
                    self.poisoned = true;
                    return Err(CoreError::FrameTooLarge {
                        len: pos + 1,
                        max: MAX_FRAME_BYTES,
                    });
                }
                let line: Vec<u8> = self.buf.drain(..=pos).collect();
                Message::parse(&line[..line.len() - 1]).map(Some)
            }
            None => {
                if self.buf.len() > MAX_FRAME_BYTES {
                    self.poisoned = true;
                    return Err(CoreError::FrameTooLarge {
                        len: self.buf.len(),
                        max: MAX_FRAME_BYTES,
                    });
                }
                Ok(None)
            }
        }
    }
}

/// Encodes a message as one newline-terminated frame.
///
/// Writers hold the write half under a lock while emitting the returned
/// buffer in a single write, so frames never interleave on the wire.
///
/// An oversized outgoing message is a recoverable `Protocol` error, not
/// `FrameTooLarge`: nothing reached the wire, so the stream itself is intact.
pub fn encode_frame(message: &Message) -> Result<Vec<u8>, CoreError> {
    let mut bytes = message.to_bytes();
    bytes.push(b'\n');
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(CoreError::Protocol(format!(
            "outgoing frame of {} bytes exceeds limit of {} bytes",
            bytes.len(),
            MAX_FRAME_BYTES
        )));
    }
    Ok(bytes)
}
