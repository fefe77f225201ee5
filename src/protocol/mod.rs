//! Audio protocol - message framing
//!
//! Every message is `[opcode u8][length u32 LE][length payload bytes]`. A
//! WRITE on a connection with a shared segment carries no socket payload:
//! its length field is the number of bytes the guest staged in the segment.
//!
//! [`decode`] pulls at most one complete message out of an [`InputStream`].
//! If the message isn't fully buffered yet the stream is rewound and `None`
//! is returned, so the caller can wait for more bytes without side effects.

mod handler;

pub use handler::{AudioConnectionHandler, AudioRequestHandler};

use std::io;

use crate::connector::InputStream;

/// Opcode plus length
pub const HEADER_LEN: usize = 5;

/// Largest payload a message may declare; anything bigger is a broken peer
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// PREPARE payload: channels, encoding, sample rate, buffer frames
const PREPARE_LEN: u32 = 10;
/// GET_BUFFER_SIZE payload: channels, encoding, sample rate
const GET_BUFFER_SIZE_LEN: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Close = 0,
    Start = 1,
    Stop = 2,
    Pause = 3,
    Prepare = 4,
    Write = 5,
    Drain = 6,
    Pointer = 7,
    GetBufferSize = 8,
}

impl Opcode {
    pub fn from_wire(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Close,
            1 => Self::Start,
            2 => Self::Stop,
            3 => Self::Pause,
            4 => Self::Prepare,
            5 => Self::Write,
            6 => Self::Drain,
            7 => Self::Pointer,
            8 => Self::GetBufferSize,
            _ => return None,
        })
    }
}

/// One decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Close,
    Start,
    Stop,
    Pause,
    Prepare {
        channels: u8,
        encoding: u8,
        sample_rate: u32,
        buffer_frames: u32,
    },
    /// `payload` is `None` when the data sits in the shared segment
    Write {
        length: u32,
        payload: Option<Vec<u8>>,
    },
    Drain,
    Pointer,
    GetBufferSize {
        channels: u8,
        encoding: u8,
        sample_rate: u32,
    },
    /// Known opcode whose payload is too short to hold its fields; the
    /// declared bytes are consumed
    Truncated { opcode: Opcode, length: u32 },
    /// Unknown opcode; consumed and dropped
    Ignored { opcode: u8, length: u32 },
}

/// Decode one message from `input`.
///
/// `shared_write` selects the shared-segment form of WRITE. Returns
/// `Ok(None)` (consuming nothing) while the message is incomplete, and an
/// `InvalidData` error if the declared length is absurd.
pub fn decode(input: &mut InputStream, shared_write: bool) -> io::Result<Option<Request>> {
    input.mark();
    if input.available() < HEADER_LEN {
        return Ok(None);
    }
    let code = input.read_u8()?;
    let length = input.read_u32()?;

    let opcode = Opcode::from_wire(code);
    if opcode == Some(Opcode::Write) && shared_write {
        return Ok(Some(Request::Write {
            length,
            payload: None,
        }));
    }

    if length > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("opcode {} declares {} payload bytes", code, length),
        ));
    }
    if input.available() < length as usize {
        input.reset();
        return Ok(None);
    }

    let request = match opcode {
        Some(Opcode::Close) => Request::Close,
        Some(Opcode::Start) => Request::Start,
        Some(Opcode::Stop) => Request::Stop,
        Some(Opcode::Pause) => Request::Pause,
        Some(Opcode::Drain) => Request::Drain,
        Some(Opcode::Pointer) => Request::Pointer,
        Some(Opcode::Write) => {
            let payload = input.read_bytes(length as usize)?;
            return Ok(Some(Request::Write {
                length,
                payload: Some(payload),
            }));
        }
        Some(Opcode::Prepare) if length >= PREPARE_LEN => {
            let request = Request::Prepare {
                channels: input.read_u8()?,
                encoding: input.read_u8()?,
                sample_rate: input.read_u32()?,
                buffer_frames: input.read_u32()?,
            };
            input.skip((length - PREPARE_LEN) as usize)?;
            return Ok(Some(request));
        }
        Some(Opcode::GetBufferSize) if length >= GET_BUFFER_SIZE_LEN => {
            let request = Request::GetBufferSize {
                channels: input.read_u8()?,
                encoding: input.read_u8()?,
                sample_rate: input.read_u32()?,
            };
            input.skip((length - GET_BUFFER_SIZE_LEN) as usize)?;
            return Ok(Some(request));
        }
        Some(opcode @ (Opcode::Prepare | Opcode::GetBufferSize)) => {
            Request::Truncated { opcode, length }
        }
        None => Request::Ignored {
            opcode: code,
            length,
        },
    };

    input.skip(length as usize)?;
    Ok(Some(request))
}


#[cfg(test)]
mod tests {
    use super::wire::*;
    use super::*;

    fn stream_of(parts: &[&[u8]]) -> InputStream {
        let mut input = InputStream::new();
        for part in parts {
            input.extend_from_slice(part);
        }
        input
    }

    #[test]
    fn test_close_then_prepare_fully_buffered() {
        let close = message(Opcode::Close, &[]);
        let prepare = prepare(2, 1, 48000, 1024);
        let mut input = stream_of(&[&close, &prepare]);

        assert_eq!(decode(&mut input, false).unwrap(), Some(Request::Close));
        assert_eq!(
            decode(&mut input, false).unwrap(),
            Some(Request::Prepare {
                channels: 2,
                encoding: 1,
                sample_rate: 48000,
                buffer_frames: 1024,
            })
        );
        assert_eq!(input.available(), 0);
        assert_eq!(decode(&mut input, false).unwrap(), None);
    }

    #[test]
    fn test_second_message_deferred_until_complete() {
        let close = message(Opcode::Close, &[]);
        let prepare = prepare(2, 1, 48000, 1024);
        let mut input = stream_of(&[&close, &prepare[..7]]);

        assert_eq!(decode(&mut input, false).unwrap(), Some(Request::Close));
        assert_eq!(decode(&mut input, false).unwrap(), None);
        // Nothing of the partial message was consumed
        assert_eq!(input.available(), 7);

        input.extend_from_slice(&prepare[7..]);
        assert!(matches!(
            decode(&mut input, false).unwrap(),
            Some(Request::Prepare { .. })
        ));
    }

    #[test]
    fn test_partial_header_is_deferred() {
        let mut input = stream_of(&[&[Opcode::Pointer as u8, 0, 0]]);
        assert_eq!(decode(&mut input, false).unwrap(), None);
        assert_eq!(input.available(), 3);
    }

    #[test]
    fn test_socket_write_waits_for_payload() {
        let write = message(Opcode::Write, &[1, 2, 3, 4, 5, 6, 7, 8]);
        let mut input = stream_of(&[&write[..9]]);
        assert_eq!(decode(&mut input, false).unwrap(), None);

        input.extend_from_slice(&write[9..]);
        assert_eq!(
            decode(&mut input, false).unwrap(),
            Some(Request::Write {
                length: 8,
                payload: Some(vec![1, 2, 3, 4, 5, 6, 7, 8]),
            })
        );
    }

    #[test]
    fn test_shared_write_has_no_socket_payload() {
        let mut input = stream_of(&[&shared_write(4096), &message(Opcode::Pointer, &[])]);
        assert_eq!(
            decode(&mut input, true).unwrap(),
            Some(Request::Write {
                length: 4096,
                payload: None,
            })
        );
        assert_eq!(decode(&mut input, true).unwrap(), Some(Request::Pointer));
    }

    #[test]
    fn test_unknown_opcode_is_consumed() {
        let mut bogus = vec![42u8];
        bogus.extend_from_slice(&3u32.to_le_bytes());
        bogus.extend_from_slice(&[9, 9, 9]);
        let mut input = stream_of(&[&bogus, &message(Opcode::Start, &[])]);

        assert_eq!(
            decode(&mut input, false).unwrap(),
            Some(Request::Ignored {
                opcode: 42,
                length: 3
            })
        );
        assert_eq!(decode(&mut input, false).unwrap(), Some(Request::Start));
    }

    #[test]
    fn test_short_payloads_are_truncated() {
        let mut input = stream_of(&[
            &message(Opcode::Prepare, &[2, 1, 0]),
            &message(Opcode::GetBufferSize, &[2]),
            &message(Opcode::Pointer, &[]),
        ]);
        assert_eq!(
            decode(&mut input, false).unwrap(),
            Some(Request::Truncated {
                opcode: Opcode::Prepare,
                length: 3
            })
        );
        assert_eq!(
            decode(&mut input, false).unwrap(),
            Some(Request::Truncated {
                opcode: Opcode::GetBufferSize,
                length: 1
            })
        );
        assert_eq!(decode(&mut input, false).unwrap(), Some(Request::Pointer));
        assert_eq!(input.available(), 0);
    }

    #[test]
    fn test_oversized_length_is_rejected() {
        let mut header = vec![Opcode::Write as u8];
        header.extend_from_slice(&(MAX_PAYLOAD_LEN + 1).to_le_bytes());
        let mut input = stream_of(&[&header]);
        let err = decode(&mut input, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
