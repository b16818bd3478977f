//! WebSocket frame codec (RFC 6455).
//!
//! Pure byte-level framing with no socket dependency: the proxy feeds raw
//! TCP reads through [`FrameBuffer::feed`] and writes [`encode`] output
//! back out. Payloads are stored unmasked; the masking key, when present,
//! is kept on the frame so re-encoding toward the backend stays a valid
//! client-to-server frame.

/// Upper bound on a single frame's declared payload length (16 MiB).
///
/// A header claiming more than this desyncs the stream; the buffer is
/// dropped rather than waiting forever for bytes that will never arrive.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame opcode as defined in RFC 6455 §5.2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x0 => Some(Opcode::Continuation),
            0x1 => Some(Opcode::Text),
            0x2 => Some(Opcode::Binary),
            0x8 => Some(Opcode::Close),
            0x9 => Some(Opcode::Ping),
            0xA => Some(Opcode::Pong),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Opcode::Continuation => 0x0,
            Opcode::Text => 0x1,
            Opcode::Binary => 0x2,
            Opcode::Close => 0x8,
            Opcode::Ping => 0x9,
            Opcode::Pong => 0xA,
        }
    }
}

/// One discrete protocol unit: type, optional masking key, payload.
///
/// The payload is always held unmasked; `mask` records the key the frame
/// arrived with (or should be sent with).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Create a final text frame.
    pub fn text(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Text,
            mask: None,
            payload: payload.into(),
        }
    }

    /// Create a final binary frame.
    pub fn binary(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode: Opcode::Binary,
            mask: None,
            payload: payload.into(),
        }
    }

    /// The frame's payload interpreted as UTF-8, lossily.
    pub fn payload_text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// XOR each payload octet with the key octet at `index % 4`.
fn apply_mask(data: &mut [u8], key: [u8; 4]) {
    for (i, byte) in data.iter_mut().enumerate() {
        *byte ^= key[i % 4];
    }
}

/// Outcome of attempting to parse one frame from the front of a buffer.
enum Parsed {
    /// A complete frame and the number of bytes it consumed.
    Complete(Frame, usize),
    /// Not enough bytes yet for a complete frame.
    Incomplete,
    /// Unrecoverable garbage (bad opcode, absurd length).
    Malformed,
}

fn parse_one(buf: &[u8]) -> Parsed {
    if buf.len() < 2 {
        return Parsed::Incomplete;
    }

    let fin = buf[0] & 0x80 != 0;
    let opcode = match Opcode::from_u8(buf[0] & 0x0F) {
        Some(op) => op,
        None => return Parsed::Malformed,
    };
    let masked = buf[1] & 0x80 != 0;

    // Three-tier length encoding: <=125 direct, 126 + u16, 127 + u64.
    let (payload_len, mut offset) = match buf[1] & 0x7F {
        len @ 0..=125 => (len as u64, 2usize),
        126 => {
            if buf.len() < 4 {
                return Parsed::Incomplete;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 4)
        }
        _ => {
            if buf.len() < 10 {
                return Parsed::Incomplete;
            }
            let len = u64::from_be_bytes([
                buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
            ]);
            (len, 10)
        }
    };

    if payload_len > MAX_FRAME_SIZE as u64 {
        return Parsed::Malformed;
    }
    let payload_len = payload_len as usize;

    let mask = if masked {
        if buf.len() < offset + 4 {
            return Parsed::Incomplete;
        }
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if buf.len() < offset + payload_len {
        return Parsed::Incomplete;
    }

    let mut payload = buf[offset..offset + payload_len].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Parsed::Complete(
        Frame {
            fin,
            opcode,
            mask,
            payload,
        },
        offset + payload_len,
    )
}

/// Decode the concatenation of one or more frames, in receipt order.
///
/// Never panics: truncated or malformed input yields the complete frames
/// parsed so far and the remainder is discarded.
pub fn decode(buf: &[u8]) -> Vec<Frame> {
    let mut frames = Vec::new();
    let mut pos = 0;
    while pos < buf.len() {
        match parse_one(&buf[pos..]) {
            Parsed::Complete(frame, consumed) => {
                frames.push(frame);
                pos += consumed;
            }
            Parsed::Incomplete | Parsed::Malformed => break,
        }
    }
    frames
}

/// Encode a sequence of frames into one concatenated buffer.
///
/// Each frame keeps its original opcode and FIN bit, uses the
/// minimal-width length encoding, and is re-masked with its own key when
/// one is present.
pub fn encode(frames: &[Frame]) -> Vec<u8> {
    let mut out = Vec::new();
    for frame in frames {
        let mut b0 = frame.opcode.as_u8();
        if frame.fin {
            b0 |= 0x80;
        }
        out.push(b0);

        let len = frame.payload.len();
        let mask_bit = if frame.mask.is_some() { 0x80 } else { 0x00 };
        if len <= 125 {
            out.push(mask_bit | len as u8);
        } else if len <= 65535 {
            out.push(mask_bit | 126);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(mask_bit | 127);
            out.extend_from_slice(&(len as u64).to_be_bytes());
        }

        match frame.mask {
            Some(key) => {
                out.extend_from_slice(&key);
                let start = out.len();
                out.extend_from_slice(&frame.payload);
                apply_mask(&mut out[start..], key);
            }
            None => out.extend_from_slice(&frame.payload),
        }
    }
    out
}

/// Streaming frame accumulator: holds a trailing partial frame across
/// reads so frames split over multiple TCP segments still decode.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buffer: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Feed bytes and return all frames completed by them, in order.
    ///
    /// Malformed data drops the whole buffered tail: there is no way to
    /// find the next frame boundary once the stream desyncs.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        self.buffer.extend_from_slice(data);
        let mut frames = Vec::new();
        loop {
            match parse_one(&self.buffer) {
                Parsed::Complete(frame, consumed) => {
                    frames.push(frame);
                    self.buffer.drain(..consumed);
                }
                Parsed::Incomplete => break,
                Parsed::Malformed => {
                    self.buffer.clear();
                    break;
                }
            }
        }
        frames
    }

    /// Number of bytes awaiting a complete frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}
