//! WebSocket frame codec (RFC 6455 framing).
//!
//! TCP delivers partial frames, so the [`Decoder`] accumulates bytes and
//! parses as many complete frames as are available per call, reassembling
//! fragmented messages and invoking the caller back once per completed
//! message. Protocol violations latch a close code and stick: every later
//! decode call on the instance is rejected with the same code.
//!
//! The [`Encoder`] masks outbound frames for both roles; this matches the
//! peer implementation this codec was built against, which tolerates and
//! expects masked server frames.

use crate::ws::MAX_CONTROL_PAYLOAD;
use rand::RngCore;

/// Frame opcodes (RFC 6455 §5.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    pub fn from_u8(value: u8) -> Option<Opcode> {
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

    pub fn is_control(self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

const FIN_BIT: u8 = 0x80;
const RSV1_BIT: u8 = 0x40;
const RSV23_BITS: u8 = 0x30;
const MASK_BIT: u8 = 0x80;

/// Stateful frame parser. Create one per connection.
pub struct Decoder {
    max_packet: usize,
    cache: Vec<u8>,
    client: bool,
    frag_opcode: Option<Opcode>,
    frag_data: Vec<u8>,
    frag_compressed: bool,
    error: u16,
}

impl Decoder {
    /// `max_packet` of zero disables the size cap.
    pub fn new(max_packet: usize) -> Decoder {
        Decoder {
            max_packet,
            cache: Vec::new(),
            client: false,
            frag_opcode: None,
            frag_data: Vec::new(),
            frag_compressed: false,
            error: 0,
        }
    }

    pub fn set_client(&mut self) {
        self.client = true;
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    /// The latched close code, 0 when healthy.
    pub fn last_error(&self) -> u16 {
        self.error
    }

    /// Append incoming bytes and deliver every message that completes.
    /// The callback receives `(payload, opcode, per_message_compressed)`;
    /// control frames (close/ping/pong) are delivered unfragmented as they
    /// arrive. Returns the latched close code on protocol violations.
    pub fn decode<F>(&mut self, data: &[u8], mut on_message: F) -> Result<(), u16>
    where
        F: FnMut(Vec<u8>, Opcode, bool),
    {
        if self.error != 0 {
            return Err(self.error);
        }
        if data.is_empty() && self.cache.is_empty() {
            return Ok(());
        }
        self.cache.extend_from_slice(data);

        let mut consumed = 0;
        let result = loop {
            let parsed = parse_one(self.max_packet, self.frag_data.len(), &self.cache[consumed..]);
            match parsed {
                Ok(None) => break Ok(()),
                Ok(Some((used, frame))) => {
                    consumed += used;
                    if let Err(code) = self.accept_frame(frame, &mut on_message) {
                        break Err(code);
                    }
                }
                Err(code) => break Err(code),
            }
        };

        if consumed == self.cache.len() {
            self.cache.clear();
        } else if consumed > 0 {
            self.cache.drain(..consumed);
        }

        if let Err(code) = result {
            self.error = code;
            return Err(code);
        }
        Ok(())
    }

    fn accept_frame<F>(&mut self, frame: Frame, on_message: &mut F) -> Result<(), u16>
    where
        F: FnMut(Vec<u8>, Opcode, bool),
    {
        match frame.opcode {
            Opcode::Continuation => {
                let opcode = match self.frag_opcode {
                    Some(opcode) => opcode,
                    None => return Err(1002),
                };
                self.frag_data.extend_from_slice(&frame.payload);
                if self.max_packet > 0 && self.frag_data.len() > self.max_packet {
                    return Err(1009);
                }
                if frame.fin {
                    let data = std::mem::take(&mut self.frag_data);
                    let compressed = self.frag_compressed;
                    self.frag_opcode = None;
                    self.frag_compressed = false;
                    on_message(data, opcode, compressed);
                }
                Ok(())
            }
            Opcode::Text | Opcode::Binary => {
                if self.frag_opcode.is_some() {
                    return Err(1002);
                }
                if frame.fin {
                    on_message(frame.payload, frame.opcode, frame.compressed);
                } else {
                    self.frag_opcode = Some(frame.opcode);
                    self.frag_data = frame.payload;
                    self.frag_compressed = frame.compressed;
                }
                Ok(())
            }
            Opcode::Close | Opcode::Ping | Opcode::Pong => {
                on_message(frame.payload, frame.opcode, false);
                Ok(())
            }
        }
    }
}

struct Frame {
    fin: bool,
    compressed: bool,
    opcode: Opcode,
    payload: Vec<u8>,
}

/// Parse a single frame header+payload from `bytes`. `Ok(None)` means more
/// bytes are needed.
fn parse_one(
    max_packet: usize,
    assembled_len: usize,
    bytes: &[u8],
) -> Result<Option<(usize, Frame)>, u16> {
    if bytes.len() < 2 {
        return Ok(None);
    }
    let b0 = bytes[0];
    let b1 = bytes[1];
    let fin = b0 & FIN_BIT != 0;
    let compressed = b0 & RSV1_BIT != 0;
    if b0 & RSV23_BITS != 0 {
        return Err(1002);
    }
    let opcode = match Opcode::from_u8(b0 & 0x0F) {
        Some(opcode) => opcode,
        None => return Err(1003),
    };
    let masked = b1 & MASK_BIT != 0;
    let len7 = (b1 & 0x7F) as usize;

    let mut offset = 2;
    let payload_len = match len7 {
        126 => {
            if bytes.len() < offset + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([bytes[offset], bytes[offset + 1]]) as usize;
            offset += 2;
            len
        }
        127 => {
            if bytes.len() < offset + 8 {
                return Ok(None);
            }
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[offset..offset + 8]);
            let len = u64::from_be_bytes(raw);
            offset += 8;
            if len > usize::MAX as u64 {
                return Err(1009);
            }
            len as usize
        }
        n => n,
    };

    if opcode.is_control() && (!fin || payload_len > MAX_CONTROL_PAYLOAD) {
        return Err(1002);
    }
    if compressed && opcode.is_control() {
        return Err(1002);
    }

    // Reject oversized messages before buffering the whole payload.
    if max_packet > 0 && !opcode.is_control() {
        let assembled = assembled_len.saturating_add(payload_len);
        if payload_len > max_packet || assembled > max_packet {
            return Err(1009);
        }
    }

    let mask_key = if masked {
        if bytes.len() < offset + 4 {
            return Ok(None);
        }
        let key = [
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ];
        offset += 4;
        Some(key)
    } else {
        None
    };

    if bytes.len() < offset + payload_len {
        return Ok(None);
    }
    let mut payload = bytes[offset..offset + payload_len].to_vec();
    if let Some(key) = mask_key {
        for (i, byte) in payload.iter_mut().enumerate() {
            *byte ^= key[i % 4];
        }
    }
    Ok(Some((
        offset + payload_len,
        Frame {
            fin,
            compressed,
            opcode,
            payload,
        },
    )))
}

/// Frame generator. Stateless per call apart from the role/mask flags.
pub struct Encoder {
    client: bool,
    mask: bool,
}

impl Encoder {
    pub fn new() -> Encoder {
        Encoder {
            client: false,
            mask: true,
        }
    }

    pub fn set_client(&mut self) {
        self.client = true;
    }

    pub fn is_client(&self) -> bool {
        self.client
    }

    pub fn disable_mask(&mut self) {
        self.mask = false;
    }

    /// Produce one wire frame for the payload. `compressed` sets RSV1 for a
    /// payload already run through per-message deflate.
    pub fn encode(&self, data: &[u8], opcode: Opcode, compressed: bool) -> Vec<u8> {
        let mut frame = Vec::with_capacity(data.len() + 14);
        let mut b0 = FIN_BIT | opcode as u8;
        if compressed && !opcode.is_control() {
            b0 |= RSV1_BIT;
        }
        frame.push(b0);

        let mask_flag = if self.mask { MASK_BIT } else { 0 };
        match data.len() {
            n if n <= 125 => frame.push(mask_flag | n as u8),
            n if n <= u16::MAX as usize => {
                frame.push(mask_flag | 126);
                frame.extend_from_slice(&(n as u16).to_be_bytes());
            }
            n => {
                frame.push(mask_flag | 127);
                frame.extend_from_slice(&(n as u64).to_be_bytes());
            }
        }

        if self.mask {
            let mut key = [0u8; 4];
            rand::thread_rng().fill_bytes(&mut key);
            frame.extend_from_slice(&key);
            frame.extend(data.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        } else {
            frame.extend_from_slice(data);
        }
        frame
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a close-frame payload: 2-byte big-endian status code plus reason.
pub fn close_payload(code: u16, reason: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(2 + reason.len());
    payload.extend_from_slice(&code.to_be_bytes());
    payload.extend_from_slice(reason.as_bytes());
    payload
}

/// Extract the status code from a close-frame payload, if present.
pub fn close_code(payload: &[u8]) -> Option<u16> {
    if payload.len() >= 2 {
        Some(u16::from_be_bytes([payload[0], payload[1]]))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(decoder: &mut Decoder, bytes: &[u8]) -> Result<Vec<(Vec<u8>, Opcode, bool)>, u16> {
        let mut out = Vec::new();
        decoder.decode(bytes, |payload, opcode, compressed| {
            out.push((payload, opcode, compressed));
        })?;
        Ok(out)
    }

    #[test]
    fn round_trip_text_and_binary() {
        let encoder = Encoder::new();
        for (payload, opcode) in [
            (b"hello".to_vec(), Opcode::Text),
            (vec![0u8, 159, 146, 150], Opcode::Binary),
            (Vec::new(), Opcode::Binary),
            (vec![7u8; 70_000], Opcode::Binary),
        ] {
            let wire = encoder.encode(&payload, opcode, false);
            let mut decoder = Decoder::new(0);
            let messages = collect(&mut decoder, &wire).unwrap();
            assert_eq!(messages.len(), 1);
            assert_eq!(messages[0].0, payload);
            assert_eq!(messages[0].1, opcode);
            assert!(!messages[0].2);
        }
    }

    #[test]
    fn unmasked_frames_decode_too() {
        let mut encoder = Encoder::new();
        encoder.disable_mask();
        let wire = encoder.encode(b"plain", Opcode::Text, false);
        let mut decoder = Decoder::new(0);
        let messages = collect(&mut decoder, &wire).unwrap();
        assert_eq!(messages[0].0, b"plain");
    }

    #[test]
    fn partial_delivery_is_idempotent() {
        let encoder = Encoder::new();
        let payload: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let wire = encoder.encode(&payload, Opcode::Binary, false);

        for chunk_size in [1, 2, 3, 7, 64, 999] {
            let mut decoder = Decoder::new(0);
            let mut messages = Vec::new();
            for chunk in wire.chunks(chunk_size) {
                decoder
                    .decode(chunk, |p, o, c| messages.push((p, o, c)))
                    .unwrap();
            }
            assert_eq!(messages.len(), 1, "chunk size {}", chunk_size);
            assert_eq!(messages[0].0, payload);
        }
    }

    #[test]
    fn fragmented_message_reassembles() {
        // Hand-build text + two continuations, unmasked.
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x01, 3]);
        wire.extend_from_slice(b"one");
        wire.extend_from_slice(&[0x00, 3]);
        wire.extend_from_slice(b"two");
        wire.extend_from_slice(&[0x80, 5]);
        wire.extend_from_slice(b"three");

        let mut decoder = Decoder::new(0);
        let messages = collect(&mut decoder, &wire).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, b"onetwothree");
        assert_eq!(messages[0].1, Opcode::Text);
    }

    #[test]
    fn control_frame_interleaves_with_fragments() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&[0x01, 2]);
        wire.extend_from_slice(b"ab");
        // ping between fragments is legal
        wire.extend_from_slice(&[0x89, 1]);
        wire.push(b'p');
        wire.extend_from_slice(&[0x80, 2]);
        wire.extend_from_slice(b"cd");

        let mut decoder = Decoder::new(0);
        let messages = collect(&mut decoder, &wire).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].1, Opcode::Ping);
        assert_eq!(messages[1].0, b"abcd");
    }

    #[test]
    fn oversize_latches_1009_and_sticks() {
        let encoder = Encoder::new();
        let wire = encoder.encode(&vec![0u8; 4096], Opcode::Binary, false);
        let mut decoder = Decoder::new(1024);
        assert_eq!(collect(&mut decoder, &wire), Err(1009));
        assert_eq!(decoder.last_error(), 1009);

        // Sticky: a well-formed small frame is rejected too.
        let small = encoder.encode(b"ok", Opcode::Binary, false);
        assert_eq!(collect(&mut decoder, &small), Err(1009));
    }

    #[test]
    fn stray_continuation_is_a_protocol_error() {
        let mut decoder = Decoder::new(0);
        let wire = [0x80u8, 2, b'x', b'y'];
        assert_eq!(collect(&mut decoder, &wire), Err(1002));
        assert_eq!(decoder.last_error(), 1002);
    }

    #[test]
    fn unknown_opcode_is_unsupported() {
        let mut decoder = Decoder::new(0);
        let wire = [0x83u8, 1, b'z'];
        assert_eq!(collect(&mut decoder, &wire), Err(1003));
    }

    #[test]
    fn fragmented_control_frame_is_rejected() {
        let mut decoder = Decoder::new(0);
        // ping without FIN
        let wire = [0x09u8, 1, b'p'];
        assert_eq!(collect(&mut decoder, &wire), Err(1002));
    }

    #[test]
    fn close_payload_round_trip() {
        let payload = close_payload(1000, "Normal Closure");
        assert_eq!(close_code(&payload), Some(1000));
        assert_eq!(&payload[2..], b"Normal Closure");
        assert_eq!(close_code(&[]), None);
    }

    #[test]
    fn compressed_flag_travels_in_rsv1() {
        let encoder = Encoder::new();
        let wire = encoder.encode(b"deflated", Opcode::Binary, true);
        assert!(wire[0] & 0x40 != 0);
        let mut decoder = Decoder::new(0);
        let messages = collect(&mut decoder, &wire).unwrap();
        assert!(messages[0].2);
    }
}
