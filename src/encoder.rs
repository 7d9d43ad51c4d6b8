//! Frame encoder
//!
//! Serializes a [`Message`] into wire bytes: header first, then the payload
//! pulled lazily from its source, masked on the fly when the encoder is
//! configured for client-side operation. The full payload is never required
//! in memory.

use bytes::Bytes;

use crate::frame::Message;
use crate::mask::MaskedSource;
use crate::storage::PayloadSource;

/// Largest possible frame header
const MAX_HEADER_SIZE: usize = 14;

/// Per-connection encoder configuration.
///
/// Masking generates a fresh unpredictable 4-byte key per frame, emits it
/// after the length field and XORs the payload stream against it; the
/// mask bit in byte 1 mirrors the flag.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    mask_outgoing: bool,
}

impl FrameEncoder {
    pub fn new(mask_outgoing: bool) -> Self {
        Self { mask_outgoing }
    }

    /// Whether outgoing payloads are masked
    pub fn masks_outgoing(&self) -> bool {
        self.mask_outgoing
    }

    /// Serialize `message` into a pull-based byte stream
    pub fn encode(&self, message: Message) -> EncodedFrame {
        let mut header = [0u8; MAX_HEADER_SIZE];
        let mut header_len = 0;

        let mut b0 = message.opcode.code();
        if message.fin {
            b0 |= 0x80;
        }
        header[0] = b0;
        header_len += 1;

        let mask_bit = if self.mask_outgoing { 0x80 } else { 0x00 };
        let size = message.payload_len;
        if size <= 125 {
            header[1] = mask_bit | size as u8;
            header_len += 1;
        } else if size <= 65535 {
            header[1] = mask_bit | 126;
            header_len += 1;
            header[2..4].copy_from_slice(&(size as u16).to_be_bytes());
            header_len += 2;
        } else {
            // Sizes never exceed i64::MAX, so the top bit is necessarily 0.
            header[1] = mask_bit | 127;
            header_len += 1;
            header[2..10].copy_from_slice(&size.to_be_bytes());
            header_len += 8;
        }

        let mut payload = message.into_payload();
        let mut mask_key = None;
        if self.mask_outgoing {
            let key: [u8; 4] = rand::random();
            header[header_len..header_len + 4].copy_from_slice(&key);
            header_len += 4;
            payload = Box::new(MaskedSource::new(payload, key));
            mask_key = Some(key);
        }

        EncodedFrame {
            header,
            header_len,
            header_sent: 0,
            mask_key,
            payload,
        }
    }
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new(false)
    }
}

/// Wire bytes of one encoded frame, consumed as a [`PayloadSource`].
///
/// Reading yields the header bytes first, then the (possibly masked)
/// payload stream.
pub struct EncodedFrame {
    header: [u8; MAX_HEADER_SIZE],
    header_len: usize,
    header_sent: usize,
    mask_key: Option<[u8; 4]>,
    payload: Box<dyn PayloadSource>,
}

impl EncodedFrame {
    /// The masking key generated for this frame, if masking was enabled
    pub fn mask_key(&self) -> Option<[u8; 4]> {
        self.mask_key
    }

    /// Drain the whole frame into one buffer.
    ///
    /// Convenience for transports that write small frames in one call; large
    /// payloads should be pumped through [`PayloadSource::read`] instead.
    pub fn into_bytes(mut self) -> std::io::Result<Bytes> {
        let mut out = Vec::with_capacity(self.remaining().min(64 * 1024) as usize);
        let mut buf = [0u8; 4096];
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                return Ok(Bytes::from(out));
            }
            out.extend_from_slice(&buf[..n]);
        }
    }
}

impl PayloadSource for EncodedFrame {
    fn remaining(&self) -> u64 {
        (self.header_len - self.header_sent) as u64 + self.payload.remaining()
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.header_sent < self.header_len {
            let n = (self.header_len - self.header_sent).min(buf.len());
            buf[..n].copy_from_slice(&self.header[self.header_sent..self.header_sent + n]);
            self.header_sent += n;
            return Ok(n);
        }
        self.payload.read(buf)
    }
}

impl std::fmt::Debug for EncodedFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncodedFrame")
            .field("header_len", &self.header_len)
            .field("masked", &self.mask_key.is_some())
            .field("remaining", &self.remaining())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::Message;
    use crate::opcode::OpCode;
    use crate::storage::BytesSource;

    fn encode_plain(message: Message) -> Vec<u8> {
        FrameEncoder::new(false)
            .encode(message)
            .into_bytes()
            .unwrap()
            .to_vec()
    }

    #[test]
    fn small_frame_layout() {
        let wire = encode_plain(Message::binary(vec![1u8, 2, 3]));
        assert_eq!(wire, vec![0x82, 0x03, 1, 2, 3]);
    }

    #[test]
    fn boundary_125_uses_inline_length() {
        let wire = encode_plain(Message::binary(vec![0u8; 125]));
        assert_eq!(wire[1], 125);
        assert_eq!(wire.len(), 2 + 125);
    }

    #[test]
    fn boundary_126_uses_sixteen_bit_length() {
        let wire = encode_plain(Message::binary(vec![0u8; 126]));
        assert_eq!(wire[1], 126);
        assert_eq!(&wire[2..4], &126u16.to_be_bytes());
        assert_eq!(wire.len(), 4 + 126);
    }

    #[test]
    fn boundary_65535_uses_sixteen_bit_length() {
        let wire = encode_plain(Message::binary(vec![0u8; 65535]));
        assert_eq!(wire[1], 126);
        assert_eq!(&wire[2..4], &65535u16.to_be_bytes());
        assert_eq!(wire.len(), 4 + 65535);
    }

    #[test]
    fn boundary_65536_uses_sixty_four_bit_length() {
        let wire = encode_plain(Message::binary(vec![0u8; 65536]));
        assert_eq!(wire[1], 127);
        assert_eq!(&wire[2..10], &65536u64.to_be_bytes());
        assert_eq!(wire.len(), 10 + 65536);
        assert_eq!(wire[2] & 0x80, 0, "top length bit is always 0");
    }

    #[test]
    fn non_final_continuation_header() {
        let message = Message::new(
            OpCode::Continuation,
            false,
            2,
            Box::new(BytesSource::new(Bytes::from_static(b"ab"))),
        );
        let wire = encode_plain(message);
        assert_eq!(wire[0], 0x00, "no FIN bit, continuation opcode");
    }

    #[test]
    fn masked_frame_carries_key_and_masked_payload() {
        let encoder = FrameEncoder::new(true);
        let encoded = encoder.encode(Message::binary(vec![0x10u8, 0x20, 0x30]));
        let key = encoded.mask_key().expect("masking enabled");
        let wire = encoded.into_bytes().unwrap();

        assert_eq!(wire[0], 0x82);
        assert_eq!(wire[1], 0x80 | 3, "mask bit mirrors the masking flag");
        assert_eq!(&wire[2..6], &key);

        let mut payload = wire[6..].to_vec();
        crate::mask::apply_mask(&mut payload, key, 0);
        assert_eq!(payload, vec![0x10, 0x20, 0x30]);
    }

    #[test]
    fn streaming_read_yields_header_then_payload() {
        let mut encoded = FrameEncoder::new(false).encode(Message::binary(vec![9u8; 10]));
        assert_eq!(encoded.remaining(), 12);
        let mut first = [0u8; 2];
        assert_eq!(encoded.read(&mut first).unwrap(), 2);
        assert_eq!(first, [0x82, 10]);
        let mut rest = [0u8; 16];
        let n = encoded.read(&mut rest).unwrap();
        assert_eq!(&rest[..n], &[9u8; 10][..]);
        assert_eq!(encoded.read(&mut rest).unwrap(), 0);
    }
}
