//! Payload masking (RFC 6455 section 5.3)

use crate::storage::PayloadSource;

/// XOR `buf` in place against the repeating 4-byte `key`.
///
/// `offset` is the number of payload bytes already processed, so a stream
/// can be masked chunk by chunk without realigning to the key boundary.
#[inline]
pub fn apply_mask(buf: &mut [u8], key: [u8; 4], offset: u64) {
    for (i, byte) in buf.iter_mut().enumerate() {
        *byte ^= key[((offset + i as u64) & 3) as usize];
    }
}

/// Pull-through source that applies the rolling XOR as bytes are read.
///
/// The same wrapper serves both directions: it unmasks an inbound payload
/// that was stored as received, and masks an outbound payload on the fly.
pub struct MaskedSource {
    inner: Box<dyn PayloadSource>,
    key: [u8; 4],
    offset: u64,
}

impl MaskedSource {
    pub fn new(inner: Box<dyn PayloadSource>, key: [u8; 4]) -> Self {
        Self {
            inner,
            key,
            offset: 0,
        }
    }
}

impl PayloadSource for MaskedSource {
    fn remaining(&self) -> u64 {
        self.inner.remaining()
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        apply_mask(&mut buf[..n], self.key, self.offset);
        self.offset += n as u64;
        Ok(n)
    }
}
