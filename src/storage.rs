//! Payload storage boundary
//!
//! Inbound payloads are streamed into a write-once sink obtained from a
//! [`MessageStore`], then read back through the paired [`PayloadSource`].
//! The store is keyed by protocol tag, path, version and declared length so
//! an implementation can spill large payloads to disk or another backend;
//! the engine itself never holds more than a bounded window in memory.

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, Bytes, BytesMut};

/// Protocol tag passed to [`MessageStore::create_sink`] for WebSocket payloads
pub const WEBSOCKET_TAG: &str = "WEBSOCKET";

/// Readable stream of payload bytes with a known remaining length.
pub trait PayloadSource: Send {
    /// Bytes left to read
    fn remaining(&self) -> u64;

    /// Read up to `buf.len()` bytes, returning 0 only at the end of the payload
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Write-once sink for an inbound payload, sized by the declared length.
pub trait PayloadSink: Send {
    /// Append a chunk of payload bytes
    fn write(&mut self, chunk: &[u8]) -> io::Result<()>;

    /// Seal the sink and return the source for the written bytes
    fn finish(self: Box<Self>) -> io::Result<Box<dyn PayloadSource>>;
}

/// Provider of payload sinks, one per decoded frame.
pub trait MessageStore: Send + Sync {
    /// Allocate a sink for a payload of `declared_len` bytes arriving on
    /// `path` with the given negotiated protocol version
    fn create_sink(
        &self,
        tag: &str,
        path: &str,
        version: u16,
        declared_len: u64,
    ) -> io::Result<Box<dyn PayloadSink>>;
}

/// In-memory [`MessageStore`] backed by [`BytesMut`].
#[derive(Debug, Clone, Default)]
pub struct MemoryStore;

impl MessageStore for MemoryStore {
    fn create_sink(
        &self,
        _tag: &str,
        _path: &str,
        _version: u16,
        declared_len: u64,
    ) -> io::Result<Box<dyn PayloadSink>> {
        // Cap the pre-allocation: the declared length is attacker-controlled.
        let reserve = declared_len.min(64 * 1024) as usize;
        Ok(Box::new(MemorySink {
            buffer: BytesMut::with_capacity(reserve),
        }))
    }
}

struct MemorySink {
    buffer: BytesMut,
}

impl PayloadSink for MemorySink {
    fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    fn finish(self: Box<Self>) -> io::Result<Box<dyn PayloadSource>> {
        Ok(Box::new(BytesSource::new(self.buffer.freeze())))
    }
}

/// [`PayloadSource`] over an in-memory byte string.
pub struct BytesSource {
    data: Bytes,
}

impl BytesSource {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }
}

impl PayloadSource for BytesSource {
    fn remaining(&self) -> u64 {
        self.data.len() as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        self.data.advance(n);
        Ok(n)
    }
}

/// Zero-length [`PayloadSource`].
pub struct EmptySource;

impl PayloadSource for EmptySource {
    fn remaining(&self) -> u64 {
        0
    }

    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

/// Ordered concatenation of sources, used when joining fragment chains.
pub struct ChainedSource {
    parts: VecDeque<Box<dyn PayloadSource>>,
}

impl ChainedSource {
    pub fn new(parts: Vec<Box<dyn PayloadSource>>) -> Self {
        Self {
            parts: parts.into(),
        }
    }
}

impl PayloadSource for ChainedSource {
    fn remaining(&self) -> u64 {
        self.parts.iter().map(|p| p.remaining()).sum()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while let Some(front) = self.parts.front_mut() {
            let n = front.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            self.parts.pop_front();
        }
        Ok(0)
    }
}

/// Drain a source into a `Vec<u8>`, mainly useful for small payloads and tests.
pub fn read_to_vec(source: &mut dyn PayloadSource) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(source.remaining().min(64 * 1024) as usize);
    let mut buf = [0u8; 4096];
    loop {
        let n = source.read(&mut buf)?;
        if n == 0 {
            return Ok(out);
        }
        out.extend_from_slice(&buf[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_round_trips() {
        let store = MemoryStore;
        let mut sink = store.create_sink(WEBSOCKET_TAG, "/chat", 13, 11).unwrap();
        sink.write(b"hello ").unwrap();
        sink.write(b"world").unwrap();
        let mut source = sink.finish().unwrap();
        assert_eq!(source.remaining(), 11);
        assert_eq!(read_to_vec(source.as_mut()).unwrap(), b"hello world");
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn chained_source_preserves_order() {
        let parts: Vec<Box<dyn PayloadSource>> = vec![
            Box::new(BytesSource::new(Bytes::from_static(b"AB"))),
            Box::new(EmptySource),
            Box::new(BytesSource::new(Bytes::from_static(b"CD"))),
            Box::new(BytesSource::new(Bytes::from_static(b"EF"))),
        ];
        let mut chained = ChainedSource::new(parts);
        assert_eq!(chained.remaining(), 6);
        assert_eq!(read_to_vec(&mut chained).unwrap(), b"ABCDEF");
    }

    #[test]
    fn empty_source_reads_nothing() {
        let mut source = EmptySource;
        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 0);
        assert_eq!(source.remaining(), 0);
    }
}
