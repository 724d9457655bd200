//! FIFO byte buffer used for receive assembly and datagram framing.
//!
//! Data is appended at the tail and consumed from the head; the head slice
//! is always contiguous. `ingress`/`egress` shuttle bytes against
//! non-blocking streams, stopping cleanly at would-block.

use std::io;

// Consumed prefixes are compacted away once they pass this threshold, so
// long-lived connections do not grow without bound.
const COMPACT_THRESHOLD: usize = 64 * 1024;

pub struct Buffer {
    data: Vec<u8>,
    head: usize,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer {
            data: Vec::new(),
            head: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: Vec::with_capacity(capacity),
            head: 0,
        }
    }

    /// Bytes currently queued.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append bytes at the tail.
    #[inline]
    pub fn extend(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Contiguous view of the queued bytes.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Drop `count` bytes from the head.
    pub fn consume(&mut self, count: usize) {
        assert!(count <= self.len(), "consumed past the buffer tail");
        self.head += count;

        if self.head >= COMPACT_THRESHOLD || self.head == self.data.len() {
            self.data.drain(..self.head);
            self.head = 0;
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.head = 0;
    }

    /// Read from `reader` until would-block or EOF, appending everything.
    /// Returns `(bytes_read, saw_eof)`.
    pub fn ingress<R: io::Read>(&mut self, mut reader: R) -> io::Result<(usize, bool)> {
        let mut total = 0;
        let mut chunk = [0u8; 16 * 1024];

        loop {
            match reader.read(&mut chunk) {
                Ok(0) => return Ok((total, true)),
                Ok(count) => {
                    self.extend(&chunk[..count]);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => {
                    return Ok((total, false));
                }
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Write queued bytes to `writer` until empty or would-block.
    /// Returns the number of bytes written.
    pub fn egress<W: io::Write>(&mut self, mut writer: W) -> io::Result<usize> {
        let mut total = 0;

        while !self.is_empty() {
            match writer.write(self.as_slice()) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => {
                    self.consume(count);
                    total += count;
                }
                Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }

        Ok(total)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cmp::min;

    /// Reader/writer that moves data in fixed chunks and then would-blocks,
    /// mimicking a non-blocking socket.
    struct MockStream {
        data: Vec<u8>,
        cursor: usize,
        chunk: usize,
        accept: usize,
    }

    impl io::Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.cursor == self.data.len() {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(min(self.chunk, buf.len()), self.data.len() - self.cursor);
            buf[..count].copy_from_slice(&self.data[self.cursor..self.cursor + count]);
            self.cursor += count;
            Ok(count)
        }
    }

    impl io::Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.data.len() >= self.accept {
                return Err(io::ErrorKind::WouldBlock.into());
            }

            let count = min(self.chunk, buf.len());
            self.data.extend_from_slice(&buf[..count]);
            Ok(count)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_extend_consume() {
        let mut buffer = Buffer::new();
        buffer.extend(&[1, 2, 3, 4]);

        assert_eq!(buffer.len(), 4);
        assert_eq!(buffer.as_slice(), &[1, 2, 3, 4]);

        buffer.consume(2);
        assert_eq!(buffer.as_slice(), &[3, 4]);

        buffer.consume(2);
        assert!(buffer.is_empty());
    }

    #[test]
    #[should_panic(expected = "consumed past the buffer tail")]
    fn test_overconsume_panics() {
        let mut buffer = Buffer::new();
        buffer.extend(&[1]);
        buffer.consume(2);
    }

    #[test]
    fn test_ingress_stops_at_would_block() {
        let payload: Vec<u8> = (0..200u8).collect();
        let mut stream = MockStream {
            data: payload.clone(),
            cursor: 0,
            chunk: 7,
            accept: 0,
        };

        let mut buffer = Buffer::new();
        let (count, eof) = buffer.ingress(&mut stream).unwrap();

        assert_eq!(count, payload.len());
        assert!(!eof);
        assert_eq!(buffer.as_slice(), &payload[..]);
    }

    #[test]
    fn test_ingress_reports_eof() {
        let mut buffer = Buffer::new();
        let (count, eof) = buffer.ingress(&[][..]).unwrap();

        assert_eq!(count, 0);
        assert!(eof);
    }

    #[test]
    fn test_egress_partial_then_resume() {
        let mut buffer = Buffer::new();
        buffer.extend(&[9u8; 50]);

        let mut stream = MockStream {
            data: Vec::new(),
            cursor: 0,
            chunk: 8,
            accept: 16,
        };

        let written = buffer.egress(&mut stream).unwrap();
        assert_eq!(written, 16);
        assert_eq!(buffer.len(), 34);

        stream.accept = 100;
        let written = buffer.egress(&mut stream).unwrap();
        assert_eq!(written, 34);
        assert!(buffer.is_empty());
        assert_eq!(stream.data.len(), 50);
    }

    #[test]
    fn test_compaction_keeps_content() {
        let mut buffer = Buffer::new();
        let payload: Vec<u8> = (0..255u8).cycle().take(COMPACT_THRESHOLD + 100).collect();
        buffer.extend(&payload);

        buffer.consume(COMPACT_THRESHOLD);
        assert_eq!(buffer.as_slice(), &payload[COMPACT_THRESHOLD..]);
        assert_eq!(buffer.len(), 100);
    }
}
