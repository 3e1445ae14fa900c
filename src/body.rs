// src/body.rs
//
// Lazy request bodies and the throttled writer used to cap upload throughput.

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    None,
    Zeroes,
    Random,
    Existing,
    Custom,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::None => "NONE",
            DataType::Zeroes => "ZEROES",
            DataType::Random => "RANDOM",
            DataType::Existing => "EXISTING",
            DataType::Custom => "CUSTOM",
        }
    }

    pub fn parse(s: &str) -> Option<DataType> {
        match s {
            "NONE" => Some(DataType::None),
            "ZEROES" => Some(DataType::Zeroes),
            "RANDOM" => Some(DataType::Random),
            "EXISTING" => Some(DataType::Existing),
            "CUSTOM" => Some(DataType::Custom),
            _ => None,
        }
    }
}

/// A description of request content. The bytes themselves are produced on
/// demand by `reader()`, which can be called any number of times and always
/// yields the same stream (random content is seeded).
#[derive(Debug, Clone)]
pub struct Body {
    data_type: DataType,
    size: u64,
    seed: Option<u64>,
    content: Option<String>,
}

impl Body {
    pub fn none() -> Body {
        Body {
            data_type: DataType::None,
            size: 0,
            seed: None,
            content: None,
        }
    }

    pub fn zeroes(size: u64) -> Body {
        Body {
            data_type: DataType::Zeroes,
            size,
            seed: None,
            content: None,
        }
    }

    pub fn random(size: u64) -> Body {
        Body::random_seeded(size, rand::rng().random())
    }

    pub fn random_seeded(size: u64, seed: u64) -> Body {
        Body {
            data_type: DataType::Random,
            size,
            seed: Some(seed),
            content: None,
        }
    }

    /// Content previously written to the store; the resolver must have placed
    /// the object name in the request context before this body materializes.
    /// Bytes read back as zeroes of the recorded size.
    pub fn existing(size: u64) -> Body {
        Body {
            data_type: DataType::Existing,
            size,
            seed: None,
            content: None,
        }
    }

    pub fn custom(content: String) -> Body {
        Body {
            data_type: DataType::Custom,
            size: content.len() as u64,
            seed: None,
            content: Some(content),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn reader(&self) -> BodyReader {
        let kind = match self.data_type {
            DataType::None => ReaderKind::Empty,
            DataType::Zeroes | DataType::Existing => ReaderKind::Zeroes,
            DataType::Random => ReaderKind::Random(StdRng::seed_from_u64(self.seed.unwrap_or(0))),
            DataType::Custom => {
                ReaderKind::Custom(self.content.clone().unwrap_or_default().into_bytes())
            }
        };
        BodyReader {
            kind,
            remaining: self.size,
            offset: 0,
        }
    }

    /// Materializes the full body. Workload bodies are bounded by the
    /// configured object sizes, so this is acceptable for the client seam.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.size as usize);
        // reading from an in-memory generator cannot fail
        let _ = self.reader().read_to_end(&mut buf);
        buf
    }
}

enum ReaderKind {
    Empty,
    Zeroes,
    Random(StdRng),
    Custom(Vec<u8>),
}

/// A restartable byte stream over a `Body`. Implements `Read`; obtain a fresh
/// one from `Body::reader()` to restart.
pub struct BodyReader {
    kind: ReaderKind,
    remaining: u64,
    offset: usize,
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let n = buf.len().min(self.remaining as usize);
        match &mut self.kind {
            ReaderKind::Empty => return Ok(0),
            ReaderKind::Zeroes => buf[..n].fill(0),
            ReaderKind::Random(rng) => rng.fill_bytes(&mut buf[..n]),
            ReaderKind::Custom(content) => {
                let end = (self.offset + n).min(content.len());
                let n = end - self.offset;
                buf[..n].copy_from_slice(&content[self.offset..end]);
                self.offset = end;
                self.remaining -= n as u64;
                return Ok(n);
            }
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

/// A writer with a maximum sustained throughput. The caller's thread blocks
/// until enough budget has accrued for the bytes already written, so a burst
/// of `n` bytes at rate `r` completes no sooner than `n/r` seconds after the
/// first write.
pub struct ThrottledWriter<W> {
    inner: W,
    bytes_per_second: u64,
    started: Option<Instant>,
    written: u64,
}

impl<W: Write> ThrottledWriter<W> {
    pub fn new(inner: W, bytes_per_second: u64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            bytes_per_second > 0,
            "bytes_per_second must be > 0 [{}]",
            bytes_per_second
        );
        Ok(ThrottledWriter {
            inner,
            bytes_per_second,
            started: None,
            written: 0,
        })
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn throttle(&mut self) {
        let started = *self.started.get_or_insert_with(Instant::now);
        let due = Duration::from_secs_f64(self.written as f64 / self.bytes_per_second as f64);
        let elapsed = started.elapsed();
        if due > elapsed {
            std::thread::sleep(due - elapsed);
        }
    }
}

impl<W: Write> Write for ThrottledWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // start the clock before the first byte so the first write is charged
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        self.throttle();
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_has_zero_size() {
        let b = Body::none();
        assert_eq!(b.size(), 0);
        assert_eq!(b.to_bytes().len(), 0);
    }

    #[test]
    fn zeroes_reads_exact_size() {
        let b = Body::zeroes(100_000);
        let bytes = b.to_bytes();
        assert_eq!(bytes.len(), 100_000);
        assert!(bytes.iter().all(|&x| x == 0));
    }

    #[test]
    fn random_is_restartable_and_seeded() {
        let b = Body::random_seeded(4096, 7);
        let first = b.to_bytes();
        let second = b.to_bytes();
        assert_eq!(first, second);
        assert_ne!(first, Body::random_seeded(4096, 8).to_bytes());
    }

    #[test]
    fn custom_round_trips_content() {
        let b = Body::custom("<CompleteMultipartUpload></CompleteMultipartUpload>".to_string());
        assert_eq!(
            b.to_bytes(),
            b"<CompleteMultipartUpload></CompleteMultipartUpload>"
        );
        assert_eq!(b.size(), 51);
    }

    #[test]
    fn throttled_writer_paces_bytes() {
        // 5000 bytes at 1000 B/s must take at least 4 seconds
        let mut w = ThrottledWriter::new(io::sink(), 1000).unwrap();
        let start = Instant::now();
        w.write_all(&[0u8; 5000]).unwrap();
        assert!(start.elapsed() >= Duration::from_secs(4));
    }

    #[test]
    fn throttled_writer_rejects_zero_rate() {
        assert!(ThrottledWriter::new(io::sink(), 0).is_err());
    }
}
