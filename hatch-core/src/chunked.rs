//! Incremental scanner for `Transfer-Encoding: chunked` bodies.
//!
//! The relay forwards chunked bodies verbatim and only needs to know where
//! the body ends. [`ChunkedScanner`] walks the chunk framing one byte (or one
//! run of chunk data) at a time, so the end is found no matter how the
//! stream is split across reads, and a `0\r\n\r\n` sequence inside chunk
//! data is never mistaken for the terminator.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("invalid byte {0:#04x} in chunk size line")]
    InvalidSize(u8),
    #[error("chunk size does not fit in 64 bits")]
    SizeOverflow,
    #[error("expected CRLF in chunked framing, found {0:#04x}")]
    LineEnding(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Size,
    SizeWs,
    Extension,
    SizeLf,
    Data,
    DataCr,
    DataLf,
    TrailerStart,
    Trailer,
    TrailerLf,
    EndLf,
    Done,
}

/// Tracks position inside a chunked body.
#[derive(Debug, Clone)]
pub struct ChunkedScanner {
    state: State,
    size: u64,
    digits: usize,
    remaining: u64,
}

impl Default for ChunkedScanner {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkedScanner {
    pub fn new() -> Self {
        Self {
            state: State::Size,
            size: 0,
            digits: 0,
            remaining: 0,
        }
    }

    /// True once the last-chunk and trailer section have been consumed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Scan `input` and return how many of its bytes belong to the body.
    ///
    /// Less than `input.len()` is returned only when the body ends inside
    /// `input`; the remaining bytes belong to the next message.
    pub fn feed(&mut self, input: &[u8]) -> Result<usize, ChunkedError> {
        let mut pos = 0;
        while pos < input.len() && self.state != State::Done {
            if self.state == State::Data {
                let available = (input.len() - pos) as u64;
                let take = self.remaining.min(available);
                pos += take as usize;
                self.remaining -= take;
                if self.remaining == 0 {
                    self.state = State::DataCr;
                }
                continue;
            }
            let byte = input[pos];
            pos += 1;
            self.state = self.step(byte)?;
        }
        Ok(pos)
    }

    fn step(&mut self, byte: u8) -> Result<State, ChunkedError> {
        let next = match (self.state, byte) {
            (State::Size, b) if b.is_ascii_hexdigit() => {
                let digit = (b as char).to_digit(16).unwrap_or(0) as u64;
                self.size = self
                    .size
                    .checked_mul(16)
                    .and_then(|s| s.checked_add(digit))
                    .ok_or(ChunkedError::SizeOverflow)?;
                self.digits += 1;
                State::Size
            }
            (State::Size, b) if self.digits == 0 => return Err(ChunkedError::InvalidSize(b)),
            (State::Size | State::SizeWs, b' ' | b'\t') => State::SizeWs,
            (State::Size | State::SizeWs, b';') => State::Extension,
            (State::Size | State::SizeWs, b'\r') => State::SizeLf,
            (State::Size | State::SizeWs, b) => return Err(ChunkedError::InvalidSize(b)),
            (State::Extension, b'\r') => State::SizeLf,
            (State::Extension, _) => State::Extension,
            (State::SizeLf, b'\n') => {
                let size = std::mem::take(&mut self.size);
                self.digits = 0;
                if size == 0 {
                    State::TrailerStart
                } else {
                    self.remaining = size;
                    State::Data
                }
            }
            (State::DataCr, b'\r') => State::DataLf,
            (State::DataLf, b'\n') => State::Size,
            (State::TrailerStart, b'\r') => State::EndLf,
            (State::TrailerStart, _) => State::Trailer,
            (State::Trailer, b'\r') => State::TrailerLf,
            (State::Trailer, _) => State::Trailer,
            (State::TrailerLf, b'\n') => State::TrailerStart,
            (State::EndLf, b'\n') => State::Done,
            (_, b) => return Err(ChunkedError::LineEnding(b)),
        };
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"4\r\nWiki\r\n5\r\npedia\r\nE\r\n in\r\n\r\nchunks.\r\n0\r\n\r\n";

    #[test]
    fn test_whole_body() {
        let mut scanner = ChunkedScanner::new();
        assert_eq!(scanner.feed(BODY).unwrap(), BODY.len());
        assert!(scanner.is_done());
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut scanner = ChunkedScanner::new();
        for (i, byte) in BODY.iter().enumerate() {
            assert!(!scanner.is_done(), "finished early at byte {}", i);
            assert_eq!(scanner.feed(std::slice::from_ref(byte)).unwrap(), 1);
        }
        assert!(scanner.is_done());
    }

    #[test]
    fn test_every_split_point() {
        for split in 0..=BODY.len() {
            let mut scanner = ChunkedScanner::new();
            let first = scanner.feed(&BODY[..split]).unwrap();
            let second = scanner.feed(&BODY[split..]).unwrap();
            assert_eq!(first + second, BODY.len(), "split at {}", split);
            assert!(scanner.is_done());
        }
    }

    #[test]
    fn test_terminator_inside_data_is_not_the_end() {
        let body = b"5\r\n0\r\n\r\n\r\n0\r\n\r\n";
        let mut scanner = ChunkedScanner::new();
        assert_eq!(scanner.feed(&body[..8]).unwrap(), 8);
        assert!(!scanner.is_done());
        assert_eq!(scanner.feed(&body[8..]).unwrap(), body.len() - 8);
        assert!(scanner.is_done());
    }

    #[test]
    fn test_stops_at_end_of_body() {
        let mut stream = b"3\r\nabc\r\n0\r\n\r\n".to_vec();
        let body_len = stream.len();
        stream.extend_from_slice(b"GET /next HTTP/1.1\r\n\r\n");

        let mut scanner = ChunkedScanner::new();
        assert_eq!(scanner.feed(&stream).unwrap(), body_len);
        assert!(scanner.is_done());
        assert_eq!(scanner.feed(b"more").unwrap(), 0);
    }

    #[test]
    fn test_extensions_and_trailers() {
        let body = b"3;name=value\r\nabc\r\n0 ; last\r\nExpires: never\r\nX-Sum: 1\r\n\r\n";
        let mut scanner = ChunkedScanner::new();
        assert_eq!(scanner.feed(body).unwrap(), body.len());
        assert!(scanner.is_done());
    }

    #[test]
    fn test_invalid_framing() {
        assert_eq!(
            ChunkedScanner::new().feed(b"zz\r\n"),
            Err(ChunkedError::InvalidSize(b'z'))
        );
        assert_eq!(
            ChunkedScanner::new().feed(b"3\r\nabcX"),
            Err(ChunkedError::LineEnding(b'X'))
        );
        assert_eq!(
            ChunkedScanner::new().feed(b"fffffffffffffffff\r\n"),
            Err(ChunkedError::SizeOverflow)
        );
    }
}
