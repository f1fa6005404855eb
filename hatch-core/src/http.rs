//! Just enough HTTP/1.x to relay messages byte for byte.
//!
//! Heads are parsed with `httparse` to learn the framing and persistence of
//! a message; the raw head bytes are kept and forwarded unmodified.

use bytes::Bytes;
use thiserror::Error;

/// Maximum number of header fields accepted in one head.
pub const MAX_HEADERS: usize = 96;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("unparseable head: {0}")]
    Parse(#[from] httparse::Error),
    #[error("head exceeds {max} bytes")]
    TooLarge { max: usize },
    #[error("invalid Content-Length")]
    InvalidContentLength,
    #[error("unsupported Transfer-Encoding '{0}'")]
    UnsupportedTransferEncoding(String),
    #[error("both Transfer-Encoding and Content-Length are present")]
    ConflictingFraming,
}

/// Start line of a head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeadKind {
    Request { method: String, target: String },
    Response { status: u16, reason: String },
}

/// How the body following a head is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    Length(u64),
    Chunked,
    /// Body runs until the sender closes the connection.
    UntilClose,
}

/// A parsed request or response head.
#[derive(Debug, Clone)]
pub struct MessageHead {
    pub kind: HeadKind,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    /// Header fields with lowercase names, in wire order.
    pub headers: Vec<(String, String)>,
    /// The exact head bytes, including the terminating blank line.
    pub raw: Bytes,
}

fn extract_headers(headers: &[httparse::Header<'_>]) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|h| !h.name.is_empty())
        .map(|h| {
            (
                h.name.to_ascii_lowercase(),
                String::from_utf8_lossy(h.value).trim().to_string(),
            )
        })
        .collect()
}

impl MessageHead {
    /// Parse a request head from the front of `buf`.
    ///
    /// Returns the head and its length, or `None` if `buf` does not yet
    /// hold a complete head.
    pub fn parse_request(buf: &[u8]) -> Result<Option<(MessageHead, usize)>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        match req.parse(buf)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let head = MessageHead {
                    kind: HeadKind::Request {
                        method: req.method.unwrap_or_default().to_string(),
                        target: req.path.unwrap_or_default().to_string(),
                    },
                    version: req.version.unwrap_or(1),
                    headers: extract_headers(req.headers),
                    raw: Bytes::copy_from_slice(&buf[..len]),
                };
                Ok(Some((head, len)))
            }
        }
    }

    /// Parse a response head from the front of `buf`.
    pub fn parse_response(buf: &[u8]) -> Result<Option<(MessageHead, usize)>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut resp = httparse::Response::new(&mut headers);
        match resp.parse(buf)? {
            httparse::Status::Partial => Ok(None),
            httparse::Status::Complete(len) => {
                let head = MessageHead {
                    kind: HeadKind::Response {
                        status: resp.code.unwrap_or_default(),
                        reason: resp.reason.unwrap_or_default().to_string(),
                    },
                    version: resp.version.unwrap_or(1),
                    headers: extract_headers(resp.headers),
                    raw: Bytes::copy_from_slice(&buf[..len]),
                };
                Ok(Some((head, len)))
            }
        }
    }

    /// First value of a header, by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Comma-separated tokens across every occurrence of a header.
    fn tokens<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.headers
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    pub fn host(&self) -> Option<&str> {
        self.header("host")
    }

    pub fn method(&self) -> Option<&str> {
        match &self.kind {
            HeadKind::Request { method, .. } => Some(method),
            HeadKind::Response { .. } => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self.kind {
            HeadKind::Response { status, .. } => Some(status),
            HeadKind::Request { .. } => None,
        }
    }

    /// Whether the sender wants the connection kept open after this message.
    ///
    /// An explicit `close` wins, then an explicit `keep-alive`; otherwise
    /// HTTP/1.1 defaults to persistent and HTTP/1.0 to close.
    pub fn keep_alive(&self) -> bool {
        let mut keep_alive = false;
        for token in self.tokens("connection") {
            if token.eq_ignore_ascii_case("close") {
                return false;
            }
            if token.eq_ignore_ascii_case("keep-alive") {
                keep_alive = true;
            }
        }
        keep_alive || self.version >= 1
    }

    fn content_length(&self) -> Result<Option<u64>, HeadError> {
        let mut length = None;
        for token in self.tokens("content-length") {
            let value: u64 = token.parse().map_err(|_| HeadError::InvalidContentLength)?;
            match length {
                Some(existing) if existing != value => return Err(HeadError::InvalidContentLength),
                _ => length = Some(value),
            }
        }
        Ok(length)
    }

    /// `Some(true)` if the last transfer coding is chunked, `Some(false)` if
    /// another coding is last, `None` without Transfer-Encoding.
    fn chunked(&self) -> Option<bool> {
        self.tokens("transfer-encoding")
            .last()
            .map(|t| t.eq_ignore_ascii_case("chunked"))
    }

    /// Whether the request waits for `100 Continue` before sending its body.
    pub fn expects_continue(&self) -> bool {
        self.tokens("expect")
            .any(|t| t.eq_ignore_ascii_case("100-continue"))
    }

    /// Body framing of a request. A request with neither Transfer-Encoding
    /// nor Content-Length has no body; one carrying both is refused, since
    /// the two hops could disagree on where it ends.
    pub fn request_framing(&self) -> Result<BodyFraming, HeadError> {
        if self.chunked().is_some() && self.header("content-length").is_some() {
            return Err(HeadError::ConflictingFraming);
        }
        match self.chunked() {
            Some(true) => return Ok(BodyFraming::Chunked),
            Some(false) => {
                let coding = self.header("transfer-encoding").unwrap_or_default();
                return Err(HeadError::UnsupportedTransferEncoding(coding.to_string()));
            }
            None => {}
        }
        Ok(match self.content_length()? {
            Some(0) | None => BodyFraming::Empty,
            Some(n) => BodyFraming::Length(n),
        })
    }

    /// Body framing of a response to a request made with `request_method`.
    pub fn response_framing(&self, request_method: &str) -> Result<BodyFraming, HeadError> {
        let status = self.status().unwrap_or_default();
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&status)
            || status == 204
            || status == 304
        {
            return Ok(BodyFraming::Empty);
        }
        match self.chunked() {
            Some(true) => return Ok(BodyFraming::Chunked),
            Some(false) => return Ok(BodyFraming::UntilClose),
            None => {}
        }
        Ok(match self.content_length()? {
            Some(0) => BodyFraming::Empty,
            Some(n) => BodyFraming::Length(n),
            None => BodyFraming::UntilClose,
        })
    }
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        404 => "Not Found",
        408 => "Request Timeout",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Error",
    }
}

/// Build a complete `Connection: close` response with a plain-text body.
pub fn synthesize_response(status: u16, body: &str) -> Bytes {
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason_phrase(status),
        body.len(),
        body
    );
    Bytes::from(response)
}
