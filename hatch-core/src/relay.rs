//! HTTP-aware relay between a downstream connection and an upstream.
//!
//! [`RelayEngine`] parses only the heads of each request/response pair,
//! forwards heads and bodies verbatim, and loops while both sides keep the
//! connection alive. How the upstream is obtained and given back is
//! delegated to a [`Backend`]; the server binds pooled tunnel sockets, the
//! client binds connections to its local service.

use crate::chunked::ChunkedScanner;
use crate::error::{ErrorCategory, TunnelError, TunnelResult};
use crate::http::{synthesize_response, BodyFraming, HeadError, MessageHead};
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Relay tuning knobs.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Limit for any single read once a message has started, and for the
    /// wait on a response head.
    pub read_timeout: Duration,
    /// Limit for waiting on the first byte of a request. `None` waits until
    /// the downstream closes.
    pub idle_timeout: Option<Duration>,
    pub max_header_size: usize,
    pub buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(30),
            idle_timeout: Some(Duration::from_secs(15)),
            max_header_size: 8192,
            buffer_size: 16 * 1024,
        }
    }
}

/// Where the relay gets its upstream from.
pub trait Backend: Send {
    type Upstream: AsyncRead + AsyncWrite + Unpin + Send;

    /// Bind an upstream for the request described by `head`.
    fn acquire(
        &mut self,
        head: &MessageHead,
    ) -> impl Future<Output = TunnelResult<Self::Upstream>> + Send;

    /// Whether an upstream bound by an earlier request may serve `head`.
    fn accepts(&self, upstream: &Self::Upstream, head: &MessageHead) -> bool {
        let _ = (upstream, head);
        true
    }

    /// Give an upstream back. `reusable` is true only when it sits cleanly
    /// between two messages.
    fn release(&mut self, upstream: Self::Upstream, reusable: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    ParsingRequest,
    ForwardingRequestBody,
    ParsingResponse,
    ForwardingResponseBody,
}

/// Per-cycle relay state.
#[derive(Debug, Clone, Default)]
pub struct RelayState {
    pub phase: Phase,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub keep_alive_request: bool,
    pub keep_alive_response: bool,
}

impl RelayState {
    fn set_framing(&mut self, framing: BodyFraming) {
        self.content_length = match framing {
            BodyFraming::Length(n) => Some(n),
            BodyFraming::Empty => Some(0),
            _ => None,
        };
        self.chunked = framing == BodyFraming::Chunked;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Downstream,
    Upstream,
}

impl Side {
    fn name(self) -> &'static str {
        match self {
            Side::Downstream => "downstream",
            Side::Upstream => "upstream",
        }
    }

    fn peer(self) -> Side {
        match self {
            Side::Downstream => Side::Upstream,
            Side::Upstream => Side::Downstream,
        }
    }

    fn closed(self, message: &str) -> TunnelError {
        match self {
            Side::Downstream => TunnelError::downstream_closed(message),
            Side::Upstream => TunnelError::upstream_closed(message),
        }
    }
}

enum HeadRead {
    Head(MessageHead),
    /// Peer closed before sending any byte of a head.
    Closed,
    /// Nothing arrived within the idle limit.
    Idle,
}

enum ContinueRace {
    Body(std::io::Result<Option<usize>>),
    Answer(Result<HeadRead, HeadFailure>),
}

enum HeadFailure {
    Malformed(HeadError),
    Truncated,
    Timeout,
    Io(std::io::Error),
}

impl HeadFailure {
    fn into_error(self, side: Side) -> TunnelError {
        match self {
            HeadFailure::Malformed(e) => {
                TunnelError::malformed_head(format!("malformed {} head", side.name())).with_cause(e)
            }
            HeadFailure::Truncated => side.closed("connection closed inside a message head"),
            HeadFailure::Timeout => TunnelError::timeout("timed out reading message head")
                .with_context("side", side.name()),
            HeadFailure::Io(e) => side.closed("read failed").with_cause(e),
        }
    }
}

/// Read more bytes into `buf`. `Ok(None)` means the wait timed out.
async fn fill<R>(
    src: &mut R,
    buf: &mut BytesMut,
    reserve: usize,
    wait: Option<Duration>,
) -> std::io::Result<Option<usize>>
where
    R: AsyncRead + Unpin,
{
    buf.reserve(reserve);
    match wait {
        Some(limit) => match tokio::time::timeout(limit, src.read_buf(buf)).await {
            Ok(read) => read.map(Some),
            Err(_) => Ok(None),
        },
        None => src.read_buf(buf).await.map(Some),
    }
}

async fn read_head<R, F>(
    src: &mut R,
    buf: &mut BytesMut,
    parse: F,
    config: &RelayConfig,
    idle: Option<Duration>,
) -> Result<HeadRead, HeadFailure>
where
    R: AsyncRead + Unpin,
    F: Fn(&[u8]) -> Result<Option<(MessageHead, usize)>, HeadError>,
{
    let too_large = || HeadFailure::Malformed(HeadError::TooLarge {
        max: config.max_header_size,
    });

    loop {
        if !buf.is_empty() {
            match parse(&buf[..]) {
                Ok(Some((_, len))) if len > config.max_header_size => return Err(too_large()),
                Ok(Some((head, len))) => {
                    buf.advance(len);
                    return Ok(HeadRead::Head(head));
                }
                Ok(None) if buf.len() >= config.max_header_size => return Err(too_large()),
                Ok(None) => {}
                Err(e) => return Err(HeadFailure::Malformed(e)),
            }
        }

        let wait = if buf.is_empty() {
            idle
        } else {
            Some(config.read_timeout)
        };
        match fill(src, buf, config.buffer_size, wait).await {
            Ok(Some(0)) if buf.is_empty() => return Ok(HeadRead::Closed),
            Ok(Some(0)) => return Err(HeadFailure::Truncated),
            Ok(Some(_)) => {}
            Ok(None) if buf.is_empty() => return Ok(HeadRead::Idle),
            Ok(None) => return Err(HeadFailure::Timeout),
            Err(e) => return Err(HeadFailure::Io(e)),
        }
    }
}

/// Forward one message body from `src` (with `buf` holding bytes already
/// read from it) to `dst`. Bytes past the end of the body stay in `buf`.
async fn forward_body<R, W>(
    src: &mut R,
    buf: &mut BytesMut,
    dst: &mut W,
    framing: BodyFraming,
    from: Side,
    config: &RelayConfig,
) -> TunnelResult<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let to = from.peer();
    let mut remaining = match framing {
        BodyFraming::Length(n) => n,
        _ => 0,
    };
    let mut scanner = ChunkedScanner::new();
    let mut forwarded = 0u64;

    loop {
        let finished = match framing {
            BodyFraming::Empty => true,
            BodyFraming::Length(_) => remaining == 0,
            BodyFraming::Chunked => scanner.is_done(),
            BodyFraming::UntilClose => false,
        };
        if finished {
            break;
        }

        if buf.is_empty() {
            match fill(src, buf, config.buffer_size, Some(config.read_timeout)).await {
                Ok(Some(0)) if framing == BodyFraming::UntilClose => break,
                Ok(Some(0)) => return Err(from.closed("connection closed mid-body")),
                Ok(Some(_)) => {}
                Ok(None) => {
                    return Err(TunnelError::timeout("timed out reading message body")
                        .with_context("side", from.name()))
                }
                Err(e) => return Err(from.closed("read failed mid-body").with_cause(e)),
            }
        }

        let take = match framing {
            BodyFraming::Length(_) => remaining.min(buf.len() as u64) as usize,
            BodyFraming::Chunked => scanner.feed(&buf[..]).map_err(|e| {
                TunnelError::malformed_head("invalid chunked body")
                    .with_context("side", from.name())
                    .with_cause(e)
            })?,
            _ => buf.len(),
        };
        let chunk = buf.split_to(take);
        dst.write_all(&chunk)
            .await
            .map_err(|e| to.closed("write failed mid-body").with_cause(e))?;
        remaining = remaining.saturating_sub(take as u64);
        forwarded += take as u64;
    }

    dst.flush()
        .await
        .map_err(|e| to.closed("flush failed").with_cause(e))?;
    Ok(forwarded)
}

/// Hand over buffered bytes and then copy opaquely in both directions.
async fn splice<D, U>(
    downstream: &mut D,
    upstream: &mut U,
    down_buf: &mut BytesMut,
    up_buf: &mut BytesMut,
) -> std::io::Result<(u64, u64)>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    if !up_buf.is_empty() {
        downstream.write_all(&up_buf[..]).await?;
        up_buf.clear();
    }
    downstream.flush().await?;
    if !down_buf.is_empty() {
        upstream.write_all(&down_buf[..]).await?;
        down_buf.clear();
    }
    tokio::io::copy_bidirectional(downstream, upstream).await
}

/// Relays HTTP/1.x request/response cycles from one downstream connection.
pub struct RelayEngine<D, B: Backend> {
    downstream: D,
    backend: B,
    config: RelayConfig,
    upstream: Option<B::Upstream>,
    down_buf: BytesMut,
    up_buf: BytesMut,
    state: RelayState,
    response_started: bool,
    cycles: u64,
}

impl<D, B> RelayEngine<D, B>
where
    D: AsyncRead + AsyncWrite + Unpin + Send,
    B: Backend,
{
    pub fn new(downstream: D, backend: B, config: RelayConfig) -> Self {
        let capacity = config.buffer_size;
        Self {
            downstream,
            backend,
            config,
            upstream: None,
            down_buf: BytesMut::with_capacity(capacity),
            up_buf: BytesMut::with_capacity(capacity),
            state: RelayState::default(),
            response_started: false,
            cycles: 0,
        }
    }

    pub fn state(&self) -> &RelayState {
        &self.state
    }

    /// Serve the downstream until it closes, an error occurs or one side
    /// ends persistence. Returns the number of completed cycles.
    pub async fn run(mut self) -> TunnelResult<u64> {
        let result = self.serve().await;
        if let Some(upstream) = self.upstream.take() {
            self.backend.release(upstream, false);
        }
        let _ = self.downstream.shutdown().await;
        result.map(|()| self.cycles)
    }

    async fn serve(&mut self) -> TunnelResult<()> {
        loop {
            match self.cycle().await {
                Ok(true) => continue,
                Ok(false) => return Ok(()),
                Err(err) => return self.abort(err).await,
            }
        }
    }

    /// One request/response pair. Returns whether to continue.
    async fn cycle(&mut self) -> TunnelResult<bool> {
        self.state = RelayState::default();
        self.response_started = false;

        let request = match read_head(
            &mut self.downstream,
            &mut self.down_buf,
            MessageHead::parse_request,
            &self.config,
            self.config.idle_timeout,
        )
        .await
        .map_err(|f| f.into_error(Side::Downstream))?
        {
            HeadRead::Head(head) => head,
            HeadRead::Closed | HeadRead::Idle => {
                trace!(cycles = self.cycles, "downstream done between messages");
                if let Some(upstream) = self.upstream.take() {
                    let reusable = self.up_buf.is_empty();
                    self.backend.release(upstream, reusable);
                }
                return Ok(false);
            }
        };

        let framing = request.request_framing().map_err(|e| {
            TunnelError::malformed_head("cannot determine request body framing").with_cause(e)
        })?;
        let method = request.method().unwrap_or_default().to_string();
        self.state.keep_alive_request = request.keep_alive();
        self.state.set_framing(framing);
        debug!(
            method = %method,
            host = request.host().unwrap_or("-"),
            cycle = self.cycles,
            "relaying request"
        );

        self.bind_upstream(&request).await?;

        self.state.phase = Phase::ForwardingRequestBody;
        {
            let upstream = self
                .upstream
                .as_mut()
                .ok_or_else(|| TunnelError::internal("relay has no upstream"))?;
            upstream
                .write_all(&request.raw)
                .await
                .map_err(|e| TunnelError::upstream_closed("failed to send request head").with_cause(e))?;
        }

        let mut early_response = None;
        if framing != BodyFraming::Empty && request.expects_continue() && self.down_buf.is_empty() {
            early_response = self.await_continue().await?;
        }
        if early_response.is_some() {
            // The body was never forwarded, so neither side can carry
            // another message.
            self.state.keep_alive_request = false;
        } else {
            let upstream = self
                .upstream
                .as_mut()
                .ok_or_else(|| TunnelError::internal("relay has no upstream"))?;
            let sent = forward_body(
                &mut self.downstream,
                &mut self.down_buf,
                upstream,
                framing,
                Side::Downstream,
                &self.config,
            )
            .await?;
            trace!(bytes = sent, "request body forwarded");
        }

        self.state.phase = Phase::ParsingResponse;
        let response = loop {
            if let Some(head) = early_response.take() {
                self.response_started = true;
                self.downstream
                    .write_all(&head.raw)
                    .await
                    .map_err(|e| TunnelError::downstream_closed("failed to send response head").with_cause(e))?;
                break head;
            }
            let upstream = self
                .upstream
                .as_mut()
                .ok_or_else(|| TunnelError::internal("relay has no upstream"))?;
            let head = match read_head(
                upstream,
                &mut self.up_buf,
                MessageHead::parse_response,
                &self.config,
                Some(self.config.read_timeout),
            )
            .await
            .map_err(|f| f.into_error(Side::Upstream))?
            {
                HeadRead::Head(head) => head,
                HeadRead::Closed => {
                    return Err(TunnelError::upstream_closed("upstream closed before responding"))
                }
                HeadRead::Idle => {
                    return Err(TunnelError::timeout("timed out waiting for the response head"))
                }
            };

            self.response_started = true;
            self.downstream
                .write_all(&head.raw)
                .await
                .map_err(|e| TunnelError::downstream_closed("failed to send response head").with_cause(e))?;

            match head.status() {
                Some(101) => {
                    self.switch_protocols().await?;
                    return Ok(false);
                }
                Some(100..=199) => continue,
                _ => break head,
            }
        };

        let framing = response.response_framing(&method).map_err(|e| {
            TunnelError::malformed_head("cannot determine response body framing").with_cause(e)
        })?;
        self.state.keep_alive_response =
            response.keep_alive() && framing != BodyFraming::UntilClose;
        self.state.set_framing(framing);
        self.state.phase = Phase::ForwardingResponseBody;
        {
            let upstream = self
                .upstream
                .as_mut()
                .ok_or_else(|| TunnelError::internal("relay has no upstream"))?;
            let sent = forward_body(
                upstream,
                &mut self.up_buf,
                &mut self.downstream,
                framing,
                Side::Upstream,
                &self.config,
            )
            .await?;
            trace!(bytes = sent, status = ?response.status(), "response body forwarded");
        }
        self.cycles += 1;

        if self.state.keep_alive_request && self.state.keep_alive_response {
            return Ok(true);
        }
        if let Some(upstream) = self.upstream.take() {
            self.backend.release(upstream, false);
        }
        Ok(false)
    }

    /// Race the request body against the upstream's answer to
    /// `Expect: 100-continue`. An interim response is passed on at once;
    /// a final one is returned and the body is never forwarded.
    async fn await_continue(&mut self) -> TunnelResult<Option<MessageHead>> {
        let upstream = self
            .upstream
            .as_mut()
            .ok_or_else(|| TunnelError::internal("relay has no upstream"))?;
        upstream
            .flush()
            .await
            .map_err(|e| TunnelError::upstream_closed("failed to send request head").with_cause(e))?;

        let wait = Some(self.config.read_timeout);
        let raced = tokio::select! {
            read = fill(&mut self.downstream, &mut self.down_buf, self.config.buffer_size, wait) => {
                ContinueRace::Body(read)
            }
            head = read_head(upstream, &mut self.up_buf, MessageHead::parse_response, &self.config, wait) => {
                ContinueRace::Answer(head)
            }
        };

        let head = match raced {
            ContinueRace::Body(Ok(Some(0))) => {
                return Err(TunnelError::downstream_closed("connection closed before the request body"))
            }
            ContinueRace::Body(Ok(Some(_))) => return Ok(None),
            ContinueRace::Body(Ok(None)) => {
                return Err(TunnelError::timeout("timed out waiting for the request body")
                    .with_context("side", Side::Downstream.name()))
            }
            ContinueRace::Body(Err(e)) => return Err(Side::Downstream.closed("read failed").with_cause(e)),
            ContinueRace::Answer(head) => match head.map_err(|f| f.into_error(Side::Upstream))? {
                HeadRead::Head(head) => head,
                HeadRead::Closed => {
                    return Err(TunnelError::upstream_closed("upstream closed before responding"))
                }
                HeadRead::Idle => return Err(TunnelError::timeout("timed out waiting for 100 Continue")),
            },
        };

        match head.status() {
            Some(status) if (100..200).contains(&status) && status != 101 => {
                trace!(status, "forwarding interim response before the request body");
                self.downstream
                    .write_all(&head.raw)
                    .await
                    .map_err(|e| TunnelError::downstream_closed("failed to send interim response").with_cause(e))?;
                self.downstream
                    .flush()
                    .await
                    .map_err(|e| TunnelError::downstream_closed("flush failed").with_cause(e))?;
                Ok(None)
            }
            _ => Ok(Some(head)),
        }
    }

    async fn bind_upstream(&mut self, request: &MessageHead) -> TunnelResult<()> {
        if let Some(upstream) = self.upstream.take() {
            if self.backend.accepts(&upstream, request) {
                self.upstream = Some(upstream);
                return Ok(());
            }
            debug!("request targets a different backend, switching upstream");
            let reusable = self.up_buf.is_empty();
            self.up_buf.clear();
            self.backend.release(upstream, reusable);
        }
        let upstream = self.backend.acquire(request).await?;
        self.upstream = Some(upstream);
        Ok(())
    }

    async fn switch_protocols(&mut self) -> TunnelResult<()> {
        let mut upstream = self
            .upstream
            .take()
            .ok_or_else(|| TunnelError::internal("relay has no upstream"))?;
        let result = splice(
            &mut self.downstream,
            &mut upstream,
            &mut self.down_buf,
            &mut self.up_buf,
        )
        .await;
        self.backend.release(upstream, false);
        self.cycles += 1;

        let (to_upstream, to_downstream) = result
            .map_err(|e| TunnelError::upstream_closed("upgraded connection failed").with_cause(e))?;
        debug!(to_upstream, to_downstream, "upgraded connection finished");
        Ok(())
    }

    /// Answer with a synthesized response where one is still possible, then
    /// hand the error back.
    async fn abort(&mut self, err: TunnelError) -> TunnelResult<()> {
        let respond = !self.response_started
            && match (err.category, self.state.phase) {
                (
                    ErrorCategory::MalformedHttpHead,
                    Phase::ParsingRequest | Phase::ForwardingRequestBody,
                ) => true,
                (ErrorCategory::NoBackendAvailable | ErrorCategory::Connection, _) => true,
                (ErrorCategory::UpstreamClosed, _) => true,
                (ErrorCategory::Timeout, Phase::ParsingResponse) => true,
                _ => false,
            };

        if respond {
            let response = synthesize_response(err.http_status(), &format!("{}\n", err.message));
            self.response_started = true;
            if let Err(e) = self.downstream.write_all(&response).await {
                debug!(error = %e, "could not deliver error response");
            } else {
                let _ = self.downstream.flush().await;
            }
        }
        Err(err)
    }
}
