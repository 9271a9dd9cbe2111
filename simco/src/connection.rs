//! Non-blocking request/reply channel to one module.
//!
//! A [`TcpModuleConnection`] owns a dedicated I/O thread: requests are
//! queued through an mpsc channel, written as length-prefixed frames,
//! and replies flow back on a second channel. [`ModuleConnection::receive`]
//! is a bounded wait on that channel, resolving with the real reply, a
//! transport error, or a synthesized timeout once the request's
//! configured timeout has elapsed — a pending request is never silently
//! dropped.
//!
//! Not thread-safe: each connection is driven by a single logical
//! owner. A timeout leaves the connection sendable again; whether to
//! retry is the coordinator's decision. A late reply belonging to a
//! timed-out request is recognized by arrival order and discarded.

use std::net::{SocketAddr, TcpStream};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use simco_common::config::ConnectionConfig;
use simco_common::status::ModuleResponseType;
use simco_common::wire::{ModuleRequest, ModuleResponse, read_message, write_message};

use crate::error::{CoordinatorError, CoordinatorResult};

/// One request/reply channel per module address.
pub trait ModuleConnection: Send {
    /// Enqueue a request asynchronously. Returns false only on local
    /// queuing failure (the I/O thread is gone).
    fn send(&mut self, request: &ModuleRequest) -> bool;

    /// Wait up to `waiting_time` for the outstanding request to
    /// resolve. Returns true exactly when a reply arrived, the
    /// transport failed, or the request's configured timeout elapsed
    /// (`response` then carries a synthesized Timeout); false while the
    /// request simply remains outstanding.
    fn receive(&mut self, response: &mut ModuleResponse, waiting_time: Duration) -> bool;

    /// Whether the last sent request is still outstanding.
    fn waiting_reply(&self) -> bool;
}

/// Builds [`ModuleConnection`]s from registered addresses.
pub trait ConnectionFactory: Send + Sync {
    fn create_connection(
        &self,
        addr: &str,
        config: &ConnectionConfig,
    ) -> CoordinatorResult<Box<dyn ModuleConnection>>;
}

enum ReplyEvent {
    Reply(ModuleResponse),
    TransportError(String),
}

/// TCP-backed module connection.
pub struct TcpModuleConnection {
    addr: String,
    config: ConnectionConfig,
    request_tx: Option<Sender<ModuleRequest>>,
    reply_rx: Receiver<ReplyEvent>,
    /// Kept for shutting the socket down on drop, unblocking the I/O
    /// thread's read.
    stream: TcpStream,
    io_thread: Option<JoinHandle<()>>,
    outstanding: bool,
    sent_at: Instant,
    /// Timeout of the outstanding request; `None` waits forever.
    request_timeout: Option<Duration>,
    /// Replies still owed to requests that were resolved as timed out;
    /// they arrive in order and are discarded.
    stale_replies: usize,
}

impl TcpModuleConnection {
    /// Connect to a module's registered step-channel address.
    pub fn connect(addr: &str, config: &ConnectionConfig) -> CoordinatorResult<Self> {
        let sock_addr: SocketAddr = addr.parse().map_err(|_| {
            CoordinatorError::InvalidArgument(format!("malformed module address: {addr}"))
        })?;
        let connect_timeout = if config.cmd_timeout_ms > 0 {
            Duration::from_millis(config.cmd_timeout_ms as u64)
        } else {
            Duration::from_secs(30)
        };
        let stream = TcpStream::connect_timeout(&sock_addr, connect_timeout).map_err(|e| {
            CoordinatorError::Connection { addr: addr.to_string(), reason: e.to_string() }
        })?;
        stream.set_nodelay(true).map_err(|e| CoordinatorError::Connection {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let (request_tx, request_rx) = mpsc::channel::<ModuleRequest>();
        let (reply_tx, reply_rx) = mpsc::channel::<ReplyEvent>();
        let mut io_stream = stream.try_clone().map_err(|e| CoordinatorError::Connection {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;

        let peer = addr.to_string();
        let io_thread = std::thread::Builder::new()
            .name("simco-module-io".to_string())
            .spawn(move || {
                for request in request_rx {
                    if let Err(e) = write_message(&mut io_stream, &request) {
                        debug!(addr = %peer, "module connection write failed: {e}");
                        let _ = reply_tx.send(ReplyEvent::TransportError(e.to_string()));
                        return;
                    }
                    match read_message::<_, ModuleResponse>(&mut io_stream) {
                        Ok(response) => {
                            if reply_tx.send(ReplyEvent::Reply(response)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(addr = %peer, "module connection read failed: {e}");
                            let _ = reply_tx.send(ReplyEvent::TransportError(e.to_string()));
                            return;
                        }
                    }
                }
            })
            .map_err(|e| CoordinatorError::Connection {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        info!(addr, "module connection established");
        Ok(Self {
            addr: addr.to_string(),
            config: *config,
            request_tx: Some(request_tx),
            reply_rx,
            stream,
            io_thread: Some(io_thread),
            outstanding: false,
            sent_at: Instant::now(),
            request_timeout: None,
            stale_replies: 0,
        })
    }

    fn timeout_for(&self, request: &ModuleRequest) -> Option<Duration> {
        let ms = match request {
            ModuleRequest::Step(_) => self.config.step_timeout_ms,
            _ => self.config.cmd_timeout_ms,
        };
        (ms > 0).then(|| Duration::from_millis(ms as u64))
    }
}

impl ModuleConnection for TcpModuleConnection {
    fn send(&mut self, request: &ModuleRequest) -> bool {
        debug_assert!(!self.outstanding, "send with an outstanding request to {}", self.addr);
        let Some(tx) = &self.request_tx else { return false };
        self.request_timeout = self.timeout_for(request);
        if tx.send(request.clone()).is_err() {
            warn!(addr = %self.addr, "module connection is down, send rejected");
            return false;
        }
        self.outstanding = true;
        self.sent_at = Instant::now();
        true
    }

    fn receive(&mut self, response: &mut ModuleResponse, waiting_time: Duration) -> bool {
        if !self.outstanding {
            return false;
        }
        let deadline = Instant::now() + waiting_time;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            // Wake early enough to resolve the request-level timeout.
            let wait = match self.request_timeout {
                Some(t) => remaining.min(t.saturating_sub(self.sent_at.elapsed())),
                None => remaining,
            };
            match self.reply_rx.recv_timeout(wait) {
                Ok(ReplyEvent::Reply(reply)) => {
                    if self.stale_replies > 0 {
                        // Belongs to a request already resolved as timed
                        // out.
                        self.stale_replies -= 1;
                        continue;
                    }
                    *response = reply;
                    self.outstanding = false;
                    return true;
                }
                Ok(ReplyEvent::TransportError(reason)) => {
                    *response = ModuleResponse {
                        ec: ModuleResponseType::Error,
                        err: format!("connection to {} lost: {reason}", self.addr),
                        ..Default::default()
                    };
                    self.outstanding = false;
                    return true;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    *response = ModuleResponse {
                        ec: ModuleResponseType::Error,
                        err: format!("connection to {} closed", self.addr),
                        ..Default::default()
                    };
                    self.outstanding = false;
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(timeout) = self.request_timeout {
                        if self.sent_at.elapsed() >= timeout {
                            *response = ModuleResponse::timed_out();
                            self.outstanding = false;
                            self.stale_replies += 1;
                            return true;
                        }
                    }
                    if Instant::now() >= deadline {
                        return false;
                    }
                }
            }
        }
    }

    fn waiting_reply(&self) -> bool {
        self.outstanding
    }
}

impl Drop for TcpModuleConnection {
    fn drop(&mut self) {
        // Closing the request channel ends the I/O loop; shutting the
        // socket down unblocks a read in flight.
        self.request_tx.take();
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        if let Some(t) = self.io_thread.take() {
            let _ = t.join();
        }
    }
}

/// Production factory building [`TcpModuleConnection`]s.
#[derive(Debug, Default)]
pub struct TcpConnectionFactory;

impl ConnectionFactory for TcpConnectionFactory {
    fn create_connection(
        &self,
        addr: &str,
        config: &ConnectionConfig,
    ) -> CoordinatorResult<Box<dyn ModuleConnection>> {
        Ok(Box::new(TcpModuleConnection::connect(addr, config)?))
    }
}
