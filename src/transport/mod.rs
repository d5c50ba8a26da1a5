//! Typed message sockets between the three processes
//!
//! Frames travel over push/pull pairs with bounded queues and non-blocking
//! sends: when a queue is full the frame is dropped, because holding back a
//! real-time producer is worse than losing a frame. Caps, tags, EOS and the
//! readiness handshake travel over pair sockets with `ensure_send`, which
//! retries until the message is on the wire.

pub mod sockets;

pub use sockets::{
    InputOutputSocket, InputPullSocket, InputPushSocket, OutputPullSocket, OutputPushSocket,
    WorkerReadySocket, READY_PAYLOAD,
};

use log::{debug, error, warn};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Queue bound for the frame push/pull sockets: 3 seconds of 60 fps video.
pub const FRAME_QUEUE_SIZE: i32 = 180;

/// Send/receive timeout on the frame sockets.
pub const FRAME_TIMEOUT_MS: i32 = 500;

/// Send/receive timeout on the metadata and readiness sockets.
pub const META_TIMEOUT_MS: i32 = 1000;

const DIAL_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What happened to a message handed to `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The message was queued for delivery
    Sent,
    /// A blocking send ran out of time
    Timeout,
    /// A non-blocking send found the queue full; the message was dropped
    WouldBlock,
}

/// Transport errors
#[derive(Debug)]
pub enum TransportError {
    /// The peer tore the socket down; the owning process should shut down
    Closed { socket: &'static str },
    /// Socket creation, configuration, bind or dial failed
    Failure { socket: &'static str, reason: String },
    /// A shutdown request arrived while dialing or retrying
    Interrupted,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Closed { socket } => write!(f, "the socket {} is closed", socket),
            TransportError::Failure { socket, reason } => {
                write!(f, "socket {} failed: {}", socket, reason)
            }
            TransportError::Interrupted => write!(f, "interrupted by shutdown request"),
        }
    }
}

impl Error for TransportError {}

/// Process-wide cancellation flag, set from the SIGINT handler and polled by
/// every loop and by the dial/ensure-send retries.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the SIGINT handler. Call once per process.
    pub fn install(&self) {
        let flag = self.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            warn!("Interrupt received, shutting down");
            flag.set();
        }) {
            warn!("Failed to install the interrupt handler: {}", e);
        }
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// A zmq socket plus the name used in every log line about it.
pub(crate) struct MsgSocket {
    socket: zmq::Socket,
    name: &'static str,
}

impl MsgSocket {
    pub(crate) fn new(
        context: &zmq::Context,
        kind: zmq::SocketType,
        name: &'static str,
        send_timeout_ms: i32,
        recv_timeout_ms: i32,
        send_queue: Option<i32>,
        recv_queue: Option<i32>,
    ) -> Result<MsgSocket, TransportError> {
        let socket = context.socket(kind).map_err(|e| failure(name, e))?;
        socket.set_linger(0).map_err(|e| failure(name, e))?;
        socket.set_sndtimeo(send_timeout_ms).map_err(|e| failure(name, e))?;
        socket.set_rcvtimeo(recv_timeout_ms).map_err(|e| failure(name, e))?;
        if let Some(size) = send_queue {
            socket.set_sndhwm(size).map_err(|e| failure(name, e))?;
        }
        if let Some(size) = recv_queue {
            socket.set_rcvhwm(size).map_err(|e| failure(name, e))?;
        }
        Ok(MsgSocket { socket, name })
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn bind(&self, endpoint: &str) -> Result<(), TransportError> {
        self.socket.bind(endpoint).map_err(|e| failure(self.name, e))
    }

    /// Dial with backoff: connection refusals and transient failures are
    /// retried every second until the endpoint appears or shutdown is
    /// requested.
    pub(crate) fn dial(
        &self,
        endpoint: &str,
        shutdown: &ShutdownFlag,
    ) -> Result<(), TransportError> {
        loop {
            if shutdown.is_set() {
                return Err(TransportError::Interrupted);
            }
            match self.socket.connect(endpoint) {
                Ok(()) => return Ok(()),
                Err(zmq::Error::ECONNREFUSED) | Err(zmq::Error::EAGAIN) => {
                    warn!("Connection to {} failed. Retrying...", endpoint);
                    thread::sleep(DIAL_RETRY_DELAY);
                }
                Err(e) => {
                    error!("Failed to connect to {}: {}", endpoint, e);
                    return Err(failure(self.name, e));
                }
            }
        }
    }

    /// Non-blocking send. A full queue drops the message.
    pub(crate) fn send(&self, payload: &[u8]) -> Result<SendOutcome, TransportError> {
        match self.socket.send(payload, zmq::DONTWAIT) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) => self.map_send_error(e, false),
        }
    }

    /// Blocking send, bounded by the configured send timeout.
    pub(crate) fn block_send(&self, payload: &[u8]) -> Result<SendOutcome, TransportError> {
        match self.socket.send(payload, 0) {
            Ok(()) => Ok(SendOutcome::Sent),
            Err(e) => self.map_send_error(e, true),
        }
    }

    /// Retry the blocking send until the message is accepted. Used for the
    /// messages whose loss is not acceptable: EOS, caps, tags, ready.
    pub(crate) fn ensure_send(
        &self,
        payload: &[u8],
        shutdown: &ShutdownFlag,
    ) -> Result<(), TransportError> {
        loop {
            match self.block_send(payload)? {
                SendOutcome::Sent => return Ok(()),
                SendOutcome::Timeout | SendOutcome::WouldBlock => {
                    warn!("Retrying send on {}...", self.name);
                }
            }
            if shutdown.is_set() {
                return Err(TransportError::Interrupted);
            }
        }
    }

    /// Non-blocking receive: `None` when there is nothing queued.
    pub(crate) fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        match self.socket.recv_bytes(zmq::DONTWAIT) {
            Ok(payload) => Ok(Some(payload)),
            Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => {
                debug!("No data to read, try again on: {}", self.name);
                Ok(None)
            }
            Err(zmq::Error::ETERM) | Err(zmq::Error::ENOTSOCK) => {
                error!("Trying to read from a closed socket: {}", self.name);
                Err(TransportError::Closed { socket: self.name })
            }
            Err(e) => Err(failure(self.name, e)),
        }
    }

    /// Blocking receive that keeps waiting across timeouts until a message
    /// arrives or shutdown is requested. Only the readiness barrier uses it.
    pub(crate) fn recv_blocking(&self, shutdown: &ShutdownFlag) -> Result<Vec<u8>, TransportError> {
        loop {
            match self.socket.recv_bytes(0) {
                Ok(payload) => return Ok(payload),
                Err(zmq::Error::EAGAIN) | Err(zmq::Error::EINTR) => {
                    if shutdown.is_set() {
                        return Err(TransportError::Interrupted);
                    }
                }
                Err(zmq::Error::ETERM) | Err(zmq::Error::ENOTSOCK) => {
                    error!("Trying to read from a closed socket: {}", self.name);
                    return Err(TransportError::Closed { socket: self.name });
                }
                Err(e) => return Err(failure(self.name, e)),
            }
        }
    }

    fn map_send_error(
        &self,
        e: zmq::Error,
        blocking: bool,
    ) -> Result<SendOutcome, TransportError> {
        match e {
            zmq::Error::EAGAIN | zmq::Error::EINTR => {
                if blocking {
                    warn!("Timeout sending message on socket: {}", self.name);
                    Ok(SendOutcome::Timeout)
                } else {
                    debug!("No data written, try again on: {}", self.name);
                    Ok(SendOutcome::WouldBlock)
                }
            }
            zmq::Error::ETERM | zmq::Error::ENOTSOCK => {
                error!("Trying to write to a closed socket: {}", self.name);
                Err(TransportError::Closed { socket: self.name })
            }
            other => Err(failure(self.name, other)),
        }
    }
}

fn failure(name: &'static str, e: zmq::Error) -> TransportError {
    TransportError::Failure { socket: name, reason: e.to_string() }
}
