//! The five named sockets of the engine
//!
//! Each socket is a process-wide singleton in spirit: constructed once at
//! process start by the owning component and passed by reference. Frame
//! sockets (push/pull) load-balance across workers; the metadata and ready
//! channels are point-to-point pairs on derived ports (`output.port + 1` and
//! `input.port + 2`).

use super::{
    MsgSocket, SendOutcome, ShutdownFlag, TransportError, FRAME_QUEUE_SIZE, FRAME_TIMEOUT_MS,
    META_TIMEOUT_MS,
};
use crate::config::Address;

/// Payload of the one-shot worker readiness handshake.
pub const READY_PAYLOAD: &[u8] = b"ready";

/// Frame fan-out socket. The input binds it; workers pull from it and the
/// push pattern load-balances frames between them.
pub struct InputPushSocket {
    inner: MsgSocket,
}

impl InputPushSocket {
    pub fn bind(context: &zmq::Context, address: &Address) -> Result<Self, TransportError> {
        let inner = MsgSocket::new(
            context,
            zmq::PUSH,
            "InputPushSocket",
            FRAME_TIMEOUT_MS,
            FRAME_TIMEOUT_MS,
            Some(FRAME_QUEUE_SIZE),
            None,
        )?;
        inner.bind(&address.endpoint())?;
        Ok(Self { inner })
    }

    /// Non-blocking frame send; drops when the queue is full.
    pub fn send(&self, payload: &[u8]) -> Result<SendOutcome, TransportError> {
        self.inner.send(payload)
    }

    /// Guaranteed delivery, used to broadcast EOS to every worker.
    pub fn ensure_send(
        &self,
        payload: &[u8],
        shutdown: &ShutdownFlag,
    ) -> Result<(), TransportError> {
        self.inner.ensure_send(payload, shutdown)
    }
}

/// Worker-side receive end of the frame fan-out.
pub struct InputPullSocket {
    inner: MsgSocket,
}

impl InputPullSocket {
    pub fn dial(
        context: &zmq::Context,
        address: &Address,
        recv_buffer_size: i32,
        shutdown: &ShutdownFlag,
    ) -> Result<Self, TransportError> {
        let inner = MsgSocket::new(
            context,
            zmq::PULL,
            "InputPullSocket",
            FRAME_TIMEOUT_MS,
            FRAME_TIMEOUT_MS,
            None,
            Some(recv_buffer_size),
        )?;
        inner.dial(&address.endpoint(), shutdown)?;
        Ok(Self { inner })
    }

    pub fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.inner.recv()
    }
}

/// Worker-side frame delivery towards the encoder.
pub struct OutputPushSocket {
    inner: MsgSocket,
}

impl OutputPushSocket {
    pub fn dial(
        context: &zmq::Context,
        address: &Address,
        shutdown: &ShutdownFlag,
    ) -> Result<Self, TransportError> {
        let inner = MsgSocket::new(
            context,
            zmq::PUSH,
            "OutputPushSocket",
            FRAME_TIMEOUT_MS,
            FRAME_TIMEOUT_MS,
            Some(FRAME_QUEUE_SIZE),
            None,
        )?;
        inner.dial(&address.endpoint(), shutdown)?;
        Ok(Self { inner })
    }

    pub fn send(&self, payload: &[u8]) -> Result<SendOutcome, TransportError> {
        self.inner.send(payload)
    }

    /// Guaranteed delivery, used to forward EOS to the output.
    pub fn ensure_send(
        &self,
        payload: &[u8],
        shutdown: &ShutdownFlag,
    ) -> Result<(), TransportError> {
        self.inner.ensure_send(payload, shutdown)
    }
}

/// Output-side receive end for frames coming back from the workers.
pub struct OutputPullSocket {
    inner: MsgSocket,
}

impl OutputPullSocket {
    pub fn bind(
        context: &zmq::Context,
        address: &Address,
        recv_buffer_size: i32,
    ) -> Result<Self, TransportError> {
        let inner = MsgSocket::new(
            context,
            zmq::PULL,
            "OutputPullSocket",
            FRAME_TIMEOUT_MS,
            FRAME_TIMEOUT_MS,
            None,
            Some(recv_buffer_size),
        )?;
        inner.bind(&address.endpoint())?;
        Ok(Self { inner })
    }

    pub fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.inner.recv()
    }
}

/// Caps, tags and EOS metadata from the input to the output. The output
/// listens on `output.port + 1`; the input dials.
pub struct InputOutputSocket {
    inner: MsgSocket,
}

impl InputOutputSocket {
    pub fn dial(
        context: &zmq::Context,
        output_address: &Address,
        shutdown: &ShutdownFlag,
    ) -> Result<Self, TransportError> {
        let inner = Self::socket(context, "InputOutputSocket-Write")?;
        inner.dial(&output_address.endpoint_offset(1), shutdown)?;
        Ok(Self { inner })
    }

    pub fn listen(context: &zmq::Context, output_address: &Address) -> Result<Self, TransportError> {
        let inner = Self::socket(context, "InputOutputSocket-Read")?;
        inner.bind(&output_address.endpoint_offset(1))?;
        Ok(Self { inner })
    }

    fn socket(context: &zmq::Context, name: &'static str) -> Result<MsgSocket, TransportError> {
        MsgSocket::new(context, zmq::PAIR, name, META_TIMEOUT_MS, META_TIMEOUT_MS, None, None)
    }

    /// Metadata changes the output pipelines, so delivery is guaranteed.
    pub fn ensure_send(
        &self,
        payload: &[u8],
        shutdown: &ShutdownFlag,
    ) -> Result<(), TransportError> {
        self.inner.ensure_send(payload, shutdown)
    }

    /// Blocking on receptions would limit throughput; the output polls.
    pub fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        self.inner.recv()
    }
}

/// One-shot barrier letting the input wait for the first worker. Without it
/// the early frames of a stream are silently dropped by the push socket
/// while no worker has dialed in yet.
pub struct WorkerReadySocket {
    inner: MsgSocket,
}

impl WorkerReadySocket {
    pub fn listen(context: &zmq::Context, input_address: &Address) -> Result<Self, TransportError> {
        let inner = Self::socket(context, "WorkerReadySocket-Input")?;
        inner.bind(&input_address.endpoint_offset(2))?;
        Ok(Self { inner })
    }

    pub fn dial(
        context: &zmq::Context,
        input_address: &Address,
        shutdown: &ShutdownFlag,
    ) -> Result<Self, TransportError> {
        let inner = Self::socket(context, "WorkerReadySocket-Worker")?;
        inner.dial(&input_address.endpoint_offset(2), shutdown)?;
        Ok(Self { inner })
    }

    fn socket(context: &zmq::Context, name: &'static str) -> Result<MsgSocket, TransportError> {
        MsgSocket::new(context, zmq::PAIR, name, META_TIMEOUT_MS, META_TIMEOUT_MS, None, None)
    }

    /// Worker side: announce readiness, retrying until the input hears it.
    pub fn announce(&self, shutdown: &ShutdownFlag) -> Result<(), TransportError> {
        self.inner.ensure_send(READY_PAYLOAD, shutdown)
    }

    /// Input side: block until the first worker announces itself.
    pub fn await_worker(&self, shutdown: &ShutdownFlag) -> Result<(), TransportError> {
        let payload = self.inner.recv_blocking(shutdown)?;
        if payload != READY_PAYLOAD {
            log::warn!("Unexpected readiness payload on {}", self.inner.name());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn address(port: u16) -> Address {
        Address { host: "127.0.0.1".to_string(), port }
    }

    fn recv_within<F: Fn() -> Result<Option<Vec<u8>>, TransportError>>(
        recv: F,
        deadline: Duration,
    ) -> Option<Vec<u8>> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if let Ok(Some(payload)) = recv() {
                return Some(payload);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn push_without_peers_drops_instead_of_blocking() {
        let context = zmq::Context::new();
        let push = InputPushSocket::bind(&context, &address(29871)).unwrap();
        let outcome = push.send(b"frame").unwrap();
        assert_eq!(outcome, SendOutcome::WouldBlock);
    }

    #[test]
    fn push_pull_delivers_in_order() {
        let context = zmq::Context::new();
        let shutdown = ShutdownFlag::new();
        let addr = address(29872);
        let push = InputPushSocket::bind(&context, &addr).unwrap();
        let pull = InputPullSocket::dial(&context, &addr, 16, &shutdown).unwrap();

        push.ensure_send(b"first", &shutdown).unwrap();
        push.ensure_send(b"second", &shutdown).unwrap();

        let first = recv_within(|| pull.recv(), Duration::from_secs(2)).expect("first message");
        let second = recv_within(|| pull.recv(), Duration::from_secs(2)).expect("second message");
        assert_eq!(first, b"first");
        assert_eq!(second, b"second");
    }

    #[test]
    fn ready_barrier_round_trip() {
        let context = zmq::Context::new();
        let shutdown = ShutdownFlag::new();
        let addr = address(29873);
        let input_side = WorkerReadySocket::listen(&context, &addr).unwrap();
        let worker_side = WorkerReadySocket::dial(&context, &addr, &shutdown).unwrap();

        worker_side.announce(&shutdown).unwrap();
        input_side.await_worker(&shutdown).unwrap();
    }

    #[test]
    fn metadata_pair_round_trip() {
        let context = zmq::Context::new();
        let shutdown = ShutdownFlag::new();
        let addr = address(29874);
        let reader = InputOutputSocket::listen(&context, &addr).unwrap();
        let writer = InputOutputSocket::dial(&context, &addr, &shutdown).unwrap();

        writer.ensure_send(b"caps", &shutdown).unwrap();
        let payload = recv_within(|| reader.recv(), Duration::from_secs(2)).expect("metadata");
        assert_eq!(payload, b"caps");
    }
}
