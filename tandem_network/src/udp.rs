//! Datagram transport: each datagram carries exactly one envelope frame.
//!
//! Best-effort by design; sends are retried a bounded number of times, then
//! the failure is surfaced as an error envelope on the local node.

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use bytes::BytesMut;
use tokio::{net::UdpSocket, sync::mpsc};
use tokio_util::codec::{Decoder, Encoder};

use tandem_runtime::{
    route::{RouteError, RouteSender},
    Action, ActionMessage, Flags, Mailbox,
};

use crate::{EnvelopeCodec, Transport, TransportError};

const MAX_DATAGRAM: usize = 65_507;
const SEND_RETRIES: usize = 3;
const RECV_SLICE: Duration = Duration::from_millis(10);

struct UdpRoute(mpsc::UnboundedSender<ActionMessage>);

impl RouteSender for UdpRoute {
    fn send(&self, msg: ActionMessage) -> Result<(), RouteError> {
        self.0.send(msg).map_err(|_| RouteError::Closed)
    }
}

/// Config for a datagram endpoint paired with one remote peer.
pub struct UdpConfig {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    /// Mailbox inbound envelopes are delivered to.
    pub sink: Arc<Mailbox<ActionMessage>>,
}

/// A bound datagram endpoint paired with one remote peer.
pub struct UdpTransport {
    runtime: Option<tokio::runtime::Runtime>,
    tx: mpsc::UnboundedSender<ActionMessage>,
    sink: Arc<Mailbox<ActionMessage>>,
    closed: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl UdpTransport {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn route(&self) -> Box<dyn RouteSender> {
        Box::new(UdpRoute(self.tx.clone()))
    }
}

impl Transport for UdpTransport {
    type Config = UdpConfig;

    /// Bind the local address and exchange frames with the remote; decoded
    /// inbound envelopes land in the sink.
    fn open(config: UdpConfig) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let socket = runtime.block_on(async { UdpSocket::bind(config.local).await })?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let closed = Arc::new(AtomicBool::new(false));
        let remote = config.remote;

        let (tx, mut rx) = mpsc::unbounded_channel::<ActionMessage>();
        let send_socket = socket.clone();
        let send_sink = config.sink.clone();
        let send_closed = closed.clone();
        runtime.spawn(async move {
            let mut codec = EnvelopeCodec::new();
            while let Some(msg) = rx.recv().await {
                let mut buf = BytesMut::new();
                if let Err(err) = codec.encode(msg, &mut buf) {
                    tracing::error!("datagram encode failure: {err}");
                    continue;
                }
                if buf.len() > MAX_DATAGRAM {
                    tracing::error!("frame of {} bytes exceeds datagram size", buf.len());
                    continue;
                }
                let mut sent = false;
                for _ in 0..SEND_RETRIES {
                    if send_socket.send_to(&buf, remote).await.is_ok() {
                        sent = true;
                        break;
                    }
                }
                if !sent {
                    push_error(&send_sink, "datagram send failed after retries");
                    send_closed.store(true, Ordering::Release);
                    return;
                }
            }
        });

        let recv_sink = config.sink.clone();
        let recv_closed = closed.clone();
        runtime.spawn(async move {
            let mut codec = EnvelopeCodec::new();
            let mut datagram = vec![0u8; MAX_DATAGRAM];
            loop {
                match socket.recv_from(&mut datagram).await {
                    Ok((len, _from)) => {
                        let mut buf = BytesMut::from(&datagram[..len]);
                        match codec.decode(&mut buf) {
                            Ok(Some(msg)) => {
                                if msg.is_priority() {
                                    recv_sink.push_priority(msg);
                                } else {
                                    recv_sink.push(msg);
                                }
                            }
                            Ok(None) => {
                                tracing::warn!("truncated datagram dropped");
                            }
                            Err(err) => {
                                tracing::warn!("undecodable datagram dropped: {err}");
                            }
                        }
                    }
                    Err(err) => {
                        push_error(&recv_sink, &format!("datagram receive failure: {err}"));
                        recv_closed.store(true, Ordering::Release);
                        return;
                    }
                }
            }
        });

        Ok(Self {
            runtime: Some(runtime),
            tx,
            sink: config.sink,
            closed,
            local_addr,
        })
    }

    fn send(&self, frame: ActionMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }

    fn recv(&mut self) -> Result<ActionMessage, TransportError> {
        loop {
            if let Some(frame) = self.sink.pop_timeout(RECV_SLICE) {
                return Ok(frame);
            }
            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        Ok(())
    }
}

impl Drop for UdpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn push_error(sink: &Mailbox<ActionMessage>, text: &str) {
    let mut msg = ActionMessage::new(Action::Error);
    msg.flags.set(Flags::ERROR);
    msg.set_name(text);
    sink.push_priority(msg);
}
