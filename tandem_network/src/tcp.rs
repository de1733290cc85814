//! Framed TCP transport.
//!
//! Each connection is split into a writer task fed by an unbounded channel
//! and a reader task that pumps decoded envelopes into the connection's
//! sink mailbox. The broker-side listener learns peer names from the
//! `RegisterCore`/`RegisterBroker` announcement on each connection, so its
//! route resolver can answer registrations. [`TcpConnection`] is the
//! [`Transport`] implementation; [`TcpServer`] is the listener beside it.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::codec::Framed;

use tandem_runtime::{
    route::{RouteError, RouteSender},
    Action, ActionMessage, Flags, Mailbox,
};

use crate::{EnvelopeCodec, Transport, TransportError};

const RECV_SLICE: Duration = Duration::from_millis(10);

type PeerTable = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<ActionMessage>>>>;

/// Sender half of one TCP connection.
struct TcpRoute(mpsc::UnboundedSender<ActionMessage>);

impl RouteSender for TcpRoute {
    fn send(&self, msg: ActionMessage) -> Result<(), RouteError> {
        self.0.send(msg).map_err(|_| RouteError::Closed)
    }
}

/// Broker-side listener: accepts core and sub-broker connections.
pub struct TcpServer {
    runtime: tokio::runtime::Runtime,
    peers: PeerTable,
    local_addr: SocketAddr,
}

impl TcpServer {
    /// Bind and start accepting; every decoded envelope lands in `sink`.
    pub fn bind(
        addr: SocketAddr,
        sink: Arc<Mailbox<ActionMessage>>,
    ) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let listener = runtime.block_on(TcpListener::bind(addr))?;
        let local_addr = listener.local_addr()?;
        let peers: PeerTable = Arc::new(Mutex::new(HashMap::new()));
        runtime.spawn(accept_loop(listener, sink, peers.clone()));
        Ok(Self {
            runtime,
            peers,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Resolver mapping announced peer names to their connections.
    pub fn resolver(&self) -> Box<dyn tandem_runtime::route::RouteResolver> {
        Box::new(TcpResolver {
            peers: self.peers.clone(),
        })
    }

    pub fn shutdown(self) {
        self.runtime.shutdown_background();
    }
}

struct TcpResolver {
    peers: PeerTable,
}

impl tandem_runtime::route::RouteResolver for TcpResolver {
    fn resolve(&self, name: &str) -> Option<Box<dyn RouteSender>> {
        self.peers
            .lock()
            .unwrap()
            .get(name)
            .map(|tx| Box::new(TcpRoute(tx.clone())) as Box<dyn RouteSender>)
    }
}

#[tracing::instrument(skip_all)]
async fn accept_loop(
    listener: TcpListener,
    sink: Arc<Mailbox<ActionMessage>>,
    peers: PeerTable,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                tracing::debug!(%addr, "accepted transport connection");
                tokio::spawn(serve_connection(stream, sink.clone(), peers.clone()));
            }
            Err(err) => {
                tracing::error!("accept failed: {err}");
                push_error(&sink, &format!("listener failure: {err}"));
                return;
            }
        }
    }
}

async fn serve_connection(stream: TcpStream, sink: Arc<Mailbox<ActionMessage>>, peers: PeerTable) {
    let framed = Framed::new(stream, EnvelopeCodec::new());
    let (mut frame_sink, mut frame_stream) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ActionMessage>();
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if frame_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = frame_stream.next().await {
        match result {
            Ok(msg) => {
                if matches!(msg.action, Action::RegisterCore | Action::RegisterBroker) {
                    peers
                        .lock()
                        .unwrap()
                        .insert(msg.name().to_owned(), tx.clone());
                }
                deliver(&sink, msg);
            }
            Err(err) => {
                tracing::error!("decode failure on connection: {err}");
                push_error(&sink, &format!("transport decode failure: {err}"));
                return;
            }
        }
    }
    tracing::debug!("transport connection closed");
}

/// Config for a core-side connection to a broker.
pub struct TcpConfig {
    pub addr: SocketAddr,
    /// Mailbox inbound envelopes are delivered to.
    pub sink: Arc<Mailbox<ActionMessage>>,
}

/// Core-side connection to a broker.
pub struct TcpConnection {
    runtime: Option<tokio::runtime::Runtime>,
    tx: mpsc::UnboundedSender<ActionMessage>,
    sink: Arc<Mailbox<ActionMessage>>,
    closed: Arc<AtomicBool>,
}

impl TcpConnection {
    /// Connect to `addr`; decoded inbound envelopes land in `sink`.
    pub fn connect(
        addr: SocketAddr,
        sink: Arc<Mailbox<ActionMessage>>,
    ) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()?;
        let stream = runtime.block_on(TcpStream::connect(addr))?;
        let framed = Framed::new(stream, EnvelopeCodec::new());
        let (mut frame_sink, mut frame_stream) = framed.split();
        let closed = Arc::new(AtomicBool::new(false));

        let (tx, mut rx) = mpsc::unbounded_channel::<ActionMessage>();
        runtime.spawn(async move {
            while let Some(msg) = rx.recv().await {
                if frame_sink.send(msg).await.is_err() {
                    break;
                }
            }
        });
        let reader_sink = sink.clone();
        let reader_closed = closed.clone();
        runtime.spawn(async move {
            while let Some(result) = frame_stream.next().await {
                match result {
                    Ok(msg) => deliver(&reader_sink, msg),
                    Err(err) => {
                        tracing::error!("decode failure from broker: {err}");
                        push_error(&reader_sink, &format!("transport decode failure: {err}"));
                        reader_closed.store(true, Ordering::Release);
                        return;
                    }
                }
            }
            push_error(&reader_sink, "broker connection dropped");
            reader_closed.store(true, Ordering::Release);
        });

        Ok(Self {
            runtime: Some(runtime),
            tx,
            sink,
            closed,
        })
    }

    /// The outbound route over this connection.
    pub fn route(&self) -> Box<dyn RouteSender> {
        Box::new(TcpRoute(self.tx.clone()))
    }
}

impl Transport for TcpConnection {
    type Config = TcpConfig;

    fn open(config: TcpConfig) -> Result<Self, TransportError> {
        Self::connect(config.addr, config.sink)
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

impl Drop for TcpConnection {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

fn deliver(sink: &Mailbox<ActionMessage>, msg: ActionMessage) {
    if msg.is_priority() {
        sink.push_priority(msg);
    } else {
        sink.push(msg);
    }
}

/// Convert a transport failure into an error envelope on the local node.
fn push_error(sink: &Mailbox<ActionMessage>, text: &str) {
    let mut msg = ActionMessage::new(Action::Error);
    msg.flags.set(Flags::ERROR);
    msg.set_name(text);
    sink.push_priority(msg);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_core::Time;

    #[test]
    fn envelope_round_trip_over_tcp() {
        let server_sink = Arc::new(Mailbox::new());
        let server = TcpServer::bind("127.0.0.1:0".parse().unwrap(), server_sink.clone()).unwrap();

        let mut connection = TcpConnection::open(TcpConfig {
            addr: server.local_addr(),
            sink: Arc::new(Mailbox::new()),
        })
        .unwrap();

        // Announce so the server learns the route, then send data.
        let mut announce = ActionMessage::new(Action::RegisterCore);
        announce.set_name("tcp_test_core");
        connection.send(announce).unwrap();

        let mut publish = ActionMessage::new(Action::Publish);
        publish.action_time = Time::from_seconds(2.5);
        publish.payload = vec![0, 1, 2, 0, 3];
        connection.send(publish.clone()).unwrap();

        let received = server_sink
            .pop_timeout(Duration::from_secs(5))
            .expect("announcement");
        assert_eq!(received.action, Action::RegisterCore);
        let received = server_sink
            .pop_timeout(Duration::from_secs(5))
            .expect("publish");
        assert_eq!(received, publish);

        // The server answers on the learned route; recv returns it.
        let back = server.resolver().resolve("tcp_test_core").unwrap();
        let mut ack = ActionMessage::new(Action::CoreAck);
        ack.set_name("tcp_test_core");
        back.send(ack.clone()).unwrap();
        assert_eq!(connection.recv().unwrap(), ack);

        connection.close().unwrap();
        assert!(matches!(
            connection.send(ActionMessage::new(Action::Ping)),
            Err(TransportError::Closed)
        ));
        server.shutdown();
    }
}
