//! Slave side: request dispatch over accepted transports

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use crate::common::buffer::ReadBuffer;
use crate::common::frame::FrameWriter;
use crate::error::RequestError;
use crate::transport::{Transport, TransportOptions};
use crate::types::{Pdu, UnitId};

/// Process image collaborator. The stack hands every well-formed request to
/// the handler and transmits whatever it returns.
pub trait RequestHandler: Send + 'static {
    /// Process one request addressed to `unit`. Returning `None` suppresses
    /// the reply, e.g. when the unit id is not served by this device.
    fn process(&mut self, unit: UnitId, request: &Pdu) -> Option<Pdu>;
}

/// Handler shared by every session of a listener
pub type SharedHandler = Arc<tokio::sync::Mutex<dyn RequestHandler>>;

/// Wrap a handler for use by a listener
pub fn shared<H: RequestHandler>(handler: H) -> SharedHandler {
    Arc::new(tokio::sync::Mutex::new(handler))
}

/// Per-listener limits
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// concurrent sessions allowed per listener, oldest evicted beyond this
    pub max_sessions: usize,
    /// transport tunables applied to every session
    pub transport: TransportOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 10,
            transport: TransportOptions::default(),
        }
    }
}

pub(crate) struct SessionTracker {
    max: usize,
    id: u64,
    sessions: BTreeMap<u64, tokio::sync::mpsc::Sender<()>>,
}

pub(crate) type SessionTrackerWrapper = Arc<Mutex<SessionTracker>>;

impl SessionTracker {
    fn new(max: usize) -> SessionTracker {
        Self {
            max,
            id: 0,
            sessions: BTreeMap::new(),
        }
    }

    pub(crate) fn wrapped(max: usize) -> SessionTrackerWrapper {
        Arc::new(Mutex::new(Self::new(max)))
    }

    pub(crate) fn add(&mut self, sender: tokio::sync::mpsc::Sender<()>) -> u64 {
        if !self.sessions.is_empty() && self.sessions.len() >= self.max {
            // dropping the sender stops the session task
            if let Some((&id, _)) = self.sessions.iter().next() {
                tracing::warn!("exceeded max sessions, closing oldest session: {}", id);
                self.sessions.remove(&id);
            }
        }

        let id = self.id;
        self.id += 1;
        self.sessions.insert(id, sender);
        id
    }

    pub(crate) fn remove(&mut self, id: u64) {
        self.sessions.remove(&id);
    }

    pub(crate) fn drain(&mut self) {
        self.sessions.clear();
    }
}

/// Serves one connected transport until the stream errors or the listener
/// shuts the session down
pub(crate) struct SessionTask {
    transport: Transport,
    handler: SharedHandler,
    shutdown: tokio::sync::mpsc::Receiver<()>,
}

impl SessionTask {
    pub(crate) fn new(
        transport: Transport,
        handler: SharedHandler,
        shutdown: tokio::sync::mpsc::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            handler,
            shutdown,
        }
    }

    pub(crate) async fn run(&mut self) -> RequestError {
        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    return RequestError::Io(std::io::ErrorKind::Interrupted);
                }
                result = Self::run_one(&mut self.transport, &self.handler) => {
                    if let Err(err) = result {
                        return err;
                    }
                }
            }
        }
    }

    async fn run_one(
        transport: &mut Transport,
        handler: &SharedHandler,
    ) -> Result<(), RequestError> {
        let (header, request) = transport.read_request().await?;
        let response = handler.lock().await.process(header.unit_id, &request);

        match response {
            // broadcast requests are processed but never answered
            Some(pdu) if !header.unit_id.is_broadcast() => {
                transport.write_response(header, &pdu).await
            }
            _ => Ok(()),
        }
    }
}

/// Accepts TCP connections and spawns one session task per socket
pub(crate) struct TcpListenerTask {
    listener: tokio::net::TcpListener,
    handler: SharedHandler,
    tracker: SessionTrackerWrapper,
    options: TransportOptions,
}

impl TcpListenerTask {
    pub(crate) fn new(
        listener: tokio::net::TcpListener,
        handler: SharedHandler,
        config: ServerConfig,
    ) -> Self {
        Self {
            listener,
            handler,
            tracker: SessionTracker::wrapped(config.max_sessions),
            options: config.transport,
        }
    }

    pub(crate) async fn run(&mut self, mut shutdown: tokio::sync::mpsc::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("listener shutdown");
                    self.tracker.lock().unwrap().drain();
                    return;
                }
                result = self.listener.accept() => {
                    match result {
                        Err(err) => {
                            tracing::error!("error accepting connection: {}", err);
                            self.tracker.lock().unwrap().drain();
                            return;
                        }
                        Ok((socket, addr)) => self.handle(socket, addr),
                    }
                }
            }
        }
    }

    fn handle(&self, socket: tokio::net::TcpStream, addr: SocketAddr) {
        let transport = Transport::accepted_tcp(socket, self.options);
        let handler = self.handler.clone();
        let tracker = self.tracker.clone();
        let (tx, rx) = tokio::sync::mpsc::channel(1);

        let id = self.tracker.lock().unwrap().add(tx);

        tracing::info!("accepted connection {} from: {}", id, addr);

        tokio::spawn(async move {
            let err = SessionTask::new(transport, handler, rx).run().await;
            tracing::info!("session {} ended: {}", id, err);
            tracker.lock().unwrap().remove(id);
        });
    }
}

/// Serves one datagram per request on a bound UDP socket
pub(crate) struct UdpListenerTask {
    socket: tokio::net::UdpSocket,
    handler: SharedHandler,
    writer: FrameWriter,
    options: TransportOptions,
}

impl UdpListenerTask {
    pub(crate) fn new(
        socket: tokio::net::UdpSocket,
        handler: SharedHandler,
        config: ServerConfig,
    ) -> Self {
        Self {
            socket,
            handler,
            writer: FrameWriter::tcp(),
            options: config.transport,
        }
    }

    pub(crate) async fn run(&mut self, mut shutdown: tokio::sync::mpsc::Receiver<()>) {
        let mut datagram = [0u8; crate::common::frame::constants::MAX_FRAME_LENGTH];
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("listener shutdown");
                    return;
                }
                result = self.socket.recv_from(&mut datagram) => {
                    match result {
                        Err(err) => {
                            tracing::error!("error receiving datagram: {}", err);
                            return;
                        }
                        Ok((count, source)) => {
                            if let Err(err) = self.handle(&datagram[..count], source).await {
                                tracing::warn!("dropping datagram from {}: {}", source, err);
                            }
                        }
                    }
                }
            }
        }
    }

    async fn handle(&mut self, datagram: &[u8], source: SocketAddr) -> Result<(), RequestError> {
        let mut parser = crate::tcp::frame::MbapParser::new();
        let mut buffer = ReadBuffer::new(datagram.len().max(1));
        buffer.push(datagram)?;

        let frame = match parser.parse(&mut buffer)? {
            Some(x) => x,
            // a datagram holding less than a full frame is dropped, the
            // remainder will never arrive
            None => return Err(crate::error::FrameParseError::FrameTooShort(datagram.len()).into()),
        };

        let request = frame.pdu()?;
        let response = self
            .handler
            .lock()
            .await
            .process(frame.header.unit_id, &request);

        if let Some(pdu) = response {
            if !frame.header.unit_id.is_broadcast() {
                let bytes = self
                    .writer
                    .format(frame.header, &pdu, self.options.decode)?;
                self.socket.send_to(bytes, source).await?;
            }
        }
        Ok(())
    }
}

/// Serves a serial endpoint: one long-lived session on the opened port
#[cfg(feature = "serial")]
pub(crate) struct SerialListenerTask {
    transport: Transport,
    handler: SharedHandler,
}

#[cfg(feature = "serial")]
impl SerialListenerTask {
    pub(crate) fn new(
        stream: tokio_serial::SerialStream,
        settings: &crate::serial::SerialSettings,
        handler: SharedHandler,
        config: ServerConfig,
    ) -> Self {
        Self {
            transport: Transport::opened_serial(stream, settings, config.transport),
            handler,
        }
    }

    pub(crate) async fn run(self, shutdown: tokio::sync::mpsc::Receiver<()>) {
        let mut session = SessionTask::new(self.transport, self.handler, shutdown);
        let err = session.run().await;
        tracing::info!("serial session ended: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::frame::FramingMode;
    use crate::transport::Role;
    use tokio_test::io::Builder;

    const UNIT_ID: u8 = 0x2A;

    //                             |   tx id  | proto id  |  length  | unit |      pdu      |
    const MBAP_REQUEST: &[u8] = &[
        0x00, 0x07, 0x00, 0x00, 0x00, 0x06, UNIT_ID, 0x03, 0x00, 0x00, 0x00, 0x01,
    ];
    const MBAP_RESPONSE: &[u8] = &[
        0x00, 0x07, 0x00, 0x00, 0x00, 0x05, UNIT_ID, 0x03, 0x02, 0x12, 0x34,
    ];

    struct FixedHandler {
        response: Option<Pdu>,
        seen: Vec<(UnitId, Pdu)>,
    }

    impl RequestHandler for FixedHandler {
        fn process(&mut self, unit: UnitId, request: &Pdu) -> Option<Pdu> {
            self.seen.push((unit, request.clone()));
            self.response.clone()
        }
    }

    fn fixed_handler(response: Option<Pdu>) -> (SharedHandler, Arc<tokio::sync::Mutex<FixedHandler>>) {
        let inner = Arc::new(tokio::sync::Mutex::new(FixedHandler {
            response,
            seen: Vec::new(),
        }));
        let handler: SharedHandler = inner.clone();
        (handler, inner)
    }

    #[tokio::test]
    async fn session_answers_request_under_its_header() {
        let io = Builder::new().read(MBAP_REQUEST).write(MBAP_RESPONSE).build();
        let transport = Transport::mock(
            io,
            FramingMode::Tcp,
            Role::Slave,
            false,
            TransportOptions::default(),
        );
        let (handler, inner) = fixed_handler(Some(Pdu::new(0x03, vec![0x02, 0x12, 0x34])));
        let (_tx, rx) = tokio::sync::mpsc::channel(1);

        let err = SessionTask::new(transport, handler, rx).run().await;
        // the mock stream ends after the exchange
        assert_eq!(err, RequestError::Io(std::io::ErrorKind::UnexpectedEof));

        let inner = inner.lock().await;
        assert_eq!(inner.seen.len(), 1);
        assert_eq!(inner.seen[0].0, UnitId::new(UNIT_ID));
        assert_eq!(inner.seen[0].1, Pdu::new(0x03, vec![0x00, 0x00, 0x00, 0x01]));
    }

    #[tokio::test]
    async fn session_processes_broadcast_without_replying() {
        // write single register broadcast over RTU, crc computed for unit 0
        const BROADCAST_REQUEST: &[u8] = &[0x00, 0x06, 0x00, 0x05, 0x12, 0x34, 0x95, 0x6D];

        let io = Builder::new().read(BROADCAST_REQUEST).build();
        let transport = Transport::mock(
            io,
            FramingMode::Rtu,
            Role::Slave,
            false,
            TransportOptions::default(),
        );
        let (handler, inner) = fixed_handler(Some(Pdu::new(0x06, vec![0x00, 0x05, 0x12, 0x34])));
        let (_tx, rx) = tokio::sync::mpsc::channel(1);

        let err = SessionTask::new(transport, handler, rx).run().await;
        assert_eq!(err, RequestError::Io(std::io::ErrorKind::UnexpectedEof));

        let inner = inner.lock().await;
        assert_eq!(inner.seen.len(), 1);
        assert!(inner.seen[0].0.is_broadcast());
    }

    #[tokio::test]
    async fn session_stops_when_its_sender_is_dropped() {
        let io = Builder::new()
            .wait(std::time::Duration::from_secs(3600))
            .build();
        let transport = Transport::mock(
            io,
            FramingMode::Tcp,
            Role::Slave,
            false,
            TransportOptions::default(),
        );
        let (handler, _inner) = fixed_handler(None);
        let (tx, rx) = tokio::sync::mpsc::channel(1);

        let task = tokio::spawn(async move { SessionTask::new(transport, handler, rx).run().await });
        drop(tx);
        let err = task.await.unwrap();
        assert_eq!(err, RequestError::Io(std::io::ErrorKind::Interrupted));
    }

    #[test]
    fn tracker_evicts_oldest_session_at_capacity() {
        use tokio::sync::mpsc::error::TryRecvError;

        let tracker = SessionTracker::wrapped(2);
        let (tx1, mut rx1) = tokio::sync::mpsc::channel::<()>(1);
        let (tx2, _rx2) = tokio::sync::mpsc::channel::<()>(1);
        let (tx3, _rx3) = tokio::sync::mpsc::channel::<()>(1);

        let mut guard = tracker.lock().unwrap();
        guard.add(tx1);
        guard.add(tx2);
        assert_eq!(rx1.try_recv(), Err(TryRecvError::Empty));
        guard.add(tx3);
        assert_eq!(rx1.try_recv(), Err(TryRecvError::Disconnected));
    }
}
