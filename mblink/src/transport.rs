use std::net::SocketAddr;
use std::time::Duration;

use crate::common::frame::{
    constants::DEFAULT_MAX_DISCARDS, FrameHeader, FrameWriter, FramedReader, FramingMode, TxId,
};
use crate::common::phys::PhysLayer;
use crate::decode::DecodeLevel;
use crate::error::{ConfigError, RequestError};
use crate::serial::{SerialEncoding, SerialSettings};
use crate::types::{Pdu, UnitId};

/// Tunables shared by every transport kind
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransportOptions {
    /// how long to wait for a correlated response
    pub response_timeout: Duration,
    /// corrupt frames tolerated per read before the read fails
    pub max_discards: usize,
    /// protocol decode logging
    pub decode: DecodeLevel,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_secs(1),
            max_discards: DEFAULT_MAX_DISCARDS,
            decode: DecodeLevel::nothing(),
        }
    }
}

/// Which side of the exchange this transport sits on. RTU parsers differ per
/// direction since the body length is inferred from the function code.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum Role {
    Master,
    Slave,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Remote {
    Tcp(SocketAddr),
    Udp(SocketAddr),
    Serial { path: String, settings: SerialSettings },
}

impl std::fmt::Display for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Remote::Tcp(addr) => write!(f, "tcp:{addr}"),
            Remote::Udp(addr) => write!(f, "udp:{addr}"),
            Remote::Serial { path, .. } => write!(f, "serial:{path}"),
        }
    }
}

fn serial_framing(encoding: SerialEncoding) -> FramingMode {
    match encoding {
        SerialEncoding::Ascii => FramingMode::Ascii,
        SerialEncoding::Rtu => FramingMode::Rtu,
        SerialEncoding::Bin => FramingMode::Bin,
    }
}

fn reader_for(mode: FramingMode, role: Role, max_discards: usize) -> FramedReader {
    match (mode, role) {
        (FramingMode::Tcp, _) => FramedReader::tcp(max_discards),
        (FramingMode::Rtu, Role::Master) => FramedReader::rtu_response(max_discards),
        (FramingMode::Rtu, Role::Slave) => FramedReader::rtu_request(max_discards),
        (FramingMode::Ascii, _) => FramedReader::ascii(max_discards),
        (FramingMode::Bin, _) => FramedReader::bin(max_discards),
    }
}

/// One framing bound to one physical layer. A master transport owns its remote
/// address and can re-establish the connection; a slave transport wraps an
/// already-accepted stream.
pub struct Transport {
    remote: Option<Remote>,
    phys: Option<PhysLayer>,
    mode: FramingMode,
    writer: FrameWriter,
    reader: FramedReader,
    tx_id: TxId,
    echo: bool,
    options: TransportOptions,
}

impl Transport {
    fn new(
        remote: Option<Remote>,
        phys: Option<PhysLayer>,
        mode: FramingMode,
        role: Role,
        echo: bool,
        options: TransportOptions,
    ) -> Self {
        Self {
            remote,
            phys,
            mode,
            writer: FrameWriter::new(mode),
            reader: reader_for(mode, role, options.max_discards),
            tx_id: TxId::default(),
            echo,
            options,
        }
    }

    /// Master transport using MBAP framing over TCP
    pub fn tcp(addr: SocketAddr, options: TransportOptions) -> Self {
        Self::new(
            Some(Remote::Tcp(addr)),
            None,
            FramingMode::Tcp,
            Role::Master,
            false,
            options,
        )
    }

    /// Master transport using MBAP framing over UDP datagrams
    pub fn udp(addr: SocketAddr, options: TransportOptions) -> Self {
        Self::new(
            Some(Remote::Udp(addr)),
            None,
            FramingMode::Tcp,
            Role::Master,
            false,
            options,
        )
    }

    /// Master transport over a serial line, framing chosen by the settings
    pub fn serial(
        path: &str,
        settings: SerialSettings,
        options: TransportOptions,
    ) -> Result<Self, ConfigError> {
        if path.is_empty() {
            return Err(ConfigError::EmptyDevicePath);
        }
        settings.validate()?;
        Ok(Self::new(
            Some(Remote::Serial {
                path: path.to_string(),
                settings,
            }),
            None,
            serial_framing(settings.encoding),
            Role::Master,
            settings.echo,
            options,
        ))
    }

    /// Slave transport over an accepted TCP stream
    pub(crate) fn accepted_tcp(socket: tokio::net::TcpStream, options: TransportOptions) -> Self {
        Self::new(
            None,
            Some(PhysLayer::new_tcp(socket)),
            FramingMode::Tcp,
            Role::Slave,
            false,
            options,
        )
    }

    /// Slave transport over an opened serial port
    #[cfg(feature = "serial")]
    pub(crate) fn opened_serial(
        stream: tokio_serial::SerialStream,
        settings: &SerialSettings,
        options: TransportOptions,
    ) -> Self {
        Self::new(
            None,
            Some(PhysLayer::new_serial(stream)),
            serial_framing(settings.encoding),
            Role::Slave,
            settings.echo,
            options,
        )
    }

    #[cfg(test)]
    pub(crate) fn mock(
        io: tokio_test::io::Mock,
        mode: FramingMode,
        role: Role,
        echo: bool,
        options: TransportOptions,
    ) -> Self {
        Self::new(None, Some(PhysLayer::new_mock(io)), mode, role, echo, options)
    }

    pub(crate) fn remote(&self) -> Option<&Remote> {
        self.remote.as_ref()
    }

    /// True if the physical layer is currently open
    pub fn is_connected(&self) -> bool {
        self.phys.is_some()
    }

    /// Establish the physical layer if it is not already open. Transports
    /// without a remote address cannot reconnect.
    pub async fn connect(&mut self) -> Result<(), RequestError> {
        if self.phys.is_some() {
            return Ok(());
        }

        let remote = match &self.remote {
            Some(x) => x,
            None => return Err(RequestError::NoConnection),
        };

        let phys = match remote {
            Remote::Tcp(addr) => {
                let socket = tokio::net::TcpStream::connect(addr).await?;
                PhysLayer::new_tcp(socket)
            }
            Remote::Udp(addr) => {
                // ephemeral local port, one datagram per read/write
                let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
                socket.connect(addr).await?;
                PhysLayer::new_udp(socket)
            }
            Remote::Serial { path, settings } => {
                #[cfg(feature = "serial")]
                {
                    let stream = crate::serial::open(path, settings).map_err(|err| match err {
                        crate::error::EndpointError::Unavailable(kind) => RequestError::Io(kind),
                        crate::error::EndpointError::Config(_) => {
                            RequestError::Io(std::io::ErrorKind::InvalidInput)
                        }
                    })?;
                    PhysLayer::new_serial(stream)
                }
                #[cfg(not(feature = "serial"))]
                {
                    let _ = (path, settings);
                    return Err(RequestError::Io(std::io::ErrorKind::Unsupported));
                }
            }
        };

        tracing::info!("connected to {}", remote);
        self.phys = Some(phys);
        self.reader.reset();
        Ok(())
    }

    /// Drop the physical layer. Safe to call when already closed.
    pub fn close(&mut self) {
        if self.phys.take().is_some() {
            if let Some(remote) = &self.remote {
                tracing::info!("closed connection to {}", remote);
            }
        }
        self.reader.reset();
    }

    /// Encode and transmit a request, returning the header the response must
    /// match. Drains the local echo on half-duplex lines.
    pub async fn write_request(
        &mut self,
        unit: UnitId,
        pdu: &Pdu,
    ) -> Result<FrameHeader, RequestError> {
        let header = match self.mode {
            FramingMode::Tcp => FrameHeader::new_tcp_header(unit, self.tx_id.next()),
            _ => FrameHeader::new_serial_header(unit),
        };
        self.write_frame(header, pdu).await?;
        Ok(header)
    }

    /// Encode and transmit a response under the header of the request it
    /// answers
    pub async fn write_response(
        &mut self,
        header: FrameHeader,
        pdu: &Pdu,
    ) -> Result<(), RequestError> {
        self.write_frame(header, pdu).await
    }

    async fn write_frame(&mut self, header: FrameHeader, pdu: &Pdu) -> Result<(), RequestError> {
        let phys = match self.phys.as_mut() {
            Some(x) => x,
            None => return Err(RequestError::NoConnection),
        };
        let bytes = self.writer.format(header, pdu, self.options.decode)?;
        phys.write(bytes, self.options.decode.physical).await?;
        if self.echo {
            phys.read_exact(bytes.len(), self.options.decode.physical)
                .await?;
        }
        Ok(())
    }

    /// Wait for the next well-formed request. Used by slave sessions, which
    /// wait indefinitely.
    pub async fn read_request(&mut self) -> Result<(FrameHeader, Pdu), RequestError> {
        let phys = match self.phys.as_mut() {
            Some(x) => x,
            None => return Err(RequestError::NoConnection),
        };
        let frame = self.reader.next_frame(phys, self.options.decode).await?;
        let pdu = frame.pdu()?;
        Ok((frame.header, pdu))
    }

    /// Wait for the response correlated with `expected`, skipping frames
    /// addressed to other units or transactions, up to the response timeout
    pub async fn read_response(&mut self, expected: FrameHeader) -> Result<Pdu, RequestError> {
        let phys = match self.phys.as_mut() {
            Some(x) => x,
            None => return Err(RequestError::NoConnection),
        };
        let deadline = tokio::time::Instant::now() + self.options.response_timeout;

        loop {
            let frame = tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(RequestError::ResponseTimeout);
                }
                result = self.reader.next_frame(phys, self.options.decode) => result?,
            };

            if frame.header.unit_id != expected.unit_id {
                tracing::warn!(
                    "ignoring frame from unit {} while expecting unit {}",
                    frame.header.unit_id,
                    expected.unit_id
                );
                continue;
            }

            if let (Some(received), Some(sent)) = (frame.header.tx_id, expected.tx_id) {
                if received != sent {
                    tracing::warn!(
                        "ignoring frame with tx id {} while expecting {}",
                        received,
                        sent
                    );
                    continue;
                }
            }

            return Ok(frame.pdu()?);
        }
    }
}
