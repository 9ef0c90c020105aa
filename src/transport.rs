//! SIP Transport Layer
//!
//! Provides the `Transport` seam used by transactions plus UDP and TCP
//! implementations and a listener that turns socket input into events.

use crate::{codec::SipCodec, error::TransportError, SipMessage, SipUri};
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// Transport layer configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// UDP listen address
    pub udp_listen_addr: SocketAddr,

    /// TCP listen address
    pub tcp_listen_addr: SocketAddr,

    /// Host placed in Via sent-by; defaults to the bound IP
    pub advertised_host: Option<String>,

    /// TCP no-delay (disable Nagle's algorithm)
    pub tcp_nodelay: bool,

    /// Largest datagram or framed message accepted
    pub max_message_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            udp_listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5060),
            tcp_listen_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5060),
            advertised_host: None,
            tcp_nodelay: true,
            max_message_size: crate::MAX_HEADER_LENGTH + crate::MAX_BODY_LENGTH,
        }
    }
}

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl TransportProtocol {
    pub fn reliability(&self) -> Reliability {
        match self {
            TransportProtocol::Udp => Reliability::Unreliable,
            TransportProtocol::Tcp => Reliability::Reliable,
        }
    }
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Whether the transport retransmits on its own; selects timer arming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// What goes into the Via this agent inserts for a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ViaAddress {
    pub protocol: TransportProtocol,
    pub sent_by: String,
    /// Host name the destination was resolved from
    pub dns_name: String,
}

/// Byte sink toward one peer. `send` must not block: transactions call it
/// from inside their event loop.
pub trait Transport: Send + Sync {
    fn via(&self, destination: &SipUri) -> Result<ViaAddress, TransportError>;

    fn send(&self, bytes: &Bytes) -> Result<Reliability, TransportError>;
}

fn sent_by(advertised_host: Option<&str>, local: SocketAddr) -> String {
    match advertised_host {
        Some(host) => format!("{}:{}", host, local.port()),
        None => local.to_string(),
    }
}

/// Datagram queued for the socket's writer task.
pub type Datagram = (Bytes, SocketAddr);

/// Datagram transport sharing the listener's socket. Writes go through the
/// socket's writer task so `send` never waits on the socket.
pub struct UdpTransport {
    writer: mpsc::UnboundedSender<Datagram>,
    peer: SocketAddr,
    sent_by: String,
}

impl UdpTransport {
    pub fn new(writer: mpsc::UnboundedSender<Datagram>, peer: SocketAddr, sent_by: String) -> Self {
        Self {
            writer,
            peer,
            sent_by,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for UdpTransport {
    fn via(&self, destination: &SipUri) -> Result<ViaAddress, TransportError> {
        Ok(ViaAddress {
            protocol: TransportProtocol::Udp,
            sent_by: self.sent_by.clone(),
            dns_name: destination.host.clone(),
        })
    }

    fn send(&self, bytes: &Bytes) -> Result<Reliability, TransportError> {
        if bytes.len() > u16::MAX as usize {
            return Err(TransportError::TooLarge(bytes.len()));
        }
        self.writer
            .send((bytes.clone(), self.peer))
            .map_err(|_| TransportError::Closed)?;
        Ok(Reliability::Unreliable)
    }
}

/// Stream transport; writes are queued to the connection's writer task.
pub struct TcpTransport {
    writer: mpsc::UnboundedSender<Bytes>,
    peer: SocketAddr,
    sent_by: String,
}

impl TcpTransport {
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn via(&self, destination: &SipUri) -> Result<ViaAddress, TransportError> {
        Ok(ViaAddress {
            protocol: TransportProtocol::Tcp,
            sent_by: self.sent_by.clone(),
            dns_name: destination.host.clone(),
        })
    }

    fn send(&self, bytes: &Bytes) -> Result<Reliability, TransportError> {
        self.writer
            .send(bytes.clone())
            .map_err(|_| TransportError::Closed)?;
        Ok(Reliability::Reliable)
    }
}

/// SIP transport event
pub enum TransportEvent {
    /// Received a SIP message; `transport` answers back to `source`
    MessageReceived {
        message: SipMessage,
        source: SocketAddr,
        protocol: TransportProtocol,
        transport: Arc<dyn Transport>,
    },

    /// Connection established
    ConnectionEstablished {
        peer: SocketAddr,
        protocol: TransportProtocol,
    },

    /// Connection closed
    ConnectionClosed {
        peer: SocketAddr,
        protocol: TransportProtocol,
    },

    /// Transport error
    Error {
        error: String,
        peer: Option<SocketAddr>,
    },
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::MessageReceived {
                source, protocol, ..
            } => write!(f, "MessageReceived({} from {})", protocol, source),
            TransportEvent::ConnectionEstablished { peer, protocol } => {
                write!(f, "ConnectionEstablished({} {})", protocol, peer)
            }
            TransportEvent::ConnectionClosed { peer, protocol } => {
                write!(f, "ConnectionClosed({} {})", protocol, peer)
            }
            TransportEvent::Error { error, peer } => write!(f, "Error({:?}: {})", peer, error),
        }
    }
}

/// SIP transport layer: bound sockets plus the event channel they feed.
pub struct SipTransport {
    config: TransportConfig,
    udp_socket: Arc<UdpSocket>,
    udp_writer: mpsc::UnboundedSender<Datagram>,
    tcp_listener: Option<TcpListener>,
    udp_sent_by: String,
    tcp_sent_by: String,
    event_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl SipTransport {
    /// Bind the UDP socket and TCP listener.
    pub async fn bind(
        config: TransportConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>)> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let udp_socket = UdpSocket::bind(config.udp_listen_addr)
            .await
            .with_context(|| format!("Failed to bind UDP socket on {}", config.udp_listen_addr))?;
        let tcp_listener = TcpListener::bind(config.tcp_listen_addr)
            .await
            .with_context(|| format!("Failed to bind TCP listener on {}", config.tcp_listen_addr))?;

        let advertised = config.advertised_host.as_deref();
        let udp_sent_by = sent_by(advertised, udp_socket.local_addr()?);
        let tcp_sent_by = sent_by(advertised, tcp_listener.local_addr()?);
        info!("UDP listener bound on {}", udp_sent_by);
        info!("TCP listener bound on {}", tcp_sent_by);

        let udp_socket = Arc::new(udp_socket);
        let udp_writer = Self::spawn_udp_writer(udp_socket.clone());

        let transport = Self {
            config,
            udp_socket,
            udp_writer,
            tcp_listener: Some(tcp_listener),
            udp_sent_by,
            tcp_sent_by,
            event_tx,
        };

        Ok((transport, event_rx))
    }

    pub fn udp_local_addr(&self) -> Result<SocketAddr> {
        Ok(self.udp_socket.local_addr()?)
    }

    /// Spawn the receive loops.
    pub fn start(&mut self) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = vec![self.start_udp_listener()];
        if let Some(listener) = self.tcp_listener.take() {
            handles.push(self.start_tcp_listener(listener));
        }
        handles
    }

    /// Datagram transport toward `peer` over the listening socket.
    pub fn udp_to(&self, peer: SocketAddr) -> Arc<dyn Transport> {
        Arc::new(UdpTransport::new(
            self.udp_writer.clone(),
            peer,
            self.udp_sent_by.clone(),
        ))
    }

    /// Drain queued datagrams onto the socket; ends when every sender is gone.
    fn spawn_udp_writer(socket: Arc<UdpSocket>) -> mpsc::UnboundedSender<Datagram> {
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Datagram>();
        tokio::spawn(async move {
            while let Some((bytes, peer)) = writer_rx.recv().await {
                match socket.send_to(&bytes, peer).await {
                    Ok(len) => debug!("Sent {} bytes over UDP to {}", len, peer),
                    Err(e) => warn!("UDP send to {} failed: {}", peer, e),
                }
            }
        });
        writer_tx
    }

    /// Open a TCP connection; replies on it arrive on the event channel.
    pub async fn connect_tcp(&self, peer: SocketAddr) -> Result<Arc<dyn Transport>> {
        let stream = TcpStream::connect(peer)
            .await
            .with_context(|| format!("Failed to connect to {}", peer))?;
        if self.config.tcp_nodelay {
            stream.set_nodelay(true)?;
        }
        let local = stream.local_addr()?;
        let sent_by = sent_by(self.config.advertised_host.as_deref(), local);
        Ok(Self::spawn_connection(
            stream,
            peer,
            sent_by,
            self.config.max_message_size,
            self.event_tx.clone(),
        ))
    }

    /// Start UDP listener
    fn start_udp_listener(&self) -> tokio::task::JoinHandle<()> {
        let socket = self.udp_socket.clone();
        let writer = self.udp_writer.clone();
        let event_tx = self.event_tx.clone();
        let sent_by = self.udp_sent_by.clone();
        let max_message_size = self.config.max_message_size;

        tokio::spawn(async move {
            let mut buf = vec![0u8; max_message_size.min(65535)];

            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((len, peer_addr)) => {
                        let data = &buf[..len];

                        // Keep-alive pings carry no message
                        if data.iter().all(|b| b.is_ascii_whitespace()) {
                            continue;
                        }

                        match crate::parse_sip_message(data) {
                            Ok(message) => {
                                debug!("Received UDP message from {}", peer_addr);
                                let transport: Arc<dyn Transport> = Arc::new(UdpTransport::new(
                                    writer.clone(),
                                    peer_addr,
                                    sent_by.clone(),
                                ));
                                if event_tx
                                    .send(TransportEvent::MessageReceived {
                                        message,
                                        source: peer_addr,
                                        protocol: TransportProtocol::Udp,
                                        transport,
                                    })
                                    .is_err()
                                {
                                    break;
                                }
                            }
                            Err(e) => {
                                debug!("Discarding malformed UDP message from {}: {}", peer_addr, e);
                                let _ = event_tx.send(TransportEvent::Error {
                                    error: format!("Parse error: {}", e),
                                    peer: Some(peer_addr),
                                });
                            }
                        }
                    }
                    Err(e) => {
                        // ICMP port-unreachable surfaces here on some platforms
                        warn!("UDP receive error: {}", e);
                    }
                }
            }
        })
    }

    /// Start TCP listener
    fn start_tcp_listener(&self, listener: TcpListener) -> tokio::task::JoinHandle<()> {
        let event_tx = self.event_tx.clone();
        let tcp_nodelay = self.config.tcp_nodelay;
        let sent_by = self.tcp_sent_by.clone();
        let max_message_size = self.config.max_message_size;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer_addr)) => {
                        if tcp_nodelay {
                            let _ = stream.set_nodelay(true);
                        }
                        debug!("TCP connection from {}", peer_addr);
                        Self::spawn_connection(
                            stream,
                            peer_addr,
                            sent_by.clone(),
                            max_message_size,
                            event_tx.clone(),
                        );
                    }
                    Err(e) => {
                        error!("TCP accept error: {}", e);
                    }
                }
            }
        })
    }

    /// Split a stream into a writer task and a reader task feeding events.
    fn spawn_connection(
        stream: TcpStream,
        peer_addr: SocketAddr,
        sent_by: String,
        max_message_size: usize,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> Arc<dyn Transport> {
        let (read_half, write_half) = stream.into_split();
        let (writer_tx, mut writer_rx) = mpsc::unbounded_channel::<Bytes>();

        let transport: Arc<dyn Transport> = Arc::new(TcpTransport {
            writer: writer_tx,
            peer: peer_addr,
            sent_by,
        });

        tokio::spawn(async move {
            let mut sink = FramedWrite::new(write_half, SipCodec::with_max_message_size(max_message_size));
            while let Some(bytes) = writer_rx.recv().await {
                if let Err(e) = sink.send(bytes).await {
                    warn!("TCP write to {} failed: {}", peer_addr, e);
                    break;
                }
            }
        });

        let _ = event_tx.send(TransportEvent::ConnectionEstablished {
            peer: peer_addr,
            protocol: TransportProtocol::Tcp,
        });

        let reply_transport = transport.clone();
        tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, SipCodec::with_max_message_size(max_message_size));
            while let Some(result) = frames.next().await {
                match result {
                    Ok(message) => {
                        debug!("Received TCP message from {}", peer_addr);
                        let _ = event_tx.send(TransportEvent::MessageReceived {
                            message,
                            source: peer_addr,
                            protocol: TransportProtocol::Tcp,
                            transport: reply_transport.clone(),
                        });
                    }
                    Err(e) => {
                        warn!("Connection error with {}: {}", peer_addr, e);
                        let _ = event_tx.send(TransportEvent::Error {
                            error: e.to_string(),
                            peer: Some(peer_addr),
                        });
                        break;
                    }
                }
            }

            let _ = event_tx.send(TransportEvent::ConnectionClosed {
                peer: peer_addr,
                protocol: TransportProtocol::Tcp,
            });
        });

        transport
    }
}
