//! Unified packet transport.
//!
//! One [`Transport`] instance carries all signaling of an agent. The
//! variants share a small contract: `send` never blocks, `tick` reads
//! whatever is available within a bounded timeout, and received datagrams
//! are popped as [`TransportEvent`]s.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

mod mqtt;
mod parse;
mod tcp;
mod udp;

pub use mqtt::{BrokerClient, BrokerMessage, LoopbackBroker, MqttTransport};
pub use parse::{CompleteItem, parse_complete};
pub use tcp::TcpTransport;
pub use udp::UdpTransport;

pub(crate) const MAX_MSG_SIZE: usize = u16::MAX as usize;

/// Events produced by a transport's tick
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete datagram / framed message
    Data {
        bytes: Vec<u8>,
        source: SocketAddr,
    },
    /// Streaming transport connect finished (`ok = true`) or the peer
    /// closed the connection (`ok = false`)
    Connected { ok: bool },
    /// The transport hit a permanent error and will not recover
    Error { error: String },
}

/// Tagged union over the supported transport variants
pub enum Transport {
    Udp(UdpTransport),
    Tcp(TcpTransport),
    Mqtt(MqttTransport),
}

impl Transport {
    /// Transport name as used in Via headers
    pub fn name(&self) -> &'static str {
        match self {
            Transport::Udp(_) => "UDP",
            Transport::Tcp(_) => "TCP",
            // broker delivery is message oriented, SIP-wise it behaves
            // like an unreliable datagram transport
            Transport::Mqtt(_) => "UDP",
        }
    }

    /// True if the transport retransmits on its own (no SIP timer E/A
    /// retransmissions needed)
    pub fn reliable(&self) -> bool {
        matches!(self, Transport::Tcp(_))
    }

    /// Local address for Via / Contact / SDP
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Transport::Udp(udp) => udp.local_addr(),
            Transport::Tcp(tcp) => tcp.local_addr(),
            Transport::Mqtt(mqtt) => mqtt.local_addr(),
        }
    }

    /// Send a datagram. Never blocks; `WouldBlock` is returned as an error
    /// and the caller retries on the next tick.
    pub fn send(&mut self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        match self {
            Transport::Udp(udp) => udp.send(bytes, target),
            Transport::Tcp(tcp) => tcp.send(bytes),
            Transport::Mqtt(mqtt) => mqtt.send(bytes),
        }
    }

    /// Read available input, waiting at most `timeout`. Returns the number
    /// of events processed.
    pub fn tick(&mut self, timeout: Duration) -> io::Result<usize> {
        match self {
            Transport::Udp(udp) => udp.tick(timeout),
            Transport::Tcp(tcp) => tcp.tick(timeout),
            Transport::Mqtt(mqtt) => mqtt.tick(timeout),
        }
    }

    pub fn pop_event(&mut self) -> Option<TransportEvent> {
        match self {
            Transport::Udp(udp) => udp.pop_event(),
            Transport::Tcp(tcp) => tcp.pop_event(),
            Transport::Mqtt(mqtt) => mqtt.pop_event(),
        }
    }
}

pub(crate) type EventQueue = VecDeque<TransportEvent>;
