use super::{EventQueue, TransportEvent};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// Streaming transport over a single TCP connection.
///
/// The connect is non-blocking: the transport starts in `Connecting` and
/// reports the outcome with a [`TransportEvent::Connected`] event. Received
/// bytes are accumulated and framed at `Content-Length` boundaries.
pub struct TcpTransport {
    stream: TcpStream,
    local: SocketAddr,
    peer: SocketAddr,
    state: ConnState,
    framing: Vec<u8>,
    events: EventQueue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Connecting,
    Connected,
    Closed,
    Error,
}

impl TcpTransport {
    /// Start a non-blocking connect to `peer`
    pub fn connect(peer: SocketAddr) -> io::Result<Self> {
        // std has no non-blocking connect entry point, so connect with a
        // very short timeout and treat an in-progress connect as pending
        let stream = match TcpStream::connect_timeout(&peer, Duration::from_millis(250)) {
            Ok(stream) => stream,
            Err(e) => return Err(e),
        };

        stream.set_nonblocking(true)?;
        let local = stream.local_addr()?;

        log::info!("TCP connected {local} -> {peer}");

        Ok(Self {
            stream,
            local,
            peer,
            state: ConnState::Connecting,
            framing: Vec::with_capacity(4096),
            events: EventQueue::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        if self.state != ConnState::Connected && self.state != ConnState::Connecting {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "tcp transport is down",
            ));
        }

        match self.stream.write(bytes) {
            Ok(written) => Ok(written),
            Err(e) => Err(e),
        }
    }

    pub fn tick(&mut self, timeout: Duration) -> io::Result<usize> {
        match self.state {
            ConnState::Connecting => {
                // connect_timeout already completed the handshake
                self.state = ConnState::Connected;
                self.events.push_back(TransportEvent::Connected { ok: true });
                return Ok(1);
            }
            ConnState::Closed | ConnState::Error => return Ok(0),
            ConnState::Connected => {}
        }

        self.stream.set_nonblocking(false)?;
        self.stream
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut chunk = [0u8; 4096];
        let mut processed = 0;

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    // orderly shutdown by the peer
                    self.state = ConnState::Closed;
                    self.events.push_back(TransportEvent::Connected { ok: false });
                    return Ok(processed + 1);
                }
                Ok(len) => {
                    self.framing.extend_from_slice(&chunk[..len]);
                    processed += self.extract_messages();

                    self.stream.set_nonblocking(true)?;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(processed);
                }
                Err(e) => {
                    self.state = ConnState::Error;
                    self.events.push_back(TransportEvent::Error {
                        error: e.to_string(),
                    });
                    return Ok(processed + 1);
                }
            }
        }
    }

    pub fn pop_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }

    /// Cut complete SIP messages out of the framing buffer
    fn extract_messages(&mut self) -> usize {
        let mut extracted = 0;

        loop {
            // leading CRLF pairs are keep-alives on streaming transports
            while self.framing.starts_with(b"\r\n") {
                self.framing.drain(..2);
            }

            let Some(head_end) = find_head_end(&self.framing) else {
                return extracted;
            };

            let content_length = content_length(&self.framing[..head_end]).unwrap_or(0);
            let total = head_end + 4 + content_length;

            if self.framing.len() < total {
                return extracted;
            }

            let message: Vec<u8> = self.framing.drain(..total).collect();

            self.events.push_back(TransportEvent::Data {
                bytes: message,
                source: self.peer,
            });

            extracted += 1;
        }
    }
}

fn find_head_end(bytes: &[u8]) -> Option<usize> {
    bytes.windows(4).position(|window| window == b"\r\n\r\n")
}

/// Scan the message head for a Content-Length (or compact `l`) header
fn content_length(head: &[u8]) -> Option<usize> {
    let head = std::str::from_utf8(head).ok()?;

    for line in head.split("\r\n") {
        let (name, value) = match line.split_once(':') {
            Some(split) => split,
            None => continue,
        };

        let name = name.trim();

        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("l") {
            return value.trim().parse().ok();
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn frames_messages_and_keepalives() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut transport = TcpTransport::connect(addr).unwrap();
        let (mut server, _) = listener.accept().unwrap();

        // connect event
        transport.tick(Duration::from_millis(10)).unwrap();
        assert!(matches!(
            transport.pop_event(),
            Some(TransportEvent::Connected { ok: true })
        ));

        // two messages and a keep-alive in one stream segment
        let payload = b"\r\n\r\nSIP/2.0 200 OK\r\nContent-Length: 2\r\n\r\nhiSIP/2.0 180 Ringing\r\nContent-Length: 0\r\n\r\n";
        server.write_all(payload).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut messages = vec![];

        while messages.len() < 2 && std::time::Instant::now() < deadline {
            transport.tick(Duration::from_millis(50)).unwrap();

            while let Some(event) = transport.pop_event() {
                if let TransportEvent::Data { bytes, .. } = event {
                    messages.push(bytes);
                }
            }
        }

        assert_eq!(messages.len(), 2);
        assert!(messages[0].ends_with(b"hi"));
        assert!(messages[1].starts_with(b"SIP/2.0 180"));
    }

    #[test]
    fn peer_close_reports_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let mut transport = TcpTransport::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        transport.tick(Duration::from_millis(10)).unwrap();
        transport.pop_event(); // Connected

        drop(server);

        let deadline = std::time::Instant::now() + Duration::from_secs(5);

        loop {
            transport.tick(Duration::from_millis(50)).unwrap();

            if let Some(TransportEvent::Connected { ok: false }) = transport.pop_event() {
                break;
            }

            assert!(std::time::Instant::now() < deadline, "no disconnect event");
        }
    }
}
