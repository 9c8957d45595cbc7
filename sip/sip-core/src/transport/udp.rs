use super::{EventQueue, MAX_MSG_SIZE, TransportEvent};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

/// Datagram transport over a single UDP socket
pub struct UdpTransport {
    socket: UdpSocket,
    bound: SocketAddr,
    buffer: Vec<u8>,
    events: EventQueue,
}

impl UdpTransport {
    pub fn bind<A>(addr: A) -> io::Result<Self>
    where
        A: ToSocketAddrs,
    {
        let socket = UdpSocket::bind(addr)?;
        let bound = socket.local_addr()?;

        log::info!("bound UDP to {bound}");

        Ok(Self {
            socket,
            bound,
            buffer: vec![0u8; MAX_MSG_SIZE],
            events: EventQueue::new(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.bound
    }

    pub fn send(&mut self, bytes: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.set_nonblocking(true)?;
        self.socket.send_to(bytes, target)
    }

    pub fn tick(&mut self, timeout: Duration) -> io::Result<usize> {
        // block with a timeout for the first datagram, then drain
        self.socket.set_nonblocking(false)?;
        self.socket
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;

        let mut processed = 0;

        loop {
            match self.socket.recv_from(&mut self.buffer) {
                Ok((len, source)) => {
                    self.events.push_back(TransportEvent::Data {
                        bytes: self.buffer[..len].to_vec(),
                        source,
                    });

                    processed += 1;
                    self.socket.set_nonblocking(true)?;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Ok(processed);
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn pop_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn roundtrip_over_loopback() {
        let mut a = UdpTransport::bind("127.0.0.1:0").unwrap();
        let mut b = UdpTransport::bind("127.0.0.1:0").unwrap();

        a.send(b"hello", b.local_addr()).unwrap();

        let processed = b.tick(Duration::from_millis(500)).unwrap();
        assert_eq!(processed, 1);

        let Some(TransportEvent::Data { bytes, source }) = b.pop_event() else {
            panic!("expected data event");
        };

        assert_eq!(bytes, b"hello");
        assert_eq!(source, a.local_addr());
    }

    #[test]
    fn tick_times_out_quietly() {
        let mut transport = UdpTransport::bind("127.0.0.1:0").unwrap();

        let processed = transport.tick(Duration::from_millis(5)).unwrap();

        assert_eq!(processed, 0);
        assert!(transport.pop_event().is_none());
    }
}
