use super::{EventQueue, TransportEvent};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

/// A message delivered by the broker client
#[derive(Debug)]
pub struct BrokerMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Narrow seam to an MQTT client implementation.
///
/// The core never links an MQTT library; hosts plug in whatever client
/// their platform provides (rumqttc, a vendor SDK, a test stub).
pub trait BrokerClient: Send {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> io::Result<()>;

    /// Deliver the next complete message, waiting at most `timeout`
    fn poll(&mut self, timeout: Duration) -> io::Result<Option<BrokerMessage>>;

    fn is_connected(&self) -> bool;
}

/// Pub/sub transport attachment.
///
/// All outbound signaling is published to `<prefix>/send` and everything
/// received on `<prefix>/recv` is delivered upwards. SIP-level destination
/// addresses are not meaningful here; the configured broker identity is
/// reported as the peer address for diagnostics.
pub struct MqttTransport {
    client: Box<dyn BrokerClient>,
    send_topic: String,
    recv_topic: String,
    /// Stand-in address reported as message source
    broker_identity: SocketAddr,
    was_connected: bool,
    events: EventQueue,
}

impl MqttTransport {
    pub fn new(
        client: Box<dyn BrokerClient>,
        topic_prefix: &str,
        broker_identity: SocketAddr,
    ) -> Self {
        Self {
            client,
            send_topic: format!("{topic_prefix}/send"),
            recv_topic: format!("{topic_prefix}/recv"),
            broker_identity,
            was_connected: false,
            events: EventQueue::new(),
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        // the broker pattern has no own socket address; advertise the
        // broker identity so Via/Contact stay resolvable for diagnostics
        self.broker_identity
    }

    pub fn send(&mut self, bytes: &[u8]) -> io::Result<usize> {
        self.client.publish(&self.send_topic, bytes)?;
        Ok(bytes.len())
    }

    pub fn tick(&mut self, timeout: Duration) -> io::Result<usize> {
        let connected = self.client.is_connected();

        if connected != self.was_connected {
            self.was_connected = connected;
            self.events
                .push_back(TransportEvent::Connected { ok: connected });
        }

        let mut processed = 0;

        // deliver everything the broker client buffered, waiting only for
        // the first message
        let mut wait = timeout;

        while let Some(message) = self.client.poll(wait)? {
            wait = Duration::ZERO;

            if message.topic != self.recv_topic {
                log::debug!("ignoring broker message on unrelated topic {}", message.topic);
                continue;
            }

            self.events.push_back(TransportEvent::Data {
                bytes: message.payload,
                source: self.broker_identity,
            });

            processed += 1;
        }

        Ok(processed)
    }

    pub fn pop_event(&mut self) -> Option<TransportEvent> {
        self.events.pop_front()
    }
}

/// Loopback broker used by tests: everything published to `<x>/send`
/// reappears on `<x>/recv`.
pub struct LoopbackBroker {
    queue: std::collections::VecDeque<BrokerMessage>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self {
            queue: std::collections::VecDeque::new(),
        }
    }
}

impl Default for LoopbackBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for LoopbackBroker {
    fn publish(&mut self, topic: &str, payload: &[u8]) -> io::Result<()> {
        let recv_topic = topic.replace("/send", "/recv");

        self.queue.push_back(BrokerMessage {
            topic: recv_topic,
            payload: payload.to_vec(),
        });

        Ok(())
    }

    fn poll(&mut self, _timeout: Duration) -> io::Result<Option<BrokerMessage>> {
        Ok(self.queue.pop_front())
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[allow(dead_code)]
pub(crate) fn test_broker_identity() -> SocketAddr {
    SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1883)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn publishes_to_send_topic_and_receives_from_recv_topic() {
        let mut transport = MqttTransport::new(
            Box::new(LoopbackBroker::new()),
            "lark/ua1",
            test_broker_identity(),
        );

        transport.send(b"REGISTER sip:example.com SIP/2.0\r\n\r\n").unwrap();

        let processed = transport.tick(Duration::from_millis(10)).unwrap();
        assert_eq!(processed, 1);

        // first event is the connection report
        assert!(matches!(
            transport.pop_event(),
            Some(TransportEvent::Connected { ok: true })
        ));

        let Some(TransportEvent::Data { bytes, source }) = transport.pop_event() else {
            panic!("expected data event");
        };

        assert!(bytes.starts_with(b"REGISTER"));
        assert_eq!(source, test_broker_identity());
    }
}
