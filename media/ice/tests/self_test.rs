use lark_ice::{IceAgent, IceConnectionState, IceCredentials, IceEvent, ReceivedPkt};
use std::cmp::min;
use std::mem::take;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

struct Packet {
    data: Vec<u8>,
    source: SocketAddr,
    destination: SocketAddr,
}

fn create_pair() -> (IceAgent, IceAgent) {
    let a = IceCredentials::random();
    let b = IceCredentials::random();

    let mut a_agent = IceAgent::new(a.clone(), true, false);
    let mut b_agent = IceAgent::new(b.clone(), false, false);

    a_agent.set_remote_data(b, &[]);
    b_agent.set_remote_data(a, &[]);

    (a_agent, b_agent)
}

fn run_to_connected(a: &mut IceAgent, b: &mut IceAgent, a_port: u16, b_port: u16) {
    let mut now = Instant::now();

    for _ in 0..10_000 {
        if a.connection_state() == IceConnectionState::Connected
            && b.connection_state() == IceConnectionState::Connected
        {
            return;
        }

        a.poll(now);
        b.poll(now);

        let mut to_a = Vec::new();
        let mut to_b = Vec::new();

        while {
            drain_agent(a, a_port, &mut to_b, &mut to_a);
            drain_agent(b, b_port, &mut to_a, &mut to_b);

            !to_a.is_empty() || !to_b.is_empty()
        } {}

        now += opt_min(a.timeout(now), b.timeout(now)).unwrap_or(Duration::from_millis(50));
    }

    panic!(
        "agents never connected (a={:?}, b={:?})",
        a.connection_state(),
        b.connection_state()
    );
}

fn drain_agent(
    agent: &mut IceAgent,
    agent_port: u16,
    to_peer: &mut Vec<Packet>,
    from_peer: &mut Vec<Packet>,
) {
    for packet in take(from_peer) {
        agent.receive(ReceivedPkt {
            data: packet.data,
            source: packet.source,
            destination: packet.destination,
        });
    }

    while let Some(event) = agent.pop_event() {
        if let IceEvent::SendData { data, target } = event {
            to_peer.push(Packet {
                data,
                source: SocketAddr::new(target.ip(), agent_port),
                destination: target,
            });
        }
    }
}

fn opt_min<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (None, None) => None,
        (None, Some(b)) => Some(b),
        (Some(a), None) => Some(a),
        (Some(a), Some(b)) => Some(min(a, b)),
    }
}

// Verify that the ice agent at least works with itself
#[test]
fn same_network() {
    let _ = env_logger::builder().is_test(true).try_init();

    let (mut a, mut b) = create_pair();

    a.add_host_addr("127.0.0.1:5555".parse().unwrap());
    b.add_host_addr("127.0.0.1:4444".parse().unwrap());

    for c in a.ice_candidates() {
        b.add_remote_candidate(&c);
    }

    for c in b.ice_candidates() {
        a.add_remote_candidate(&c);
    }

    run_to_connected(&mut a, &mut b, 5555, 4444);

    // the nominated pair must point at the peer
    assert_eq!(a.discovered_addr().unwrap().port(), 4444);
    assert_eq!(b.discovered_addr().unwrap().port(), 5555);
}

#[test]
fn controlling_against_lite_peer() {
    let _ = env_logger::builder().is_test(true).try_init();

    let a_creds = IceCredentials::random();
    let b_creds = IceCredentials::random();

    let mut a = IceAgent::new(a_creds.clone(), true, false);
    let mut b = IceAgent::new(b_creds.clone(), false, true);

    a.set_remote_data(b_creds, &[]);
    b.set_remote_data(a_creds, &[]);

    a.add_host_addr("127.0.0.1:5555".parse().unwrap());
    b.add_host_addr("127.0.0.1:4444".parse().unwrap());

    for c in a.ice_candidates() {
        b.add_remote_candidate(&c);
    }

    for c in b.ice_candidates() {
        a.add_remote_candidate(&c);
    }

    run_to_connected(&mut a, &mut b, 5555, 4444);
}

#[test]
fn gathering_completes_without_stun_server() {
    let creds = IceCredentials::random();
    let mut agent = IceAgent::new(creds, true, false);

    agent.add_host_addr("127.0.0.1:5555".parse().unwrap());
    agent.poll(Instant::now());

    assert_eq!(
        agent.gathering_state(),
        lark_ice::IceGatheringState::Complete
    );
}

#[test]
fn credentials_use_ice_charset() {
    let creds = IceCredentials::random();

    assert!((4..=8).contains(&creds.ufrag.len()));
    assert!((22..=24).contains(&creds.pwd.len()));

    let is_ice_char =
        |c: char| c.is_ascii_alphanumeric() || c == '+' || c == '/';

    assert!(creds.ufrag.chars().all(is_ice_char));
    assert!(creds.pwd.chars().all(is_ice_char));
}
