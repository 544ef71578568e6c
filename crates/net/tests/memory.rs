use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use ar_net::{
    MemoryNetwork, MessageStatus, Origin, SendStatus, Session, SessionConfig, StaticHostInfo,
};
use ntest::timeout;

use crate::common::{wait_for_reliable, wait_for_send, EchoServer};

mod common;

const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PORT: u16 = 26000;

fn server(network: &MemoryNetwork, max_clients: u8) -> Session {
    Session::builder(SessionConfig {
        max_clients,
        dedicated: true,
        listen: true,
        ..SessionConfig::default()
    })
    .host_info(StaticHostInfo::new("arena", "start"))
    .land(network.land(SERVER_IP, PORT))
    .build()
}

fn client(network: &MemoryNetwork, ip: Ipv4Addr) -> Session {
    Session::builder(SessionConfig::default())
        .without_loopback()
        .land(network.land(ip, PORT))
        .build()
}

#[test]
#[timeout(10000)]
fn test_echo() {
    let network = MemoryNetwork::new();
    let server = EchoServer::spawn(server(&network, 4));

    let mut client = client(&network, CLIENT_IP);
    let id = client.connect(Some("10.0.0.2")).unwrap();
    assert_eq!(client.origin(id), Some(Origin::Initiated));
    assert!(client.address(id).unwrap().starts_with("10.0.0.2:"));

    let large: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
    let messages = [vec![1, 2, 3], large, vec![], vec![42; 500]];
    for message in messages.iter() {
        wait_for_send(&mut client, id);
        assert_eq!(client.send_message(id, message), SendStatus::Sent);
        assert_eq!(&wait_for_reliable(&mut client, id), message);
    }

    // 1 + 10 + 1 + 1 fragments.
    assert_eq!(client.stats().packets_sent, 13);
    assert_eq!(client.stats().messages_sent, 4);
    assert_eq!(client.stats().messages_received, 4);

    client.close(id);
    let report = server.stop();
    assert_eq!(report.accepted, 1);
    assert_eq!(report.received, messages.to_vec());
}

#[test]
#[timeout(10000)]
fn test_retransmission() {
    let network = MemoryNetwork::new();
    let server = EchoServer::spawn(server(&network, 4));

    let mut client = client(&network, CLIENT_IP);
    let id = client.connect(Some("10.0.0.2")).unwrap();

    // Drop the first data datagram and the first acknowledgment.
    let dropped_data = Arc::new(AtomicUsize::new(0));
    let dropped_acks = Arc::new(AtomicUsize::new(0));
    {
        let dropped_data = Arc::clone(&dropped_data);
        let dropped_acks = Arc::clone(&dropped_acks);
        network.set_filter(move |source: SocketAddr, _, data: &[u8]| {
            if data.len() < 2 || data[0] & 0x80 != 0 {
                return true;
            }
            let counter = if data[1] & 0x01 != 0 && source.ip() == CLIENT_IP {
                &dropped_data
            } else if data[1] & 0x02 != 0 && source.ip() == SERVER_IP {
                &dropped_acks
            } else {
                return true;
            };
            counter
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        });
    }

    assert_eq!(client.send_message(id, &[7; 10]), SendStatus::Sent);
    assert_eq!(wait_for_reliable(&mut client, id), vec![7; 10]);
    assert_eq!(dropped_data.load(Ordering::Acquire), 1);
    assert_eq!(dropped_acks.load(Ordering::Acquire), 1);
    assert_eq!(client.stats().packets_resent, 1);

    // The lost acknowledgment makes the client re-send the fragment again.
    wait_for_send(&mut client, id);
    assert_eq!(client.stats().packets_resent, 2);

    client.close(id);
    let report = server.stop();
    assert_eq!(report.received, vec![vec![7; 10]]);
    assert_eq!(report.stats.received_duplicate_count, 1);
}

#[test]
#[timeout(60000)]
fn test_random_loss() {
    let network = MemoryNetwork::new();
    let server = EchoServer::spawn(server(&network, 4));

    let mut client = client(&network, CLIENT_IP);
    let id = client.connect(Some("10.0.0.2")).unwrap();
    network.set_loss(0.15, 7);

    // Single and multi fragment messages.
    let lengths = [1, 1234, 17, 500, 501, 1000, 2, 800, 64, 1234];
    let messages: Vec<Vec<u8>> = lengths
        .iter()
        .enumerate()
        .map(|(i, &len)| (0..len).map(|j| (i * 7 + j) as u8).collect())
        .collect();

    for message in messages.iter() {
        wait_for_send(&mut client, id);
        assert_eq!(client.send_message(id, message), SendStatus::Sent);
        assert_eq!(&wait_for_reliable(&mut client, id), message);
    }
    assert_eq!(client.stats().messages_received, messages.len() as u64);

    client.close(id);
    network.reset_faults();
    let report = server.stop();
    assert_eq!(report.received, messages);
    assert!(client.stats().packets_resent + report.stats.packets_resent > 0);
}

#[test]
#[timeout(10000)]
fn test_unreliable() {
    let network = MemoryNetwork::new();
    let mut server = server(&network, 4);
    let mut client = client(&network, CLIENT_IP);

    let handle = std::thread::spawn(move || {
        let id = client.connect(Some("10.0.0.2")).unwrap();
        (client, id)
    });
    let server_id = loop {
        if let Some(id) = server.check_new_connections() {
            break id;
        }
        std::thread::sleep(Duration::from_millis(1));
    };
    let (mut client, id) = handle.join().unwrap();

    for i in 0..3u8 {
        assert_eq!(client.send_unreliable_message(id, &[i]), SendStatus::Sent);
    }
    for i in 0..3u8 {
        assert_eq!(server.get_message(server_id), MessageStatus::Unreliable);
        assert_eq!(server.message(), &[i]);
    }
    assert_eq!(server.get_message(server_id), MessageStatus::NoData);
    assert_eq!(server.stats().unreliable_messages_received, 3);
    assert_eq!(client.stats().unreliable_messages_sent, 3);
}

#[test]
#[timeout(20000)]
fn test_server_full() {
    let network = MemoryNetwork::new();
    let server = EchoServer::spawn(server(&network, 1));

    let mut first = client(&network, CLIENT_IP);
    let first_id = first.connect(Some("10.0.0.2")).unwrap();

    let mut second = client(&network, Ipv4Addr::new(10, 0, 0, 3));
    assert!(second.connect(Some("10.0.0.2")).is_none());
    assert_eq!(second.active_connections(), 0);

    first.close(first_id);
    drop(first);
    let report = server.stop();
    assert_eq!(report.accepted, 1);
}

#[test]
#[timeout(10000)]
fn test_discovery() {
    let network = MemoryNetwork::new();
    let server = EchoServer::spawn(server(&network, 4));

    let mut client = client(&network, CLIENT_IP);
    client.start_discovery(true);
    while client.is_discovering() {
        client.poll();
        std::thread::sleep(Duration::from_millis(5));
    }

    let entries = client.hostcache().entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "arena");
    assert_eq!(entries[0].map, "start");
    assert_eq!(entries[0].cname, "10.0.0.2:26000");
    assert_eq!(entries[0].max_users, 4);

    // Known hosts are connected by name without another discovery.
    let id = client.connect(Some("ARENA")).unwrap();
    assert!(client.address(id).unwrap().starts_with("10.0.0.2:"));
    assert!(!client.is_discovering());

    client.close(id);
    server.stop();
}
