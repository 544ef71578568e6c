use std::{
    net::Ipv4Addr,
    thread,
    time::{Duration, Instant},
};

use ar_net::{
    ConnId, ManualClock, MemoryNetwork, MessageStatus, Origin, SendStatus, Session, SessionConfig,
    StaticHostInfo,
};
use ntest::timeout;

use crate::common::wait_for_reliable;

mod common;

const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const PORT: u16 = 26000;

fn client(network: &MemoryNetwork, ip: Ipv4Addr) -> Session {
    Session::builder(SessionConfig::default())
        .without_loopback()
        .land(network.land(ip, PORT))
        .build()
}

/// Connects a client running in a background thread, the server is driven
/// from the current thread until the connection is accepted. The client
/// runs `then` once connected.
fn connect_remote<T, F>(
    server: &mut Session,
    network: &MemoryNetwork,
    ip: Ipv4Addr,
    then: F,
) -> (thread::JoinHandle<T>, ConnId)
where
    T: Send + 'static,
    F: FnOnce(&mut Session, ConnId) -> T + Send + 'static,
{
    let mut client = client(network, ip);
    let handle = thread::spawn(move || {
        let id = client.connect(Some("10.0.0.2")).unwrap();
        then(&mut client, id)
    });

    let id = loop {
        if let Some(id) = server.check_new_connections() {
            break id;
        }
        thread::sleep(Duration::from_millis(1));
    };
    (handle, id)
}

#[test]
#[timeout(10000)]
fn test_loopback() {
    let mut session = Session::builder(SessionConfig::default())
        .host_info(StaticHostInfo::new("arena", "start"))
        .build();

    let client = session.connect(Some("LOCAL")).unwrap();
    let server = session.check_new_connections().unwrap();
    assert!(session.check_new_connections().is_none());
    assert_eq!(session.origin(client), Some(Origin::Initiated));
    assert_eq!(session.origin(server), Some(Origin::Accepted));
    assert_eq!(session.active_connections(), 2);

    assert_eq!(session.send_message(server, &[1; 8192]), SendStatus::Sent);
    assert_eq!(session.send_unreliable_message(server, &[2]), SendStatus::Sent);
    assert_eq!(session.get_message(client), MessageStatus::Reliable);
    assert_eq!(session.message().len(), 8192);
    assert_eq!(session.get_message(client), MessageStatus::Unreliable);
    assert_eq!(session.get_message(client), MessageStatus::NoData);

    session.close(client);
    assert_eq!(session.get_message(server), MessageStatus::Dead);
    assert_eq!(session.active_connections(), 0);
    assert_eq!(session.send_message(client, &[1]), SendStatus::Dead);
}

#[test]
#[timeout(10000)]
fn test_dedicated_has_no_loopback() {
    let mut session = Session::builder(SessionConfig {
        dedicated: true,
        ..SessionConfig::default()
    })
    .host_info(StaticHostInfo::new("arena", "start"))
    .build();

    assert!(session.connect(Some("local")).is_none());
    assert_eq!(session.active_connections(), 0);
}

#[test]
#[timeout(10000)]
fn test_timeout() {
    let network = MemoryNetwork::new();
    let clock = ManualClock::new();
    let mut server = Session::builder(SessionConfig {
        dedicated: true,
        listen: true,
        message_timeout: Duration::from_secs(5),
        ..SessionConfig::default()
    })
    .clock(clock.clone())
    .host_info(StaticHostInfo::new("arena", "start"))
    .land(network.land(SERVER_IP, PORT))
    .build();

    let (handle, id) =
        connect_remote(&mut server, &network, Ipv4Addr::new(10, 0, 0, 1), |_, _| ());
    handle.join().unwrap();

    clock.advance(Duration::from_secs(5));
    assert_eq!(server.get_message(id), MessageStatus::NoData);
    clock.advance(Duration::from_millis(1));
    assert_eq!(server.get_message(id), MessageStatus::Dead);
    assert_eq!(server.active_connections(), 0);
    assert_eq!(server.send_message(id, &[1]), SendStatus::Dead);
}

#[test]
#[timeout(20000)]
fn test_send_to_all() {
    let network = MemoryNetwork::new();
    let mut server = Session::builder(SessionConfig {
        listen: true,
        ..SessionConfig::default()
    })
    .host_info(StaticHostInfo::new("arena", "start"))
    .land(network.land(SERVER_IP, PORT))
    .build();

    let local_client = server.connect(Some("local")).unwrap();
    let local_server = server.check_new_connections().unwrap();
    assert_eq!(server.origin(local_server), Some(Origin::Accepted));

    let (first, _) = connect_remote(
        &mut server,
        &network,
        Ipv4Addr::new(10, 0, 0, 1),
        wait_for_reliable,
    );
    let (second, _) = connect_remote(
        &mut server,
        &network,
        Ipv4Addr::new(10, 0, 0, 3),
        wait_for_reliable,
    );
    assert_eq!(server.active_connections(), 4);

    let message = b"changelevel e1m2".to_vec();
    assert_eq!(server.send_to_all(&message, Duration::from_secs(10)), 0);

    assert_eq!(first.join().unwrap(), message);
    assert_eq!(second.join().unwrap(), message);
    assert_eq!(server.get_message(local_client), MessageStatus::Reliable);
    assert_eq!(server.message(), message.as_slice());
}

#[test]
#[timeout(20000)]
fn test_send_to_all_time_limit() {
    let network = MemoryNetwork::new();
    let mut server = Session::builder(SessionConfig {
        dedicated: true,
        listen: true,
        ..SessionConfig::default()
    })
    .host_info(StaticHostInfo::new("arena", "start"))
    .land(network.land(SERVER_IP, PORT))
    .build();

    // The client disappears right after connecting.
    let (handle, id) =
        connect_remote(&mut server, &network, Ipv4Addr::new(10, 0, 0, 1), |_, _| ());
    handle.join().unwrap();

    assert_eq!(server.send_to_all(&[1], Duration::from_millis(100)), 1);
    assert!(!server.can_send_message(id));
}

#[test]
#[timeout(20000)]
fn test_send_to_all_partial() {
    let network = MemoryNetwork::new();
    let mut server = Session::builder(SessionConfig {
        dedicated: true,
        listen: true,
        ..SessionConfig::default()
    })
    .host_info(StaticHostInfo::new("arena", "start"))
    .land(network.land(SERVER_IP, PORT))
    .build();

    let (first, _) = connect_remote(
        &mut server,
        &network,
        Ipv4Addr::new(10, 0, 0, 1),
        wait_for_reliable,
    );
    let (second, _) = connect_remote(
        &mut server,
        &network,
        Ipv4Addr::new(10, 0, 0, 3),
        wait_for_reliable,
    );
    // This client never acknowledges anything.
    let (silent, _) =
        connect_remote(&mut server, &network, Ipv4Addr::new(10, 0, 0, 4), |_, _| ());
    silent.join().unwrap();
    assert_eq!(server.active_connections(), 3);

    let time_limit = Duration::from_millis(300);
    let start = Instant::now();
    assert_eq!(server.send_to_all(&[9, 9], time_limit), 1);
    let elapsed = start.elapsed();
    assert!(elapsed >= time_limit);
    assert!(elapsed < time_limit + Duration::from_millis(200));

    assert_eq!(first.join().unwrap(), vec![9, 9]);
    assert_eq!(second.join().unwrap(), vec![9, 9]);
}
