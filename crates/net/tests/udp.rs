use std::net::{IpAddr, Ipv4Addr};

use ar_net::{SendStatus, Session, SessionConfig, StaticHostInfo, UdpLand};
use ntest::timeout;

use crate::common::{wait_for_reliable, wait_for_send, EchoServer};

mod common;

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const SERVER_PORT: u16 = 26310;
const CLIENT_PORT: u16 = 26311;

#[test]
#[timeout(10000)]
fn test_udp() {
    let server = Session::builder(SessionConfig {
        dedicated: true,
        listen: true,
        ..SessionConfig::default()
    })
    .host_info(StaticHostInfo::new("arena", "start"))
    .land(UdpLand::new(LOCALHOST, SERVER_PORT))
    .build();
    assert_eq!(server.host_port(), Some(SERVER_PORT));
    let server = EchoServer::spawn(server);

    let mut client = Session::builder(SessionConfig::default())
        .without_loopback()
        .land(UdpLand::new(LOCALHOST, CLIENT_PORT))
        .build();

    let id = client
        .connect(Some(&format!("127.0.0.1:{SERVER_PORT}")))
        .unwrap();
    assert!(client.address(id).unwrap().starts_with("127.0.0.1:"));

    let message: Vec<u8> = (0..1200).map(|i| (i % 256) as u8).collect();
    assert_eq!(client.send_message(id, &message), SendStatus::Sent);
    assert_eq!(wait_for_reliable(&mut client, id), message);
    wait_for_send(&mut client, id);

    client.close(id);
    let report = server.stop();
    assert_eq!(report.accepted, 1);
    assert_eq!(report.received, vec![message]);
}
