//! Loopback integration tests: dispatcher routing, discovery, autoreply,
//! fragmentation, and the bulk image channel on ephemeral ports.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use slcp_core::wire::{encode_datagram, parse_datagram};
use slcp_core::{Accept, Envelope, Notification, Peer, Reassembler};
use slcp_node::discovery::Discovery;
use slcp_node::{bulk, spawn_directory, Config, Dispatcher, DirectoryHandle, Outbound};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc;

const TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(handle: &str, inactive: bool) -> Config {
    Config {
        handle: handle.to_string(),
        port: 0,
        whoisport: 0,
        imagepath: temp_dir(),
        autoreply: "away".to_string(),
        inactive,
        peer_timeout_secs: 0,
    }
}

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("slcp-node-test-{}", uuid::Uuid::new_v4()))
}

struct TestNode {
    data_addr: SocketAddr,
    outbound: mpsc::Sender<Outbound>,
    notifications: mpsc::Receiver<Notification>,
    directory: DirectoryHandle,
}

fn spawn_node(cfg: &Config) -> TestNode {
    let (notif_tx, notif_rx) = mpsc::channel(64);
    let (outbound_tx, outbound_rx) = mpsc::channel(64);
    let directory = spawn_directory(None, notif_tx.clone());
    let dispatcher = Dispatcher::new(cfg, directory.clone(), notif_tx, outbound_rx)
        .expect("bind dispatcher sockets");
    let port = dispatcher.data_addr().expect("local addr").port();
    tokio::spawn(dispatcher.run());
    TestNode {
        data_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port),
        outbound: outbound_tx,
        notifications: notif_rx,
        directory,
    }
}

async fn expect_notification(rx: &mut mpsc::Receiver<Notification>) -> Notification {
    tokio::time::timeout(TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for notification")
        .expect("notification channel closed")
}

async fn recv_envelope(sock: &UdpSocket) -> Envelope {
    let mut buf = vec![0u8; 65536];
    let (n, _) = tokio::time::timeout(TIMEOUT, sock.recv_from(&mut buf))
        .await
        .expect("timed out waiting for datagram")
        .expect("recv failed");
    parse_datagram(&buf[..n]).expect("parseable datagram")
}

#[tokio::test]
async fn directory_service_register_lookup_unregister() {
    let (notif_tx, _notif_rx) = mpsc::channel(8);
    let directory = spawn_directory(None, notif_tx);
    let ip: IpAddr = "192.168.1.2".parse().unwrap();

    assert!(directory.register("alice", ip, 5001).await.unwrap());
    assert!(!directory.register("alice", ip, 5001).await.unwrap());

    let peer = directory.lookup("alice").await.unwrap().unwrap();
    assert_eq!(peer.ip, ip);
    assert_eq!(peer.port, 5001);

    assert!(directory.unregister("alice").await.unwrap());
    assert!(directory.lookup("alice").await.unwrap().is_none());
}

#[tokio::test]
async fn duplicate_join_emits_single_notification() {
    let (notif_tx, mut notif_rx) = mpsc::channel(8);
    let directory = spawn_directory(None, notif_tx.clone());
    let discovery = Discovery::new("alice".into(), directory, notif_tx);

    let from: SocketAddr = "192.168.1.3:5002".parse().unwrap();
    let join = Envelope::Join {
        handle: "bob".into(),
        port: 5002,
    };
    discovery.handle(join.clone(), from).await.unwrap();
    discovery.handle(join, from).await.unwrap();

    assert_eq!(
        expect_notification(&mut notif_rx).await,
        Notification::PeerJoined {
            handle: "bob".into()
        }
    );
    assert!(notif_rx.try_recv().is_err(), "second JOIN must not notify");
}

#[tokio::test]
async fn who_reply_is_returned_to_the_caller() {
    let (notif_tx, _notif_rx) = mpsc::channel(8);
    let directory = spawn_directory(None, notif_tx.clone());
    let discovery = Discovery::new("alice".into(), directory.clone(), notif_tx);
    directory
        .register("bob", "192.168.1.3".parse().unwrap(), 5002)
        .await
        .unwrap();

    // The handler must hand the reply back, never park on a queue the
    // dispatcher drains, so it completes regardless of outbound pressure.
    let from: SocketAddr = "192.168.1.3:5002".parse().unwrap();
    let reply = tokio::time::timeout(TIMEOUT, discovery.handle(Envelope::Who, from))
        .await
        .expect("WHO handling must not stall")
        .unwrap();
    match reply {
        Some((Envelope::KnownUsers { entries }, dest)) => {
            assert_eq!(dest, from);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].handle, "bob");
        }
        other => panic!("expected a KnownUsers reply, got {other:?}"),
    }
}

#[tokio::test]
async fn who_is_answered_unicast_with_snapshot() {
    let cfg = test_config("alice", false);
    let mut node = spawn_node(&cfg);
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sock.send_to(b"JOIN bob 6001", node.data_addr).await.unwrap();
    assert_eq!(
        expect_notification(&mut node.notifications).await,
        Notification::PeerJoined {
            handle: "bob".into()
        }
    );

    sock.send_to(b"WHO", node.data_addr).await.unwrap();
    match recv_envelope(&sock).await {
        Envelope::KnownUsers { entries } => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].handle, "bob");
            assert_eq!(entries[0].ip, "127.0.0.1".parse::<IpAddr>().unwrap());
            assert_eq!(entries[0].port, 6001);
        }
        other => panic!("expected KnownUsers, got {other:?}"),
    }
}

#[tokio::test]
async fn knownusers_merge_does_not_overwrite_direct_join() {
    let cfg = test_config("alice", false);
    let mut node = spawn_node(&cfg);
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sock.send_to(b"JOIN bob 6001", node.data_addr).await.unwrap();
    expect_notification(&mut node.notifications).await;

    // A relayed report disagreeing about bob must lose; carol is new.
    sock.send_to(b"KNOWNUSERS bob 10.0.0.9 9999 carol 10.0.0.8 7001", node.data_addr)
        .await
        .unwrap();
    assert_eq!(
        expect_notification(&mut node.notifications).await,
        Notification::PeerJoined {
            handle: "carol".into()
        }
    );

    let bob = node.directory.lookup("bob").await.unwrap().unwrap();
    assert_eq!(bob.port, 6001);
    let carol = node.directory.lookup("carol").await.unwrap().unwrap();
    assert_eq!(carol.port, 7001);
}

#[tokio::test]
async fn inbound_message_reaches_output_boundary() {
    let cfg = test_config("alice", false);
    let mut node = spawn_node(&cfg);
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sock.send_to(b"MSG bob alice hi there", node.data_addr)
        .await
        .unwrap();
    assert_eq!(
        expect_notification(&mut node.notifications).await,
        Notification::Message {
            sender: "bob".into(),
            text: "hi there".into()
        }
    );
}

#[tokio::test]
async fn autoreply_falls_back_to_observed_source() {
    let cfg = test_config("alice", true);
    let mut node = spawn_node(&cfg);
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    // bob is not in the directory, so the reply must go to the datagram's
    // observed source address.
    sock.send_to(b"MSG bob alice hi", node.data_addr).await.unwrap();
    assert_eq!(
        expect_notification(&mut node.notifications).await,
        Notification::Message {
            sender: "bob".into(),
            text: "hi".into()
        }
    );
    assert_eq!(
        recv_envelope(&sock).await,
        Envelope::Message {
            sender: "alice".into(),
            target: "bob".into(),
            text: "away".into(),
        }
    );
}

#[tokio::test]
async fn getpeer_answers_found_and_notfound() {
    let cfg = test_config("alice", false);
    let mut node = spawn_node(&cfg);
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    sock.send_to(b"JOIN bob 6001", node.data_addr).await.unwrap();
    expect_notification(&mut node.notifications).await;

    sock.send_to(b"GETPEER bob", node.data_addr).await.unwrap();
    match recv_envelope(&sock).await {
        Envelope::Found { target, peer } => {
            assert_eq!(target, "bob");
            assert_eq!(peer.port, 6001);
        }
        other => panic!("expected Found, got {other:?}"),
    }

    sock.send_to(b"GETPEER carol", node.data_addr).await.unwrap();
    assert_eq!(
        recv_envelope(&sock).await,
        Envelope::NotFound {
            target: "carol".into()
        }
    );
}

#[tokio::test]
async fn oversized_outbound_message_is_fragmented() {
    let cfg = test_config("alice", false);
    let node = spawn_node(&cfg);
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let dest = sock.local_addr().unwrap();

    let text: String = "x".repeat(2000);
    let env = Envelope::Message {
        sender: "alice".into(),
        target: "bob".into(),
        text: text.clone(),
    };
    assert!(encode_datagram(&env).unwrap().len() > 512);
    node.outbound
        .send(Outbound::Unicast(env.clone(), dest))
        .await
        .unwrap();

    // Each received datagram is an independently addressed chunk; feeding
    // them to a fresh reassembler must reproduce the original envelope.
    let mut reassembler = Reassembler::default();
    let reconstructed = loop {
        match recv_envelope(&sock).await {
            Envelope::Chunk {
                message_id,
                index,
                total,
                payload,
            } => {
                match reassembler
                    .accept(message_id, index, total, payload, Instant::now())
                    .unwrap()
                {
                    Accept::Complete(bytes) => break parse_datagram(&bytes).unwrap(),
                    Accept::Incomplete => {}
                    Accept::Duplicate => panic!("sender must not duplicate chunks"),
                }
            }
            other => panic!("expected Chunk, got {other:?}"),
        }
    };
    assert_eq!(reconstructed, env);
}

#[tokio::test]
async fn inbound_fragments_are_reassembled_and_redispatched() {
    let cfg = test_config("alice", false);
    let mut node = spawn_node(&cfg);
    let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let text: String = "y".repeat(1500);
    let env = Envelope::Message {
        sender: "bob".into(),
        target: "alice".into(),
        text: text.clone(),
    };
    let bytes = encode_datagram(&env).unwrap();
    let chunks = slcp_core::fragment(&bytes, 512);
    assert!(chunks.len() >= 3);
    // Deliver out of order; the dispatcher must still reconstruct.
    for chunk in chunks.iter().rev() {
        let datagram = encode_datagram(chunk).unwrap();
        sock.send_to(&datagram, node.data_addr).await.unwrap();
    }

    assert_eq!(
        expect_notification(&mut node.notifications).await,
        Notification::Message {
            sender: "bob".into(),
            text
        }
    );
}

#[tokio::test]
async fn dispatcher_exits_when_outbound_senders_drop() {
    let cfg = test_config("alice", false);
    let (notif_tx, _notif_rx) = mpsc::channel(8);
    let (outbound_tx, outbound_rx) = mpsc::channel::<Outbound>(8);
    let directory = spawn_directory(None, notif_tx.clone());
    let dispatcher = Dispatcher::new(&cfg, directory, notif_tx, outbound_rx)
        .expect("bind dispatcher sockets");
    let task = tokio::spawn(dispatcher.run());

    drop(outbound_tx);
    tokio::time::timeout(TIMEOUT, task)
        .await
        .expect("dispatcher must stop once all producers are gone")
        .expect("dispatcher task panicked")
        .expect("dispatcher returned an error");
}

#[tokio::test]
async fn two_nodes_share_the_discovery_port() {
    // Multiple nodes on one host listen on the same well-known broadcast
    // port; reuse-address makes the second bind succeed.
    let mut cfg = test_config("alice", false);
    cfg.whoisport = 47123;
    let first = spawn_node(&cfg);
    cfg.handle = "bob".to_string();
    let second = spawn_node(&cfg);
    drop(first);
    drop(second);
}

#[tokio::test]
async fn bulk_image_transfer_end_to_end() {
    let image_dir = temp_dir();
    let (notif_tx, mut notif_rx) = mpsc::channel(8);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let bulk_port = listener.local_addr().unwrap().port();
    tokio::spawn(bulk::run_listener(listener, image_dir.clone(), notif_tx));

    let src_dir = temp_dir();
    tokio::fs::create_dir_all(&src_dir).await.unwrap();
    let src = src_dir.join("cat.png");
    let payload: Vec<u8> = (0u32..50_000).map(|i| (i * 3) as u8).collect();
    tokio::fs::write(&src, &payload).await.unwrap();

    let peer = Peer {
        handle: "bob".into(),
        ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: bulk_port - slcp_core::BULK_PORT_OFFSET,
    };
    let size = bulk::send_image(&peer, "alice", &src).await.unwrap();
    assert_eq!(size, payload.len() as u64);

    match expect_notification(&mut notif_rx).await {
        Notification::ImageReceived { sender, path } => {
            assert_eq!(sender, "alice");
            assert_eq!(path, image_dir.join("cat.png"));
            let written = tokio::fs::read(&path).await.unwrap();
            assert_eq!(written, payload);
        }
        other => panic!("expected ImageReceived, got {other:?}"),
    }

    tokio::fs::remove_dir_all(&image_dir).await.ok();
    tokio::fs::remove_dir_all(&src_dir).await.ok();
}
