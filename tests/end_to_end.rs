#![cfg(all(feature = "client", feature = "server"))]

use async_trait::async_trait;
use rndz_chat::{
    rendezvous::{self, RetryPolicy, Server},
    start, Discovery, Endpoint, Inbound, Inbox, NatType, PeerSession, PunchConfig, PunchState,
    Rendezvous, Result, SessionOptions, SharedKey, Strategy, StunProbe, StunReply, Target,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::time::timeout;

/// Sees every caller at 127.0.0.1 with an unknown port.
struct LoopbackProbe;

#[async_trait]
impl StunProbe for LoopbackProbe {
    async fn query(&self, _server: &str, _local: SocketAddr) -> Result<StunReply> {
        Ok(StunReply {
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            nat_type: NatType::FullCone,
        })
    }
}

async fn rendezvous_server() -> String {
    let server = Server::new("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", server.local_addr().unwrap());
    tokio::spawn(server.run());
    url
}

fn policy() -> RetryPolicy {
    RetryPolicy {
        register_attempts: 3,
        register_delay: Duration::from_millis(50),
        resolve_attempts: 50,
        resolve_interval: Duration::from_millis(50),
        refresh_period: Duration::from_secs(60),
        request_timeout: Duration::from_secs(5),
    }
}

fn options() -> SessionOptions {
    SessionOptions {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        punch: PunchConfig {
            burst: 5,
            burst_gap: Duration::from_millis(10),
            interval: Duration::from_millis(100),
            max_interval: Duration::from_millis(200),
            timeout: Duration::from_secs(10),
            ..PunchConfig::default()
        },
        keepalive: Duration::from_secs(1),
        recv_timeout: Duration::from_millis(50),
    }
}

async fn expect_text(inbox: &mut Inbox) -> String {
    match timeout(Duration::from_secs(5), inbox.recv())
        .await
        .unwrap()
        .unwrap()
    {
        Inbound::Message { text, .. } => text,
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn alice_and_bob_meet_and_chat() {
    let url = rendezvous_server().await;
    let client = rendezvous::Client::new(&url, policy()).unwrap();

    let alice_public: Endpoint = "198.51.100.1:41000".parse::<SocketAddr>().unwrap().into();
    let bob_public: Endpoint = "198.51.100.2:42000".parse::<SocketAddr>().unwrap().into();
    client.register("alice", &alice_public).await.unwrap();
    let reply = client.register("bob", &bob_public).await.unwrap();
    assert_eq!(reply.active_peers, 2);
    assert_eq!(client.resolve("alice").await.unwrap(), alice_public);
    assert_eq!(client.list_peers().await.unwrap().peers, vec!["alice", "bob"]);

    // the documentation addresses are not routable here, punch over loopback instead
    let key = SharedKey::generate();
    let mut alice = PeerSession::bind(options(), &key).await.unwrap();
    let mut bob = PeerSession::bind(options(), &key).await.unwrap();
    let (alice_addr, bob_addr) = (alice.local_addr(), bob.local_addr());

    let (a, b) = tokio::join!(
        alice.punch(Strategy::Directed(bob_addr)),
        bob.punch(Strategy::Directed(alice_addr))
    );
    assert_eq!(a.unwrap(), bob_addr);
    assert_eq!(b.unwrap(), alice_addr);
    assert_eq!(alice.state(), PunchState::Established);

    let mut alice_inbox = alice.inbox().unwrap();
    bob.send("hello").await.unwrap();
    assert_eq!(expect_text(&mut alice_inbox).await, "hello");

    alice.close().await;
    bob.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_start_through_rendezvous() {
    let url = rendezvous_server().await;
    let client = rendezvous::Client::new(&url, policy()).unwrap();
    let discovery = Discovery::new(LoopbackProbe, vec!["loopback".to_string()]);
    let key = SharedKey::generate();

    let alice = start(
        options(),
        &key,
        &discovery,
        Some(Rendezvous {
            client: &client,
            username: "alice",
        }),
        Target::Peer("bob".to_string()),
    );
    let bob = start(
        options(),
        &key,
        &discovery,
        Some(Rendezvous {
            client: &client,
            username: "bob",
        }),
        Target::Peer("alice".to_string()),
    );

    let (alice, bob) = tokio::join!(alice, bob);
    let (mut alice, mut bob) = (alice.unwrap(), bob.unwrap());
    assert_eq!(alice.remote(), Some(bob.local_addr()));
    assert_eq!(bob.remote(), Some(alice.local_addr()));

    // registered with the bound port in place of the unknown external one
    let registered = client.resolve("alice").await.unwrap();
    assert_eq!(registered.port, alice.local_addr().port());

    let mut alice_inbox = alice.inbox().unwrap();
    let mut bob_inbox = bob.inbox().unwrap();
    alice.send("hi bob").await.unwrap();
    bob.send("hi alice").await.unwrap();
    assert_eq!(expect_text(&mut bob_inbox).await, "hi bob");
    assert_eq!(expect_text(&mut alice_inbox).await, "hi alice");

    alice.close().await;
    bob.close().await;
}

#[tokio::test]
async fn unknown_peer_fails_and_closes() {
    let url = rendezvous_server().await;
    let mut policy = policy();
    policy.resolve_attempts = 3;
    let client = rendezvous::Client::new(&url, policy).unwrap();
    let discovery = Discovery::new(LoopbackProbe, vec!["loopback".to_string()]);

    let res = start(
        options(),
        &SharedKey::generate(),
        &discovery,
        Some(Rendezvous {
            client: &client,
            username: "carol",
        }),
        Target::Peer("nobody".to_string()),
    )
    .await;

    assert!(matches!(res, Err(rndz_chat::Error::PeerNotFound(name)) if name == "nobody"));
}

#[tokio::test]
async fn peer_lookup_needs_rendezvous() {
    let discovery = Discovery::new(LoopbackProbe, vec![]);
    let res = start(
        options(),
        &SharedKey::generate(),
        &discovery,
        None,
        Target::Peer("bob".to_string()),
    )
    .await;

    assert!(matches!(res, Err(rndz_chat::Error::Config(_))));
}
