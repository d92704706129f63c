//! Connection IT tests: a real connection against a scripted peer speaking raw frames.

// unused deps lint confusion
#![allow(unused_crate_dependencies)]

use assert_matches::assert_matches;
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    io::{AsyncWriteExt as _, DuplexStream},
    net::TcpListener,
    time::timeout,
};
use tracing_subscriber::EnvFilter;
use xic_config::{ConnectionConfig, DEFAULT_MAX_MESSAGE_SIZE};
use xic_network::{
    Answer, ConState, Connection, Current, GenericServant, Message, MessageCodec, Quest, Servant,
    ServantError, ServiceMap, XicError,
};
use xic_types::{decode, encode, Arguments, Context, Exception, Value};

const TEST_DEADLINE: Duration = Duration::from_secs(5);

fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[derive(Debug, Serialize, Deserialize)]
struct Lookup {
    key: String,
}

/// A generic servant that reports what it was called with.
struct Reflect;

#[async_trait::async_trait]
impl GenericServant for Reflect {
    async fn invoke(&self, current: Current, args: Arguments) -> Result<Arguments, ServantError> {
        Ok(args.with("method", current.method()).with("txid", current.txid()))
    }
}

fn services(notified: Arc<AtomicUsize>) -> Arc<ServiceMap> {
    let echo = Servant::builder("Echo")
        .method("Ping", |_cur, _: ()| async move { Ok("pong".to_string()) })
        .method("Get", |_cur, lookup: Lookup| async move {
            let ex = Exception::new("NotFound", 404, format!("no {}", lookup.key));
            Err::<String, _>(ServantError::from(ex))
        })
        .method("Whoami", |cur: Current, _: ()| async move {
            Ok(cur.context().get("user").and_then(Value::as_str).unwrap_or_default().to_string())
        })
        .oneway("Notify", move |_cur, _: ()| {
            let notified = notified.clone();
            async move {
                notified.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .build();

    Arc::new(ServiceMap::new().with(echo).with(Servant::generic("Reflect", Arc::new(Reflect))))
}

/// A peer driven by hand, one frame at a time.
struct RawPeer {
    stream: DuplexStream,
    codec: MessageCodec,
}

impl RawPeer {
    fn new(stream: DuplexStream) -> Self {
        Self { stream, codec: MessageCodec::new(DEFAULT_MAX_MESSAGE_SIZE) }
    }

    async fn send(&mut self, msg: Message) {
        self.codec.write_message(&mut self.stream, &msg).await.unwrap();
    }

    async fn recv(&mut self) -> Message {
        timeout(TEST_DEADLINE, self.codec.read_message(&mut self.stream))
            .await
            .expect("frame before deadline")
            .expect("valid frame")
    }

    async fn recv_quest(&mut self) -> Quest {
        match self.recv().await {
            Message::Quest(quest) => quest,
            other => panic!("expected quest, got {other:?}"),
        }
    }
}

/// An outgoing connection whose peer is scripted by the test.
fn outgoing_with_raw_peer() -> (Connection<DuplexStream>, RawPeer) {
    init_test_tracing();
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let connection = Connection::outgoing(local, "raw", ConnectionConfig::default());
    connection.start();
    (connection, RawPeer::new(remote))
}

/// An incoming connection serving [`services`], with a scripted caller.
fn incoming_with_raw_peer(notified: Arc<AtomicUsize>) -> (Connection<DuplexStream>, RawPeer) {
    init_test_tracing();
    let (local, remote) = tokio::io::duplex(64 * 1024);
    let connection =
        Connection::incoming(local, "raw", Some(services(notified)), ConnectionConfig::default());
    connection.start();
    (connection, RawPeer::new(remote))
}

fn quest(txid: i64, service: &str, method: &str, args: Vec<u8>) -> Message {
    Message::Quest(Quest {
        txid,
        service: service.into(),
        method: method.into(),
        context: Context::new(),
        args,
    })
}

#[tokio::test]
async fn test_echo_ping_returns_pong() {
    let (connection, mut peer) = outgoing_with_raw_peer();
    peer.send(Message::Hello).await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke::<_, String>("Echo", "Ping", &()).await }
    });

    let quest = peer.recv_quest().await;
    assert_eq!(quest.service, "Echo");
    assert_eq!(quest.method, "Ping");
    assert!(quest.txid > 0);
    peer.send(Message::Answer(Answer::normal(quest.txid, encode("pong").unwrap()))).await;

    assert_eq!(call.await.unwrap().unwrap(), "pong");
    assert_eq!(connection.pending_calls(), 0);
}

#[tokio::test]
async fn test_exceptional_answer_becomes_exception() {
    let (connection, mut peer) = outgoing_with_raw_peer();
    peer.send(Message::Hello).await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke::<_, String>("Store", "Get", &"k").await }
    });

    let quest = peer.recv_quest().await;
    let failure = Exception::new("NotFound", 404, "no such key").to_failure("Get*Store");
    peer.send(Message::Answer(Answer::exceptional(quest.txid, &failure).unwrap())).await;

    let err = call.await.unwrap().unwrap_err();
    let ex = err.exception().expect("remote exception");
    assert_eq!(ex.exname(), "NotFound");
    assert_eq!(ex.code(), 404);
    assert_eq!(ex.message(), "no such key");
    assert_eq!(connection.state(), ConState::Active);
}

#[tokio::test]
async fn test_eof_mid_header_fails_pending_calls() {
    let (connection, mut peer) = outgoing_with_raw_peer();
    peer.send(Message::Hello).await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke::<_, String>("Echo", "Ping", &()).await }
    });
    let _ = peer.recv_quest().await;

    // three bytes of a header, then the stream ends
    peer.stream.write_all(b"XA!").await.unwrap();
    drop(peer);

    assert_matches!(call.await.unwrap(), Err(XicError::ConnectionClosed));
    assert_eq!(timeout(TEST_DEADLINE, connection.wait_closed()).await.unwrap(), ConState::Error);
    assert_matches!(
        connection.invoke::<_, String>("Echo", "Ping", &()).await,
        Err(XicError::ConnectionClosed)
    );
}

#[tokio::test]
async fn test_unknown_answer_is_discarded() {
    let (connection, mut peer) = outgoing_with_raw_peer();
    peer.send(Message::Hello).await;
    peer.send(Message::Answer(Answer::normal(999, encode("stale").unwrap()))).await;

    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke::<_, String>("Echo", "Ping", &()).await }
    });
    let quest = peer.recv_quest().await;
    peer.send(Message::Answer(Answer::normal(quest.txid, encode("pong").unwrap()))).await;

    assert_eq!(call.await.unwrap().unwrap(), "pong");
    assert_eq!(connection.state(), ConState::Active);
}

#[tokio::test]
async fn test_quest_before_hello_is_fatal() {
    let (connection, mut peer) = outgoing_with_raw_peer();
    peer.send(quest(1, "Echo", "Ping", vec![])).await;

    assert_eq!(timeout(TEST_DEADLINE, connection.wait_closed()).await.unwrap(), ConState::Error);
}

#[tokio::test]
async fn test_quest_while_closing_is_dropped() {
    let (connection, mut peer) = outgoing_with_raw_peer();
    connection.set_adapter(Some(services(Arc::default())));
    peer.send(Message::Hello).await;
    // a round trip proves the hello was processed
    let call = tokio::spawn({
        let connection = connection.clone();
        async move { connection.invoke::<_, String>("Echo", "Ping", &()).await }
    });
    let ping = peer.recv_quest().await;
    peer.send(Message::Answer(Answer::normal(ping.txid, encode("pong").unwrap()))).await;
    call.await.unwrap().unwrap();

    connection.close(false).await;
    assert_eq!(connection.state(), ConState::Closing);
    assert_matches!(peer.recv().await, Message::Bye);

    peer.send(quest(7, "Echo", "Ping", vec![])).await;
    peer.send(Message::Bye).await;
    assert_eq!(timeout(TEST_DEADLINE, connection.wait_closed()).await.unwrap(), ConState::Closed);

    // no answer to the dropped quest and no second bye: the stream just ends
    let next = timeout(TEST_DEADLINE, peer.codec.read_message(&mut peer.stream)).await.unwrap();
    assert!(next.is_err(), "unexpected frame {next:?}");
}

#[tokio::test]
async fn test_bye_from_peer_is_answered() {
    let notified = Arc::new(AtomicUsize::new(0));
    let (connection, mut peer) = incoming_with_raw_peer(notified);
    assert_matches!(peer.recv().await, Message::Hello);

    peer.send(Message::Bye).await;
    assert_matches!(peer.recv().await, Message::Bye);
    assert_eq!(timeout(TEST_DEADLINE, connection.wait_closed()).await.unwrap(), ConState::Closed);
}

#[tokio::test]
async fn test_incoming_dispatch() {
    let notified = Arc::new(AtomicUsize::new(0));
    let (_connection, mut peer) = incoming_with_raw_peer(notified.clone());
    assert_matches!(peer.recv().await, Message::Hello);

    // oneway quest: invoked, never answered
    peer.send(quest(0, "Echo", "Notify", encode(&()).unwrap())).await;
    // oneway quest to a twoway method: result discarded
    peer.send(quest(0, "Echo", "Ping", encode(&()).unwrap())).await;
    peer.send(quest(5, "Echo", "Ping", encode(&()).unwrap())).await;

    let Message::Answer(answer) = peer.recv().await else { panic!("expected answer") };
    assert_eq!(answer.txid, 5);
    assert_eq!(decode::<String>(&answer.args).unwrap(), "pong");
    assert_eq!(notified.load(Ordering::SeqCst), 1);

    // declared exception
    let args = encode(&Lookup { key: "k".into() }).unwrap();
    peer.send(quest(6, "Echo", "Get", args)).await;
    let Message::Answer(answer) = peer.recv().await else { panic!("expected answer") };
    assert!(answer.is_exceptional());
    let failure: Arguments = decode(&answer.args).unwrap();
    assert_eq!(failure.get_string("raiser"), "Get*Echo @");
    assert_eq!(failure.get_int("code"), 404);
    assert_eq!(failure.get_string("message"), "no k");

    // generic servant
    let args = encode(&Arguments::new().with("x", 1i64)).unwrap();
    peer.send(quest(8, "Reflect", "Anything", args)).await;
    let Message::Answer(answer) = peer.recv().await else { panic!("expected answer") };
    let out: Arguments = decode(&answer.args).unwrap();
    assert_eq!(out.get_string("method"), "Anything");
    assert_eq!(out.get_int("txid"), 8);
    assert_eq!(out.get_int("x"), 1);
}

#[tokio::test]
async fn test_bad_magic_is_fatal() {
    let notified = Arc::new(AtomicUsize::new(0));
    let (connection, mut peer) = incoming_with_raw_peer(notified);
    assert_matches!(peer.recv().await, Message::Hello);

    peer.stream.write_all(&[b'Y', b'!', b'Q', 0, 0, 0, 0, 0]).await.unwrap();
    assert_eq!(timeout(TEST_DEADLINE, connection.wait_closed()).await.unwrap(), ConState::Error);
}

#[tokio::test]
async fn test_proxy_sends_context() {
    init_test_tracing();
    let (client, server) = tokio::io::duplex(64 * 1024);
    let client = Connection::outgoing(client, "server", ConnectionConfig::default());
    let server = Connection::incoming(
        server,
        "client",
        Some(services(Arc::default())),
        ConnectionConfig::default(),
    );
    client.start();
    server.start();

    assert_matches!(client.create_proxy("Echo@tcp+host+1"), Err(XicError::InvalidService(_)));

    let proxy = client.create_proxy("Echo").unwrap().with_context("user", "alice");
    assert_eq!(proxy.to_string(), "Echo@outgoing/server");
    let user: String = proxy.invoke("Whoami", &()).await.unwrap();
    assert_eq!(user, "alice");
    proxy.invoke_oneway("Notify", &()).await.unwrap();

    let err = proxy.invoke::<_, String>("Missing", &()).await.unwrap_err();
    assert_eq!(err.exception().unwrap().exname(), xic_types::SERVICE_NOT_FOUND_EXCEPTION);
}

#[tokio::test]
async fn test_dial_over_tcp() {
    init_test_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let accept = tokio::spawn(async move {
        let (stream, peer) = listener.accept().await.unwrap();
        let connection = Connection::incoming(
            stream,
            peer.to_string(),
            Some(services(Arc::default())),
            ConnectionConfig::default(),
        );
        connection.start();
        connection
    });

    let config = ConnectionConfig::default().with_timeout(TEST_DEADLINE);
    let client = Connection::dial(&addr.to_string(), config).await.unwrap();
    let server = accept.await.unwrap();

    let pong: String = client.invoke("Echo", "Ping", &()).await.unwrap();
    assert_eq!(pong, "pong");
    assert_eq!(client.timeout(), Some(TEST_DEADLINE));

    client.close(false).await;
    assert_eq!(timeout(TEST_DEADLINE, client.wait_closed()).await.unwrap(), ConState::Closed);
    assert_eq!(timeout(TEST_DEADLINE, server.wait_closed()).await.unwrap(), ConState::Closed);
}
