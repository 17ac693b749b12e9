use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use tapsdriver::{
    Connection, ConnectionState, LocalEndpoint, Preconnection, Property, Protocol, ReceiveRequest,
    RemoteEndpoint, TransportProperties,
};

#[derive(Debug, PartialEq, Eq)]
enum Received {
    Partial(Bytes),
    Complete(Bytes),
}

fn reliable() -> TransportProperties {
    TransportProperties::new().require(Property::Reliability)
}

fn remote(addr: SocketAddr) -> RemoteEndpoint {
    RemoteEndpoint::new()
        .with_address(addr.ip())
        .with_port(addr.port())
}

fn loopback() -> LocalEndpoint {
    LocalEndpoint::new().with_address(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

async fn initiate(preconnection: Preconnection) -> Connection {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let failed = tx.clone();
    preconnection
        .on_ready(move |connection| {
            let _ = tx.send(Ok(connection));
        })
        .on_initiate_error(move |_, error| {
            let _ = failed.send(Err(error.to_string()));
        })
        .initiate();

    rx.recv().await.unwrap().unwrap()
}

fn collect_received(connection: &Connection) -> mpsc::UnboundedReceiver<Received> {
    let (tx, rx) = mpsc::unbounded_channel();
    let partial = tx.clone();
    connection
        .on_received(move |data, _, _| {
            tx.send(Received::Complete(data)).unwrap();
        })
        .on_received_partial(move |data, _, _, _| {
            partial.send(Received::Partial(data)).unwrap();
        });
    rx
}

#[tokio::test]
async fn tcp_lifecycle() {
    let _ = tracing_subscriber::fmt::try_init();

    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let (connection, accepted) = tokio::join!(
        initiate(
            Preconnection::new()
                .with_remote_endpoint(remote(addr))
                .with_transport_properties(reliable())
        ),
        peer.accept()
    );
    let (mut stream, _) = accepted.unwrap();

    assert_eq!(connection.state(), ConnectionState::Established);
    assert!(connection.is_active());
    assert_eq!(connection.protocol(), Some(Protocol::Tcp));
    assert_eq!(connection.remote_addr(), Some(addr));
    assert_eq!(connection.remote_endpoint().addresses(), &[addr.ip()]);

    // Sequence numbers and `sent` come back in order.
    let (sent_tx, mut sent) = mpsc::unbounded_channel();
    connection.on_sent(move |seq| {
        sent_tx.send(seq).unwrap();
    });
    assert_eq!(connection.send(&b"hello"[..]), 1);
    assert_eq!(connection.send(&b"world"[..]), 2);
    assert_eq!(sent.recv().await, Some(1));
    assert_eq!(sent.recv().await, Some(2));

    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"helloworld");

    // A partial delivery waits for the minimum length.
    let mut received = collect_received(&connection);
    connection.receive(ReceiveRequest::new().with_min_incomplete_length(5));
    stream.write_all(b"he").await.unwrap();
    stream.flush().await.unwrap();
    tokio::task::yield_now().await;
    stream.write_all(b"llo").await.unwrap();
    assert_eq!(
        received.recv().await,
        Some(Received::Partial(Bytes::from_static(b"hello")))
    );

    // The end of the stream completes the message.
    connection.receive(ReceiveRequest::new());
    stream.write_all(b"bye").await.unwrap();
    stream.shutdown().await.unwrap();
    assert_eq!(
        received.recv().await,
        Some(Received::Complete(Bytes::from_static(b"bye")))
    );

    // Closing twice fires `closed` once.
    let (closed_tx, mut closed) = mpsc::unbounded_channel();
    connection.on_closed(move || {
        closed_tx.send(()).unwrap();
    });
    connection.close();
    connection.close();
    closed.recv().await.unwrap();
    assert_eq!(connection.state(), ConnectionState::Closed);
    tokio::task::yield_now().await;
    assert!(closed.try_recv().is_err());

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn send_after_close_fails() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let (connection, _accepted) = tokio::join!(
        initiate(
            Preconnection::new()
                .with_remote_endpoint(remote(addr))
                .with_transport_properties(reliable())
        ),
        peer.accept()
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    connection.on_send_error(move |seq, error| {
        tx.send((seq, error.to_string())).unwrap();
    });

    connection.close();
    let seq = connection.send(&b"late"[..]);
    let (failed, message) = rx.recv().await.unwrap();
    assert_eq!(failed, seq);
    assert!(message.starts_with("send:"), "{message}");
}

#[tokio::test]
async fn refused_connection_fails_to_initiate() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };

    let (tx, mut rx) = mpsc::unbounded_channel();
    let connection = Preconnection::new()
        .with_remote_endpoint(remote(addr))
        .with_transport_properties(reliable())
        .on_initiate_error(move |connection, error| {
            tx.send((connection.state(), error.to_string())).unwrap();
        })
        .initiate();

    let (state, message) = rx.recv().await.unwrap();
    assert_eq!(state, ConnectionState::Closed);
    assert!(message.starts_with("initiate:"), "{message}");
    assert_eq!(connection.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn receive_before_ready_is_kept() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = peer.local_addr().unwrap();

    let connection = Preconnection::new()
        .with_remote_endpoint(remote(addr))
        .with_transport_properties(reliable())
        .initiate();
    let mut received = collect_received(&connection);
    connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));

    let (mut stream, _) = peer.accept().await.unwrap();
    stream.write_all(b"early").await.unwrap();

    match received.recv().await.unwrap() {
        Received::Partial(data) => assert!(b"early".starts_with(&data)),
        other => panic!("unexpected delivery: {other:?}"),
    }
}

#[tokio::test]
async fn end_of_stream_is_reported_once() {
    let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let connection = initiate(
        Preconnection::new()
            .with_remote_endpoint(remote(peer.local_addr().unwrap()))
            .with_transport_properties(reliable()),
    )
    .await;

    // Keep asking for more after every delivery, like an echo loop.
    let (tx, mut received) = mpsc::unbounded_channel();
    let partial = tx.clone();
    connection
        .on_received(move |data, _, connection| {
            tx.send(Received::Complete(data)).unwrap();
            connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
        })
        .on_received_partial(move |data, _, _, connection| {
            partial.send(Received::Partial(data)).unwrap();
            connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
        });
    connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));

    let (mut stream, _) = peer.accept().await.unwrap();
    stream.write_all(b"bye").await.unwrap();
    stream.shutdown().await.unwrap();

    let mut data = Vec::new();
    loop {
        match received.recv().await.unwrap() {
            Received::Partial(chunk) => data.extend_from_slice(&chunk),
            Received::Complete(chunk) => {
                data.extend_from_slice(&chunk);
                break;
            }
        }
    }
    assert_eq!(data, b"bye");

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(received.try_recv().is_err());
    connection.close();
}

#[tokio::test]
async fn echo_through_listener() {
    let _ = tracing_subscriber::fmt::try_init();

    // The server never keeps its connections: they stay open on their own.
    let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
    let listener = Preconnection::new()
        .with_local_endpoint(loopback())
        .with_transport_properties(reliable())
        .on_connection_received(move |connection| {
            accepted_tx.send(connection.remote_addr()).unwrap();
            connection.on_received_partial(|data, _, _, connection| {
                connection.send(data);
                connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
            });
            connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
        })
        .listen();
    let server = listener.local_addr(Protocol::Tcp).await.unwrap();

    let connection = initiate(
        Preconnection::new()
            .with_remote_endpoint(remote(server))
            .with_transport_properties(reliable()),
    )
    .await;
    let mut received = collect_received(&connection);

    connection.send(&b"ping"[..]);
    connection.receive(ReceiveRequest::new().with_min_incomplete_length(4));
    assert_eq!(
        received.recv().await,
        Some(Received::Partial(Bytes::from_static(b"ping")))
    );

    // Long after the server's handler returned.
    tokio::time::sleep(Duration::from_millis(200)).await;
    connection.send(&b"again"[..]);
    connection.receive(ReceiveRequest::new().with_min_incomplete_length(5));
    assert_eq!(
        received.recv().await,
        Some(Received::Partial(Bytes::from_static(b"again")))
    );

    assert_eq!(accepted.recv().await.unwrap(), connection.local_addr());
    assert!(accepted.try_recv().is_err());

    connection.close();
    listener.stop();
}
