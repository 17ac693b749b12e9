use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use bytes::Bytes;
use tokio::sync::mpsc;

use tapsdriver::dns::IpAddrs;
use tapsdriver::{
    LocalEndpoint, Preconnection, Property, Protocol, ReceiveRequest, RemoteEndpoint, Resolver,
    SecurityParameters, TransportProperties,
};

struct Identity {
    _dir: tempfile::TempDir,
    identity: PathBuf,
    ca: PathBuf,
}

fn identity() -> Identity {
    let dir = tempfile::tempdir().unwrap();
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert = certified.cert.pem();

    let identity = dir.path().join("identity.pem");
    std::fs::write(
        &identity,
        format!("{cert}{}", certified.key_pair.serialize_pem()),
    )
    .unwrap();

    let ca = dir.path().join("ca.pem");
    std::fs::write(&ca, cert).unwrap();

    Identity {
        _dir: dir,
        identity,
        ca,
    }
}

fn localhost() -> Resolver {
    Resolver::new(tower::service_fn(|_host: Box<str>| async {
        Ok::<_, io::Error>(IpAddrs::from_iter([IpAddr::V4(Ipv4Addr::LOCALHOST)]))
    }))
}

fn listen(files: &Identity) -> tapsdriver::Listener {
    Preconnection::new()
        .with_local_endpoint(LocalEndpoint::new().with_address(IpAddr::V4(Ipv4Addr::LOCALHOST)))
        .with_transport_properties(TransportProperties::new().require(Property::Reliability))
        .with_security_parameters(SecurityParameters::new().with_identity(&files.identity))
        .on_connection_received(|connection| {
            connection.on_received_partial(|data, _, _, connection| {
                connection.send(data);
            });
            connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
        })
        .listen()
}

#[tokio::test]
async fn secured_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let files = identity();
    let listener = listen(&files);
    let server = listener.local_addr(Protocol::Tcp).await.unwrap();
    assert!(listener.local_addr(Protocol::Udp).await.is_none());

    let (tx, mut rx) = mpsc::unbounded_channel();
    Preconnection::new()
        .with_remote_endpoint(
            RemoteEndpoint::new()
                .with_host_name("localhost")
                .with_port(server.port()),
        )
        .with_resolver(localhost())
        .with_security_parameters(SecurityParameters::new().with_trusted_ca(&files.ca))
        .on_ready(move |connection| {
            let tx = tx.clone();
            connection.on_received_partial(move |data, _, _, _| {
                tx.send(data).unwrap();
            });
            connection.receive(ReceiveRequest::new().with_min_incomplete_length(6));
            connection.send(&b"secret"[..]);
        })
        .initiate();

    assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"secret"));
    listener.stop();
}

#[tokio::test]
async fn untrusted_server_fails_to_initiate() {
    let files = identity();
    let other = identity();
    let listener = listen(&files);
    let server = listener.local_addr(Protocol::Tcp).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    Preconnection::new()
        .with_remote_endpoint(
            RemoteEndpoint::new()
                .with_host_name("localhost")
                .with_port(server.port()),
        )
        .with_resolver(localhost())
        .with_security_parameters(SecurityParameters::new().with_trusted_ca(&other.ca))
        .on_initiate_error(move |_, error| {
            tx.send(error.to_string()).unwrap();
        })
        .initiate();

    let message = rx.recv().await.unwrap();
    assert!(message.contains("tls handshake"), "{message}");
    listener.stop();
}
