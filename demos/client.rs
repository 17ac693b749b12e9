//! Connect, send a message, and print what comes back.
//!
//! Use `--help` for the options.

use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::eyre;
use tapsdriver::{
    ConnectionConfig, Preconnection, Property, ReceiveRequest, RemoteEndpoint, SecurityParameters,
    TransportProperties,
};
use tokio::sync::mpsc;

#[derive(Debug, Parser)]
#[command(version, about = "Send a message over whichever transport wins")]
struct Args {
    /// Host name or address to connect to.
    host: String,

    /// Port to connect to.
    port: u16,

    /// The message to send.
    #[arg(default_value = "hello")]
    message: String,

    /// Require a reliable (stream) transport.
    #[arg(long, conflicts_with = "datagram")]
    reliable: bool,

    /// Require a datagram transport.
    #[arg(long)]
    datagram: bool,

    /// Secure the connection with TLS, trusting this CA file (or the
    /// platform roots if given as an empty string).
    #[arg(long)]
    tls: Option<String>,

    /// Milliseconds to wait between racing candidates.
    #[arg(long, default_value_t = 100)]
    racing_delay: u64,
}

enum Event {
    Ready,
    Failed(tapsdriver::Error),
    Data(bytes::Bytes),
    Closed,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let remote = match args.host.parse() {
        Ok(addr) => RemoteEndpoint::new().with_address(addr),
        Err(_) => RemoteEndpoint::new().with_host_name(&args.host),
    }
    .with_port(args.port);

    let mut properties = TransportProperties::new();
    if args.reliable {
        properties = properties.require(Property::Reliability);
    }
    if args.datagram {
        properties = properties.require(Property::PreserveMsgBoundaries);
    }

    let config = ConnectionConfig {
        racing_delay: Duration::from_millis(args.racing_delay),
        ..Default::default()
    };

    let (tx, mut events) = mpsc::unbounded_channel();
    let failed = tx.clone();
    let mut preconnection = Preconnection::new()
        .with_remote_endpoint(remote)
        .with_transport_properties(properties)
        .with_config(config)
        .on_ready(move |_| {
            let _ = tx.send(Event::Ready);
        })
        .on_initiate_error(move |_, error| {
            let _ = failed.send(Event::Failed(error));
        });

    if let Some(ca) = args.tls {
        let mut security = SecurityParameters::new();
        if !ca.is_empty() {
            security = security.with_trusted_ca(ca);
        }
        preconnection = preconnection.with_security_parameters(security);
    }

    let connection = preconnection.initiate();
    match events.recv().await {
        Some(Event::Ready) => {}
        Some(Event::Failed(error)) => return Err(error.into()),
        _ => return Err(eyre!("establishment ended without an outcome")),
    }
    println!(
        "connected over {:?} to {:?}",
        connection.protocol(),
        connection.remote_addr()
    );

    let (tx, mut events) = mpsc::unbounded_channel();
    let partial = tx.clone();
    let closed = tx.clone();
    connection
        .on_received(move |data, _, _| {
            let _ = tx.send(Event::Data(data));
        })
        .on_received_partial(move |data, _, _, _| {
            let _ = partial.send(Event::Data(data));
        })
        .on_sent(|seq| println!("message {seq} sent"))
        .on_send_error(|seq, error| eprintln!("message {seq} failed: {error}"))
        .on_closed(move || {
            let _ = closed.send(Event::Closed);
        });

    connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
    connection.send(args.message.into_bytes());

    let reply = tokio::time::timeout(Duration::from_secs(5), events.recv()).await;
    match reply {
        Ok(Some(Event::Data(data))) => println!("received {data:?}"),
        Ok(_) => println!("no reply"),
        Err(_) => println!("no reply within 5s"),
    }

    connection.close();
    while let Some(event) = events.recv().await {
        if let Event::Closed = event {
            break;
        }
    }
    Ok(())
}
