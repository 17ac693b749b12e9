//! A listener which prints every message it receives.
//!
//! Listens on 127.0.0.1:6666 by default; use `--help` for the options.

use clap::Parser;
use tapsdriver::{
    Direction, LocalEndpoint, PreferenceLevel, Preconnection, Property, Protocol,
    ReceiveRequest, SecurityParameters, TransportProperties,
};

#[derive(Debug, Parser)]
#[command(version, about = "Print what clients send")]
struct Args {
    /// Interface name or address to listen on.
    #[arg(default_value = "127.0.0.1")]
    interface: String,

    /// Port to listen on.
    #[arg(default_value_t = 6666)]
    port: u16,

    /// Only accept reliable (stream) connections.
    #[arg(long)]
    reliable: bool,

    /// Echo every message back to its sender.
    #[arg(long)]
    echo: bool,

    /// Join the multicast group given as the interface instead.
    #[arg(long)]
    multicast: bool,

    /// PEM file with a certificate chain and key, to accept TLS.
    #[arg(long)]
    identity: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let local = if args.multicast {
        LocalEndpoint::new().with_address(args.interface.parse()?)
    } else {
        LocalEndpoint::new().with_interface(&args.interface)
    }
    .with_port(args.port);

    let mut properties = TransportProperties::new();
    if args.reliable {
        properties.add(Property::Reliability, PreferenceLevel::Require);
    }
    if args.multicast {
        properties = properties.with_direction(Direction::UnidirectionalReceive);
    }

    let echo = args.echo;
    let mut preconnection = Preconnection::new()
        .with_local_endpoint(local)
        .with_transport_properties(properties)
        .on_connection_received(move |connection| {
            println!("connection from {:?}", connection.remote_addr());
            connection
                .on_received_partial(move |data, context, _, connection| {
                    println!("{:?}: {:?}", context.remote_addr(), data);
                    if echo {
                        connection.send(data);
                    }
                    connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
                })
                .on_received(move |data, context, connection| {
                    println!("{:?}: {:?} (complete)", context.remote_addr(), data);
                    if echo && !data.is_empty() {
                        connection.send(data);
                    }
                    // A complete message on a stream means the peer is done.
                    if connection.protocol() == Some(Protocol::Tcp) {
                        connection.close();
                    } else {
                        connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
                    }
                })
                .on_connection_error(|error| {
                    eprintln!("connection error: {error}");
                });
            connection.receive(ReceiveRequest::new().with_min_incomplete_length(1));
        })
        .on_listen_error(|error| {
            eprintln!("{error}");
            std::process::exit(1);
        })
        .on_stopped(|| println!("stopped"));

    if let Some(identity) = args.identity {
        preconnection =
            preconnection.with_security_parameters(SecurityParameters::new().with_identity(identity));
    }

    let listener = preconnection.listen();
    for (protocol, addr) in listener.local_addrs().await {
        println!("listening on {protocol} {addr}");
    }

    tokio::signal::ctrl_c().await?;
    listener.stop();
    Ok(())
}
