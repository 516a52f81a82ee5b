use bytes::Bytes;
use clap::Parser;
use rsipstream::{
    transport::{
        tls::create_acceptor, ConnectionContext, ConnectionTable, StreamListener, TlsConfig,
        TransportEvent,
    },
    Error, Result, SipMessage, TransportConfig,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::{select, sync::mpsc::unbounded_channel};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about = "Answers SIP requests received over TCP or TLS with 200 OK")]
struct Args {
    /// Address of the TCP listener
    #[arg(long, env = "SIP_ECHO_TCP", default_value = "0.0.0.0:5060")]
    tcp: SocketAddr,

    /// Address of the TLS listener, requires --cert and --key
    #[arg(long, env = "SIP_ECHO_TLS")]
    tls: Option<SocketAddr>,

    /// PEM certificate chain for the TLS listener
    #[arg(long, env = "SIP_ECHO_CERT")]
    cert: Option<String>,

    /// PEM private key for the TLS listener
    #[arg(long, env = "SIP_ECHO_KEY")]
    key: Option<String>,

    /// Largest message accepted on a connection, in bytes
    #[arg(long, env = "SIP_ECHO_MAX_MESSAGE_SIZE")]
    max_message_size: Option<usize>,
}

/// Builds the 200 OK for `request`, copying the headers a UAC matches
/// responses with. Returns None for responses and ACK.
fn echo_response(request: &SipMessage) -> Option<String> {
    match request.method() {
        None | Some("ACK") => return None,
        Some(_) => {}
    }
    let mut response = String::from("SIP/2.0 200 OK\r\n");
    for name in ["Via", "From", "To", "Call-ID", "CSeq"] {
        for value in request.header_values(name) {
            response.push_str(name);
            response.push_str(": ");
            response.push_str(value);
            response.push_str("\r\n");
        }
    }
    response.push_str("Content-Length: 0\r\n\r\n");
    Some(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();

    let args = Args::parse();
    if args.tls.is_some() && (args.cert.is_none() || args.key.is_none()) {
        return Err(Error::Error(
            "--tls requires both --cert and --key".to_string(),
        ));
    }

    let mut config = TransportConfig::default();
    if let Some(size) = args.max_message_size {
        config = config.with_max_message_size(size);
    }

    let token = CancellationToken::new();
    let (sender, mut receiver) = unbounded_channel();
    let table = ConnectionTable::with_events(sender.clone());
    let ctx = ConnectionContext::new(config, Arc::new(table.clone()), Arc::new(sender));

    let tcp = StreamListener::bind(args.tcp, None, None).await?;
    tcp.serve_listener(token.child_token(), ctx.clone())?;
    info!("listening on {}", tcp);

    if let (Some(addr), Some(cert), Some(key)) = (args.tls, args.cert, args.key) {
        let tls_config = TlsConfig::from_pem_files(&cert, &key)?;
        let tls = StreamListener::bind(addr, Some(create_acceptor(&tls_config)?), None).await?;
        tls.serve_listener(token.child_token(), ctx.clone())?;
        info!("listening on {}", tls);
    }

    loop {
        select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down, {} connections open", table.len());
                break;
            }
            event = receiver.recv() => match event {
                Some(TransportEvent::Incoming(msg, conn, source)) => {
                    info!(%source, "received {}", msg.start_line());
                    if let Some(response) = echo_response(&msg) {
                        if let Err(e) = conn.write_message(Bytes::from(response)) {
                            warn!(identity = %conn.identity(), "failed to answer: {}", e);
                        }
                    }
                }
                Some(TransportEvent::New(conn)) => info!(identity = %conn.identity(), "new connection"),
                Some(TransportEvent::Closed(conn)) => info!(identity = %conn.identity(), "connection closed"),
                None => break,
            }
        }
    }
    token.cancel();
    table.stop_all();
    Ok(())
}
