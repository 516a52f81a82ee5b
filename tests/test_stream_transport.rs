use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use rsipstream::{
    transport::{
        ConnectionContext, ConnectionState, ConnectionTable, StreamListener, StreamedConnection,
        TransportEvent, TransportReceiver,
    },
    Result, TransportConfig,
};
use tokio::{sync::mpsc::unbounded_channel, time::timeout};
use tokio_util::sync::CancellationToken;

async fn next_event(receiver: &mut TransportReceiver) -> TransportEvent {
    timeout(Duration::from_secs(5), receiver.recv())
        .await
        .expect("event in time")
        .expect("channel open")
}

#[tokio::test]
async fn test_stream_transport() -> Result<()> {
    tracing_subscriber::fmt()
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .ok();
    let token = CancellationToken::new();

    let (server_sender, mut server_events) = unbounded_channel();
    let server_table = ConnectionTable::with_events(server_sender.clone());
    let server_ctx = ConnectionContext::new(
        TransportConfig::default(),
        Arc::new(server_table.clone()),
        Arc::new(server_sender),
    );
    let listener = StreamListener::bind("127.0.0.1:0".parse()?, None, None).await?;
    listener.serve_listener(token.child_token(), server_ctx)?;

    let (client_sender, mut client_events) = unbounded_channel();
    let client_table = ConnectionTable::with_events(client_sender.clone());
    let client_ctx = ConnectionContext::new(
        TransportConfig::default(),
        Arc::new(client_table.clone()),
        Arc::new(client_sender),
    )
    .with_cancel_token(token.child_token());
    let client = StreamedConnection::client(client_ctx);
    client.client_connect(listener.get_addr().clone()).await?;
    assert!(matches!(
        next_event(&mut client_events).await,
        TransportEvent::New(_)
    ));
    assert_eq!(client_table.len(), 1);

    let options = "OPTIONS sip:echo@127.0.0.1 SIP/2.0\r\n\
                   Via: SIP/2.0/TCP 127.0.0.1;branch=z9hG4bK-options\r\n\
                   From: <sip:probe@127.0.0.1>;tag=p1\r\n\
                   To: <sip:echo@127.0.0.1>\r\n\
                   Call-ID: transport-options\r\n\
                   CSeq: 7 OPTIONS\r\n\
                   Content-Length: 0\r\n\r\n";
    client.write_message(Bytes::from_static(options.as_bytes()))?;

    let server_conn = match next_event(&mut server_events).await {
        TransportEvent::New(conn) => conn,
        other => panic!("Expected new connection event, got {:?}", other),
    };
    match next_event(&mut server_events).await {
        TransportEvent::Incoming(msg, conn, source) => {
            assert_eq!(msg.method(), Some("OPTIONS"));
            assert_eq!(msg.header_param("Via", "branch"), Some("z9hG4bK-options"));
            assert_eq!(conn.id(), server_conn.id());
            assert_eq!(Some(source), server_conn.remote_addr());
            let request: rsip::SipMessage = msg.try_into()?;
            assert!(request.is_request());
            conn.write_message(Bytes::from_static(
                b"SIP/2.0 200 OK\r\nCall-ID: transport-options\r\nCSeq: 7 OPTIONS\r\nContent-Length: 0\r\n\r\n",
            ))?;
        }
        other => panic!("Expected incoming message, got {:?}", other),
    }
    match next_event(&mut client_events).await {
        TransportEvent::Incoming(msg, _, _) => {
            assert_eq!(msg.status_code(), Some(200));
            assert_eq!(msg.header("CSeq"), Some("7 OPTIONS"));
        }
        other => panic!("Expected response, got {:?}", other),
    }

    // cancelling the shared token closes both ends
    token.cancel();
    assert!(matches!(
        next_event(&mut client_events).await,
        TransportEvent::Closed(_)
    ));
    assert!(matches!(
        next_event(&mut server_events).await,
        TransportEvent::Closed(_)
    ));
    assert_eq!(client.state(), ConnectionState::Closed);
    assert!(client_table.is_empty());
    assert!(server_table.is_empty());
    Ok(())
}
