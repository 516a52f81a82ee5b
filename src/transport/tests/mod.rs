use crate::{
    transport::{
        ConnectionContext, ConnectionManager, ConnectionState, StreamedConnection,
        TransportEvent, TransportReceiver,
    },
    Result, TransportConfig,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::mpsc::unbounded_channel,
    time::{sleep, timeout},
};


/// Counts manager calls without tracking connections.
#[derive(Default)]
pub struct RecordingManager {
    pub started: AtomicUsize,
    pub stopped: AtomicUsize,
}

impl RecordingManager {
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    pub fn stopped(&self) -> usize {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl ConnectionManager for RecordingManager {
    fn start(&self, _connection: StreamedConnection) {
        self.started.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self, _connection: &StreamedConnection) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_file(true)
        .with_line_number(true)
        .with_test_writer()
        .try_init()
        .ok();
}

/// A context whose manager is a [`RecordingManager`] and whose dispatch
/// sink is an event channel.
pub fn recording_context(
    config: TransportConfig,
) -> (ConnectionContext, Arc<RecordingManager>, TransportReceiver) {
    let manager = Arc::new(RecordingManager::default());
    let (sender, receiver) = unbounded_channel();
    let ctx = ConnectionContext::new(config, manager.clone(), Arc::new(sender));
    (ctx, manager, receiver)
}

/// Server side connection plus the raw client socket talking to it.
pub async fn accepted_pair(ctx: ConnectionContext) -> Result<(StreamedConnection, TcpStream)> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let client = TcpStream::connect(listener.local_addr()?).await?;
    let (server, _) = listener.accept().await?;
    let connection = StreamedConnection::accept(server, ctx)?;
    Ok((connection, client))
}

pub fn register_message(call_id: &str) -> String {
    format!(
        "REGISTER sip:example.com SIP/2.0\r\n\
         Via: SIP/2.0/TCP 127.0.0.1:5060;branch=z9hG4bK-{}\r\n\
         From: <sip:alice@example.com>;tag={}\r\n\
         To: <sip:alice@example.com>\r\n\
         Call-ID: {}\r\n\
         CSeq: 1 REGISTER\r\n\
         Contact: <sip:alice@127.0.0.1:5060>\r\n\
         Max-Forwards: 70\r\n\
         Content-Length: 0\r\n\r\n",
        call_id, call_id, call_id
    )
}

/// Helper function to wait for transport events with timeout
pub async fn wait_for_event(receiver: &mut TransportReceiver) -> Result<TransportEvent> {
    match timeout(Duration::from_secs(5), receiver.recv()).await {
        Ok(Some(event)) => Ok(event),
        Ok(None) => Err(crate::Error::Error("Channel closed".to_string())),
        Err(_) => Err(crate::Error::Error("Timeout waiting for event".to_string())),
    }
}

pub async fn wait_for_state(connection: &StreamedConnection, state: ConnectionState) -> Result<()> {
    for _ in 0..500 {
        if connection.state() == state {
            return Ok(());
        }
        sleep(Duration::from_millis(10)).await;
    }
    Err(crate::Error::Error(format!(
        "Timeout waiting for {:?}, still {:?}",
        state,
        connection.state()
    )))
}

/// Waits for the next incoming message and returns its Call-ID.
pub async fn expect_incoming(receiver: &mut TransportReceiver) -> Result<String> {
    match wait_for_event(receiver).await? {
        TransportEvent::Incoming(msg, _, _) => Ok(msg.header("Call-ID").unwrap_or_default().to_string()),
        other => Err(crate::Error::Error(format!("Expected incoming message, got {:?}", other))),
    }
}
