use super::{connection::StreamedConnection, SipAddr};
use crate::{config::TransportConfig, message::SipMessage};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Clone, Debug)]
pub enum TransportEvent {
    Incoming(SipMessage, StreamedConnection, SipAddr),
    New(StreamedConnection),
    Closed(StreamedConnection),
}

pub type TransportReceiver = UnboundedReceiver<TransportEvent>;
pub type TransportSender = UnboundedSender<TransportEvent>;

/// Registry of live connections.
///
/// A connection calls `start` once it becomes active and `stop` exactly
/// once when it is torn down. Implementations must tolerate `stop` for a
/// connection they never saw.
pub trait ConnectionManager: Send + Sync {
    fn start(&self, connection: StreamedConnection);
    fn stop(&self, connection: &StreamedConnection);
}

/// Receives every framed message, in the order it was read.
///
/// Called from the connection's read loop; must not block.
pub trait MessageDispatch: Send + Sync {
    fn on_received_message(&self, message: SipMessage, connection: &StreamedConnection);
}

impl MessageDispatch for TransportSender {
    fn on_received_message(&self, message: SipMessage, connection: &StreamedConnection) {
        let source = connection.remote_addr().unwrap_or_default();
        if let Err(e) = self.send(TransportEvent::Incoming(
            message,
            connection.clone(),
            source,
        )) {
            warn!(identity = %connection.identity(), "Error sending incoming message: {:?}", e);
        }
    }
}

/// Everything a connection needs from its surroundings.
#[derive(Clone)]
pub struct ConnectionContext {
    pub config: TransportConfig,
    pub manager: Arc<dyn ConnectionManager>,
    pub dispatch: Arc<dyn MessageDispatch>,
    /// Parent of every connection's own token.
    pub cancel_token: CancellationToken,
}

impl ConnectionContext {
    pub fn new(
        config: TransportConfig,
        manager: Arc<dyn ConnectionManager>,
        dispatch: Arc<dyn MessageDispatch>,
    ) -> Self {
        Self {
            config,
            manager,
            dispatch,
            cancel_token: CancellationToken::new(),
        }
    }

    pub fn with_cancel_token(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }
}

/// Connection manager keyed by connection id.
///
/// Emits [`TransportEvent::New`] and [`TransportEvent::Closed`] when a
/// sender is attached.
#[derive(Clone, Default)]
pub struct ConnectionTable {
    connections: Arc<Mutex<HashMap<u64, StreamedConnection>>>,
    sender: Option<TransportSender>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(sender: TransportSender) -> Self {
        Self {
            connections: Arc::default(),
            sender: Some(sender),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<u64, StreamedConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn connections(&self) -> Vec<StreamedConnection> {
        self.table().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table().is_empty()
    }

    pub fn get(&self, id: u64) -> Option<StreamedConnection> {
        self.table().get(&id).cloned()
    }

    pub fn find_by_remote(&self, remote: &SipAddr) -> Option<StreamedConnection> {
        self.table()
            .values()
            .find(|conn| {
                conn.remote_addr().is_some_and(|addr| {
                    addr.addr == remote.addr
                        && (remote.r#type.is_none() || addr.r#type == remote.r#type)
                })
            })
            .cloned()
    }

    /// Stops every registered connection. Each one unregisters itself as
    /// its read loop winds down.
    pub fn stop_all(&self) {
        for conn in self.connections() {
            conn.stop();
        }
    }

    fn notify(&self, event: TransportEvent) {
        if let Some(sender) = &self.sender {
            if let Err(e) = sender.send(event) {
                debug!("connection event dropped: {:?}", e);
            }
        }
    }
}

impl ConnectionManager for ConnectionTable {
    fn start(&self, connection: StreamedConnection) {
        let added = {
            let mut table = self.table();
            if table.contains_key(&connection.id()) {
                false
            } else {
                table.insert(connection.id(), connection.clone());
                true
            }
        };
        if added {
            debug!(identity = %connection.identity(), "connection registered");
            self.notify(TransportEvent::New(connection));
        }
    }

    fn stop(&self, connection: &StreamedConnection) {
        let removed = self.table().remove(&connection.id());
        if let Some(connection) = removed {
            debug!(identity = %connection.identity(), "connection unregistered");
            self.notify(TransportEvent::Closed(connection));
        }
    }
}
