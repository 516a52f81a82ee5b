use super::{
    connection::StreamedConnection, manager::ConnectionContext, sip_addr::SipAddr,
};
use crate::Result;
use rsip::transport::Transport;
use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};
use tokio::{net::TcpListener, select};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct StreamListenerInner {
    pub local_addr: SipAddr,
    pub external: Option<SipAddr>,
    acceptor: Option<TlsAcceptor>,
    listener: Mutex<Option<TcpListener>>,
}

/// Accepts TCP or TLS connections and serves each one as a
/// [`StreamedConnection`].
#[derive(Clone)]
pub struct StreamListener {
    pub inner: Arc<StreamListenerInner>,
}

impl StreamListener {
    /// Binds `local`; port 0 picks a free port, see [`get_addr`](Self::get_addr).
    /// With an acceptor every connection is TLS.
    pub async fn bind(
        local: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        external: Option<SocketAddr>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(local).await?;
        let scheme = match acceptor {
            Some(_) => Transport::Tls,
            None => Transport::Tcp,
        };
        let inner = StreamListenerInner {
            local_addr: SipAddr::new(scheme, listener.local_addr()?.into()),
            external: external.map(|addr| SipAddr::new(scheme, addr.into())),
            acceptor,
            listener: Mutex::new(Some(listener)),
        };
        info!("Created {} listener on {}", scheme, inner.local_addr);
        Ok(StreamListener {
            inner: Arc::new(inner),
        })
    }

    /// Spawns the accept loop. Accepted connections get a child of
    /// `cancel_token`, so cancelling it also closes them.
    pub fn serve_listener(&self, cancel_token: CancellationToken, ctx: ConnectionContext) -> Result<()> {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(listener) = listener else {
            return Err(crate::Error::TransportLayerError(
                "listener already serving".to_string(),
                self.inner.local_addr.clone(),
            ));
        };
        let ctx = ctx.with_cancel_token(cancel_token.clone());
        let acceptor = self.inner.acceptor.clone();
        let local_addr = self.inner.local_addr.clone();

        tokio::spawn(async move {
            loop {
                let (stream, remote_addr) = select! {
                    _ = cancel_token.cancelled() => {
                        info!(%local_addr, "listener stopped");
                        break;
                    }
                    result = listener.accept() => match result {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(%local_addr, "Failed to accept connection: {:?}", e);
                            continue;
                        }
                    },
                };
                stream.set_nodelay(true).ok();
                debug!(%local_addr, %remote_addr, "accepted connection");

                let ctx = ctx.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let result = match acceptor {
                        Some(acceptor) => {
                            StreamedConnection::accept_tls(stream, &acceptor, ctx).await
                        }
                        None => StreamedConnection::accept(stream, ctx),
                    };
                    if let Err(e) = result {
                        warn!(%remote_addr, "Dropping connection: {}", e);
                    }
                });
            }
        });
        Ok(())
    }

    pub fn get_addr(&self) -> &SipAddr {
        if let Some(external) = &self.inner.external {
            external
        } else {
            &self.inner.local_addr
        }
    }

    pub fn local_addr(&self) -> &SipAddr {
        &self.inner.local_addr
    }
}

impl fmt::Display for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listener {}", self.get_addr())
    }
}

impl fmt::Debug for StreamListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
