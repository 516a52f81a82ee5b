use crate::Result;
use rsip::{host_with_port, transport::Transport, HostWithPort};
use std::{fmt, hash::Hash, net::SocketAddr};

/// Port used when a target carries none (or 0).
pub const DEFAULT_SIP_PORT: u16 = 5060;

/// SIP Address
///
/// `SipAddr` combines a host/port with the transport scheme it is reached
/// over. Stream connections only ever carry `TCP` or `TLS`.
///
/// # Examples
///
/// ```rust
/// use rsipstream::transport::SipAddr;
/// use rsip::transport::Transport;
/// use std::net::SocketAddr;
///
/// let socket_addr: SocketAddr = "192.168.1.100:5060".parse().unwrap();
/// let sip_addr = SipAddr::from(socket_addr);
/// assert_eq!(sip_addr.get_socketaddr().unwrap(), socket_addr);
///
/// let sip_addr = SipAddr::new(
///     Transport::Tls,
///     rsip::HostWithPort::try_from("example.com:5061").unwrap(),
/// );
/// assert_eq!(sip_addr.port(), 5061);
///
/// // a zero port falls back to 5060
/// let sip_addr = SipAddr::from("10.0.0.1:0".parse::<SocketAddr>().unwrap());
/// assert_eq!(sip_addr.port(), 5060);
/// ```
#[derive(Debug, Eq, PartialEq, Clone, Default)]
pub struct SipAddr {
    pub r#type: Option<Transport>,
    pub addr: HostWithPort,
}

impl fmt::Display for SipAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SipAddr {
                r#type: Some(r#type),
                addr,
            } => write!(f, "{} {}", r#type, addr),
            SipAddr { r#type: None, addr } => write!(f, "{}", addr),
        }
    }
}

impl Hash for SipAddr {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.r#type.hash(state);
        match self.addr.host {
            host_with_port::Host::Domain(ref domain) => domain.hash(state),
            host_with_port::Host::IpAddr(ref ip_addr) => ip_addr.hash(state),
        }
        if let Some(port) = self.addr.port {
            port.value().hash(state);
        }
    }
}

impl SipAddr {
    pub fn new(transport: Transport, addr: HostWithPort) -> Self {
        SipAddr {
            r#type: Some(transport),
            addr,
        }
    }

    pub fn port(&self) -> u16 {
        match self.addr.port.map(|p| *p.value()) {
            Some(0) | None => DEFAULT_SIP_PORT,
            Some(port) => port,
        }
    }

    /// The same address with a missing or zero port replaced by 5060.
    pub fn with_default_port(mut self) -> Self {
        self.addr.port = Some(self.port().into());
        self
    }

    pub fn get_socketaddr(&self) -> Result<SocketAddr> {
        match &self.addr.host {
            host_with_port::Host::Domain(domain) => Err(crate::Error::Error(format!(
                "Cannot convert domain {} to SocketAddr",
                domain
            ))),
            host_with_port::Host::IpAddr(ip_addr) => Ok(SocketAddr::new(*ip_addr, self.port())),
        }
    }

    /// Resolves the address, looking the host up when it is a domain.
    pub async fn resolve(&self) -> Result<SocketAddr> {
        if let Ok(addr) = self.get_socketaddr() {
            return Ok(addr);
        }
        let host = self.addr.host.to_string();
        let mut addrs = tokio::net::lookup_host((host.as_str(), self.port())).await?;
        let first = addrs.next();
        first.ok_or_else(|| {
            crate::Error::TransportLayerError(
                format!("no address found for {}", host),
                self.clone(),
            )
        })
    }
}

/// Identity of a connection as it appears in logs: scheme, id and the
/// local/remote endpoints known so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionIdentity {
    pub id: u64,
    pub scheme: Transport,
    pub local: Option<SipAddr>,
    pub remote: Option<SipAddr>,
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ", self.scheme, self.id)?;
        match &self.local {
            Some(local) => write!(f, "{}", local.addr)?,
            None => write!(f, "-")?,
        }
        match &self.remote {
            Some(remote) => write!(f, " -> {}", remote.addr),
            None => write!(f, " -> -"),
        }
    }
}

impl From<&SipAddr> for rsip::Uri {
    fn from(addr: &SipAddr) -> Self {
        let scheme = match addr.r#type {
            Some(Transport::Tls) => rsip::Scheme::Sips,
            _ => rsip::Scheme::Sip,
        };
        rsip::Uri {
            scheme: Some(scheme),
            host_with_port: addr.addr.clone(),
            ..Default::default()
        }
    }
}

impl From<SocketAddr> for SipAddr {
    fn from(addr: SocketAddr) -> Self {
        SipAddr {
            r#type: None,
            addr: addr.into(),
        }
    }
}

impl From<HostWithPort> for SipAddr {
    fn from(host_with_port: HostWithPort) -> Self {
        SipAddr {
            r#type: None,
            addr: host_with_port,
        }
    }
}

impl TryFrom<&rsip::Uri> for SipAddr {
    type Error = crate::Error;

    fn try_from(uri: &rsip::Uri) -> Result<Self> {
        let r#type = uri.transport().cloned().or_else(|| match uri.scheme {
            Some(rsip::Scheme::Sips) => Some(Transport::Tls),
            _ => None,
        });
        Ok(SipAddr {
            r#type,
            addr: uri.host_with_port.clone(),
        })
    }
}
