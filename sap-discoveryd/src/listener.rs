use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Bound,
    Joined,
    Running,
    Terminated,
}

/// UDP endpoint for SAP traffic. Setup moves it Idle -> Bound -> Joined,
/// the reactor moves it to Running and finally Terminated.
pub struct SapListener {
    state: ListenerState,
    socket: Option<Socket>,
    running: Option<UdpSocket>,
    joined: Vec<Ipv4Addr>,
}

impl SapListener {
    pub fn new() -> Self {
        Self {
            state: ListenerState::Idle,
            socket: None,
            running: None,
            joined: Vec::new(),
        }
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        if let Some(socket) = &self.running {
            return Ok(socket.local_addr()?);
        }
        let socket = self.socket.as_ref().context("Listener is not bound")?;
        socket
            .local_addr()?
            .as_socket()
            .context("Listener bound to a non-IP address")
    }

    /// Bind to `0.0.0.0:<port>` with address reuse so several listeners can
    /// share the SAP port.
    pub fn bind(&mut self, port: u16) -> Result<()> {
        if self.state != ListenerState::Idle {
            anyhow::bail!("Cannot bind listener in state {:?}", self.state);
        }

        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .context("Failed to create UDP socket")?;
        socket
            .set_reuse_address(true)
            .context("Failed to set SO_REUSEADDR")?;
        #[cfg(unix)]
        socket
            .set_reuse_port(true)
            .context("Failed to set SO_REUSEPORT")?;
        socket
            .set_nonblocking(true)
            .context("Failed to set socket non-blocking")?;

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        socket
            .bind(&addr.into())
            .with_context(|| format!("Failed to bind to {}", addr))?;

        tracing::debug!("Bound SAP socket to {}", addr);
        self.socket = Some(socket);
        self.state = ListenerState::Bound;
        Ok(())
    }

    /// Join `group` on the named interface, or on every non-loopback IPv4
    /// interface when `interface` is `None`.
    pub fn join(&mut self, group: Ipv4Addr, interface: Option<&str>) -> Result<()> {
        if self.state != ListenerState::Bound {
            anyhow::bail!("Cannot join multicast group in state {:?}", self.state);
        }
        let socket = self.socket.as_ref().context("Listener is not bound")?;

        match interface {
            Some(name) => {
                let addr = interface_addr(name)?;
                socket
                    .join_multicast_v4(&group, &addr)
                    .with_context(|| format!("Failed to join {} on {} ({})", group, name, addr))?;
                tracing::info!("Joined {} on {} ({})", group, name, addr);
                self.joined.push(addr);
            }
            None => {
                for addr in ipv4_interfaces()? {
                    match socket.join_multicast_v4(&group, &addr) {
                        Ok(()) => {
                            tracing::debug!("Joined {} on {}", group, addr);
                            self.joined.push(addr);
                        }
                        Err(e) => tracing::warn!("Failed to join {} on {}: {}", group, addr, e),
                    }
                }
                if self.joined.is_empty() {
                    // Let the kernel pick the interface
                    socket
                        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
                        .with_context(|| format!("Failed to join {}", group))?;
                    self.joined.push(Ipv4Addr::UNSPECIFIED);
                }
                tracing::info!("Joined {} on {} interface(s)", group, self.joined.len());
            }
        }

        self.state = ListenerState::Joined;
        Ok(())
    }

    /// Register the socket with the runtime. Must be called inside a tokio
    /// runtime.
    pub fn start(&mut self) -> Result<()> {
        if !matches!(self.state, ListenerState::Bound | ListenerState::Joined) {
            anyhow::bail!("Cannot start listener in state {:?}", self.state);
        }
        let socket = self.socket.take().context("Listener is not bound")?;
        let socket = UdpSocket::from_std(socket.into())
            .context("Failed to register socket with the runtime")?;

        self.running = Some(socket);
        self.state = ListenerState::Running;
        Ok(())
    }

    /// Wait for the next datagram
    pub async fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        match &self.running {
            Some(socket) => socket.recv_from(buf).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "listener is not running",
            )),
        }
    }

    /// Release the socket. Dropping it leaves the multicast group.
    pub fn close(&mut self) {
        self.running = None;
        self.socket = None;
        self.state = ListenerState::Terminated;
    }
}

impl Default for SapListener {
    fn default() -> Self {
        Self::new()
    }
}

fn interface_addr(name: &str) -> Result<Ipv4Addr> {
    let interfaces = get_if_addrs::get_if_addrs().context("Failed to enumerate interfaces")?;
    interfaces
        .iter()
        .filter(|iface| iface.name == name)
        .find_map(|iface| match iface.ip() {
            std::net::IpAddr::V4(addr) => Some(addr),
            std::net::IpAddr::V6(_) => None,
        })
        .with_context(|| format!("Interface {} has no IPv4 address", name))
}

fn ipv4_interfaces() -> Result<Vec<Ipv4Addr>> {
    let interfaces = get_if_addrs::get_if_addrs().context("Failed to enumerate interfaces")?;
    let mut addrs: Vec<Ipv4Addr> = interfaces
        .iter()
        .filter_map(|iface| match iface.ip() {
            std::net::IpAddr::V4(addr) if !addr.is_loopback() => Some(addr),
            _ => None,
        })
        .collect();
    addrs.dedup();
    Ok(addrs)
}
