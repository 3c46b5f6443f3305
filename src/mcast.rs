// src/mcast.rs
//
// Multicast upstream driver: group (or source-specific) join on the selected
// interface, non-blocking receive into pool buffers, optional periodic
// LEAVE+JOIN to force a fresh IGMP report through flaky access hardware.
use crate::config::Config;
use crate::service::Service;
use anyhow::{bail, Context};
use log::{debug, warn};
use socket2::{Domain, InterfaceIndexOrAddress, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

pub struct McastSource {
    sock: Socket,
    group: SocketAddr,
    source: Option<IpAddr>,
    iface_index: u32,
    iface_v4: Option<Ipv4Addr>,
    next_rejoin_ms: u64,
}

impl McastSource {
    /// Join the service's group. Interface priority: the multicast-specific
    /// selector, else the default upstream selector, else kernel routing.
    pub fn join(service: &Service, cfg: &Config, now_ms: u64) -> anyhow::Result<Self> {
        let group = service.addr.context("service has no multicast address")?;
        let iface_name = cfg
            .iface_mcast
            .as_deref()
            .or(cfg.iface_default.as_deref());
        let (iface_index, iface_v4) = match iface_name {
            Some(name) => {
                let idx = crate::net::iface_index(name);
                if idx == 0 {
                    warn!("multicast interface {name} not found, using routing default");
                }
                (idx, crate::net::iface_ipv4(name))
            }
            None => (0, None),
        };

        let domain = Domain::for_address(group);
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).context("socket")?;
        sock.set_reuse_address(true).ok();
        if cfg.upstream_rcvbuf > 0 {
            let _ = sock.set_recv_buffer_size(cfg.upstream_rcvbuf);
        }
        // Bind the group address itself so concurrent joins on the same port
        // do not cross-feed; fall back to wildcard where that is refused.
        if sock.bind(&group.into()).is_err() {
            let any: SocketAddr = match group {
                SocketAddr::V4(_) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), group.port()),
                SocketAddr::V6(_) => {
                    SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), group.port())
                }
            };
            sock.bind(&any.into())
                .with_context(|| format!("bind {group}"))?;
        }

        let mut src = Self {
            sock,
            group,
            source: service.source,
            iface_index,
            iface_v4,
            next_rejoin_ms: if cfg.mcast_rejoin_interval > 0 {
                now_ms + cfg.mcast_rejoin_interval * 1000
            } else {
                u64::MAX
            },
        };
        src.join_group()?;
        src.sock.set_nonblocking(true).context("set_nonblocking")?;
        Ok(src)
    }

    fn join_group(&self) -> anyhow::Result<()> {
        match (self.group.ip(), self.source) {
            (IpAddr::V4(group), Some(IpAddr::V4(source))) => {
                // IGMPv3 source-specific join.
                let iface = self.iface_v4.unwrap_or(Ipv4Addr::UNSPECIFIED);
                self.sock
                    .join_ssm_v4(&source, &group, &iface)
                    .with_context(|| format!("source join {source}@{group}"))?;
            }
            (IpAddr::V4(group), None) => {
                self.sock
                    .join_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(self.iface_index))
                    .with_context(|| format!("join {group}"))?;
            }
            (IpAddr::V6(group), None) => {
                self.sock
                    .join_multicast_v6(&group, self.iface_index)
                    .with_context(|| format!("join {group}"))?;
            }
            (IpAddr::V6(_), Some(_)) => bail!("source-specific IPv6 join not supported"),
            (IpAddr::V4(_), Some(IpAddr::V6(_))) => bail!("mixed-family source group"),
        }
        Ok(())
    }

    fn leave_group(&self) {
        match (self.group.ip(), self.source) {
            (IpAddr::V4(group), Some(IpAddr::V4(source))) => {
                let iface = self.iface_v4.unwrap_or(Ipv4Addr::UNSPECIFIED);
                let _ = self.sock.leave_ssm_v4(&source, &group, &iface);
            }
            (IpAddr::V4(group), _) => {
                let _ = self
                    .sock
                    .leave_multicast_v4_n(&group, &InterfaceIndexOrAddress::Index(self.iface_index));
            }
            (IpAddr::V6(group), _) => {
                let _ = self.sock.leave_multicast_v6(&group, self.iface_index);
            }
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.sock.as_raw_fd()
    }

    /// Periodic LEAVE+JOIN. Returns the next deadline so the worker can fold
    /// it into its wake computation.
    pub fn maybe_rejoin(&mut self, now_ms: u64, interval_secs: u64) -> u64 {
        if interval_secs == 0 || now_ms < self.next_rejoin_ms {
            return self.next_rejoin_ms;
        }
        debug!("rejoining {}", self.group);
        self.leave_group();
        if let Err(e) = self.join_group() {
            warn!("rejoin {} failed: {e:#}", self.group);
        }
        self.next_rejoin_ms = now_ms + interval_secs * 1000;
        self.next_rejoin_ms
    }

    #[inline]
    pub fn next_rejoin_ms(&self) -> u64 {
        self.next_rejoin_ms
    }
}

impl Drop for McastSource {
    fn drop(&mut self) {
        self.leave_group();
    }
}
