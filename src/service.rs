// src/service.rs
//
// Addressable stream sources. A Service is immutable once built; the worker
// looks services up by name in an O(1) map rebuilt on reload.
use anyhow::{bail, Context};
use hashbrown::HashMap;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Multicast RTP: payload is clipped out of RTP datagrams.
    Mrtp,
    /// Multicast UDP: datagrams forwarded verbatim.
    Mudp,
    /// Unicast RTSP client session.
    Rtsp,
}

impl ServiceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::Mrtp => "MRTP",
            ServiceKind::Mudp => "MUDP",
            ServiceKind::Rtsp => "RTSP",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Service {
    /// Unique key; doubles as the URL path component.
    pub name: String,
    pub kind: ServiceKind,
    /// Resolved multicast group (MRTP/MUDP).
    pub addr: Option<SocketAddr>,
    /// Source address for IGMPv3 source-specific joins.
    pub source: Option<IpAddr>,
    /// Fast-channel-change server, recorded but not spoken to from core.
    pub fcc_addr: Option<SocketAddr>,
    pub rtsp_url: Option<String>,
    /// Catchup/timeshift RTSP template from an M3U `catchup-source` attribute.
    pub catchup_source: Option<String>,
    /// Upstream User-Agent template; `{ua}` expands to the client's agent.
    pub user_agent: Option<String>,
}

impl Service {
    pub fn multicast(name: &str, addr: SocketAddr, rtp: bool) -> Self {
        Self {
            name: name.to_string(),
            kind: if rtp { ServiceKind::Mrtp } else { ServiceKind::Mudp },
            addr: Some(addr),
            source: None,
            fcc_addr: None,
            rtsp_url: None,
            catchup_source: None,
            user_agent: None,
        }
    }

    pub fn rtsp(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ServiceKind::Rtsp,
            addr: None,
            source: None,
            fcc_addr: None,
            rtsp_url: Some(url.to_string()),
            catchup_source: None,
            user_agent: None,
        }
    }

    /// One `[services]` config line:
    ///   `<name> MRTP <group[:port]> [source]`
    ///   `<name> MUDP <group[:port]>`
    ///   `<name> RTSP <rtsp-url>`
    pub fn from_config_line(line: &str) -> anyhow::Result<Self> {
        let mut it = line.split_whitespace();
        let name = it.next().context("missing service name")?;
        let kind = it.next().context("missing service kind")?;
        let target = it.next().context("missing service address")?;
        match kind.to_ascii_uppercase().as_str() {
            "MRTP" | "MUDP" => {
                let addr = resolve_host_port(target, 1234)?;
                if !addr.ip().is_multicast() {
                    bail!("{target}: not a multicast address");
                }
                let mut svc = Service::multicast(name, addr, kind.eq_ignore_ascii_case("MRTP"));
                if let Some(src) = it.next() {
                    let source: IpAddr = src.parse().with_context(|| format!("bad source {src}"))?;
                    svc.source = Some(source);
                }
                Ok(svc)
            }
            "RTSP" => Ok(Service::rtsp(name, target)),
            other => bail!("unknown service kind {other}"),
        }
    }
}

/// getaddrinfo-backed resolution of `host[:port]` with a default port.
pub fn resolve_host_port(s: &str, default_port: u16) -> anyhow::Result<SocketAddr> {
    let (host, port) = crate::util::split_host_port(s);
    let port: u16 = match port {
        Some(p) => p.parse().with_context(|| format!("bad port in {s}"))?,
        None => default_port,
    };
    // Fast path: numeric literal, no resolver round-trip.
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve {host}"))?
        .next()
        .with_context(|| format!("no address for {host}"))
}

pub type ServiceMap = HashMap<String, Service>;

/// Build the lookup map. Duplicate names get `/2`, `/3`, … suffixes so every
/// playlist entry stays addressable.
pub fn build_map(services: &[Service]) -> ServiceMap {
    let mut map = ServiceMap::with_capacity(services.len());
    for svc in services {
        if !map.contains_key(&svc.name) {
            map.insert(svc.name.clone(), svc.clone());
            continue;
        }
        let mut n = 2;
        loop {
            let key = format!("{}/{n}", svc.name);
            if !map.contains_key(&key) {
                let mut renamed = svc.clone();
                renamed.name = key.clone();
                map.insert(key, renamed);
                break;
            }
            n += 1;
        }
    }
    map
}

/// Listen endpoint from a `[bind]` line: `node service`, node `*` = any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAddr {
    pub node: Option<String>,
    pub service: String,
}

impl BindAddr {
    /// `[addr:]port` CLI form; IPv6 literals in brackets.
    pub fn from_cli(s: &str) -> anyhow::Result<Self> {
        let (host, port) = crate::util::split_host_port(s);
        match port {
            Some(p) => {
                p.parse::<u16>().with_context(|| format!("bad port in {s}"))?;
                Ok(Self {
                    node: Some(host.to_string()).filter(|h| !h.is_empty() && h != "*"),
                    service: p.to_string(),
                })
            }
            None => {
                host.parse::<u16>().with_context(|| format!("bad listen spec {s}"))?;
                Ok(Self {
                    node: None,
                    service: host.to_string(),
                })
            }
        }
    }

    pub fn resolve(&self) -> anyhow::Result<Vec<SocketAddr>> {
        let port: u16 = self
            .service
            .parse()
            .with_context(|| format!("bad service {}", self.service))?;
        match &self.node {
            None => Ok(vec![SocketAddr::new(IpAddr::from([0u8, 0, 0, 0]), port)]),
            Some(node) => {
                if let Ok(ip) = node.parse::<IpAddr>() {
                    return Ok(vec![SocketAddr::new(ip, port)]);
                }
                let addrs: Vec<_> = (node.as_str(), port)
                    .to_socket_addrs()
                    .with_context(|| format!("cannot resolve bind node {node}"))?
                    .collect();
                anyhow::ensure!(!addrs.is_empty(), "no address for bind node {node}");
                Ok(addrs)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_line_mrtp_with_source() {
        let svc = Service::from_config_line("CCTV1 MRTP 239.0.0.1:5000 10.1.1.1").unwrap();
        assert_eq!(svc.kind, ServiceKind::Mrtp);
        assert_eq!(svc.addr.unwrap().to_string(), "239.0.0.1:5000");
        assert_eq!(svc.source.unwrap().to_string(), "10.1.1.1");
    }

    #[test]
    fn config_line_rejects_unicast_group() {
        assert!(Service::from_config_line("x MRTP 10.0.0.1:5000").is_err());
    }

    #[test]
    fn config_line_rtsp() {
        let svc = Service::from_config_line("ch RTSP rtsp://example.com/live").unwrap();
        assert_eq!(svc.kind, ServiceKind::Rtsp);
        assert_eq!(svc.rtsp_url.as_deref(), Some("rtsp://example.com/live"));
    }

    #[test]
    fn map_collisions_get_suffixes() {
        let a = Service::multicast("ch", "239.0.0.1:1000".parse().unwrap(), true);
        let b = Service::multicast("ch", "239.0.0.2:1000".parse().unwrap(), true);
        let c = Service::multicast("ch", "239.0.0.3:1000".parse().unwrap(), true);
        let map = build_map(&[a, b, c]);
        assert_eq!(map.len(), 3);
        assert!(map.contains_key("ch"));
        assert!(map.contains_key("ch/2"));
        assert!(map.contains_key("ch/3"));
    }

    #[test]
    fn bind_from_cli() {
        assert_eq!(
            BindAddr::from_cli("5140").unwrap(),
            BindAddr {
                node: None,
                service: "5140".into()
            }
        );
        assert_eq!(
            BindAddr::from_cli("127.0.0.1:8080").unwrap(),
            BindAddr {
                node: Some("127.0.0.1".into()),
                service: "8080".into()
            }
        );
        assert_eq!(
            BindAddr::from_cli("[::1]:8080").unwrap().node.as_deref(),
            Some("::1")
        );
        assert!(BindAddr::from_cli("notaport").is_err());
    }
}
