// src/playlist.rs
//
// M3U playlist handling: `[services]` sections and external playlists are
// ingested into Service records, and /playlist.m3u re-emits the set with
// every URL pointing back at this gateway.
use crate::http::url_encode;
use crate::service::{resolve_host_port, Service, ServiceKind};
use log::warn;

/// One `#EXTINF` entry before URL substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub url: String,
    pub catchup_source: Option<String>,
}

/// Split a playlist into (name, url) entries. Lines that do not belong to a
/// recognized entry are skipped.
pub fn parse_entries(text: &str) -> Vec<Entry> {
    let mut out = Vec::new();
    let mut pending: Option<(String, Option<String>)> = None;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line == "#EXTM3U" {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            // `#EXTINF:<dur> [attrs],<display name>`
            let name = rest.rsplit_once(',').map_or("", |(_, n)| n).trim();
            let catchup = attr_value(rest, "catchup-source");
            pending = Some((name.to_string(), catchup));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let (name, catchup) = pending.take().unwrap_or_default();
        let name = if name.is_empty() {
            line.to_string()
        } else {
            name
        };
        out.push(Entry {
            name,
            url: line.to_string(),
            catchup_source: catchup,
        });
    }
    out
}

fn attr_value(extinf: &str, key: &str) -> Option<String> {
    let start = extinf.find(&format!("{key}=\""))? + key.len() + 2;
    let rest = &extinf[start..];
    let end = rest.find('"')?;
    Some(rest[..end].to_string())
}

/// Parse a full playlist into services. Unknown schemes and bad addresses
/// log-and-skip; a playlist never fails wholesale.
pub fn parse_m3u(text: &str) -> Vec<Service> {
    let mut services = Vec::new();
    for entry in parse_entries(text) {
        match service_from_url(&entry.name, &entry.url) {
            Ok(Some(mut svc)) => {
                svc.catchup_source = entry.catchup_source;
                services.push(svc);
            }
            Ok(None) => {}
            Err(e) => warn!("playlist: skipping {}: {e:#}", entry.name),
        }
    }
    services
}

/// Map one playlist URL to a service. `rtp://[source@]group[:port][?fcc=..]`,
/// `udp://group[:port]`, `rtsp://…`. Returns Ok(None) for foreign schemes.
fn service_from_url(name: &str, raw: &str) -> anyhow::Result<Option<Service>> {
    let (scheme, rest) = match raw.split_once("://") {
        Some(x) => x,
        None => return Ok(None),
    };
    match scheme.to_ascii_lowercase().as_str() {
        "rtp" | "udp" => {
            let (addr_part, query) = rest.split_once('?').unwrap_or((rest, ""));
            let (source, group) = match addr_part.split_once('@') {
                Some((s, g)) => (Some(s), g),
                None => (None, addr_part),
            };
            let addr = resolve_host_port(group.trim_end_matches('/'), 1234)?;
            anyhow::ensure!(addr.ip().is_multicast(), "{group}: not multicast");
            let mut svc = Service::multicast(name, addr, scheme.eq_ignore_ascii_case("rtp"));
            if let Some(src) = source {
                svc.source = Some(src.parse()?);
            }
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                if k == "fcc" {
                    svc.fcc_addr = Some(resolve_host_port(v, 0)?);
                }
            }
            Ok(Some(svc))
        }
        "rtsp" => Ok(Some(Service::rtsp(name, raw))),
        _ => Ok(None),
    }
}

/// Emit the transformed playlist: same entries, URLs rewritten to address
/// this gateway. `base` is `http://host[:port]` with no trailing slash.
pub fn render(services: &[Service], base: &str) -> String {
    let mut out = String::with_capacity(64 + services.len() * 64);
    out.push_str("#EXTM3U\n");
    for svc in services {
        out.push_str("#EXTINF:-1");
        if let Some(cs) = &svc.catchup_source {
            out.push_str(" catchup=\"default\" catchup-source=\"");
            out.push_str(cs);
            out.push('"');
        }
        out.push(',');
        out.push_str(&svc.name);
        out.push('\n');
        out.push_str(base);
        out.push('/');
        out.push_str(&url_encode(&svc.name));
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "#EXTM3U\n#EXTINF:-1 ,CCTV1\nrtp://239.0.0.1:5000\n#EXTINF:-1,CCTV2\nudp://239.0.0.2:5001\n#EXTINF:-1,Live\nrtsp://example.com/ch\n";

    #[test]
    fn parses_kinds() {
        let svcs = parse_m3u(SAMPLE);
        assert_eq!(svcs.len(), 3);
        assert_eq!(svcs[0].name, "CCTV1");
        assert_eq!(svcs[0].kind, ServiceKind::Mrtp);
        assert_eq!(svcs[1].kind, ServiceKind::Mudp);
        assert_eq!(svcs[2].kind, ServiceKind::Rtsp);
    }

    #[test]
    fn source_specific_and_fcc() {
        let svcs = parse_m3u("#EXTM3U\n#EXTINF:-1,X\nrtp://10.1.1.1@239.0.0.1:5000?fcc=10.2.2.2:8027\n");
        assert_eq!(svcs.len(), 1);
        assert_eq!(svcs[0].source.unwrap().to_string(), "10.1.1.1");
        assert_eq!(svcs[0].fcc_addr.unwrap().to_string(), "10.2.2.2:8027");
    }

    #[test]
    fn catchup_source_attribute() {
        let svcs = parse_m3u(
            "#EXTM3U\n#EXTINF:-1 catchup-source=\"rtsp://h/ch?playseek={utc:YmdHMS}\",X\nrtp://239.0.0.1:5000\n",
        );
        assert_eq!(
            svcs[0].catchup_source.as_deref(),
            Some("rtsp://h/ch?playseek={utc:YmdHMS}")
        );
    }

    #[test]
    fn render_points_at_gateway() {
        let svcs = parse_m3u(SAMPLE);
        let text = render(&svcs, "http://gw:5140");
        assert!(text.contains("http://gw:5140/CCTV1\n"));
        assert!(text.contains("#EXTINF:-1,CCTV2\n"));
    }

    #[test]
    fn transformed_playlist_reparses_to_same_entries() {
        let svcs = parse_m3u(SAMPLE);
        let text = render(&svcs, "http://gw:5140");
        let names: Vec<_> = parse_entries(&text).into_iter().map(|e| e.name).collect();
        let orig: Vec<_> = svcs.iter().map(|s| s.name.clone()).collect();
        assert_eq!(names, orig);
    }

    #[test]
    fn bad_lines_are_skipped() {
        let svcs = parse_m3u("#EXTM3U\n#EXTINF:-1,Bad\nrtp://not-multicast.example:12\n#EXTINF:-1,Ok\nrtp://239.9.9.9:1\n");
        assert_eq!(svcs.len(), 1);
        assert_eq!(svcs[0].name, "Ok");
    }
}
