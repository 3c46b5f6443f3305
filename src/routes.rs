// src/routes.rs
//
// Request routing and the non-streaming handlers. Order matters: token gate,
// hostname gate, exact-path pages, UDPxy-compatible prefixes, then the
// service map.
use crate::connection::{Action, ConnState, Connection};
use crate::http::{self, url_decode, ResponseHead};
use crate::mcast::McastSource;
use crate::rtp::SeqTracker;
use crate::rtsp::{self, RtspSession};
use crate::service::{resolve_host_port, Service, ServiceKind};
use crate::stream::{StreamCtx, Upstream};
use crate::worker::{FdOwner, Reactor, Resources};
use crate::net::EV_IN;
use log::{debug, info};
use std::sync::atomic::Ordering;

const PLAYER_HTML: &str = "<!doctype html>\n<html><head><title>rtp2httpd</title></head>\n<body><video controls autoplay src=\"\"></video>\n<script>const v=document.querySelector('video');v.src=new URLSearchParams(location.search).get('src')||'';</script>\n</body></html>\n";

pub fn dispatch(conn: &mut Connection, rt: &mut Reactor, res: &mut Resources) -> Action {
    if conn.req.method != "GET" {
        respond_error(conn, res, 400);
        return Action::None;
    }

    // Access token: query parameter, cookie, or a R2HTOKEN/<token> marker in
    // the User-Agent.
    if let Some(token) = &res.cfg.token {
        let ok = conn.req.query_value("r2h-token") == Some(token.as_str())
            || conn.req.cookie_value("r2h-token") == Some(token.as_str())
            || conn
                .req
                .user_agent
                .as_deref()
                .map(|ua| ua.contains(&format!("R2HTOKEN/{token}")))
                .unwrap_or(false);
        if !ok {
            respond_error(conn, res, 401);
            return Action::None;
        }
    }

    // Hostname gate: Host header's name part, ports ignored.
    if let Some(expect) = &res.cfg.hostname {
        let got = conn
            .req
            .host
            .as_deref()
            .map(|h| crate::util::split_host_port(h).0.to_ascii_lowercase());
        if got.as_deref() != Some(expect.as_str()) {
            respond_error(conn, res, 404);
            return Action::None;
        }
    }

    let raw_path = conn.req.path().to_string();
    let path = url_decode(http::strip_label_suffix(&raw_path));

    if path == res.cfg.status_page_path {
        // EventSource clients ask the page itself with an SSE Accept.
        let wants_sse = conn
            .req
            .accept
            .as_deref()
            .map(|a| a.contains("text/event-stream"))
            .unwrap_or(false);
        if wants_sse {
            return serve_status_sse(conn, res);
        }
        return serve_status_json(conn, res);
    }
    if path == format!("{}/events", res.cfg.status_page_path) {
        return serve_status_sse(conn, res);
    }
    if path == res.cfg.player_page_path {
        return serve_static_html(conn, res, PLAYER_HTML);
    }
    if path == "/playlist.m3u" {
        return serve_playlist(conn, res);
    }
    if path == "/epg.xml" || path == "/epg.xml.gz" {
        return serve_epg(conn, res, path.ends_with(".gz"));
    }
    if conn.req.request_snapshot.is_some() || path.starts_with("/snapshot/") {
        return serve_snapshot_unavailable(conn, res);
    }

    // UDPxy-compatible addressing.
    if res.cfg.udpxy {
        if let Some(rest) = path.strip_prefix("/rtp/") {
            return start_udpxy_multicast(conn, rt, res, rest, true);
        }
        if let Some(rest) = path.strip_prefix("/udp/") {
            return start_udpxy_multicast(conn, rt, res, rest, false);
        }
        if let Some(rest) = path.strip_prefix("/rtsp/") {
            return start_udpxy_rtsp(conn, rt, res, rest);
        }
    }

    // Named services.
    let name = path.trim_start_matches('/');
    if let Some(svc) = res.services.get(name).cloned() {
        return start_stream(conn, rt, res, svc);
    }

    respond_error(conn, res, 404);
    Action::None
}

fn respond_error(conn: &mut Connection, res: &mut Resources, status: u16) {
    let body = http::error_response(status);
    conn.queue_output_and_close(res, &body);
}

fn serve_static_html(conn: &mut Connection, res: &mut Resources, html: &str) -> Action {
    let head = ResponseHead {
        content_type: "text/html",
        content_length: Some(html.len()),
        ..Default::default()
    }
    .render();
    conn.queue_output(res, head.as_bytes());
    conn.queue_output_and_close(res, html.as_bytes());
    Action::None
}

fn serve_status_json(conn: &mut Connection, res: &mut Resources) -> Action {
    let body = serde_json::to_vec(&res.shm.snapshot()).unwrap_or_else(|_| b"{}".to_vec());
    let head = ResponseHead {
        content_type: "application/json",
        content_length: Some(body.len()),
        ..Default::default()
    }
    .render();
    conn.queue_output(res, head.as_bytes());
    conn.queue_output_and_close(res, &body);
    Action::None
}

fn serve_status_sse(conn: &mut Connection, res: &mut Resources) -> Action {
    let head = ResponseHead {
        content_type: "text/event-stream",
        keep_alive: true,
        ..Default::default()
    }
    .render();
    conn.queue_output(res, head.as_bytes());
    let snap = serde_json::to_string(&res.shm.snapshot()).unwrap_or_else(|_| "{}".into());
    conn.queue_output(res, format!("data: {snap}\n\n").as_bytes());
    conn.state = ConnState::Sse;
    conn.sse_next_beat_ms = res.now_ms + res.cfg.sse_heartbeat_secs * 1000;
    Action::None
}

fn serve_playlist(conn: &mut Connection, res: &mut Resources) -> Action {
    let mut services: Vec<Service> = res.services.values().cloned().collect();
    services.sort_by(|a, b| a.name.cmp(&b.name));
    let host = conn
        .req
        .host
        .clone()
        .or_else(|| res.cfg.hostname.clone())
        .unwrap_or_else(|| "localhost".into());
    let body = crate::playlist::render(&services, &format!("http://{host}"));
    serve_cacheable(conn, res, body.into_bytes(), "audio/x-mpegurl")
}

fn serve_epg(conn: &mut Connection, res: &mut Resources, gz: bool) -> Action {
    let Some(body) = res.epg_cache.clone() else {
        respond_error(conn, res, 404);
        return Action::None;
    };
    let ct = if gz { "application/gzip" } else { "application/xml" };
    serve_cacheable(conn, res, body, ct)
}

/// ETag + If-None-Match path shared by the playlist and EPG documents.
fn serve_cacheable(
    conn: &mut Connection,
    res: &mut Resources,
    body: Vec<u8>,
    content_type: &str,
) -> Action {
    let etag = http::format_etag(&crate::util::etag_hex(&body));
    if let Some(inm) = &conn.req.if_none_match {
        if http::if_none_match(inm, &etag) {
            let head = ResponseHead {
                status: 304,
                etag: Some(&etag),
                ..Default::default()
            }
            .render();
            conn.queue_output_and_close(res, head.as_bytes());
            return Action::None;
        }
    }
    let head = ResponseHead {
        content_type,
        content_length: Some(body.len()),
        etag: Some(&etag),
        ..Default::default()
    }
    .render();
    conn.queue_output(res, head.as_bytes());
    conn.queue_output_and_close(res, &body);
    Action::None
}

/// Snapshot endpoints are routed, but the transcoder behind them is an
/// external collaborator; without one the answer is 503.
fn serve_snapshot_unavailable(conn: &mut Connection, res: &mut Resources) -> Action {
    match (&res.cfg.ffmpeg_path, res.cfg.video_snapshot) {
        (Some(ffmpeg), true) => {
            debug!(
                "snapshot requested; transcoder {} {} runs out of process",
                ffmpeg,
                res.cfg.ffmpeg_args.as_deref().unwrap_or("")
            );
            respond_error(conn, res, 501);
        }
        _ => respond_error(conn, res, 503),
    }
    Action::None
}

fn start_udpxy_multicast(
    conn: &mut Connection,
    rt: &mut Reactor,
    res: &mut Resources,
    rest: &str,
    rtp: bool,
) -> Action {
    let addr = match resolve_host_port(rest, 1234) {
        Ok(a) if a.ip().is_multicast() => a,
        _ => {
            debug!("{}: bad multicast target {rest}", conn.peer);
            respond_error(conn, res, 404);
            return Action::None;
        }
    };
    let mut svc = Service::multicast(rest, addr, rtp);
    if let Some(fcc) = conn.req.query_value("fcc") {
        svc.fcc_addr = resolve_host_port(&url_decode(fcc), 0).ok();
    }
    start_stream(conn, rt, res, svc)
}

fn start_udpxy_rtsp(
    conn: &mut Connection,
    rt: &mut Reactor,
    res: &mut Resources,
    rest: &str,
) -> Action {
    let query = conn.req.url.split_once('?').map(|(_, q)| q);
    let mut url = format!("rtsp://{rest}");
    if let Some(q) = query {
        url.push('?');
        url.push_str(q);
    }
    let url = rtsp::apply_playseek(&url, conn.req.user_agent.as_deref());
    let svc = Service::rtsp(rest, &url);
    start_stream(conn, rt, res, svc)
}

/// Resolve a service into a live stream context on this connection.
fn start_stream(
    conn: &mut Connection,
    rt: &mut Reactor,
    res: &mut Resources,
    svc: Service,
) -> Action {
    let active = res.stats.clients.load(Ordering::Relaxed) as usize;
    if active >= res.cfg.maxclients {
        info!("{}: client cap reached ({active})", conn.peer);
        respond_error(conn, res, 503);
        return Action::None;
    }

    let upstream = match svc.kind {
        ServiceKind::Mrtp | ServiceKind::Mudp => {
            let src = match McastSource::join(&svc, &res.cfg, res.now_ms) {
                Ok(s) => s,
                Err(e) => {
                    info!("{}: join {} failed: {e:#}", conn.peer, svc.name);
                    respond_error(conn, res, 503);
                    return Action::None;
                }
            };
            if rt.register(src.fd(), EV_IN, FdOwner::Upstream(conn.key)).is_err() {
                respond_error(conn, res, 503);
                return Action::None;
            }
            Upstream::Mcast(src)
        }
        ServiceKind::Rtsp => {
            let url = match rtsp_url_for(&svc, &conn.req) {
                Some(u) => u,
                None => {
                    respond_error(conn, res, 404);
                    return Action::None;
                }
            };
            let agent = svc.user_agent.as_ref().map(|template| {
                template.replace("{ua}", conn.req.user_agent.as_deref().unwrap_or(""))
            });
            let device = res
                .cfg
                .iface_rtsp
                .as_deref()
                .or(res.cfg.iface_default.as_deref());
            let mut session = match RtspSession::new(&url, agent.as_deref(), device) {
                Ok(s) => s,
                Err(e) => {
                    info!("{}: {e:#}", conn.peer);
                    respond_error(conn, res, 404);
                    return Action::None;
                }
            };
            if let Err(e) = session.start(rt, conn.key, res.now_ms) {
                info!("{}: rtsp connect failed: {e:#}", conn.peer);
                respond_error(conn, res, 503);
                return Action::None;
            }
            Upstream::Rtsp(Box::new(session))
        }
    };

    let head = ResponseHead {
        content_type: "video/mp2t",
        ..Default::default()
    }
    .render();
    conn.queue_output(res, head.as_bytes());

    conn.stream = Some(StreamCtx {
        name: svc.name.clone(),
        kind: svc.kind,
        upstream,
        seq: SeqTracker::default(),
    });
    conn.state = ConnState::Streaming;

    if let Some(fcc) = svc.fcc_addr {
        // Rapid channel change is negotiated by an external helper.
        debug!("{}: fcc server {fcc} recorded", svc.name);
    }
    let addr = conn.display_addr(res);
    conn.client_slot = res.shm.register_client(res.worker_id, &addr, &svc.name);
    res.stats.clients.fetch_add(1, Ordering::Relaxed);
    info!("{addr}: streaming {} ({})", svc.name, svc.kind.as_str());
    res.shm
        .push_log(2, &format!("{addr} -> {} ({})", svc.name, svc.kind.as_str()));
    Action::None
}

/// Upstream URL for a configured RTSP (or catchup-capable) service, folding
/// in a client playseek request.
fn rtsp_url_for(svc: &Service, req: &http::Request) -> Option<String> {
    let playseek = req
        .query_value("playseek")
        .map(|v| rtsp::convert_playseek(&url_decode(v), req.user_agent.as_deref()));
    // A multicast service with a catchup template can serve a timeshift
    // request through RTSP.
    if let (Some(seek), Some(template)) = (&playseek, &svc.catchup_source) {
        if template.contains("{playseek}") {
            return Some(template.replace("{playseek}", seek));
        }
        let sep = if template.contains('?') { '&' } else { '?' };
        return Some(format!("{template}{sep}playseek={seek}"));
    }
    let base = svc.rtsp_url.clone()?;
    match playseek {
        Some(seek) => {
            let sep = if base.contains('?') { '&' } else { '?' };
            Some(format!("{base}{sep}playseek={seek}"))
        }
        None => Some(base),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::Request;

    fn req(url: &str, ua: Option<&str>) -> Request {
        Request {
            url: url.into(),
            user_agent: ua.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn plain_rtsp_service_keeps_url() {
        let svc = Service::rtsp("ch1", "rtsp://h/ch1");
        let r = req("/ch1", None);
        assert_eq!(rtsp_url_for(&svc, &r).as_deref(), Some("rtsp://h/ch1"));
    }

    #[test]
    fn playseek_is_converted_and_appended() {
        let svc = Service::rtsp("ch1", "rtsp://h/ch1");
        let r = req("/ch1?playseek=20240101000000-20240101003000", Some("app TZ+08:00"));
        assert_eq!(
            rtsp_url_for(&svc, &r).as_deref(),
            Some("rtsp://h/ch1?playseek=20231231160000-20231231163000")
        );
    }

    #[test]
    fn catchup_template_substitution() {
        let mut svc = Service::multicast("ch1", "239.0.0.1:5000".parse().unwrap(), true);
        svc.catchup_source = Some("rtsp://h/tsr/ch1?seek={playseek}".into());
        let r = req("/ch1?playseek=1704038400-", None);
        assert_eq!(
            rtsp_url_for(&svc, &r).as_deref(),
            Some("rtsp://h/tsr/ch1?seek=1704038400-")
        );
    }

    #[test]
    fn multicast_service_without_playseek_has_no_rtsp_url() {
        let svc = Service::multicast("ch1", "239.0.0.1:5000".parse().unwrap(), true);
        let r = req("/ch1", None);
        assert_eq!(rtsp_url_for(&svc, &r), None);
    }
}
