// src/rtsp.rs
//
// Non-blocking RTSP/1.0 client: DESCRIBE -> SETUP -> PLAY over a single TCP
// control socket, media either TCP-interleaved ($-framed on the control
// connection) or over a local RTP/RTCP UDP pair. Teardown is graceful where
// possible: one TEARDOWN round-trip, with at most one async reconnect when
// the control socket already died. Any failure funnels through
// force_cleanup, which is idempotent and drives the session back to Init.
use crate::config::Config;
use crate::net::{self, IoStatus, EV_ERR, EV_HUP, EV_IN, EV_OUT, EV_RDHUP};
use crate::rtp::{self, Depayload, SeqTracker, SeqVerdict};
use crate::stream::Sink;
use crate::worker::{FdOwner, Reactor};
use anyhow::Context;
use bytes::{Buf, BytesMut};
use log::{debug, info, warn};
use rand::Rng;
use socket2::Socket;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};

const MAX_REDIRECTS: u8 = 5;
const RESPONSE_TIMEOUT_MS: u64 = 10_000;
const MAX_RESPONSE: usize = 65536;
const MAX_INTERLEAVED_BUF: usize = 65536 + 4;

pub const USER_AGENT: &str = concat!("rtp2httpd/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtspState {
    Init,
    Connecting,
    Connected,
    SendingDescribe,
    AwaitingDescribe,
    Described,
    SendingSetup,
    AwaitingSetup,
    Setup,
    SendingPlay,
    AwaitingPlay,
    Playing,
    Reconnecting,
    SendingTeardown,
    AwaitingTeardown,
    TeardownComplete,
    #[allow(dead_code)]
    Paused,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    TcpInterleaved,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProto {
    Mp2t,
    Rtp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Continue,
    /// Session ended cleanly (teardown complete); resources released.
    Finished,
    Error,
}

pub struct RtspSession {
    state: RtspState,
    host: String,
    port: u16,
    url: String,
    ctrl: Option<Socket>,
    cseq: u32,
    session_id: Option<String>,
    mode: TransportMode,
    proto: TransportProto,
    rtp_channel: u8,
    rtcp_channel: u8,
    rtp_sock: Option<Socket>,
    rtcp_sock: Option<Socket>,
    pending: Vec<u8>,
    sent: usize,
    awaiting_response: bool,
    resp: Vec<u8>,
    media_buf: BytesMut,
    redirects: u8,
    reconnect_attempted: bool,
    teardown_wanted: bool,
    last_activity_ms: u64,
    seq: SeqTracker,
    user_agent: String,
    bind_device: Option<String>,
}

impl RtspSession {
    /// `url` is the final upstream URL, playseek already applied.
    /// `user_agent` overrides the default agent string (service templates);
    /// `bind_device` pins the control socket to an upstream interface.
    pub fn new(
        url: &str,
        user_agent: Option<&str>,
        bind_device: Option<&str>,
    ) -> anyhow::Result<Self> {
        let (host, port) = host_port_of(url)?;
        Ok(Self {
            state: RtspState::Init,
            host,
            port,
            url: url.to_string(),
            ctrl: None,
            cseq: 0,
            session_id: None,
            mode: TransportMode::TcpInterleaved,
            proto: TransportProto::Mp2t,
            rtp_channel: 0,
            rtcp_channel: 1,
            rtp_sock: None,
            rtcp_sock: None,
            pending: Vec::new(),
            sent: 0,
            awaiting_response: false,
            resp: Vec::new(),
            media_buf: BytesMut::new(),
            redirects: 0,
            reconnect_attempted: false,
            teardown_wanted: false,
            last_activity_ms: 0,
            seq: SeqTracker::default(),
            user_agent: user_agent.unwrap_or(USER_AGENT).to_string(),
            bind_device: bind_device.map(|s| s.to_string()),
        })
    }

    #[inline]
    pub fn state(&self) -> RtspState {
        self.state
    }

    #[inline]
    pub fn ctrl_fd(&self) -> Option<RawFd> {
        self.ctrl.as_ref().map(|s| s.as_raw_fd())
    }

    fn is_rtp_fd(&self, fd: RawFd) -> bool {
        self.rtp_sock.as_ref().map(|s| s.as_raw_fd()) == Some(fd)
    }

    fn is_rtcp_fd(&self, fd: RawFd) -> bool {
        self.rtcp_sock.as_ref().map(|s| s.as_raw_fd()) == Some(fd)
    }

    /// Resolve and start the non-blocking connect.
    pub fn start(&mut self, rt: &mut Reactor, conn_key: usize, now_ms: u64) -> anyhow::Result<()> {
        let addr = crate::service::resolve_host_port(
            &format!("{}:{}", bracketed(&self.host), self.port),
            554,
        )?;
        self.connect_to(rt, conn_key, addr, now_ms)
    }

    fn connect_to(
        &mut self,
        rt: &mut Reactor,
        conn_key: usize,
        addr: SocketAddr,
        now_ms: u64,
    ) -> anyhow::Result<()> {
        let (sock, connected) = net::connect_nonblocking(addr, self.bind_device.as_deref())?;
        let fd = sock.as_raw_fd();
        rt.register(fd, EV_IN | EV_OUT | EV_RDHUP, FdOwner::Upstream(conn_key))
            .context("register rtsp control")?;
        self.ctrl = Some(sock);
        self.last_activity_ms = now_ms;
        self.state = if self.teardown_wanted {
            RtspState::Reconnecting
        } else {
            RtspState::Connecting
        };
        if connected {
            // Localhost fast path: EPOLLOUT still fires, but we can move on
            // without waiting for it.
            self.on_connected(rt, conn_key);
        }
        Ok(())
    }

    fn on_connected(&mut self, rt: &mut Reactor, conn_key: usize) {
        let _ = conn_key;
        if self.state == RtspState::Reconnecting {
            self.queue_teardown(rt);
            return;
        }
        self.state = RtspState::Connected;
        self.queue_describe(rt);
    }

    fn queue_request(&mut self, rt: &mut Reactor, method: &str, extra: &[(&str, String)]) {
        self.cseq += 1;
        self.pending = build_request(method, &self.url, self.cseq, &self.user_agent, extra);
        self.sent = 0;
        self.awaiting_response = false;
        self.resp.clear();
        if let Some(fd) = self.ctrl_fd() {
            let _ = rt.rearm(fd, EV_IN | EV_OUT | EV_RDHUP);
        }
    }

    fn queue_describe(&mut self, rt: &mut Reactor) {
        self.queue_request(rt, "DESCRIBE", &[("Accept", "application/sdp".into())]);
        self.state = RtspState::SendingDescribe;
        self.try_send(rt);
    }

    fn queue_setup(&mut self, rt: &mut Reactor, conn_key: usize, sink: &Sink<'_>) {
        let udp_ready = self.setup_udp_pair(rt, conn_key, sink.cfg);
        let mut transport = String::from(
            "MP2T/RTP/TCP;unicast;interleaved=0-1,\
             MP2T/TCP;unicast;interleaved=0-1,\
             RTP/AVP/TCP;unicast;interleaved=0-1",
        );
        if udp_ready {
            let p = self.client_rtp_port();
            transport.push_str(&format!(
                ",MP2T/RTP;unicast;client_port={p}-{},RTP/AVP;unicast;client_port={p}-{}",
                p + 1,
                p + 1
            ));
        }
        self.queue_request(rt, "SETUP", &[("Transport", transport)]);
        self.state = RtspState::SendingSetup;
        self.try_send(rt);
    }

    fn queue_play(&mut self, rt: &mut Reactor) {
        let session = self.session_id.clone().unwrap_or_default();
        self.queue_request(
            rt,
            "PLAY",
            &[("Session", session), ("Range", "npt=0.000-".into())],
        );
        self.state = RtspState::SendingPlay;
        self.try_send(rt);
    }

    fn queue_teardown(&mut self, rt: &mut Reactor) {
        let session = self.session_id.clone().unwrap_or_default();
        self.queue_request(rt, "TEARDOWN", &[("Session", session)]);
        self.state = RtspState::SendingTeardown;
        self.try_send(rt);
    }

    fn client_rtp_port(&self) -> u16 {
        self.rtp_sock
            .as_ref()
            .and_then(|s| s.local_addr().ok())
            .and_then(|a| a.as_socket())
            .map(|a| a.port())
            .unwrap_or(0)
    }

    /// Bind a consecutive even/odd local UDP pair for RTP/RTCP and register
    /// both for EPOLLIN. Non-fatal: failure just limits the SETUP offer to
    /// interleaved transports.
    fn setup_udp_pair(&mut self, rt: &mut Reactor, conn_key: usize, cfg: &Config) -> bool {
        let (lo, hi) = cfg.fcc_port_range.unwrap_or((32768, 60998));
        let lo = (lo + 1) & !1; // even base
        if hi <= lo {
            return false;
        }
        let mut rng = rand::thread_rng();
        for _ in 0..16 {
            let span = ((hi - lo) as u32 / 2).max(1);
            let base = lo + (rng.gen_range(0..span) * 2) as u16;
            if base.checked_add(1).map_or(true, |b| b > hi) {
                continue;
            }
            let rtp_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), base);
            let rtcp_addr = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), base + 1);
            let Ok(rtp) = net::udp_bound(rtp_addr) else {
                continue;
            };
            let Ok(rtcp) = net::udp_bound(rtcp_addr) else {
                continue;
            };
            let r1 = rt.register(rtp.as_raw_fd(), EV_IN, FdOwner::Upstream(conn_key));
            let r2 = rt.register(rtcp.as_raw_fd(), EV_IN, FdOwner::Upstream(conn_key));
            if r1.is_err() || r2.is_err() {
                if r1.is_ok() {
                    rt.deregister(rtp.as_raw_fd());
                }
                if r2.is_ok() {
                    rt.deregister(rtcp.as_raw_fd());
                }
                return false;
            }
            self.rtp_sock = Some(rtp);
            self.rtcp_sock = Some(rtcp);
            return true;
        }
        debug!("rtsp: no free local UDP port pair, offering TCP only");
        false
    }

    fn close_udp(&mut self, rt: &mut Reactor) {
        if let Some(s) = self.rtp_sock.take() {
            rt.deregister(s.as_raw_fd());
        }
        if let Some(s) = self.rtcp_sock.take() {
            rt.deregister(s.as_raw_fd());
        }
    }

    fn try_send(&mut self, rt: &mut Reactor) {
        let Some(fd) = self.ctrl_fd() else {
            return;
        };
        while self.sent < self.pending.len() {
            match net::send_once(fd, &self.pending[self.sent..]) {
                IoStatus::Done(n) => self.sent += n,
                IoStatus::WouldBlock => {
                    let _ = rt.rearm(fd, EV_IN | EV_OUT | EV_RDHUP);
                    return;
                }
                _ => {
                    self.state = RtspState::Error;
                    return;
                }
            }
        }
        // Fully sent: wait for the response on EPOLLIN only.
        self.awaiting_response = true;
        let _ = rt.rearm(fd, EV_IN | EV_RDHUP);
        self.state = match self.state {
            RtspState::SendingDescribe => RtspState::AwaitingDescribe,
            RtspState::SendingSetup => RtspState::AwaitingSetup,
            RtspState::SendingPlay => RtspState::AwaitingPlay,
            RtspState::SendingTeardown => RtspState::AwaitingTeardown,
            s => s,
        };
    }

    /// Main entry: the worker hands over the raw epoll event mask for any fd
    /// owned by this session.
    pub fn handle_event(
        &mut self,
        rt: &mut Reactor,
        conn_key: usize,
        fd: RawFd,
        events: u32,
        sink: &mut Sink<'_>,
    ) -> Outcome {
        self.last_activity_ms = sink.now_ms;
        if self.is_rtcp_fd(fd) {
            net::drain_socket(fd);
            return Outcome::Continue;
        }
        if self.is_rtp_fd(fd) {
            self.on_udp_media(sink);
            return Outcome::Continue;
        }
        if self.ctrl_fd() != Some(fd) {
            return Outcome::Continue; // stale event for a closed fd
        }
        if events & (EV_ERR | EV_HUP) != 0 {
            return self.on_ctrl_broken(rt, conn_key, sink.now_ms);
        }
        if events & EV_OUT != 0 {
            match self.state {
                RtspState::Connecting | RtspState::Reconnecting => {
                    if let Err(e) = net::connect_result(fd) {
                        info!("rtsp connect {}:{} failed: {e}", self.host, self.port);
                        return self.on_ctrl_broken(rt, conn_key, sink.now_ms);
                    }
                    self.on_connected(rt, conn_key);
                }
                RtspState::SendingDescribe
                | RtspState::SendingSetup
                | RtspState::SendingPlay
                | RtspState::SendingTeardown => self.try_send(rt),
                _ => {
                    // Nothing queued; drop write interest.
                    let _ = rt.rearm(fd, EV_IN | EV_RDHUP);
                }
            }
            if self.state == RtspState::Error {
                self.force_cleanup(rt);
                return Outcome::Error;
            }
        }
        if events & (EV_IN | EV_RDHUP) != 0 {
            return self.on_ctrl_readable(rt, conn_key, sink);
        }
        Outcome::Continue
    }

    fn on_ctrl_readable(
        &mut self,
        rt: &mut Reactor,
        conn_key: usize,
        sink: &mut Sink<'_>,
    ) -> Outcome {
        let Some(fd) = self.ctrl_fd() else {
            return Outcome::Continue;
        };
        let mut scratch = [0u8; 4096];
        loop {
            match net::recv_once(fd, &mut scratch) {
                IoStatus::Done(n) => {
                    let outcome = self.on_ctrl_bytes(rt, conn_key, sink, &scratch[..n]);
                    if outcome != Outcome::Continue {
                        return outcome;
                    }
                    // A redirect swaps the control socket under us.
                    if self.ctrl_fd() != Some(fd) {
                        return Outcome::Continue;
                    }
                }
                IoStatus::WouldBlock => return Outcome::Continue,
                IoStatus::Closed | IoStatus::Error(_) => {
                    return self.on_ctrl_broken(rt, conn_key, sink.now_ms)
                }
            }
        }
    }

    fn on_ctrl_bytes(
        &mut self,
        rt: &mut Reactor,
        conn_key: usize,
        sink: &mut Sink<'_>,
        bytes: &[u8],
    ) -> Outcome {
        if self.state == RtspState::Playing && self.mode == TransportMode::TcpInterleaved {
            self.media_buf.extend_from_slice(bytes);
            self.demux_media(sink);
            if self.media_buf.len() > MAX_INTERLEAVED_BUF {
                warn!("rtsp: interleaved buffer overrun, resyncing");
                self.media_buf.clear();
            }
            return Outcome::Continue;
        }
        if self.awaiting_response {
            self.resp.extend_from_slice(bytes);
            if self.resp.len() > MAX_RESPONSE {
                self.state = RtspState::Error;
                self.force_cleanup(rt);
                return Outcome::Error;
            }
            return self.maybe_dispatch_response(rt, conn_key, sink);
        }
        // Server chatter outside a request/response exchange (announcements,
        // keepalive replies); interleaved frames while not playing land here
        // too and are dropped.
        Outcome::Continue
    }

    fn maybe_dispatch_response(
        &mut self,
        rt: &mut Reactor,
        conn_key: usize,
        sink: &mut Sink<'_>,
    ) -> Outcome {
        // Interleaved data may precede the TEARDOWN response; skip whole
        // frames until a status line can start.
        if self.state == RtspState::AwaitingTeardown {
            loop {
                match self.resp.first() {
                    Some(b'$') if self.resp.len() >= 4 => {
                        let len = u16::from_be_bytes([self.resp[2], self.resp[3]]) as usize;
                        if self.resp.len() < 4 + len {
                            return Outcome::Continue;
                        }
                        self.resp.drain(..4 + len);
                    }
                    Some(b'$') => return Outcome::Continue,
                    _ => break,
                }
            }
        }
        let Some(head_end) = find_header_end(&self.resp) else {
            return Outcome::Continue;
        };
        let head = String::from_utf8_lossy(&self.resp[..head_end]).into_owned();
        let content_length = header_value(&head, "Content-Length")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(0);
        if self.resp.len() < head_end + 4 + content_length {
            return Outcome::Continue;
        }
        let residue = self.resp.split_off(head_end + 4 + content_length);
        let Some(status) = parse_status_line(&head) else {
            self.state = RtspState::Error;
            self.force_cleanup(rt);
            return Outcome::Error;
        };
        self.awaiting_response = false;
        self.resp.clear();
        self.dispatch_response(rt, conn_key, sink, status, &head, residue)
    }

    fn dispatch_response(
        &mut self,
        rt: &mut Reactor,
        conn_key: usize,
        sink: &mut Sink<'_>,
        status: u16,
        head: &str,
        residue: Vec<u8>,
    ) -> Outcome {
        if (300..400).contains(&status) {
            return self.follow_redirect(rt, conn_key, head, sink.now_ms);
        }
        if !(200..300).contains(&status) {
            info!("rtsp {} returned {status} in {:?}", self.url, self.state);
            let failed_teardown = self.state == RtspState::AwaitingTeardown;
            self.force_cleanup(rt);
            return if failed_teardown {
                Outcome::Finished
            } else {
                Outcome::Error
            };
        }
        if let Some(sess) = header_value(head, "Session") {
            let sess = sess.split(';').next().unwrap_or(sess).trim();
            if !sess.is_empty() {
                self.session_id = Some(sess.to_string());
            }
        }
        match self.state {
            RtspState::AwaitingDescribe => {
                self.state = RtspState::Described;
                self.queue_setup(rt, conn_key, sink);
                Outcome::Continue
            }
            RtspState::AwaitingSetup => {
                if let Some(tr) = header_value(head, "Transport") {
                    let parsed = parse_transport(tr);
                    self.mode = parsed.mode;
                    self.proto = parsed.proto;
                    if let Some((a, b)) = parsed.interleaved {
                        self.rtp_channel = a;
                        self.rtcp_channel = b;
                    }
                }
                if self.mode == TransportMode::TcpInterleaved {
                    self.close_udp(rt);
                }
                self.state = RtspState::Setup;
                if self.teardown_wanted {
                    // Client vanished while the handshake was in flight.
                    self.queue_teardown(rt);
                } else {
                    self.queue_play(rt);
                }
                Outcome::Continue
            }
            RtspState::AwaitingPlay => {
                self.state = RtspState::Playing;
                debug!(
                    "rtsp {} playing ({:?}/{:?})",
                    self.url, self.mode, self.proto
                );
                if !residue.is_empty() && self.mode == TransportMode::TcpInterleaved {
                    // Bytes that followed the PLAY response are the first
                    // interleaved frames.
                    self.media_buf = BytesMut::from(&residue[..]);
                    self.demux_media(sink);
                }
                if self.teardown_wanted {
                    self.queue_teardown(rt);
                }
                Outcome::Continue
            }
            RtspState::AwaitingTeardown => {
                self.state = RtspState::TeardownComplete;
                self.force_cleanup(rt);
                Outcome::Finished
            }
            other => {
                debug!("rtsp: response {status} in unexpected state {other:?}");
                Outcome::Continue
            }
        }
    }

    fn follow_redirect(
        &mut self,
        rt: &mut Reactor,
        conn_key: usize,
        head: &str,
        now_ms: u64,
    ) -> Outcome {
        self.redirects += 1;
        if self.redirects > MAX_REDIRECTS {
            warn!("rtsp {}: redirect limit reached", self.url);
            self.state = RtspState::Error;
            self.force_cleanup(rt);
            return Outcome::Error;
        }
        let Some(location) = header_value(head, "Location") else {
            self.state = RtspState::Error;
            self.force_cleanup(rt);
            return Outcome::Error;
        };
        let location = location.to_string();
        info!("rtsp redirect -> {location}");
        if let Some(old) = self.ctrl.take() {
            rt.deregister(old.as_raw_fd());
        }
        match host_port_of(&location) {
            Ok((host, port)) => {
                self.host = host;
                self.port = port;
                self.url = location;
            }
            Err(_) => {
                self.state = RtspState::Error;
                self.force_cleanup(rt);
                return Outcome::Error;
            }
        }
        let addr = match crate::service::resolve_host_port(
            &format!("{}:{}", bracketed(&self.host), self.port),
            554,
        ) {
            Ok(a) => a,
            Err(e) => {
                warn!("rtsp redirect resolve failed: {e:#}");
                self.state = RtspState::Error;
                self.force_cleanup(rt);
                return Outcome::Error;
            }
        };
        if self.connect_to(rt, conn_key, addr, now_ms).is_err() {
            self.state = RtspState::Error;
            self.force_cleanup(rt);
            return Outcome::Error;
        }
        Outcome::Continue
    }

    /// Control socket died. Mid-teardown this may use the one permitted
    /// async reconnect; anywhere else it is fatal.
    fn on_ctrl_broken(&mut self, rt: &mut Reactor, conn_key: usize, now_ms: u64) -> Outcome {
        if let Some(old) = self.ctrl.take() {
            rt.deregister(old.as_raw_fd());
        }
        if self.teardown_wanted && !self.reconnect_attempted {
            self.reconnect_attempted = true;
            let addr = crate::service::resolve_host_port(
                &format!("{}:{}", bracketed(&self.host), self.port),
                554,
            );
            if let Ok(addr) = addr {
                if self.connect_to(rt, conn_key, addr, now_ms).is_ok() {
                    return Outcome::Continue;
                }
            }
            self.force_cleanup(rt);
            return Outcome::Finished;
        }
        let was_teardown = self.teardown_wanted;
        self.force_cleanup(rt);
        if was_teardown {
            Outcome::Finished
        } else {
            Outcome::Error
        }
    }

    /// Client went away. In SETUP/PLAYING (or with a session id on record)
    /// attempt a graceful TEARDOWN; otherwise clean up immediately.
    pub fn client_gone(&mut self, rt: &mut Reactor, conn_key: usize, now_ms: u64) -> Outcome {
        self.teardown_wanted = true;
        let has_session = self.session_id.is_some();
        match self.state {
            RtspState::Setup | RtspState::Playing | RtspState::AwaitingPlay
                if has_session =>
            {
                if self.ctrl.is_some() {
                    self.queue_teardown(rt);
                    if self.state == RtspState::Error {
                        self.force_cleanup(rt);
                        return Outcome::Finished;
                    }
                    Outcome::Continue
                } else if !self.reconnect_attempted {
                    self.reconnect_attempted = true;
                    match crate::service::resolve_host_port(
                        &format!("{}:{}", bracketed(&self.host), self.port),
                        554,
                    )
                    .and_then(|addr| self.connect_to(rt, conn_key, addr, now_ms))
                    {
                        Ok(()) => Outcome::Continue,
                        Err(_) => {
                            self.force_cleanup(rt);
                            Outcome::Finished
                        }
                    }
                } else {
                    self.force_cleanup(rt);
                    Outcome::Finished
                }
            }
            _ => {
                self.force_cleanup(rt);
                Outcome::Finished
            }
        }
    }

    /// Response-inactivity watchdog, driven from worker maintenance.
    pub fn tick(&mut self, rt: &mut Reactor, now_ms: u64) -> Outcome {
        let waiting = self.awaiting_response
            || matches!(self.state, RtspState::Connecting | RtspState::Reconnecting);
        if waiting && now_ms.saturating_sub(self.last_activity_ms) > RESPONSE_TIMEOUT_MS {
            info!("rtsp {}: response timeout in {:?}", self.url, self.state);
            let was_teardown = self.teardown_wanted;
            self.force_cleanup(rt);
            return if was_teardown {
                Outcome::Finished
            } else {
                Outcome::Error
            };
        }
        Outcome::Continue
    }

    /// Close and deregister every socket this session owns and reset all
    /// per-exchange state. Safe to call any number of times.
    pub fn force_cleanup(&mut self, rt: &mut Reactor) {
        if let Some(s) = self.ctrl.take() {
            rt.deregister(s.as_raw_fd());
        }
        self.close_udp(rt);
        self.pending.clear();
        self.sent = 0;
        self.awaiting_response = false;
        self.resp.clear();
        self.media_buf.clear();
        self.session_id = None;
        self.state = RtspState::Init;
    }

    fn demux_media(&mut self, sink: &mut Sink<'_>) {
        let Self {
            media_buf,
            seq,
            rtp_channel,
            proto,
            ..
        } = self;
        demux_interleaved(media_buf, *rtp_channel, |payload| {
            deliver_tcp_payload(sink, seq, *proto, payload)
        });
    }

    fn on_udp_media(&mut self, sink: &mut Sink<'_>) {
        let Some(fd) = self.rtp_sock.as_ref().map(|s| s.as_raw_fd()) else {
            return;
        };
        let rtp_pipeline = self.proto == TransportProto::Rtp;
        loop {
            let Some(id) = sink.pools.media.alloc() else {
                net::drain_socket(fd);
                break;
            };
            match net::recv_once(fd, sink.pools.media.write_space(id)) {
                IoStatus::Done(n) => {
                    sink.pools.media.set_len(id, n);
                    crate::stream::ingest_datagram(sink, &mut self.seq, id, rtp_pipeline, &self.url);
                }
                _ => {
                    sink.pools.media.put(id);
                    break;
                }
            }
        }
    }
}

fn deliver_tcp_payload(
    sink: &mut Sink<'_>,
    seq: &mut SeqTracker,
    proto: TransportProto,
    payload: &[u8],
) {
    match proto {
        TransportProto::Mp2t => sink.push_copy(payload),
        TransportProto::Rtp => match rtp::parse(payload, &sink.cfg.fec_payload_types) {
            Depayload::Passthrough => sink.push_copy(payload),
            Depayload::Fec | Depayload::Malformed => {}
            Depayload::Rtp(p) => {
                if seq.check(p.seq, "rtsp") == SeqVerdict::Deliver {
                    sink.push_copy(&payload[p.offset..p.offset + p.len]);
                }
            }
        },
    }
}

// ---------- wire helpers ----------

fn build_request(
    method: &str,
    url: &str,
    cseq: u32,
    user_agent: &str,
    extra: &[(&str, String)],
) -> Vec<u8> {
    let mut out = String::with_capacity(128);
    out.push_str(method);
    out.push(' ');
    out.push_str(url);
    out.push_str(" RTSP/1.0\r\n");
    out.push_str(&format!("CSeq: {cseq}\r\n"));
    out.push_str(&format!("User-Agent: {user_agent}\r\n"));
    for (k, v) in extra {
        if !v.is_empty() {
            out.push_str(&format!("{k}: {v}\r\n"));
        }
    }
    out.push_str("\r\n");
    out.into_bytes()
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

fn parse_status_line(head: &str) -> Option<u16> {
    let line = head.lines().next()?;
    let mut it = line.split_whitespace();
    let proto = it.next()?;
    if !proto.starts_with("RTSP/") {
        return None;
    }
    it.next()?.parse().ok()
}

fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    for line in head.lines().skip(1) {
        if let Some((k, v)) = line.split_once(':') {
            if k.trim().eq_ignore_ascii_case(name) {
                return Some(v.trim());
            }
        }
    }
    None
}

struct ParsedTransport {
    mode: TransportMode,
    proto: TransportProto,
    interleaved: Option<(u8, u8)>,
}

/// Server Transport header: mode by TCP/interleaved vs client_port keywords,
/// protocol by MP2T vs RTP/AVP tokens.
fn parse_transport(value: &str) -> ParsedTransport {
    let upper = value.to_ascii_uppercase();
    let mode = if upper.contains("INTERLEAVED") || upper.contains("/TCP") {
        TransportMode::TcpInterleaved
    } else if upper.contains("CLIENT_PORT") {
        TransportMode::Udp
    } else {
        TransportMode::TcpInterleaved
    };
    let proto = if upper.contains("MP2T") {
        TransportProto::Mp2t
    } else if upper.contains("RTP/AVP") {
        TransportProto::Rtp
    } else {
        TransportProto::Mp2t
    };
    let interleaved = upper.find("INTERLEAVED=").and_then(|i| {
        let rest = &value[i + "interleaved=".len()..];
        let spec = rest.split(|c: char| c == ';' || c == ',').next()?;
        let (a, b) = spec.split_once('-')?;
        Some((a.trim().parse().ok()?, b.trim().parse().ok()?))
    });
    ParsedTransport {
        mode,
        proto,
        interleaved,
    }
}

/// Step the `$ <ch> <len:u16>` interleaved framing. Frames for other
/// channels are skipped; garbage resyncs to the next '$'.
fn demux_interleaved(buf: &mut BytesMut, rtp_channel: u8, mut on_media: impl FnMut(&[u8])) {
    let mut pos = 0usize;
    loop {
        let rest = &buf[pos..];
        if rest.is_empty() {
            break;
        }
        if rest[0] != b'$' {
            match rest.iter().position(|&b| b == b'$') {
                Some(skip) => {
                    debug!("rtsp: resync, skipped {skip} bytes");
                    pos += skip;
                    continue;
                }
                None => {
                    pos = buf.len();
                    break;
                }
            }
        }
        if rest.len() < 4 {
            break;
        }
        let ch = rest[1];
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        if rest.len() < 4 + len {
            break;
        }
        if ch == rtp_channel {
            on_media(&rest[4..4 + len]);
        }
        pos += 4 + len;
    }
    buf.advance(pos);
}

fn host_port_of(url: &str) -> anyhow::Result<(String, u16)> {
    let parsed = url::Url::parse(url).with_context(|| format!("bad rtsp url {url}"))?;
    anyhow::ensure!(parsed.scheme() == "rtsp", "not an rtsp url: {url}");
    let host = parsed.host_str().context("rtsp url missing host")?.to_string();
    Ok((host, parsed.port().unwrap_or(554)))
}

fn bracketed(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

// ---------- playseek time conversion ----------

/// `TZ±HH:MM` (or ±HHMM) convention in the client's User-Agent; offset in
/// seconds east of UTC.
pub fn tz_offset_from_ua(ua: &str) -> Option<i32> {
    let i = ua.find("TZ")?;
    let rest = &ua[i + 2..];
    let mut chars = rest.chars();
    let sign = match chars.next()? {
        '+' => 1,
        '-' => -1,
        _ => return None,
    };
    let digits: String = rest[1..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == ':')
        .collect();
    let (h, m) = match digits.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m[..2.min(m.len())].parse::<i32>().ok()?),
        None if digits.len() >= 4 => (
            digits[..2].parse::<i32>().ok()?,
            digits[2..4].parse::<i32>().ok()?,
        ),
        None if digits.len() >= 2 => (digits[..2].parse::<i32>().ok()?, 0),
        None => return None,
    };
    Some(sign * (h * 3600 + m * 60))
}

fn convert_time_token(token: &str, offset_secs: i32) -> String {
    // 10-digit Unix seconds are already UTC; 14-digit local wall-clock
    // converts through the UA timezone and re-emits in the same format.
    if token.len() == 14 && token.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(token, "%Y%m%d%H%M%S") {
            let utc = dt - chrono::Duration::seconds(offset_secs as i64);
            return utc.format("%Y%m%d%H%M%S").to_string();
        }
    }
    token.to_string()
}

/// Convert a `playseek` value (`begin`, `begin-`, `begin-end`) to UTC.
pub fn convert_playseek(raw: &str, ua: Option<&str>) -> String {
    let offset = ua.and_then(tz_offset_from_ua).unwrap_or(0);
    match raw.split_once('-') {
        Some((begin, "")) => format!("{}-", convert_time_token(begin, offset)),
        Some((begin, end)) => format!(
            "{}-{}",
            convert_time_token(begin, offset),
            convert_time_token(end, offset)
        ),
        None => convert_time_token(raw, offset),
    }
}

/// Rewrite the `playseek=` query value of an RTSP URL to UTC.
pub fn apply_playseek(url: &str, ua: Option<&str>) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let rewritten: Vec<String> = query
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some(("playseek", v)) => format!("playseek={}", convert_playseek(v, ua)),
            _ => pair.to_string(),
        })
        .collect();
    format!("{base}?{}", rewritten.join("&"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_format() {
        let req = build_request(
            "DESCRIBE",
            "rtsp://h/ch",
            1,
            USER_AGENT,
            &[("Accept", "application/sdp".into())],
        );
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("DESCRIBE rtsp://h/ch RTSP/1.0\r\n"));
        assert!(text.contains("CSeq: 1\r\n"));
        assert!(text.contains("User-Agent: rtp2httpd/"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn status_line_and_headers() {
        let head = "RTSP/1.0 200 OK\r\nCSeq: 2\r\nSession: 12345;timeout=60\r\nTransport: MP2T/TCP;unicast;interleaved=0-1";
        assert_eq!(parse_status_line(head), Some(200));
        assert_eq!(header_value(head, "session").map(|s| s.split(';').next().unwrap()), Some("12345"));
        assert!(header_value(head, "Missing").is_none());
    }

    #[test]
    fn transport_parsing() {
        let t = parse_transport("MP2T/TCP;unicast;interleaved=2-3");
        assert_eq!(t.mode, TransportMode::TcpInterleaved);
        assert_eq!(t.proto, TransportProto::Mp2t);
        assert_eq!(t.interleaved, Some((2, 3)));

        let t = parse_transport("RTP/AVP;unicast;client_port=5000-5001;server_port=6000-6001");
        assert_eq!(t.mode, TransportMode::Udp);
        assert_eq!(t.proto, TransportProto::Rtp);
        assert_eq!(t.interleaved, None);
    }

    #[test]
    fn interleaved_demux() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'$', 0, 0, 3]);
        buf.extend_from_slice(b"abc");
        buf.extend_from_slice(&[b'$', 1, 0, 2]); // rtcp channel, skipped
        buf.extend_from_slice(b"xy");
        buf.extend_from_slice(&[b'$', 0, 0, 5]); // incomplete tail
        buf.extend_from_slice(b"de");
        let mut got = Vec::new();
        demux_interleaved(&mut buf, 0, |p| got.push(p.to_vec()));
        assert_eq!(got, vec![b"abc".to_vec()]);
        // Incomplete frame stays buffered.
        assert_eq!(buf.len(), 4 + 2);
    }

    #[test]
    fn demux_resyncs_on_garbage() {
        let mut buf = BytesMut::from(&b"junkjunk"[..]);
        buf.extend_from_slice(&[b'$', 0, 0, 1, b'z']);
        let mut got = Vec::new();
        demux_interleaved(&mut buf, 0, |p| got.push(p.to_vec()));
        assert_eq!(got, vec![b"z".to_vec()]);
        assert!(buf.is_empty());
    }

    #[test]
    fn tz_offsets() {
        assert_eq!(tz_offset_from_ua("app TZ+08:00"), Some(8 * 3600));
        assert_eq!(tz_offset_from_ua("app TZ-0530"), Some(-(5 * 3600 + 30 * 60)));
        assert_eq!(tz_offset_from_ua("plain agent"), None);
    }

    #[test]
    fn playseek_conversion() {
        // +08:00 local window converts to UTC wall-clock.
        let got = convert_playseek("20240101000000-20240101003000", Some("app TZ+08:00"));
        assert_eq!(got, "20231231160000-20231231163000");
        // Unix-seconds form passes through.
        assert_eq!(
            convert_playseek("1704038400-1704040200", Some("app TZ+08:00")),
            "1704038400-1704040200"
        );
        // Open-ended form keeps the dash.
        assert_eq!(
            convert_playseek("20240101000000-", Some("app TZ+08:00")),
            "20231231160000-"
        );
    }

    #[test]
    fn playseek_applied_to_url() {
        let url = "rtsp://host/channel?playseek=20240101000000-20240101003000&x=1";
        let got = apply_playseek(url, Some("app TZ+08:00"));
        assert_eq!(
            got,
            "rtsp://host/channel?playseek=20231231160000-20231231163000&x=1"
        );
    }

    #[test]
    fn url_host_port() {
        assert_eq!(host_port_of("rtsp://h/ch").unwrap(), ("h".into(), 554));
        assert_eq!(host_port_of("rtsp://h:8554/ch").unwrap(), ("h".into(), 8554));
        assert!(host_port_of("http://h/ch").is_err());
    }

    #[test]
    fn session_state_starts_init() {
        let s = RtspSession::new("rtsp://example.com/live", None, None).unwrap();
        assert_eq!(s.state(), RtspState::Init);
    }

    #[test]
    fn per_service_user_agent() {
        let s = RtspSession::new("rtsp://example.com/live", Some("STB-Model-X"), None).unwrap();
        assert_eq!(s.user_agent, "STB-Model-X");
    }
}
