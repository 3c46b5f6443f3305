// src/fetch.rs
//
// Minimal non-blocking HTTP/1.0 GET driven by the worker epoll, used for the
// external playlist and EPG refresh. Plain HTTP only; the response is
// close-delimited (we always send Connection: close) with Content-Length
// honored when present.
use crate::net::{self, IoStatus, EV_IN, EV_OUT, EV_RDHUP};
use crate::worker::{FdOwner, Reactor};
use anyhow::Context;
use log::{debug, warn};
use socket2::Socket;
use std::os::fd::{AsRawFd, RawFd};

const MAX_RESPONSE: usize = 8 * 1024 * 1024;
const RETRY_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FetchState {
    Idle,
    Connecting,
    Sending,
    Receiving,
}

#[derive(Debug)]
pub struct FetchResult {
    pub status: u16,
    pub body: Vec<u8>,
}

pub struct Fetcher {
    url: String,
    host: String,
    port: u16,
    request: Vec<u8>,
    sock: Option<Socket>,
    state: FetchState,
    sent: usize,
    resp: Vec<u8>,
    interval_ms: u64,
    pub next_attempt_ms: u64,
}

impl Fetcher {
    pub fn new(url: &str, interval_secs: u64) -> anyhow::Result<Self> {
        let parsed = url::Url::parse(url).with_context(|| format!("bad url {url}"))?;
        anyhow::ensure!(parsed.scheme() == "http", "only http urls supported: {url}");
        let host = parsed.host_str().context("url missing host")?.to_string();
        let port = parsed.port().unwrap_or(80);
        let mut path = parsed.path().to_string();
        if let Some(q) = parsed.query() {
            path.push('?');
            path.push_str(q);
        }
        let request = format!(
            "GET {path} HTTP/1.0\r\nHost: {host}\r\nUser-Agent: {}\r\nConnection: close\r\n\r\n",
            crate::rtsp::USER_AGENT
        )
        .into_bytes();
        Ok(Self {
            url: url.to_string(),
            host,
            port,
            request,
            sock: None,
            state: FetchState::Idle,
            sent: 0,
            resp: Vec::new(),
            interval_ms: interval_secs.max(1) * 1000,
            next_attempt_ms: 0,
        })
    }

    #[inline]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[inline]
    pub fn fd(&self) -> Option<RawFd> {
        self.sock.as_ref().map(|s| s.as_raw_fd())
    }

    #[inline]
    pub fn due(&self, now_ms: u64) -> bool {
        self.state == FetchState::Idle && now_ms >= self.next_attempt_ms
    }

    /// Kick off a fetch attempt. Failure here just schedules a retry.
    pub fn start(&mut self, rt: &mut Reactor, slot: usize, now_ms: u64) {
        let target = if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        };
        let addr = match crate::service::resolve_host_port(&target, 80) {
            Ok(a) => a,
            Err(e) => {
                warn!("fetch {}: {e:#}", self.url);
                self.schedule_retry(now_ms);
                return;
            }
        };
        match net::connect_nonblocking(addr, None) {
            Ok((sock, _connected)) => {
                if rt
                    .register(sock.as_raw_fd(), EV_IN | EV_OUT | EV_RDHUP, FdOwner::Fetch(slot))
                    .is_err()
                {
                    self.schedule_retry(now_ms);
                    return;
                }
                self.sock = Some(sock);
                self.state = FetchState::Connecting;
                self.sent = 0;
                self.resp.clear();
            }
            Err(e) => {
                warn!("fetch {}: {e:#}", self.url);
                self.schedule_retry(now_ms);
            }
        }
    }

    fn schedule_retry(&mut self, now_ms: u64) {
        self.state = FetchState::Idle;
        self.next_attempt_ms = now_ms + RETRY_SECS * 1000;
    }

    fn schedule_next(&mut self, now_ms: u64) {
        self.state = FetchState::Idle;
        self.next_attempt_ms = now_ms + self.interval_ms;
    }

    fn abort(&mut self, rt: &mut Reactor, now_ms: u64) {
        if let Some(s) = self.sock.take() {
            rt.deregister(s.as_raw_fd());
        }
        self.schedule_retry(now_ms);
    }

    /// Drive the fetch; returns the finished document when complete.
    pub fn handle_event(
        &mut self,
        rt: &mut Reactor,
        events: u32,
        now_ms: u64,
    ) -> Option<FetchResult> {
        let Some(fd) = self.fd() else {
            return None;
        };
        if self.state == FetchState::Connecting && events & EV_OUT != 0 {
            if let Err(e) = net::connect_result(fd) {
                debug!("fetch {}: connect failed: {e}", self.url);
                self.abort(rt, now_ms);
                return None;
            }
            self.state = FetchState::Sending;
        }
        if self.state == FetchState::Sending && events & EV_OUT != 0 {
            while self.sent < self.request.len() {
                match net::send_once(fd, &self.request[self.sent..]) {
                    IoStatus::Done(n) => self.sent += n,
                    IoStatus::WouldBlock => return None,
                    _ => {
                        self.abort(rt, now_ms);
                        return None;
                    }
                }
            }
            self.state = FetchState::Receiving;
            let _ = rt.rearm(fd, EV_IN | EV_RDHUP);
        }
        if self.state == FetchState::Receiving && events & (EV_IN | EV_RDHUP) != 0 {
            let mut scratch = [0u8; 8192];
            loop {
                match net::recv_once(fd, &mut scratch) {
                    IoStatus::Done(n) => {
                        if self.resp.len() + n > MAX_RESPONSE {
                            warn!("fetch {}: response too large", self.url);
                            self.abort(rt, now_ms);
                            return None;
                        }
                        self.resp.extend_from_slice(&scratch[..n]);
                    }
                    IoStatus::WouldBlock => return None,
                    IoStatus::Closed => return self.finish(rt, now_ms),
                    IoStatus::Error(_) => {
                        self.abort(rt, now_ms);
                        return None;
                    }
                }
            }
        }
        None
    }

    fn finish(&mut self, rt: &mut Reactor, now_ms: u64) -> Option<FetchResult> {
        if let Some(s) = self.sock.take() {
            rt.deregister(s.as_raw_fd());
        }
        let head_end = self.resp.windows(4).position(|w| w == b"\r\n\r\n")?;
        let head = String::from_utf8_lossy(&self.resp[..head_end]).into_owned();
        let status: u16 = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let body = self.resp.split_off(head_end + 4);
        self.resp.clear();
        if (200..300).contains(&status) {
            self.schedule_next(now_ms);
            Some(FetchResult { status, body })
        } else {
            warn!("fetch {}: HTTP {status}", self.url);
            self.schedule_retry(now_ms);
            None
        }
    }
}
