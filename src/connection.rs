// src/connection.rs
//
// One accepted client socket. The connection owns its input buffer, request,
// send queue and (once routed to a media URL) the stream context with its
// upstream driver. Teardown order on destroy: upstream first, then the
// queue, then the socket.
use crate::http::{self, ParseStatus, INPUT_BUF_CAP};
use crate::net::{self, IoStatus, EV_IN, EV_OUT, EV_RDHUP};
use crate::pool::PoolKind;
use crate::rtsp::Outcome as RtspOutcome;
use crate::sendq::{DrainStatus, SendQueue};
use crate::stream::{Sink, SlowCounters, StreamCtx, Upstream};
use crate::worker::{Reactor, Resources};
use log::{debug, info};
use socket2::Socket;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    ReadReqLine,
    ReadHeaders,
    Route,
    Sse,
    Streaming,
    Closing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Worker should destroy this connection now.
    Close,
}

pub struct Connection {
    pub key: usize,
    sock: Socket,
    fd: RawFd,
    pub state: ConnState,
    inbuf: Vec<u8>,
    parser: http::Parser,
    pub req: http::Request,
    pub sendq: SendQueue,
    pub stream: Option<StreamCtx>,
    pub peer: String,
    pub client_slot: Option<usize>,
    pub slow: SlowCounters,
    /// Next SSE heartbeat deadline, u64::MAX when not an SSE client.
    pub sse_next_beat_ms: u64,
    epollout: bool,
}

impl Connection {
    pub fn new(sock: Socket, peer: String, key: usize, res: &Resources) -> Self {
        let fd = sock.as_raw_fd();
        sock.set_nodelay(true).ok();
        let zerocopy = res.cfg.zerocopy && net::enable_zerocopy(fd);
        Self {
            key,
            sock,
            fd,
            state: ConnState::ReadReqLine,
            inbuf: Vec::with_capacity(1024),
            parser: http::Parser::default(),
            req: http::Request::default(),
            sendq: SendQueue::new(zerocopy),
            stream: None,
            peer,
            client_slot: None,
            slow: SlowCounters::default(),
            sse_next_beat_ms: u64::MAX,
            epollout: false,
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// The client address honored for display: X-Forwarded-For when enabled.
    pub fn display_addr(&self, res: &Resources) -> String {
        if res.cfg.xff {
            if let Some(xff) = &self.req.forwarded_for {
                return xff.clone();
            }
        }
        self.peer.clone()
    }

    fn base_interest(&self) -> u32 {
        EV_IN | EV_RDHUP
    }

    fn arm(&mut self, rt: &Reactor, want_out: bool) {
        if want_out != self.epollout {
            self.epollout = want_out;
            let ev = self.base_interest() | if want_out { EV_OUT } else { 0 };
            let _ = rt.rearm(self.fd, ev);
        }
    }

    // ---------- output API ----------

    /// Copy `bytes` into control-pool buffers and enqueue. Control output is
    /// never dropped by backpressure; it is small and bounded.
    pub fn queue_output(&mut self, res: &mut Resources, bytes: &[u8]) {
        let chunk = res.pools.control.buf_size();
        for part in bytes.chunks(chunk) {
            let Some(id) = res.pools.control.alloc() else {
                // Control pool exhausted: the client is beyond help.
                self.state = ConnState::Closing;
                return;
            };
            res.pools.control.write_space(id)[..part.len()].copy_from_slice(part);
            res.pools.control.set_len(id, part.len());
            self.sendq.enqueue_memory(&mut res.pools, PoolKind::Control, id);
            res.pools.control.put(id);
        }
    }

    pub fn queue_output_and_close(&mut self, res: &mut Resources, bytes: &[u8]) {
        self.queue_output(res, bytes);
        self.state = ConnState::Closing;
    }

    /// Enqueue a file span; fd ownership transfers to the queue.
    #[allow(dead_code)]
    pub fn queue_file(&mut self, fd: RawFd, offset: u64, len: u64) {
        self.sendq.enqueue_file(fd, offset, len);
    }

    /// Flush the queue and fold the result into epoll interest.
    pub fn flush(&mut self, rt: &Reactor, res: &mut Resources) -> Action {
        let r = self.sendq.drain(self.fd, &mut res.pools, res.stats);
        if r.sent > 0 {
            if let Some(slot) = self.client_slot {
                res.shm
                    .client(slot)
                    .bytes_sent
                    .fetch_add(r.sent as u64, Ordering::Relaxed);
            }
        }
        match r.status {
            DrainStatus::Ok => {
                if self.sendq.bytes() < res.cfg.queue_limit_bytes {
                    self.slow.saturated_since_ms = None;
                }
                self.arm(rt, false);
                if self.state == ConnState::Closing && self.sendq.is_empty() {
                    return Action::Close;
                }
                Action::None
            }
            DrainStatus::WouldBlock => {
                self.arm(rt, true);
                Action::None
            }
            DrainStatus::Error => Action::Close,
        }
    }

    // ---------- event handlers ----------

    pub fn on_event(&mut self, rt: &mut Reactor, res: &mut Resources, events: u32) -> Action {
        if events & net::EV_ERR != 0 {
            // MSG_ZEROCOPY completions surface as EPOLLERR via the socket
            // error queue; only a real SO_ERROR is fatal.
            self.sendq
                .reap_completions(self.fd, &mut res.pools, res.stats);
            let hard_error = net::connect_result(self.fd).is_err();
            if hard_error || events & (net::EV_HUP | EV_RDHUP) != 0 {
                return self.on_peer_gone(rt, res);
            }
        } else if events & (net::EV_HUP | EV_RDHUP) != 0 {
            return self.on_peer_gone(rt, res);
        }
        if events & EV_OUT != 0 {
            self.sendq
                .reap_completions(self.fd, &mut res.pools, res.stats);
            let act = self.flush(rt, res);
            if act == Action::Close {
                return act;
            }
        }
        if events & EV_IN != 0 {
            let act = self.on_readable(rt, res);
            if act == Action::Close {
                return act;
            }
        }
        // Error-queue completions piggyback on EPOLLERR-free wakeups too.
        if self.sendq.has_pending_completions() {
            self.sendq
                .reap_completions(self.fd, &mut res.pools, res.stats);
        }
        Action::None
    }

    fn on_readable(&mut self, rt: &mut Reactor, res: &mut Resources) -> Action {
        if matches!(self.state, ConnState::Streaming | ConnState::Sse) {
            // A streaming client has nothing more to say; consume and drop
            // so level-triggered EPOLLIN quiesces, detect orderly close.
            let mut scratch = [0u8; 512];
            loop {
                match net::recv_once(self.fd, &mut scratch) {
                    IoStatus::Done(_) => continue,
                    IoStatus::WouldBlock => return Action::None,
                    IoStatus::Closed | IoStatus::Error(_) => return self.on_peer_gone(rt, res),
                }
            }
        }
        if self.state == ConnState::Closing {
            net::drain_socket(self.fd);
            return Action::None;
        }
        loop {
            let mut scratch = [0u8; 2048];
            match net::recv_once(self.fd, &mut scratch) {
                IoStatus::Done(n) => {
                    if self.inbuf.len() + n > INPUT_BUF_CAP {
                        // Header section overran the input cap.
                        let resp = http::error_response(400);
                        self.queue_output_and_close(res, &resp);
                        return self.flush(rt, res);
                    }
                    self.inbuf.extend_from_slice(&scratch[..n]);
                    match self.advance_parser(rt, res) {
                        Some(act) => return act,
                        None => continue,
                    }
                }
                IoStatus::WouldBlock => return Action::None,
                IoStatus::Closed | IoStatus::Error(_) => return self.on_peer_gone(rt, res),
            }
        }
    }

    fn advance_parser(&mut self, rt: &mut Reactor, res: &mut Resources) -> Option<Action> {
        let status = self.parser.advance(&self.inbuf, &mut self.req);
        let consumed = self.parser.consumed();
        if consumed > 0 {
            self.inbuf.drain(..consumed);
            self.parser.rebase();
        }
        self.state = if self.parser.in_headers() {
            if self.req.method.is_empty() {
                ConnState::ReadReqLine
            } else {
                ConnState::ReadHeaders
            }
        } else {
            self.state
        };
        match status {
            ParseStatus::NeedMore => None,
            ParseStatus::Error(code) => {
                debug!("{}: bad request ({code})", self.peer);
                let resp = http::error_response(code);
                self.queue_output_and_close(res, &resp);
                Some(self.flush(rt, res))
            }
            ParseStatus::Complete => {
                debug!(
                    "{}: {} {} ({:?}, {} extra header bytes)",
                    self.peer,
                    self.req.method,
                    self.req.url,
                    self.req.version,
                    self.req.extra_headers.len()
                );
                self.state = ConnState::Route;
                let act = crate::routes::dispatch(self, rt, res);
                if act == Action::Close {
                    return Some(act);
                }
                Some(self.flush(rt, res))
            }
        }
    }

    /// Client half is gone (RDHUP/HUP/reset). Tear the upstream down;
    /// an RTSP session may need a graceful TEARDOWN round first.
    fn on_peer_gone(&mut self, rt: &mut Reactor, res: &mut Resources) -> Action {
        debug!("{}: client closed", self.peer);
        self.state = ConnState::Closing;
        match self.stream.as_mut().map(|s| &mut s.upstream) {
            Some(Upstream::Rtsp(session)) => {
                debug!("{}: rtsp session in {:?} at client close", self.peer, session.state());
                match session.client_gone(rt, self.key, res.now_ms) {
                    RtspOutcome::Continue => Action::None, // wait for teardown
                    RtspOutcome::Finished | RtspOutcome::Error => Action::Close,
                }
            }
            _ => Action::Close,
        }
    }

    /// Epoll event for an upstream fd owned by this connection's stream.
    pub fn on_upstream_event(
        &mut self,
        rt: &mut Reactor,
        res: &mut Resources,
        fd: RawFd,
        events: u32,
    ) -> Action {
        let Some(stream) = self.stream.as_mut() else {
            return Action::None;
        };
        let mut sink = Sink {
            pools: &mut res.pools,
            q: &mut self.sendq,
            fd: self.fd,
            cfg: &res.cfg,
            slow: &mut self.slow,
            stats: res.stats,
            shm: res.shm,
            client_slot: self.client_slot,
            now_ms: res.now_ms,
            want_epollout: false,
            fatal: false,
        };
        let mut rtsp_result = RtspOutcome::Continue;
        if let Upstream::Rtsp(session) = &mut stream.upstream {
            rtsp_result = session.handle_event(rt, self.key, fd, events, &mut sink);
        } else {
            stream.on_mcast_readable(&mut sink);
        }
        let want_out = sink.want_epollout;
        let fatal = sink.fatal;
        if fatal {
            return Action::Close;
        }
        if want_out {
            self.arm(rt, true);
        }
        match rtsp_result {
            RtspOutcome::Continue => Action::None,
            RtspOutcome::Finished => {
                if self.state == ConnState::Closing {
                    Action::Close
                } else {
                    // Upstream ended while the client still listens: close
                    // out the HTTP stream.
                    self.state = ConnState::Closing;
                    self.flush(rt, res)
                }
            }
            RtspOutcome::Error => Action::Close,
        }
    }

    /// Periodic maintenance: SSE heartbeats, slow-consumer expiry, RTSP
    /// watchdogs, timeout flush of half-filled batches.
    pub fn tick(&mut self, rt: &mut Reactor, res: &mut Resources) -> Action {
        let now = res.now_ms;
        if let Some(since) = self.slow.saturated_since_ms {
            if now.saturating_sub(since) > res.cfg.slow_consumer_secs * 1000 {
                info!(
                    "{}: slow consumer (queue saturated {}s, highwater {} bytes, {} packets dropped, {} backpressure events), closing",
                    self.peer,
                    res.cfg.slow_consumer_secs,
                    self.slow.highwater,
                    self.slow.dropped_packets,
                    self.slow.backpressure_events
                );
                res.stats.slow_closes.fetch_add(1, Ordering::Relaxed);
                res.shm
                    .push_log(1, &format!("{}: slow consumer closed", self.peer));
                return Action::Close;
            }
        }
        if self.state == ConnState::Sse && now >= self.sse_next_beat_ms {
            self.sse_next_beat_ms = now + res.cfg.sse_heartbeat_secs * 1000;
            let snap = res.shm.snapshot();
            let payload = serde_json::to_string(&snap).unwrap_or_else(|_| "{}".into());
            let event = format!("data: {payload}\n\n");
            self.queue_output(res, event.as_bytes());
        }
        if let Some(StreamCtx {
            upstream: Upstream::Rtsp(session),
            ..
        }) = self.stream.as_mut()
        {
            match session.tick(rt, now) {
                RtspOutcome::Continue => {}
                RtspOutcome::Finished | RtspOutcome::Error => return Action::Close,
            }
        }
        if !self.sendq.is_empty() && !self.epollout {
            res.stats.timeout_flushes.fetch_add(1, Ordering::Relaxed);
            return self.flush(rt, res);
        }
        Action::None
    }

    /// Earliest deadline this connection needs the worker awake for.
    pub fn next_deadline_ms(&self) -> u64 {
        let mut deadline = self.sse_next_beat_ms;
        if let Some(StreamCtx {
            upstream: Upstream::Mcast(src),
            ..
        }) = self.stream.as_ref()
        {
            deadline = deadline.min(src.next_rejoin_ms());
        }
        deadline
    }

    pub fn maybe_rejoin(&mut self, res: &Resources) {
        if let Some(StreamCtx {
            upstream: Upstream::Mcast(src),
            ..
        }) = self.stream.as_mut()
        {
            src.maybe_rejoin(res.now_ms, res.cfg.mcast_rejoin_interval);
        }
    }

    /// Full teardown. Upstream resources go first, then queued buffers,
    /// then the socket (deregistered by the worker before this call).
    pub fn destroy(mut self, rt: &mut Reactor, res: &mut Resources) {
        if let Some(mut stream) = self.stream.take() {
            debug!(
                "{}: stream {} done (gaps {}, lost {}, dups {}, late {})",
                self.peer, stream.name, stream.seq.gaps, stream.seq.lost, stream.seq.dups,
                stream.seq.late
            );
            match &mut stream.upstream {
                Upstream::Mcast(src) => {
                    rt.deregister(src.fd());
                }
                Upstream::Rtsp(session) => {
                    session.force_cleanup(rt);
                }
            }
        }
        self.sendq.clear(&mut res.pools);
        if let Some(slot) = self.client_slot.take() {
            res.shm.unregister_client(slot);
            res.stats.clients.fetch_sub(1, Ordering::Relaxed);
        }
        res.pools.media.try_shrink();
        drop(self.sock);
    }
}
