// src/worker.rs
//
// One single-threaded worker process: an epoll set, its share of the
// SO_REUSEPORT listeners, the fd→owner map, the buffer pools, and every
// connection it accepted. Suspension happens only in epoll_wait; everything
// else is non-blocking. Signals funnel through a self-pipe so the main loop
// sees them as ordinary readable events.
use crate::config::{self, CliArgs, Config};
use crate::connection::{Action, Connection};
use crate::fetch::Fetcher;
use crate::net::{self, Epoll, EV_IN, EV_RDHUP};
use crate::pool::{BufferPool, PoolConfig, Pools};
use crate::service::{self, ServiceMap};
use crate::status::StatusShm;
use anyhow::Context;
use log::{debug, error, info, warn};
use slab::Slab;
use socket2::Socket;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

const MAINTENANCE_TICK_MS: u64 = 100;
const EVENT_BATCH: usize = 64;
const LISTEN_BACKLOG: i32 = 128;

const FETCH_M3U: usize = 0;
const FETCH_EPG: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdOwner {
    Listener(usize),
    /// Signal self-pipe read end.
    Pipe,
    Conn(usize),
    /// Upstream fd (multicast, RTSP control, RTP/RTCP) owned by a
    /// connection's stream.
    Upstream(usize),
    Fetch(usize),
}

/// fd → owner, a flat array indexed by fd grown on demand. Registration
/// always precedes epoll events for the fd; deregistration precedes close.
#[derive(Default)]
pub struct FdMap {
    v: Vec<Option<FdOwner>>,
}

impl FdMap {
    fn set(&mut self, fd: RawFd, owner: FdOwner) {
        let idx = fd as usize;
        if idx >= self.v.len() {
            self.v.resize(idx + 1, None);
        }
        self.v[idx] = Some(owner);
    }

    fn clear(&mut self, fd: RawFd) {
        if let Some(slot) = self.v.get_mut(fd as usize) {
            *slot = None;
        }
    }

    pub fn owner(&self, fd: RawFd) -> Option<FdOwner> {
        self.v.get(fd as usize).copied().flatten()
    }
}

/// Epoll + fd map, the pair every registration touches together.
pub struct Reactor {
    pub epoll: Epoll,
    fds: FdMap,
}

impl Reactor {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            fds: FdMap::default(),
        })
    }

    pub fn register(&mut self, fd: RawFd, events: u32, owner: FdOwner) -> io::Result<()> {
        self.epoll.add(fd, events)?;
        self.fds.set(fd, owner);
        Ok(())
    }

    pub fn rearm(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.epoll.modify(fd, events)
    }

    /// Remove from epoll and the map; the fd is still open afterwards and
    /// the owner closes it.
    pub fn deregister(&mut self, fd: RawFd) {
        let _ = self.epoll.del(fd);
        self.fds.clear(fd);
    }

    #[inline]
    pub fn owner(&self, fd: RawFd) -> Option<FdOwner> {
        self.fds.owner(fd)
    }
}

/// Everything handlers need besides the reactor: configuration snapshot,
/// pools, shared-memory status, and the service table.
pub struct Resources {
    pub cfg: Config,
    pub pools: Pools,
    pub shm: StatusShm,
    pub stats: &'static crate::status::WorkerSlot,
    pub worker_id: u32,
    pub now_ms: u64,
    pub services: ServiceMap,
    pub epg_cache: Option<Vec<u8>>,
}

// Self-pipe write end for the signal handlers.
static SIG_PIPE_W: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_worker_signal(sig: libc::c_int) {
    let fd = SIG_PIPE_W.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = if sig == libc::SIGHUP { b'H' } else { b'T' };
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

pub struct Worker {
    rt: Reactor,
    res: Resources,
    conns: Slab<Connection>,
    listeners: Vec<Socket>,
    fetchers: Vec<Option<Fetcher>>,
    sig_pipe_r: RawFd,
    cli: CliArgs,
    next_maintenance_ms: u64,
    stop: bool,
    draining_since_ms: Option<u64>,
}

/// Worker process entry, called in the child right after fork.
pub fn run(
    worker_id: u32,
    cfg: Config,
    cli: CliArgs,
    shm: StatusShm,
    supervisor_pid: libc::pid_t,
) -> anyhow::Result<()> {
    // Die with the supervisor, and close the race where it already exited
    // between fork and prctl.
    unsafe {
        libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
    }
    if unsafe { libc::getppid() } != supervisor_pid {
        anyhow::bail!("supervisor exited before worker start");
    }

    // The child inherits the supervisor's handlers, which write into the
    // shared self-pipe fd; restore defaults until our own are installed.
    {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let dfl = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for sig in [
            Signal::SIGCHLD,
            Signal::SIGUSR1,
            Signal::SIGTERM,
            Signal::SIGINT,
            Signal::SIGHUP,
        ] {
            unsafe {
                let _ = sigaction(sig, &dfl);
            }
        }
    }

    let stats = shm.worker(worker_id as usize);
    stats.pid.store(unsafe { libc::getpid() } as u32, Ordering::Relaxed);

    let mut worker = Worker::new(worker_id, cfg, cli, shm, stats)?;
    worker.install_signals()?;
    worker.run_loop()
}

impl Worker {
    fn new(
        worker_id: u32,
        cfg: Config,
        cli: CliArgs,
        shm: StatusShm,
        stats: &'static crate::status::WorkerSlot,
    ) -> anyhow::Result<Self> {
        let mut rt = Reactor::new()?;

        let pools = Pools {
            media: BufferPool::new(PoolConfig {
                buf_size: cfg.buffer_size,
                step: 256,
                max: cfg.pool_max,
                low_watermark: 64,
                high_watermark: 1024,
            })?,
            control: BufferPool::new(PoolConfig {
                buf_size: cfg.buffer_size,
                step: 64,
                max: 2048,
                low_watermark: 8,
                high_watermark: 256,
            })?,
        };

        let listeners = bind_listeners(&cfg, &mut rt)?;
        let services = service::build_map(&cfg.services);

        let mut fetchers: Vec<Option<Fetcher>> = vec![None, None];
        if let Some(url) = &cfg.external_m3u {
            match Fetcher::new(url, cfg.external_m3u_interval) {
                Ok(f) => fetchers[FETCH_M3U] = Some(f),
                Err(e) => warn!("external m3u disabled: {e:#}"),
            }
        }
        if let Some(url) = &cfg.external_epg {
            match Fetcher::new(url, cfg.external_m3u_interval) {
                Ok(f) => fetchers[FETCH_EPG] = Some(f),
                Err(e) => warn!("external epg disabled: {e:#}"),
            }
        }

        Ok(Self {
            rt,
            res: Resources {
                cfg,
                pools,
                shm,
                stats,
                worker_id,
                now_ms: crate::util::now_ms(),
                services,
                epg_cache: None,
            },
            conns: Slab::new(),
            listeners,
            fetchers,
            sig_pipe_r: -1,
            cli,
            next_maintenance_ms: 0,
            stop: false,
            draining_since_ms: None,
        })
    }

    fn install_signals(&mut self) -> anyhow::Result<()> {
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).context("pipe2");
        }
        SIG_PIPE_W.store(fds[1], Ordering::Relaxed);
        self.sig_pipe_r = fds[0];
        self.rt
            .register(self.sig_pipe_r, EV_IN, FdOwner::Pipe)
            .context("register signal pipe")?;

        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let action = SigAction::new(
            SigHandler::Handler(on_worker_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            sigaction(Signal::SIGTERM, &action).context("sigaction TERM")?;
            sigaction(Signal::SIGINT, &action).context("sigaction INT")?;
            sigaction(Signal::SIGHUP, &action).context("sigaction HUP")?;
            sigaction(Signal::SIGPIPE, &ignore).context("sigaction PIPE")?;
        }
        Ok(())
    }

    fn run_loop(&mut self) -> anyhow::Result<()> {
        info!(
            "worker {} up: {} listener(s), {} service(s)",
            self.res.worker_id,
            self.listeners.len(),
            self.res.services.len()
        );
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; EVENT_BATCH];
        loop {
            self.res.now_ms = crate::util::now_ms();
            let timeout = self.next_wake_ms().saturating_sub(self.res.now_ms).min(1000) as i32;
            let n = self.rt.epoll.wait(&mut events, timeout)?;
            self.res.now_ms = crate::util::now_ms();

            for ev in &events[..n] {
                let fd = ev.u64 as RawFd;
                let bits = ev.events;
                match self.rt.owner(fd) {
                    Some(FdOwner::Listener(i)) => self.accept_all(i),
                    Some(FdOwner::Pipe) => self.on_pipe(),
                    Some(FdOwner::Conn(key)) => {
                        let act = match self.conns.get_mut(key) {
                            Some(conn) => conn.on_event(&mut self.rt, &mut self.res, bits),
                            None => Action::None,
                        };
                        if act == Action::Close {
                            self.destroy_conn(key);
                        }
                    }
                    Some(FdOwner::Upstream(key)) => {
                        let act = match self.conns.get_mut(key) {
                            Some(conn) => {
                                conn.on_upstream_event(&mut self.rt, &mut self.res, fd, bits)
                            }
                            None => Action::None,
                        };
                        if act == Action::Close {
                            self.destroy_conn(key);
                        }
                    }
                    Some(FdOwner::Fetch(slot)) => self.on_fetch_event(slot, bits),
                    None => {
                        // Stale event for an fd deregistered earlier in this
                        // batch; nothing to do.
                        debug!("event for unmapped fd {fd}");
                    }
                }
            }

            if self.res.now_ms >= self.next_maintenance_ms {
                self.maintenance();
                self.next_maintenance_ms = self.res.now_ms + MAINTENANCE_TICK_MS;
            }

            if self.stop {
                if self.begin_drain() {
                    break;
                }
            }
        }
        self.shutdown();
        Ok(())
    }

    fn next_wake_ms(&self) -> u64 {
        let mut wake = self.next_maintenance_ms;
        for (_, conn) in self.conns.iter() {
            wake = wake.min(conn.next_deadline_ms());
        }
        for f in self.fetchers.iter().flatten() {
            wake = wake.min(f.next_attempt_ms);
        }
        wake.max(self.res.now_ms)
    }

    fn accept_all(&mut self, listener_idx: usize) {
        loop {
            let r = match self.listeners.get(listener_idx) {
                Some(l) => l.accept(),
                None => return,
            };
            match r {
                Ok((sock, addr)) => {
                    if sock.set_nonblocking(true).is_err() {
                        continue;
                    }
                    let peer = addr
                        .as_socket()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "?".into());
                    let entry = self.conns.vacant_entry();
                    let key = entry.key();
                    let conn = Connection::new(sock, peer, key, &self.res);
                    let fd = conn.fd();
                    let conn = entry.insert(conn);
                    if self
                        .rt
                        .register(fd, EV_IN | EV_RDHUP, FdOwner::Conn(key))
                        .is_err()
                    {
                        let _ = conn;
                        let conn = self.conns.remove(key);
                        conn.destroy(&mut self.rt, &mut self.res);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                Err(e) => {
                    // EMFILE and friends: log and let the tick retry.
                    warn!("accept: {e}");
                    return;
                }
            }
        }
    }

    fn on_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(
                    self.sig_pipe_r,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if n <= 0 {
                break;
            }
            for &b in &buf[..n as usize] {
                match b {
                    b'T' => {
                        info!("worker {}: shutdown requested", self.res.worker_id);
                        self.stop = true;
                    }
                    b'H' => self.reload(),
                    other => debug!("pipe: unknown control byte {other}"),
                }
            }
        }
    }

    /// SIGHUP: re-read the config (CLI still shadows), swap the service map,
    /// re-bind listeners if the listen set changed, refresh external feeds.
    fn reload(&mut self) {
        info!("worker {}: reloading configuration", self.res.worker_id);
        let fresh = config::reload(&self.res.cfg, &self.cli);
        let rebind = config::binds_changed(&self.res.cfg, &fresh);
        self.res.services = service::build_map(&fresh.services);
        self.res.cfg = fresh;
        if rebind {
            for l in self.listeners.drain(..) {
                self.rt.deregister(l.as_raw_fd());
            }
            match bind_listeners(&self.res.cfg, &mut self.rt) {
                Ok(ls) => self.listeners = ls,
                Err(e) => {
                    // Keep serving existing clients; the supervisor decides
                    // whether to cycle us.
                    error!("worker {}: rebind failed: {e:#}", self.res.worker_id);
                }
            }
        }
        for f in self.fetchers.iter_mut().flatten() {
            f.next_attempt_ms = 0; // refresh now
        }
    }

    fn on_fetch_event(&mut self, slot: usize, events: u32) {
        let Some(Some(fetcher)) = self.fetchers.get_mut(slot) else {
            return;
        };
        let Some(result) = fetcher.handle_event(&mut self.rt, events, self.res.now_ms) else {
            return;
        };
        match slot {
            FETCH_M3U => {
                let services = crate::playlist::parse_m3u(&String::from_utf8_lossy(&result.body));
                if services.is_empty() {
                    warn!("external m3u: no services parsed, keeping current table");
                    return;
                }
                info!("external m3u: {} services", services.len());
                self.res.services = service::build_map(&services);
            }
            FETCH_EPG => {
                info!("epg updated (HTTP {}, {} bytes)", result.status, result.body.len());
                self.res.epg_cache = Some(result.body);
            }
            _ => {}
        }
    }

    fn maintenance(&mut self) {
        // Connection upkeep: heartbeats, watchdogs, slow-consumer expiry,
        // timeout flushes, multicast rejoin.
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            let act = match self.conns.get_mut(key) {
                Some(conn) => {
                    conn.maybe_rejoin(&self.res);
                    conn.tick(&mut self.rt, &mut self.res)
                }
                None => Action::None,
            };
            if act == Action::Close {
                self.destroy_conn(key);
            }
        }
        // External fetch scheduling.
        for slot in 0..self.fetchers.len() {
            if let Some(Some(f)) = self.fetchers.get_mut(slot) {
                if f.due(self.res.now_ms) {
                    debug!("starting fetch of {}", f.url());
                    let now = self.res.now_ms;
                    f.start(&mut self.rt, slot, now);
                }
            }
        }
        // Mirror pool stats into the shared region.
        let ps = self.res.pools.media.stats();
        self.res.stats.pool_total.store(ps.total, Ordering::Relaxed);
        self.res.stats.pool_free.store(ps.free, Ordering::Relaxed);
        self.res
            .stats
            .pool_exhaustions
            .store(ps.exhaustions, Ordering::Relaxed);
        self.res
            .stats
            .pool_expansions
            .store(ps.expansions, Ordering::Relaxed);
        self.res.stats.pool_shrinks.store(ps.shrinks, Ordering::Relaxed);
    }

    /// First call closes the listeners and starts the drain clock; returns
    /// true once every connection is gone or the grace period lapsed.
    fn begin_drain(&mut self) -> bool {
        if self.draining_since_ms.is_none() {
            self.draining_since_ms = Some(self.res.now_ms);
            for l in self.listeners.drain(..) {
                self.rt.deregister(l.as_raw_fd());
            }
            let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
            for key in keys {
                // Streams stop; queued bytes get the grace period to drain.
                let empty = self
                    .conns
                    .get(key)
                    .map(|c| c.sendq.is_empty())
                    .unwrap_or(true);
                if empty {
                    self.destroy_conn(key);
                }
            }
        }
        let grace = self.res.cfg.shutdown_grace_secs * 1000;
        let deadline_hit = self
            .draining_since_ms
            .map(|t| self.res.now_ms.saturating_sub(t) >= grace)
            .unwrap_or(false);
        self.conns.is_empty() || deadline_hit
    }

    fn destroy_conn(&mut self, key: usize) {
        if !self.conns.contains(key) {
            return;
        }
        let conn = self.conns.remove(key);
        self.rt.deregister(conn.fd());
        conn.destroy(&mut self.rt, &mut self.res);
    }

    fn shutdown(&mut self) {
        let keys: Vec<usize> = self.conns.iter().map(|(k, _)| k).collect();
        for key in keys {
            self.destroy_conn(key);
        }
        self.res.stats.pid.store(0, Ordering::Relaxed);
        info!("worker {} exiting", self.res.worker_id);
    }
}

fn bind_listeners(cfg: &Config, rt: &mut Reactor) -> anyhow::Result<Vec<Socket>> {
    let mut out = Vec::new();
    for bind in &cfg.listen {
        for addr in bind.resolve()? {
            let sock = net::build_listener(addr, LISTEN_BACKLOG)?;
            let idx = out.len();
            rt.register(sock.as_raw_fd(), EV_IN, FdOwner::Listener(idx))
                .context("register listener")?;
            info!("listening on {addr}");
            out.push(sock);
        }
    }
    anyhow::ensure!(!out.is_empty(), "no listen addresses");
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fd_map_set_get_clear() {
        let mut m = FdMap::default();
        assert_eq!(m.owner(5), None);
        m.set(5, FdOwner::Conn(3));
        assert_eq!(m.owner(5), Some(FdOwner::Conn(3)));
        m.set(900, FdOwner::Pipe);
        assert_eq!(m.owner(900), Some(FdOwner::Pipe));
        m.clear(5);
        assert_eq!(m.owner(5), None);
    }

    #[test]
    fn reactor_registers_before_events() {
        let mut rt = Reactor::new().unwrap();
        let mut fds = [0 as libc::c_int; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK) }, 0);
        rt.register(fds[0], EV_IN, FdOwner::Pipe).unwrap();
        assert_eq!(rt.owner(fds[0]), Some(FdOwner::Pipe));

        // A write wakes the poller with the registered fd as payload.
        unsafe { libc::write(fds[1], b"x".as_ptr() as *const libc::c_void, 1) };
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; 4];
        let n = rt.epoll.wait(&mut events, 100).unwrap();
        assert_eq!(n, 1);
        assert_eq!(events[0].u64 as RawFd, fds[0]);

        rt.deregister(fds[0]);
        assert_eq!(rt.owner(fds[0]), None);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }
}
