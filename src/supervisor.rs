// src/supervisor.rs
//
// Parent process: forks N workers, reaps and respawns them under a rate
// limit, and fans signals out. Signal handlers write one byte per signal
// into a self-pipe; the main loop polls that pipe and treats it as a
// message queue.
use crate::config::{self, CliArgs, Config};
use crate::status::StatusShm;
use crate::worker;
use anyhow::Context;
use log::{error, info, warn};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant};

static SUP_PIPE_W: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_supervisor_signal(sig: libc::c_int) {
    let fd = SUP_PIPE_W.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte: u8 = match sig {
            libc::SIGCHLD => b'C',
            libc::SIGHUP => b'H',
            libc::SIGUSR1 => b'U',
            _ => b'T',
        };
        unsafe {
            libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        }
    }
}

struct WorkerProc {
    id: u32,
    pid: Option<Pid>,
    /// Recent spawn timestamps (ms), newest last, capped at the limit.
    restarts: VecDeque<u64>,
}

impl WorkerProc {
    fn new(id: u32) -> Self {
        Self {
            id,
            pid: None,
            restarts: VecDeque::new(),
        }
    }

    /// Rate limit: more than `limit` spawns inside `window_ms` parks the
    /// worker until the window clears.
    fn rate_limited(&mut self, now_ms: u64, limit: u32, window_ms: u64) -> bool {
        while let Some(&t) = self.restarts.front() {
            if now_ms.saturating_sub(t) > window_ms {
                self.restarts.pop_front();
            } else {
                break;
            }
        }
        self.restarts.len() >= limit as usize
    }
}

pub struct Supervisor {
    cfg: Config,
    cli: CliArgs,
    shm: StatusShm,
    workers: Vec<WorkerProc>,
    pipe_r: RawFd,
    self_pid: libc::pid_t,
    shutting_down: bool,
}

impl Supervisor {
    pub fn new(cfg: Config, cli: CliArgs) -> anyhow::Result<Self> {
        // Pre-flight the listen set: workers bind their own SO_REUSEPORT
        // sockets after fork, but an unusable address should fail startup
        // with a non-zero exit instead of churning the restart limiter.
        for bind in &cfg.listen {
            for addr in bind.resolve()? {
                crate::net::build_listener(addr, 16)
                    .with_context(|| format!("cannot listen on {addr}"))?;
            }
        }
        let shm = StatusShm::create()?;
        shm.set_log_level(cfg.verbosity as u32);
        let mut fds = [0 as libc::c_int; 2];
        let rc = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if rc != 0 {
            return Err(io::Error::last_os_error()).context("pipe2");
        }
        SUP_PIPE_W.store(fds[1], Ordering::Relaxed);
        let workers = (0..cfg.workers as u32).map(WorkerProc::new).collect();
        Ok(Self {
            cfg,
            cli,
            shm,
            workers,
            pipe_r: fds[0],
            self_pid: unsafe { libc::getpid() },
            shutting_down: false,
        })
    }

    fn install_signals(&self) -> anyhow::Result<()> {
        let action = SigAction::new(
            SigHandler::Handler(on_supervisor_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
        unsafe {
            sigaction(Signal::SIGCHLD, &action).context("sigaction CHLD")?;
            sigaction(Signal::SIGTERM, &action).context("sigaction TERM")?;
            sigaction(Signal::SIGINT, &action).context("sigaction INT")?;
            sigaction(Signal::SIGHUP, &action).context("sigaction HUP")?;
            sigaction(Signal::SIGUSR1, &action).context("sigaction USR1")?;
            sigaction(Signal::SIGPIPE, &ignore).context("sigaction PIPE")?;
        }
        Ok(())
    }

    pub fn run(mut self) -> anyhow::Result<()> {
        self.install_signals()?;
        if self.cfg.iface_default.is_some()
            || self.cfg.iface_fcc.is_some()
            || self.cfg.iface_rtsp.is_some()
            || self.cfg.iface_mcast.is_some()
        {
            info!(
                "upstream interfaces: default={:?} fcc={:?} rtsp={:?} mcast={:?}",
                self.cfg.iface_default, self.cfg.iface_fcc, self.cfg.iface_rtsp,
                self.cfg.iface_mcast
            );
        }
        self.spawn_missing();

        loop {
            let mut term = false;
            let mut hup = false;
            let mut usr1 = false;
            self.wait_pipe(500, &mut term, &mut hup, &mut usr1);
            self.reap_children();
            if term {
                break;
            }
            if usr1 {
                info!("SIGUSR1: cycling all workers");
                self.broadcast(Signal::SIGTERM);
            }
            if hup {
                self.reload();
            }
            self.spawn_missing();
        }

        self.shutdown();
        Ok(())
    }

    fn wait_pipe(&self, timeout_ms: i32, term: &mut bool, hup: &mut bool, usr1: &mut bool) {
        let mut pfd = libc::pollfd {
            fd: self.pipe_r,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc <= 0 {
            return;
        }
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe {
                libc::read(self.pipe_r, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
            for &b in &buf[..n as usize] {
                match b {
                    b'T' => *term = true,
                    b'H' => *hup = true,
                    b'U' => *usr1 = true,
                    _ => {} // 'C': reap below regardless
                }
            }
        }
    }

    fn reap_children(&mut self) {
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, code)) => {
                    self.on_worker_exit(pid, &format!("exit code {code}"));
                }
                Ok(WaitStatus::Signaled(pid, sig, _)) => {
                    self.on_worker_exit(pid, &format!("killed by {sig}"));
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }

    fn on_worker_exit(&mut self, pid: Pid, why: &str) {
        if let Some(w) = self.workers.iter_mut().find(|w| w.pid == Some(pid)) {
            if self.shutting_down {
                info!("worker {} (pid {pid}) exited: {why}", w.id);
            } else {
                warn!("worker {} (pid {pid}) exited: {why}", w.id);
                self.shm.push_log(1, &format!("worker {} exited: {why}", w.id));
            }
            w.pid = None;
        }
    }

    fn spawn_missing(&mut self) {
        if self.shutting_down {
            return;
        }
        let now_ms = crate::util::now_ms();
        let limit = self.cfg.restart_limit;
        let window_ms = self.cfg.restart_window_secs * 1000;
        for i in 0..self.workers.len() {
            if self.workers[i].pid.is_some() {
                continue;
            }
            if self.workers[i].rate_limited(now_ms, limit, window_ms) {
                // Retried on a later tick once the window clears.
                continue;
            }
            self.spawn_one(i, now_ms);
        }
    }

    fn spawn_one(&mut self, idx: usize, now_ms: u64) {
        let id = self.workers[idx].id;
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let code = match worker::run(
                    id,
                    self.cfg.clone(),
                    self.cli.clone(),
                    self.shm,
                    self.self_pid,
                ) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("worker {id}: {e:#}");
                        1
                    }
                };
                std::process::exit(code);
            }
            Ok(ForkResult::Parent { child }) => {
                info!("worker {id} spawned (pid {child})");
                let w = &mut self.workers[idx];
                w.pid = Some(child);
                w.restarts.push_back(now_ms);
                while w.restarts.len() > self.cfg.restart_limit as usize + 1 {
                    w.restarts.pop_front();
                }
            }
            Err(e) => error!("fork worker {id}: {e}"),
        }
    }

    /// SIGHUP: rebuild the config (CLI flags still shadow). A failed reload
    /// keeps the old config and is NOT forwarded to workers. A changed
    /// listen set escalates to a full worker restart.
    fn reload(&mut self) {
        let fresh = config::reload(&self.cfg, &self.cli);
        let binds_changed = config::binds_changed(&self.cfg, &fresh);
        let old_count = self.workers.len();
        let new_count = fresh.workers;
        self.shm.set_log_level(fresh.verbosity as u32);
        self.cfg = fresh;

        if new_count > old_count {
            for id in old_count as u32..new_count as u32 {
                self.workers.push(WorkerProc::new(id));
            }
        } else if new_count < old_count {
            for w in self.workers.drain(new_count..) {
                if let Some(pid) = w.pid {
                    let _ = kill(pid, Signal::SIGTERM);
                }
            }
        }
        let sig = if binds_changed {
            info!("reload: bind addresses changed, restarting workers");
            Signal::SIGTERM
        } else {
            info!("reload: signaling workers to re-read configuration");
            Signal::SIGHUP
        };
        self.broadcast(sig);
    }

    fn broadcast(&self, sig: Signal) {
        for w in &self.workers {
            if let Some(pid) = w.pid {
                let _ = kill(pid, sig);
            }
        }
    }

    fn alive(&self) -> usize {
        self.workers.iter().filter(|w| w.pid.is_some()).count()
    }

    fn shutdown(&mut self) {
        info!("shutting down, terminating {} worker(s)", self.alive());
        self.shutting_down = true;
        self.broadcast(Signal::SIGTERM);

        let deadline = Instant::now() + Duration::from_secs(self.cfg.shutdown_grace_secs);
        while self.alive() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(50));
            self.reap_children();
        }
        if self.alive() > 0 {
            warn!("{} worker(s) survived the grace period, sending SIGKILL", self.alive());
            for w in &self.workers {
                if let Some(pid) = w.pid {
                    let _ = kill(pid, Signal::SIGKILL);
                }
            }
            std::thread::sleep(Duration::from_millis(50));
            self.reap_children();
        }
        self.shm.destroy();
        info!("clean shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_window() {
        let mut w = WorkerProc::new(0);
        // Three restarts inside the 5s window hit the limit.
        w.restarts.extend([1000, 2000, 3000]);
        assert!(w.rate_limited(3500, 3, 5000));
        // Once the window clears, spawning resumes.
        assert!(!w.rate_limited(8000, 3, 5000));
        assert_eq!(w.restarts.len(), 1);
    }

    #[test]
    fn under_limit_is_not_limited() {
        let mut w = WorkerProc::new(0);
        w.restarts.extend([1000, 2000]);
        assert!(!w.rate_limited(2500, 3, 5000));
    }
}
