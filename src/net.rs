// src/net.rs
use anyhow::Context;
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

pub const EV_IN: u32 = libc::EPOLLIN as u32;
pub const EV_OUT: u32 = libc::EPOLLOUT as u32;
pub const EV_ERR: u32 = libc::EPOLLERR as u32;
pub const EV_HUP: u32 = libc::EPOLLHUP as u32;
pub const EV_RDHUP: u32 = libc::EPOLLRDHUP as u32;

/// Thin epoll wrapper. Event payload is the raw fd; the worker resolves
/// ownership through its fd map.
pub struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub fn new() -> anyhow::Result<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error()).context("epoll_create1");
        }
        Ok(Self { fd })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.fd, op, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[inline]
    pub fn add(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    #[inline]
    pub fn modify(&self, fd: RawFd, events: u32) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    #[inline]
    pub fn del(&self, fd: RawFd) -> io::Result<()> {
        // Kernels before 2.6.9 demanded a non-null event for DEL; keep one.
        let mut ev = libc::epoll_event { events: 0, u64: 0 };
        let rc = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Wait for events. `timeout_ms < 0` blocks indefinitely. EINTR is
    /// surfaced as an empty batch so the caller re-evaluates its stop flag.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: i32) -> io::Result<usize> {
        let rc = unsafe {
            libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as libc::c_int,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err);
        }
        Ok(rc as usize)
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}

/// TCP listener shared across workers via SO_REUSEPORT. Each worker builds
/// its own socket for the same bind address; the kernel shards accepts.
pub fn build_listener(addr: SocketAddr, backlog: i32) -> anyhow::Result<Socket> {
    let domain = Domain::for_address(addr);
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).context("socket")?;
    sock.set_reuse_address(true).ok();
    sock.set_reuse_port(true).context("SO_REUSEPORT")?;
    if addr.is_ipv6() {
        // Dual-stack is handled by listing both families in [bind].
        sock.set_only_v6(true).ok();
    }
    sock.bind(&addr.into())
        .with_context(|| format!("bind {addr}"))?;
    sock.listen(backlog).context("listen")?;
    sock.set_nonblocking(true).context("set_nonblocking")?;
    Ok(sock)
}

/// Enable kernel MSG_ZEROCOPY completions on a TCP socket. Returns false on
/// kernels without SO_ZEROCOPY; the send queue then stays in copy mode.
pub fn enable_zerocopy(fd: RawFd) -> bool {
    let one: libc::c_int = 1;
    let rc = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ZEROCOPY,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    rc == 0
}

/// Non-blocking TCP connect, optionally pinned to an interface. Returns the
/// socket and whether the connect completed synchronously (localhost fast
/// path); otherwise the caller arms EPOLLOUT and resumes on writability.
pub fn connect_nonblocking(
    addr: SocketAddr,
    bind_device: Option<&str>,
) -> anyhow::Result<(Socket, bool)> {
    let domain = Domain::for_address(addr);
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).context("socket")?;
    if let Some(dev) = bind_device {
        sock.bind_device(Some(dev.as_bytes()))
            .with_context(|| format!("SO_BINDTODEVICE {dev}"))?;
    }
    sock.set_nonblocking(true).context("set_nonblocking")?;
    sock.set_nodelay(true).ok();
    match sock.connect(&addr.into()) {
        Ok(()) => Ok((sock, true)),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok((sock, false)),
        Err(e) => Err(e).with_context(|| format!("connect {addr}")),
    }
}

/// After EPOLLOUT on a connecting socket, check SO_ERROR for the outcome.
pub fn connect_result(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

/// Bind a non-blocking UDP socket on `addr`, used for RTSP RTP/RTCP pairs.
pub fn udp_bound(addr: SocketAddr) -> io::Result<Socket> {
    let domain = Domain::for_address(addr);
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    sock.set_reuse_address(true).ok();
    sock.bind(&addr.into())?;
    sock.set_nonblocking(true)?;
    Ok(sock)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// `n` bytes moved.
    Done(usize),
    WouldBlock,
    /// Orderly remote close (recv only).
    Closed,
    Error(i32),
}

/// One non-blocking recv into `buf`.
pub fn recv_once(fd: RawFd, buf: &mut [u8]) -> IoStatus {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
    if n > 0 {
        IoStatus::Done(n as usize)
    } else if n == 0 {
        IoStatus::Closed
    } else {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        match errno {
            libc::EAGAIN | libc::EINTR => IoStatus::WouldBlock,
            e => IoStatus::Error(e),
        }
    }
}

/// One non-blocking send of `buf`.
pub fn send_once(fd: RawFd, buf: &[u8]) -> IoStatus {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n >= 0 {
        IoStatus::Done(n as usize)
    } else {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO);
        match errno {
            libc::EAGAIN | libc::EINTR | libc::ENOBUFS => IoStatus::WouldBlock,
            e => IoStatus::Error(e),
        }
    }
}

/// Drain a readable socket without keeping the data. Used when the buffer
/// pool is exhausted: level-triggered readiness would otherwise spin.
pub fn drain_socket(fd: RawFd) {
    let mut scratch = [0u8; 2048];
    loop {
        match recv_once(fd, &mut scratch) {
            IoStatus::Done(_) => continue,
            _ => break,
        }
    }
}

/// Interface name → index, 0 when unknown.
pub fn iface_index(name: &str) -> u32 {
    let Ok(cname) = std::ffi::CString::new(name) else {
        return 0;
    };
    unsafe { libc::if_nametoindex(cname.as_ptr()) }
}

/// First IPv4 address configured on `name` (source-specific joins need the
/// interface address, not its index).
pub fn iface_ipv4(name: &str) -> Option<std::net::Ipv4Addr> {
    let addrs = nix::ifaddrs::getifaddrs().ok()?;
    for ifa in addrs {
        if ifa.interface_name != name {
            continue;
        }
        if let Some(storage) = ifa.address {
            if let Some(sin) = storage.as_sockaddr_in() {
                return Some(sin.ip());
            }
        }
    }
    None
}
