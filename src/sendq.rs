// src/sendq.rs
//
// Per-connection egress queue. MEMORY entries reference pool buffers and are
// flushed with one gathering sendmsg per batch; FILE entries own an fd and
// are flushed with sendfile, one call per drain. With MSG_ZEROCOPY enabled a
// sent buffer stays referenced on a pending-completion queue until the
// kernel reports its send id on the socket error queue.
use crate::pool::{BufId, PoolKind, Pools};
use crate::status::WorkerSlot;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;

/// iovec gather cap per sendmsg call.
const MAX_IOVECS: usize = 16;

#[derive(Debug)]
enum Entry {
    Mem {
        pool: PoolKind,
        id: BufId,
    },
    File {
        fd: RawFd,
        offset: i64,
        remaining: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainStatus {
    /// Queue fully flushed.
    Ok,
    /// Kernel said later (EAGAIN/ENOBUFS); EPOLLOUT should be armed.
    WouldBlock,
    Error,
}

#[derive(Debug, Clone, Copy)]
pub struct DrainResult {
    pub sent: usize,
    pub status: DrainStatus,
}

struct PendingCompletion {
    zc_id: u32,
    bufs: SmallVec<[(PoolKind, BufId); 8]>,
}

pub struct SendQueue {
    q: VecDeque<Entry>,
    /// Unsent bytes across all entries; equals enqueued minus sent at all
    /// times.
    bytes: usize,
    zerocopy: bool,
    zc_next_id: u32,
    pending: VecDeque<PendingCompletion>,
}

impl SendQueue {
    pub fn new(zerocopy: bool) -> Self {
        Self {
            q: VecDeque::new(),
            bytes: 0,
            zerocopy,
            zc_next_id: 0,
            pending: VecDeque::new(),
        }
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    #[inline]
    pub fn has_pending_completions(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Append a pool buffer; the queue takes its own reference.
    pub fn enqueue_memory(&mut self, pools: &mut Pools, pool: PoolKind, id: BufId) {
        let len = pools.get(pool).len(id);
        if len == 0 {
            return;
        }
        debug_assert!(pools.get(pool).refcount(id) > 0, "enqueue of a freed buffer");
        pools.get_mut(pool).get_ref(id);
        self.bytes += len;
        self.q.push_back(Entry::Mem { pool, id });
    }

    /// Append a file span; ownership of `fd` transfers to the queue.
    pub fn enqueue_file(&mut self, fd: RawFd, offset: u64, len: u64) {
        self.bytes += len as usize;
        self.q.push_back(Entry::File {
            fd,
            offset: offset as i64,
            remaining: len,
        });
    }

    /// Flush now when the batch threshold is met or a FILE entry heads the
    /// queue (sendfile cannot wait for more gathered memory).
    pub fn should_flush(&self, batch_threshold: usize) -> bool {
        if self.bytes >= batch_threshold {
            return true;
        }
        matches!(self.q.front(), Some(Entry::File { .. }))
    }

    /// Drain toward `fd` until empty or the kernel pushes back.
    pub fn drain(&mut self, fd: RawFd, pools: &mut Pools, stats: &WorkerSlot) -> DrainResult {
        let mut sent_total = 0usize;
        loop {
            match self.q.front() {
                None => {
                    return DrainResult {
                        sent: sent_total,
                        status: DrainStatus::Ok,
                    }
                }
                Some(Entry::File { .. }) => match self.drain_file(fd, stats) {
                    FileStep::Progress(n) => {
                        sent_total += n;
                        continue;
                    }
                    FileStep::WouldBlock => {
                        return DrainResult {
                            sent: sent_total,
                            status: DrainStatus::WouldBlock,
                        }
                    }
                    FileStep::Error => {
                        return DrainResult {
                            sent: sent_total,
                            status: DrainStatus::Error,
                        }
                    }
                },
                Some(Entry::Mem { .. }) => match self.drain_memory(fd, pools, stats) {
                    MemStep::Sent { n, complete } => {
                        sent_total += n;
                        if complete {
                            continue;
                        }
                        // Partial batch: the socket buffer is full enough
                        // that the next call would block.
                        return DrainResult {
                            sent: sent_total,
                            status: DrainStatus::WouldBlock,
                        };
                    }
                    MemStep::WouldBlock => {
                        return DrainResult {
                            sent: sent_total,
                            status: DrainStatus::WouldBlock,
                        }
                    }
                    MemStep::Error => {
                        return DrainResult {
                            sent: sent_total,
                            status: DrainStatus::Error,
                        }
                    }
                },
            }
        }
    }

    fn drain_file(&mut self, fd: RawFd, stats: &WorkerSlot) -> FileStep {
        let Some(Entry::File {
            fd: in_fd,
            offset,
            remaining,
        }) = self.q.front_mut()
        else {
            return FileStep::Error;
        };
        let n = unsafe { libc::sendfile(fd, *in_fd, offset, *remaining as usize) };
        if n > 0 {
            let n = n as usize;
            *remaining -= n as u64;
            self.bytes -= n;
            stats.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
            if *remaining == 0 {
                let done_fd = *in_fd;
                self.q.pop_front();
                unsafe { libc::close(done_fd) };
            }
            FileStep::Progress(n)
        } else if n == 0 {
            // File shorter than promised; drop the entry rather than spin.
            let done_fd = *in_fd;
            self.bytes -= *remaining as usize;
            self.q.pop_front();
            unsafe { libc::close(done_fd) };
            FileStep::Progress(0)
        } else {
            match io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) {
                libc::EAGAIN => {
                    stats.eagain.fetch_add(1, Ordering::Relaxed);
                    FileStep::WouldBlock
                }
                libc::EINTR => FileStep::Progress(0),
                _ => FileStep::Error,
            }
        }
    }

    fn drain_memory(&mut self, fd: RawFd, pools: &mut Pools, stats: &WorkerSlot) -> MemStep {
        // Gather contiguous MEMORY entries; a FILE entry ends the batch.
        let mut iov: SmallVec<[libc::iovec; MAX_IOVECS]> = SmallVec::new();
        let mut batch: SmallVec<[(PoolKind, BufId, usize); MAX_IOVECS]> = SmallVec::new();
        for entry in self.q.iter() {
            if iov.len() == MAX_IOVECS {
                break;
            }
            let Entry::Mem { pool, id } = entry else {
                break;
            };
            let data = pools.get(*pool).data(*id);
            iov.push(libc::iovec {
                iov_base: data.as_ptr() as *mut libc::c_void,
                iov_len: data.len(),
            });
            batch.push((*pool, *id, data.len()));
        }

        let mut flags = libc::MSG_DONTWAIT | libc::MSG_NOSIGNAL;
        if self.zerocopy {
            flags |= libc::MSG_ZEROCOPY;
        }
        let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
        msg.msg_iov = iov.as_mut_ptr();
        msg.msg_iovlen = iov.len();
        let n = unsafe { libc::sendmsg(fd, &msg, flags) };
        if n < 0 {
            return match io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO) {
                libc::EAGAIN => {
                    stats.eagain.fetch_add(1, Ordering::Relaxed);
                    MemStep::WouldBlock
                }
                libc::ENOBUFS => {
                    stats.enobufs.fetch_add(1, Ordering::Relaxed);
                    MemStep::WouldBlock
                }
                libc::EINTR => MemStep::Sent { n: 0, complete: false },
                _ => MemStep::Error,
            };
        }
        let mut left = n as usize;
        let batch_bytes: usize = batch.iter().map(|(_, _, l)| l).sum();
        self.bytes -= left;
        stats.sent_bytes.fetch_add(left as u64, Ordering::Relaxed);
        stats.sent_packets.fetch_add(1, Ordering::Relaxed);

        // One send id per successful MSG_ZEROCOPY sendmsg, whether or not a
        // buffer completed within it.
        let zc_id = if self.zerocopy {
            let id = self.zc_next_id;
            self.zc_next_id = self.zc_next_id.wrapping_add(1);
            stats.zc_sends.fetch_add(1, Ordering::Relaxed);
            Some(id)
        } else {
            None
        };
        let mut completed: SmallVec<[(PoolKind, BufId); 8]> = SmallVec::new();
        for (pool, id, len) in batch {
            if left == 0 {
                break;
            }
            if left >= len {
                // Fully consumed: off the live queue; released now (copy
                // mode) or parked until its completion arrives.
                left -= len;
                self.q.pop_front();
                if zc_id.is_some() {
                    completed.push((pool, id));
                } else {
                    pools.get_mut(pool).put(id);
                }
            } else {
                // Split in place: advance the buffer window past the sent
                // prefix and keep the entry at the head.
                let rest = len - left;
                pools.get_mut(pool).clip(id, left, rest);
                left = 0;
            }
        }
        if let Some(zc_id) = zc_id {
            self.pending.push_back(PendingCompletion {
                zc_id,
                bufs: completed,
            });
        }
        MemStep::Sent {
            n: n as usize,
            complete: n as usize == batch_bytes,
        }
    }

    /// Drain MSG_ZEROCOPY completions from the socket error queue and
    /// release every buffer whose send id is covered.
    pub fn reap_completions(&mut self, fd: RawFd, pools: &mut Pools, stats: &WorkerSlot) {
        if !self.zerocopy {
            return;
        }
        loop {
            let mut control = [0u8; 128];
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_control = control.as_mut_ptr() as *mut libc::c_void;
            msg.msg_controllen = control.len();
            let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_ERRQUEUE) };
            if n < 0 {
                break; // EAGAIN: queue drained
            }
            let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
            while !cmsg.is_null() {
                let (level, ty) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type) };
                let is_recverr = (level == libc::SOL_IP && ty == libc::IP_RECVERR)
                    || (level == libc::SOL_IPV6 && ty == libc::IPV6_RECVERR);
                if is_recverr {
                    let err = unsafe { &*(libc::CMSG_DATA(cmsg) as *const libc::sock_extended_err) };
                    if err.ee_origin == SO_EE_ORIGIN_ZEROCOPY {
                        let lo = err.ee_info;
                        let hi = err.ee_data;
                        if err.ee_code & SO_EE_CODE_ZEROCOPY_COPIED != 0 {
                            stats.zc_copied.fetch_add(1, Ordering::Relaxed);
                        }
                        self.complete_range(lo, hi, pools, stats);
                    }
                }
                cmsg = unsafe { libc::CMSG_NXTHDR(&msg, cmsg) };
            }
        }
    }

    /// Release every pending completion with id in [lo, hi], wrap-aware.
    fn complete_range(&mut self, lo: u32, hi: u32, pools: &mut Pools, stats: &WorkerSlot) {
        let span = hi.wrapping_sub(lo);
        while let Some(front) = self.pending.front() {
            if front.zc_id.wrapping_sub(lo) > span {
                break;
            }
            let done = self.pending.pop_front().unwrap();
            for (pool, id) in done.bufs {
                pools.get_mut(pool).put(id);
            }
            stats.zc_completions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Teardown: release every queued and pending buffer, close FILE fds.
    pub fn clear(&mut self, pools: &mut Pools) {
        for entry in self.q.drain(..) {
            match entry {
                Entry::Mem { pool, id } => pools.get_mut(pool).put(id),
                Entry::File { fd, .. } => unsafe {
                    libc::close(fd);
                },
            }
        }
        for p in self.pending.drain(..) {
            for (pool, id) in p.bufs {
                pools.get_mut(pool).put(id);
            }
        }
        self.bytes = 0;
    }
}

enum FileStep {
    Progress(usize),
    WouldBlock,
    Error,
}

enum MemStep {
    Sent { n: usize, complete: bool },
    WouldBlock,
    Error,
}

const SO_EE_CODE_ZEROCOPY_COPIED: u8 = 1;
const SO_EE_ORIGIN_ZEROCOPY: u8 = 5;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{BufferPool, PoolConfig};
    use crate::status::StatusShm;
    use std::io::Read;
    use std::os::fd::RawFd;

    fn pools() -> Pools {
        let cfg = PoolConfig {
            buf_size: 256,
            step: 16,
            max: 64,
            low_watermark: 0,
            high_watermark: 64,
        };
        Pools {
            media: BufferPool::new(cfg).unwrap(),
            control: BufferPool::new(cfg).unwrap(),
        }
    }

    fn socketpair() -> (RawFd, std::net::TcpStream) {
        // A loopback TCP pair keeps the sendmsg path honest.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        use std::os::fd::IntoRawFd;
        (server.into_raw_fd(), client)
    }

    fn put_payload(pools: &mut Pools, data: &[u8]) -> BufId {
        let id = pools.media.alloc().unwrap();
        pools.media.write_space(id)[..data.len()].copy_from_slice(data);
        pools.media.set_len(id, data.len());
        id
    }

    #[test]
    fn accounting_matches_enqueued_minus_sent() {
        let mut pools = pools();
        let mut q = SendQueue::new(false);
        let shm = StatusShm::create().unwrap();
        let id = put_payload(&mut pools, b"hello world");
        q.enqueue_memory(&mut pools, PoolKind::Media, id);
        pools.media.put(id); // producer reference released
        assert_eq!(q.bytes(), 11);

        let (server, mut client) = socketpair();
        let r = q.drain(server, &mut pools, shm.worker(0));
        assert_eq!(r.status, DrainStatus::Ok);
        assert_eq!(r.sent, 11);
        assert_eq!(q.bytes(), 0);
        let mut buf = [0u8; 32];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        // Copy mode releases at send time; the pool must be whole again.
        let s = pools.media.stats();
        assert_eq!(s.free, s.total);
        unsafe { libc::close(server) };
        shm.destroy();
    }

    #[test]
    fn fifo_across_multiple_buffers() {
        let mut pools = pools();
        let mut q = SendQueue::new(false);
        let shm = StatusShm::create().unwrap();
        for chunk in [&b"aaa"[..], b"bb", b"cccc"] {
            let id = put_payload(&mut pools, chunk);
            q.enqueue_memory(&mut pools, PoolKind::Media, id);
            pools.media.put(id);
        }
        assert_eq!(q.bytes(), 9);
        let (server, mut client) = socketpair();
        let r = q.drain(server, &mut pools, shm.worker(0));
        assert_eq!(r.status, DrainStatus::Ok);
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"aaabbcccc");
        unsafe { libc::close(server) };
        shm.destroy();
    }

    #[test]
    fn should_flush_on_threshold_or_file_head() {
        let mut pools = pools();
        let mut q = SendQueue::new(false);
        let id = put_payload(&mut pools, &[0u8; 100]);
        q.enqueue_memory(&mut pools, PoolKind::Media, id);
        pools.media.put(id);
        assert!(!q.should_flush(256));
        assert!(q.should_flush(64));

        let mut q2 = SendQueue::new(false);
        let f = std::fs::File::open("/proc/self/cmdline").unwrap();
        use std::os::fd::IntoRawFd;
        q2.enqueue_file(f.into_raw_fd(), 0, 4);
        assert!(q2.should_flush(usize::MAX));
        let mut p = pools;
        q2.clear(&mut p);
    }

    #[test]
    fn file_entry_sends_file_bytes() {
        let mut pools = pools();
        let mut q = SendQueue::new(false);
        let shm = StatusShm::create().unwrap();
        let path = std::env::temp_dir().join(format!("sendq-test-{}", std::process::id()));
        std::fs::write(&path, b"0123456789").unwrap();
        let f = std::fs::File::open(&path).unwrap();
        use std::os::fd::IntoRawFd;
        q.enqueue_file(f.into_raw_fd(), 2, 5);
        let (server, mut client) = socketpair();
        let r = q.drain(server, &mut pools, shm.worker(0));
        assert_eq!(r.status, DrainStatus::Ok);
        let mut buf = [0u8; 16];
        let n = client.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"23456");
        std::fs::remove_file(&path).ok();
        unsafe { libc::close(server) };
        shm.destroy();
    }

    #[test]
    fn clear_releases_everything() {
        let mut pools = pools();
        let mut q = SendQueue::new(false);
        for _ in 0..5 {
            let id = put_payload(&mut pools, b"x");
            q.enqueue_memory(&mut pools, PoolKind::Media, id);
            pools.media.put(id);
        }
        q.clear(&mut pools);
        assert_eq!(q.bytes(), 0);
        let s = pools.media.stats();
        assert_eq!(s.free, s.total);
    }
}
