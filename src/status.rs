// src/status.rs
//
// Shared-memory status region. The supervisor maps it MAP_SHARED|MAP_ANONYMOUS
// before forking; every worker inherits the same mapping. Discipline: each
// worker writes only its own slot (and client slots it registered); any
// process may read. Counters are monotonic atomics, strings are published
// behind a length store with Release ordering, and readers tolerate torn
// text; the status UI is best-effort.
use serde::Serialize;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

pub const MAX_WORKERS: usize = 32;
pub const MAX_CLIENTS: usize = 512;
pub const LOG_RING: usize = 64;
pub const LOG_LINE: usize = 128;
const NAME_LEN: usize = 64;

#[repr(C)]
pub struct WorkerSlot {
    pub pid: AtomicU32,
    pub clients: AtomicU32,
    pub sent_bytes: AtomicU64,
    pub sent_packets: AtomicU64,
    pub eagain: AtomicU64,
    pub enobufs: AtomicU64,
    pub zc_sends: AtomicU64,
    pub zc_completions: AtomicU64,
    pub zc_copied: AtomicU64,
    pub batch_flushes: AtomicU64,
    pub timeout_flushes: AtomicU64,
    pub dropped_bytes: AtomicU64,
    pub dropped_packets: AtomicU64,
    pub slow_closes: AtomicU64,
    pub pool_total: AtomicU64,
    pub pool_free: AtomicU64,
    pub pool_exhaustions: AtomicU64,
    pub pool_expansions: AtomicU64,
    pub pool_shrinks: AtomicU64,
}

#[repr(C)]
pub struct ClientSlot {
    /// 0 free, 1 claimed. Claim is a CAS by the registering worker.
    used: AtomicU32,
    worker: AtomicU32,
    addr_len: AtomicU32,
    service_len: AtomicU32,
    pub bytes_sent: AtomicU64,
    pub dropped_packets: AtomicU64,
    addr: UnsafeCell<[u8; NAME_LEN]>,
    service: UnsafeCell<[u8; NAME_LEN]>,
}

#[repr(C)]
struct LogEntry {
    seq: AtomicU64,
    level: AtomicU32,
    len: AtomicU32,
    text: UnsafeCell<[u8; LOG_LINE]>,
}

#[repr(C)]
struct Region {
    log_level: AtomicU32,
    log_head: AtomicU64,
    workers: [WorkerSlot; MAX_WORKERS],
    clients: [ClientSlot; MAX_CLIENTS],
    log: [LogEntry; LOG_RING],
}

/// Handle to the mapped region; trivially copyable across fork.
#[derive(Clone, Copy)]
pub struct StatusShm {
    region: *mut Region,
}

// Single-writer-per-slot discipline; readers accept torn strings.
unsafe impl Send for StatusShm {}
unsafe impl Sync for StatusShm {}

impl StatusShm {
    pub fn create() -> anyhow::Result<Self> {
        let len = std::mem::size_of::<Region>();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            anyhow::bail!("mmap status region: {}", std::io::Error::last_os_error());
        }
        // Anonymous mappings are zero-filled, which is exactly the initial
        // state every field wants.
        Ok(Self {
            region: ptr as *mut Region,
        })
    }

    /// Supervisor-side teardown after all workers exited.
    pub fn destroy(self) {
        unsafe {
            libc::munmap(self.region as *mut libc::c_void, std::mem::size_of::<Region>());
        }
    }

    #[inline]
    fn region(&self) -> &Region {
        unsafe { &*self.region }
    }

    /// The mapping lives for the whole process; slot references are handed
    /// out as 'static so handlers can hold them without borrowing the shm
    /// handle.
    #[inline]
    pub fn worker(&self, idx: usize) -> &'static WorkerSlot {
        unsafe { &(*self.region).workers[idx.min(MAX_WORKERS - 1)] }
    }

    pub fn set_log_level(&self, level: u32) {
        self.region().log_level.store(level, Ordering::Relaxed);
    }

    pub fn log_level(&self) -> u32 {
        self.region().log_level.load(Ordering::Relaxed)
    }

    /// Append a line to the shared log ring.
    pub fn push_log(&self, level: u32, msg: &str) {
        let r = self.region();
        let seq = r.log_head.fetch_add(1, Ordering::Relaxed);
        let entry = &r.log[(seq as usize) % LOG_RING];
        let bytes = msg.as_bytes();
        let n = bytes.len().min(LOG_LINE);
        unsafe {
            (&mut (*entry.text.get()))[..n].copy_from_slice(&bytes[..n]);
        }
        entry.level.store(level, Ordering::Relaxed);
        entry.len.store(n as u32, Ordering::Release);
        entry.seq.store(seq + 1, Ordering::Release);
    }

    /// Claim a client registry slot. None when the registry is full
    /// (status display degrades, streaming itself is unaffected).
    pub fn register_client(&self, worker: u32, addr: &str, service: &str) -> Option<usize> {
        let r = self.region();
        for (i, slot) in r.clients.iter().enumerate() {
            if slot
                .used
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                slot.worker.store(worker, Ordering::Relaxed);
                slot.bytes_sent.store(0, Ordering::Relaxed);
                slot.dropped_packets.store(0, Ordering::Relaxed);
                let a = addr.as_bytes();
                let s = service.as_bytes();
                let an = a.len().min(NAME_LEN);
                let sn = s.len().min(NAME_LEN);
                unsafe {
                    (&mut (*slot.addr.get()))[..an].copy_from_slice(&a[..an]);
                    (&mut (*slot.service.get()))[..sn].copy_from_slice(&s[..sn]);
                }
                slot.addr_len.store(an as u32, Ordering::Release);
                slot.service_len.store(sn as u32, Ordering::Release);
                return Some(i);
            }
        }
        None
    }

    #[inline]
    pub fn client(&self, slot: usize) -> &'static ClientSlot {
        unsafe { &(*self.region).clients[slot.min(MAX_CLIENTS - 1)] }
    }

    pub fn unregister_client(&self, slot: usize) {
        self.region().clients[slot.min(MAX_CLIENTS - 1)]
            .used
            .store(0, Ordering::Release);
    }

    pub fn snapshot(&self) -> Snapshot {
        let r = self.region();
        let mut workers = Vec::new();
        for w in &r.workers {
            let pid = w.pid.load(Ordering::Relaxed);
            if pid == 0 {
                continue;
            }
            workers.push(WorkerSnap {
                pid,
                clients: w.clients.load(Ordering::Relaxed),
                sent_bytes: w.sent_bytes.load(Ordering::Relaxed),
                sent_packets: w.sent_packets.load(Ordering::Relaxed),
                eagain: w.eagain.load(Ordering::Relaxed),
                enobufs: w.enobufs.load(Ordering::Relaxed),
                zc_sends: w.zc_sends.load(Ordering::Relaxed),
                zc_completions: w.zc_completions.load(Ordering::Relaxed),
                zc_copied: w.zc_copied.load(Ordering::Relaxed),
                batch_flushes: w.batch_flushes.load(Ordering::Relaxed),
                timeout_flushes: w.timeout_flushes.load(Ordering::Relaxed),
                dropped_bytes: w.dropped_bytes.load(Ordering::Relaxed),
                dropped_packets: w.dropped_packets.load(Ordering::Relaxed),
                slow_closes: w.slow_closes.load(Ordering::Relaxed),
                pool_total: w.pool_total.load(Ordering::Relaxed),
                pool_free: w.pool_free.load(Ordering::Relaxed),
                pool_exhaustions: w.pool_exhaustions.load(Ordering::Relaxed),
                pool_expansions: w.pool_expansions.load(Ordering::Relaxed),
                pool_shrinks: w.pool_shrinks.load(Ordering::Relaxed),
            });
        }
        let mut clients = Vec::new();
        for c in &r.clients {
            if c.used.load(Ordering::Acquire) == 0 {
                continue;
            }
            let an = c.addr_len.load(Ordering::Acquire) as usize;
            let sn = c.service_len.load(Ordering::Acquire) as usize;
            let (addr, service) = unsafe {
                (
                    String::from_utf8_lossy(&(&(*c.addr.get()))[..an.min(NAME_LEN)]).into_owned(),
                    String::from_utf8_lossy(&(&(*c.service.get()))[..sn.min(NAME_LEN)]).into_owned(),
                )
            };
            clients.push(ClientSnap {
                worker: c.worker.load(Ordering::Relaxed),
                addr,
                service,
                bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
                dropped_packets: c.dropped_packets.load(Ordering::Relaxed),
            });
        }
        let mut log = Vec::new();
        let head = r.log_head.load(Ordering::Acquire);
        let start = head.saturating_sub(LOG_RING as u64);
        for seq in start..head {
            let entry = &r.log[(seq as usize) % LOG_RING];
            if entry.seq.load(Ordering::Acquire) != seq + 1 {
                continue; // overwritten mid-read
            }
            let n = entry.len.load(Ordering::Acquire) as usize;
            let text =
                unsafe { String::from_utf8_lossy(&(&(*entry.text.get()))[..n.min(LOG_LINE)]).into_owned() };
            log.push(LogSnap {
                level: entry.level.load(Ordering::Relaxed),
                text,
            });
        }
        Snapshot {
            log_level: self.log_level(),
            workers,
            clients,
            log,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct WorkerSnap {
    pub pid: u32,
    pub clients: u32,
    pub sent_bytes: u64,
    pub sent_packets: u64,
    pub eagain: u64,
    pub enobufs: u64,
    pub zc_sends: u64,
    pub zc_completions: u64,
    pub zc_copied: u64,
    pub batch_flushes: u64,
    pub timeout_flushes: u64,
    pub dropped_bytes: u64,
    pub dropped_packets: u64,
    pub slow_closes: u64,
    pub pool_total: u64,
    pub pool_free: u64,
    pub pool_exhaustions: u64,
    pub pool_expansions: u64,
    pub pool_shrinks: u64,
}

#[derive(Debug, Serialize)]
pub struct ClientSnap {
    pub worker: u32,
    pub addr: String,
    pub service: String,
    pub bytes_sent: u64,
    pub dropped_packets: u64,
}

#[derive(Debug, Serialize)]
pub struct LogSnap {
    pub level: u32,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct Snapshot {
    pub log_level: u32,
    pub workers: Vec<WorkerSnap>,
    pub clients: Vec<ClientSnap>,
    pub log: Vec<LogSnap>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn client_registry_claims_and_releases() {
        let shm = StatusShm::create().unwrap();
        let a = shm.register_client(0, "10.0.0.1:55000", "CCTV1").unwrap();
        let b = shm.register_client(1, "10.0.0.2:55001", "CCTV2").unwrap();
        assert_ne!(a, b);
        shm.client(a).bytes_sent.store(42, Ordering::Relaxed);
        let snap = shm.snapshot();
        assert_eq!(snap.clients.len(), 2);
        let c = snap.clients.iter().find(|c| c.service == "CCTV1").unwrap();
        assert_eq!(c.bytes_sent, 42);
        shm.unregister_client(a);
        shm.unregister_client(b);
        assert!(shm.snapshot().clients.is_empty());
        shm.destroy();
    }

    #[test]
    fn log_ring_wraps() {
        let shm = StatusShm::create().unwrap();
        for i in 0..(LOG_RING + 10) {
            shm.push_log(2, &format!("line {i}"));
        }
        let snap = shm.snapshot();
        assert_eq!(snap.log.len(), LOG_RING);
        assert_eq!(snap.log.last().unwrap().text, format!("line {}", LOG_RING + 9));
        shm.destroy();
    }

    #[test]
    fn worker_slot_counters() {
        let shm = StatusShm::create().unwrap();
        let w = shm.worker(3);
        w.pid.store(1234, Ordering::Relaxed);
        w.sent_bytes.fetch_add(100, Ordering::Relaxed);
        let snap = shm.snapshot();
        assert_eq!(snap.workers.len(), 1);
        assert_eq!(snap.workers[0].pid, 1234);
        assert_eq!(snap.workers[0].sent_bytes, 100);
        shm.destroy();
    }
}
