// src/stream.rs
//
// Stream context: glue between an upstream driver, the RTP pipeline and the
// client's send queue. The Sink enforces the backpressure policy: over the
// queue limit, new packets are dropped and counted, and a queue that stays
// saturated past the configured window marks the client a slow consumer.
use crate::config::Config;
use crate::mcast::McastSource;
use crate::net::{drain_socket, recv_once, IoStatus};
use crate::pool::{BufId, PoolKind, Pools};
use crate::rtp::{self, Depayload, SeqTracker, SeqVerdict};
use crate::rtsp::RtspSession;
use crate::sendq::{DrainStatus, SendQueue};
use crate::service::ServiceKind;
use crate::status::{StatusShm, WorkerSlot};
use log::{info, warn};
use std::os::fd::RawFd;
use std::sync::atomic::Ordering;

/// Slow-consumer bookkeeping, one per connection.
#[derive(Debug, Default)]
pub struct SlowCounters {
    pub highwater: usize,
    pub dropped_bytes: u64,
    pub dropped_packets: u64,
    pub backpressure_events: u64,
    /// Set while the queue sits at its limit; cleared when it drains.
    pub saturated_since_ms: Option<u64>,
}

/// Borrowed bundle handed to upstream drivers for delivering media.
pub struct Sink<'a> {
    pub pools: &'a mut Pools,
    pub q: &'a mut SendQueue,
    /// Client socket.
    pub fd: RawFd,
    pub cfg: &'a Config,
    pub slow: &'a mut SlowCounters,
    pub stats: &'static WorkerSlot,
    pub shm: StatusShm,
    pub client_slot: Option<usize>,
    pub now_ms: u64,
    /// Out-params the connection folds into its epoll interest afterwards.
    pub want_epollout: bool,
    pub fatal: bool,
}

impl Sink<'_> {
    /// Hand a producer-owned pool buffer to the egress queue. Consumes the
    /// producer's reference in all outcomes.
    pub fn push_pool_buffer(&mut self, id: BufId) {
        let len = self.pools.media.len(id);
        if len == 0 {
            self.pools.media.put(id);
            return;
        }
        if self.q.bytes() + len > self.cfg.queue_limit_bytes {
            if self.slow.saturated_since_ms.is_none() {
                self.slow.saturated_since_ms = Some(self.now_ms);
                self.slow.backpressure_events += 1;
            }
            self.slow.dropped_packets += 1;
            self.slow.dropped_bytes += len as u64;
            self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
            self.stats.dropped_bytes.fetch_add(len as u64, Ordering::Relaxed);
            if let Some(slot) = self.client_slot {
                self.shm.client(slot).dropped_packets.fetch_add(1, Ordering::Relaxed);
            }
            if self.slow.dropped_packets % 100 == 1 {
                warn!(
                    "slow client: queue at {} bytes, dropped {} packets so far",
                    self.q.bytes(),
                    self.slow.dropped_packets
                );
            }
            self.pools.media.put(id);
            return;
        }
        self.q.enqueue_memory(self.pools, PoolKind::Media, id);
        self.pools.media.put(id);
        self.slow.highwater = self.slow.highwater.max(self.q.bytes());
        if self.q.should_flush(self.cfg.batch_flush_bytes) {
            self.stats.batch_flushes.fetch_add(1, Ordering::Relaxed);
            self.flush();
        }
    }

    /// Copy `bytes` into fresh media buffers and enqueue (TCP-interleaved
    /// ingress has no pool-backed receive path).
    pub fn push_copy(&mut self, bytes: &[u8]) {
        let chunk = self.pools.media.buf_size();
        for part in bytes.chunks(chunk) {
            let Some(id) = self.pools.media.alloc() else {
                self.slow.dropped_packets += 1;
                self.stats.dropped_packets.fetch_add(1, Ordering::Relaxed);
                return;
            };
            self.pools.media.write_space(id)[..part.len()].copy_from_slice(part);
            self.pools.media.set_len(id, part.len());
            self.push_pool_buffer(id);
        }
    }

    pub fn flush(&mut self) {
        let r = self.q.drain(self.fd, self.pools, self.stats);
        if r.sent > 0 {
            if let Some(slot) = self.client_slot {
                self.shm
                    .client(slot)
                    .bytes_sent
                    .fetch_add(r.sent as u64, Ordering::Relaxed);
            }
        }
        match r.status {
            DrainStatus::Ok => {
                if self.q.bytes() < self.cfg.queue_limit_bytes {
                    self.slow.saturated_since_ms = None;
                }
            }
            DrainStatus::WouldBlock => self.want_epollout = true,
            DrainStatus::Error => self.fatal = true,
        }
    }
}

/// Run one datagram through the RTP pipeline (or pass it through) and hand
/// it to the sink. Consumes the producer reference on `id`.
pub fn ingest_datagram(
    sink: &mut Sink<'_>,
    seq: &mut SeqTracker,
    id: BufId,
    rtp_pipeline: bool,
    stream_name: &str,
) {
    if !rtp_pipeline {
        sink.push_pool_buffer(id);
        return;
    }
    match rtp::parse(sink.pools.media.data(id), &sink.cfg.fec_payload_types) {
        Depayload::Passthrough => sink.push_pool_buffer(id),
        Depayload::Fec => sink.pools.media.put(id),
        Depayload::Malformed => {
            sink.pools.media.put(id);
        }
        Depayload::Rtp(p) => match seq.check(p.seq, stream_name) {
            SeqVerdict::Deliver => {
                sink.pools.media.clip(id, p.offset, p.len);
                sink.push_pool_buffer(id);
            }
            SeqVerdict::Duplicate | SeqVerdict::Late => sink.pools.media.put(id),
        },
    }
}

pub enum Upstream {
    Mcast(McastSource),
    Rtsp(Box<RtspSession>),
}

/// Created when routing resolves to a media source; owned by the connection.
pub struct StreamCtx {
    pub name: String,
    pub kind: ServiceKind,
    pub upstream: Upstream,
    pub seq: SeqTracker,
}

impl StreamCtx {
    /// Multicast receive path: pull datagrams straight into pool buffers
    /// until EAGAIN. On pool exhaustion the socket is drained and the
    /// packets dropped, so level-triggered readiness cannot spin.
    pub fn on_mcast_readable(&mut self, sink: &mut Sink<'_>) {
        let Upstream::Mcast(src) = &self.upstream else {
            return;
        };
        let fd = src.fd();
        let rtp_pipeline = self.kind == ServiceKind::Mrtp;
        loop {
            // Pool exhaustion is counted by the pool itself and mirrored to
            // the status region; here it just means drop-and-drain.
            let Some(id) = sink.pools.media.alloc() else {
                drain_socket(fd);
                break;
            };
            match recv_once(fd, sink.pools.media.write_space(id)) {
                IoStatus::Done(n) => {
                    sink.pools.media.set_len(id, n);
                    ingest_datagram(sink, &mut self.seq, id, rtp_pipeline, &self.name);
                }
                IoStatus::WouldBlock | IoStatus::Closed => {
                    sink.pools.media.put(id);
                    break;
                }
                IoStatus::Error(e) => {
                    sink.pools.media.put(id);
                    info!("{}: upstream recv error {e}", self.name);
                    break;
                }
            }
        }
    }
}
