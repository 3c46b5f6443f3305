// src/pool.rs
//
// Per-worker buffer pool. Buffers are fixed-size regions carved out of
// segment allocations; headers carry refcount + live-payload window and a
// free-list link. Handles are u32 ids (segment | slot), never pointers.
use std::alloc::{alloc, dealloc, Layout};

pub const DEFAULT_BUF_SIZE: usize = 2048;
const ALIGN: usize = 64;
const NONE: u32 = u32::MAX;

pub type BufId = u32;

#[inline]
fn seg_of(id: BufId) -> usize {
    (id >> 16) as usize
}

#[inline]
fn slot_of(id: BufId) -> usize {
    (id & 0xffff) as usize
}

#[inline]
fn make_id(seg: usize, slot: usize) -> BufId {
    ((seg as u32) << 16) | slot as u32
}

#[derive(Clone, Copy)]
struct BufHeader {
    refcount: u32,
    offset: u32,
    len: u32,
    next_free: u32,
}

struct Segment {
    data: *mut u8,
    slots: usize,
    buf_size: usize,
    free_in_seg: usize,
    headers: Vec<BufHeader>,
}

impl Segment {
    fn new(slots: usize, buf_size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(slots * buf_size, ALIGN).ok()?;
        let data = unsafe { alloc(layout) };
        if data.is_null() {
            return None;
        }
        let headers = vec![
            BufHeader {
                refcount: 0,
                offset: 0,
                len: 0,
                next_free: NONE,
            };
            slots
        ];
        Some(Self {
            data,
            slots,
            buf_size,
            free_in_seg: slots,
            headers,
        })
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        // Sizes were validated when the segment was allocated.
        if let Ok(l) = Layout::from_size_align(self.slots * self.buf_size, ALIGN) {
            unsafe { dealloc(self.data, l) };
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub buf_size: usize,
    /// Buffers in the initial segment; also the expansion step.
    pub step: usize,
    /// Hard cap on total buffers.
    pub max: usize,
    /// Proactive expansion when free drops below this.
    pub low_watermark: usize,
    /// Shrink candidate when free exceeds this.
    pub high_watermark: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            buf_size: DEFAULT_BUF_SIZE,
            step: 256,
            max: 16384,
            low_watermark: 64,
            high_watermark: 1024,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    pub total: u64,
    pub free: u64,
    pub expansions: u64,
    pub exhaustions: u64,
    pub shrinks: u64,
}

pub struct BufferPool {
    cfg: PoolConfig,
    segments: Vec<Option<Segment>>,
    free_head: u32,
    free_count: usize,
    total: usize,
    expansions: u64,
    exhaustions: u64,
    shrinks: u64,
}

impl BufferPool {
    pub fn new(cfg: PoolConfig) -> anyhow::Result<Self> {
        anyhow::ensure!(cfg.buf_size >= 64 && cfg.buf_size <= 65536, "buffer size out of range");
        anyhow::ensure!(cfg.step >= 1 && cfg.step <= 65536, "pool step out of range");
        anyhow::ensure!(cfg.max >= cfg.step, "pool max below initial segment");
        let mut pool = Self {
            cfg,
            segments: Vec::new(),
            free_head: NONE,
            free_count: 0,
            total: 0,
            expansions: 0,
            exhaustions: 0,
            shrinks: 0,
        };
        if !pool.expand() {
            anyhow::bail!("cannot allocate initial buffer segment");
        }
        pool.expansions = 0; // the initial segment is not an expansion
        Ok(pool)
    }

    #[inline]
    pub fn buf_size(&self) -> usize {
        self.cfg.buf_size
    }

    fn expand(&mut self) -> bool {
        let room = self.cfg.max.saturating_sub(self.total);
        if room == 0 {
            return false;
        }
        let slots = self.cfg.step.min(room);
        let Some(seg) = Segment::new(slots, self.cfg.buf_size) else {
            return false;
        };
        // Reuse a hole left by shrink, else append.
        let seg_idx = match self.segments.iter().position(Option::is_none) {
            Some(i) => {
                self.segments[i] = Some(seg);
                i
            }
            None => {
                self.segments.push(Some(seg));
                self.segments.len() - 1
            }
        };
        if seg_idx > 0xffff {
            self.segments[seg_idx] = None;
            return false;
        }
        let seg = self.segments[seg_idx].as_mut().unwrap();
        for slot in 0..slots {
            seg.headers[slot].next_free = self.free_head;
            self.free_head = make_id(seg_idx, slot);
        }
        self.free_count += slots;
        self.total += slots;
        self.expansions += 1;
        true
    }

    #[inline]
    fn header(&self, id: BufId) -> &BufHeader {
        &self.segments[seg_of(id)].as_ref().expect("stale buffer id").headers[slot_of(id)]
    }

    #[inline]
    fn header_mut(&mut self, id: BufId) -> &mut BufHeader {
        &mut self.segments[seg_of(id)].as_mut().expect("stale buffer id").headers[slot_of(id)]
    }

    /// Pop a free buffer; refcount starts at 1 with an empty payload window.
    /// Returns None when the pool is exhausted at its cap (expected under
    /// overload; the caller drops the packet and drains the socket).
    pub fn alloc(&mut self) -> Option<BufId> {
        if self.free_head == NONE && !self.expand() {
            self.exhaustions += 1;
            return None;
        }
        let id = self.free_head;
        self.free_head = self.header(id).next_free;
        {
            let h = self.header_mut(id);
            h.next_free = NONE;
            h.refcount = 1;
            h.offset = 0;
            h.len = 0;
        }
        self.free_count -= 1;
        self.segments[seg_of(id)].as_mut().unwrap().free_in_seg -= 1;

        // Proactive expansion keeps bursts from hitting the reactive path.
        if self.free_count < self.cfg.low_watermark && self.total < self.cfg.max {
            self.expand();
        }
        Some(id)
    }

    /// Take an additional reference (send queue, pending-completion queue).
    #[inline]
    pub fn get_ref(&mut self, id: BufId) {
        let h = self.header_mut(id);
        debug_assert!(h.refcount > 0, "get_ref on free buffer");
        h.refcount += 1;
    }

    /// Drop one reference; the buffer returns to the free list at zero.
    pub fn put(&mut self, id: BufId) {
        let free_head = self.free_head;
        let now_free = {
            let h = self.header_mut(id);
            debug_assert!(h.refcount > 0, "double put");
            h.refcount -= 1;
            if h.refcount == 0 {
                h.next_free = free_head;
                true
            } else {
                false
            }
        };
        if now_free {
            self.free_head = id;
            self.free_count += 1;
            self.segments[seg_of(id)].as_mut().unwrap().free_in_seg += 1;
        }
    }

    /// Live payload window.
    #[inline]
    pub fn data(&self, id: BufId) -> &[u8] {
        let seg = self.segments[seg_of(id)].as_ref().expect("stale buffer id");
        let h = &seg.headers[slot_of(id)];
        let base = slot_of(id) * self.cfg.buf_size + h.offset as usize;
        unsafe { std::slice::from_raw_parts(seg.data.add(base), h.len as usize) }
    }

    /// Whole writable region; resets the payload window to empty.
    pub fn write_space(&mut self, id: BufId) -> &mut [u8] {
        let buf_size = self.cfg.buf_size;
        let seg = self.segments[seg_of(id)].as_mut().expect("stale buffer id");
        let h = &mut seg.headers[slot_of(id)];
        h.offset = 0;
        h.len = 0;
        let base = slot_of(id) * buf_size;
        unsafe { std::slice::from_raw_parts_mut(seg.data.add(base), buf_size) }
    }

    #[inline]
    pub fn set_len(&mut self, id: BufId, len: usize) {
        let buf_size = self.cfg.buf_size;
        let h = self.header_mut(id);
        debug_assert!(h.offset as usize + len <= buf_size);
        h.len = len as u32;
    }

    /// Shrink the payload window from the front (RTP header clip) or back
    /// (padding strip). The offset only ever grows toward the end.
    pub fn clip(&mut self, id: BufId, advance: usize, new_len: usize) {
        let h = self.header_mut(id);
        debug_assert!(advance + new_len <= h.len as usize);
        h.offset += advance as u32;
        h.len = new_len as u32;
    }

    #[inline]
    pub fn len(&self, id: BufId) -> usize {
        self.header(id).len as usize
    }

    #[inline]
    pub fn refcount(&self, id: BufId) -> u32 {
        self.header(id).refcount
    }

    /// Free whole idle segments above the high watermark, oldest expansion
    /// first, always keeping the initial segment. Called on connection
    /// teardown, so the free-list rebuild cost is off the hot path.
    pub fn try_shrink(&mut self) {
        if self.free_count <= self.cfg.high_watermark || self.total <= self.cfg.step {
            return;
        }
        let mut freed_any = false;
        for seg_idx in 1..self.segments.len() {
            if self.free_count <= self.cfg.high_watermark || self.total <= self.cfg.step {
                break;
            }
            let idle = match &self.segments[seg_idx] {
                Some(s) => s.free_in_seg == s.slots,
                None => false,
            };
            if !idle {
                continue;
            }
            let slots = self.segments[seg_idx].as_ref().unwrap().slots;
            self.segments[seg_idx] = None;
            self.total -= slots;
            self.free_count -= slots;
            self.shrinks += 1;
            freed_any = true;
        }
        if freed_any {
            self.rebuild_free_list();
        }
    }

    fn rebuild_free_list(&mut self) {
        self.free_head = NONE;
        for seg_idx in (0..self.segments.len()).rev() {
            let Some(seg) = self.segments[seg_idx].as_mut() else {
                continue;
            };
            for slot in (0..seg.slots).rev() {
                if seg.headers[slot].refcount == 0 {
                    seg.headers[slot].next_free = self.free_head;
                    self.free_head = make_id(seg_idx, slot);
                }
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total: self.total as u64,
            free: self.free_count as u64,
            expansions: self.expansions,
            exhaustions: self.exhaustions,
            shrinks: self.shrinks,
        }
    }
}

// Pool memory is only touched through ids by the owning worker thread.
unsafe impl Send for BufferPool {}

/// Which pool a queued buffer belongs to. Media buffers carry stream payload;
/// control buffers carry HTTP response heads and small bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolKind {
    Media,
    Control,
}

pub struct Pools {
    pub media: BufferPool,
    pub control: BufferPool,
}

impl Pools {
    #[inline]
    pub fn get(&self, kind: PoolKind) -> &BufferPool {
        match kind {
            PoolKind::Media => &self.media,
            PoolKind::Control => &self.control,
        }
    }

    #[inline]
    pub fn get_mut(&mut self, kind: PoolKind) -> &mut BufferPool {
        match kind {
            PoolKind::Media => &mut self.media,
            PoolKind::Control => &mut self.control,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool() -> BufferPool {
        BufferPool::new(PoolConfig {
            buf_size: 256,
            step: 4,
            max: 12,
            low_watermark: 0,
            high_watermark: 2,
        })
        .unwrap()
    }

    #[test]
    fn alloc_put_roundtrip() {
        let mut p = small_pool();
        let id = p.alloc().unwrap();
        assert_eq!(p.refcount(id), 1);
        assert_eq!(p.stats().free, 3);
        p.get_ref(id);
        p.put(id);
        assert_eq!(p.refcount(id), 1);
        p.put(id);
        assert_eq!(p.stats().free, 4);
    }

    #[test]
    fn expands_then_hits_cap() {
        let mut p = small_pool();
        let mut held = Vec::new();
        for _ in 0..12 {
            held.push(p.alloc().unwrap());
        }
        assert!(p.alloc().is_none());
        assert_eq!(p.stats().exhaustions, 1);
        assert_eq!(p.stats().total, 12);
        for id in held {
            p.put(id);
        }
        assert_eq!(p.stats().free, 12);
    }

    #[test]
    fn shrink_keeps_initial_segment() {
        let mut p = small_pool();
        let mut held = Vec::new();
        for _ in 0..12 {
            held.push(p.alloc().unwrap());
        }
        for id in held {
            p.put(id);
        }
        p.try_shrink();
        let s = p.stats();
        assert!(s.total >= 4, "initial segment survives");
        assert!(s.shrinks >= 1);
        assert_eq!(s.free, s.total);
        // Pool still works after shrink.
        let id = p.alloc().unwrap();
        p.put(id);
    }

    #[test]
    fn clip_moves_window() {
        let mut p = small_pool();
        let id = p.alloc().unwrap();
        {
            let space = p.write_space(id);
            space[..16].copy_from_slice(&[7u8; 16]);
        }
        p.set_len(id, 16);
        p.clip(id, 12, 3);
        assert_eq!(p.data(id), &[7u8; 3][..]);
        p.put(id);
    }

    #[test]
    fn no_leak_over_random_ops() {
        let mut p = small_pool();
        let mut held: Vec<BufId> = Vec::new();
        let mut x: u64 = 0x2545f491;
        for _ in 0..10_000 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            if x & 1 == 0 {
                if let Some(id) = p.alloc() {
                    held.push(id);
                }
            } else if let Some(id) = held.pop() {
                p.put(id);
            }
        }
        for id in held.drain(..) {
            p.put(id);
        }
        let s = p.stats();
        assert_eq!(s.free, s.total);
    }
}
