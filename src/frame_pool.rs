use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A reusable byte buffer carrying one decoded audio frame.
///
/// The payload is interleaved little-endian f32 samples; `pts` is the
/// presentation timestamp in seconds since the start of the source.
#[derive(Debug)]
pub struct PooledFrame {
    pub pts: f64,
    data: Vec<u8>,
}

impl PooledFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    /// Number of f32 samples in the payload.
    pub fn sample_count(&self) -> usize {
        self.data.len() / std::mem::size_of::<f32>()
    }

    /// Decode the payload into `out` (appended), returning the sample count.
    pub fn copy_samples_into(&self, out: &mut Vec<f32>) -> usize {
        let count = self.sample_count();
        out.reserve(count);
        for chunk in self.data.chunks_exact(4) {
            out.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        count
    }

    /// Truncate the payload to `frames × channels` samples after a short read.
    pub fn truncate_samples(&mut self, sample_count: usize) {
        self.data.truncate(sample_count * std::mem::size_of::<f32>());
    }
}

/// Thread-safe bounded pool of fixed-size frame buffers.
///
/// The decode loop rents one buffer per decoder call and gives it back once
/// the payload has been pushed downstream, so the steady-state hot path
/// performs no allocation. When the pool runs dry a fresh buffer is
/// allocated and counted; returns beyond `max_pooled` are dropped.
pub struct FramePool {
    buffer_len: usize,
    max_pooled: usize,
    free: Mutex<Vec<Vec<u8>>>,
    rented: AtomicU64,
    returned: AtomicU64,
    fresh_allocations: AtomicU64,
}

impl FramePool {
    /// `buffer_len` is the byte size of each pooled buffer; `max_pooled` the
    /// number kept around for reuse.
    pub fn new(buffer_len: usize, max_pooled: usize) -> Self {
        let free = (0..max_pooled).map(|_| vec![0u8; buffer_len]).collect();
        Self {
            buffer_len,
            max_pooled,
            free: Mutex::new(free),
            rented: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            fresh_allocations: AtomicU64::new(0),
        }
    }

    /// Rent a buffer of `byte_len` bytes stamped with `pts`.
    pub fn rent(&self, pts: f64, byte_len: usize) -> PooledFrame {
        self.rented.fetch_add(1, Ordering::Relaxed);

        let mut data = if byte_len <= self.buffer_len {
            self.free.lock().ok().and_then(|mut free| free.pop())
        } else {
            None
        }
        .unwrap_or_else(|| {
            self.fresh_allocations.fetch_add(1, Ordering::Relaxed);
            debug!("Frame pool exhausted, allocating {} bytes", byte_len);
            Vec::with_capacity(byte_len.max(self.buffer_len))
        });

        data.resize(byte_len, 0);
        PooledFrame { pts, data }
    }

    /// Return a buffer to the pool; dropped if the pool is already full.
    pub fn give_back(&self, frame: PooledFrame) {
        self.returned.fetch_add(1, Ordering::Relaxed);

        let mut data = frame.data;
        if data.capacity() < self.buffer_len {
            return;
        }
        if let Ok(mut free) = self.free.lock() {
            if free.len() < self.max_pooled {
                data.clear();
                free.push(data);
            }
        }
    }

    pub fn stats(&self) -> FramePoolStats {
        FramePoolStats {
            pooled: self.free.lock().map(|f| f.len()).unwrap_or(0),
            max_pooled: self.max_pooled,
            rented: self.rented.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            fresh_allocations: self.fresh_allocations.load(Ordering::Relaxed),
        }
    }
}

/// Frame pool statistics
#[derive(Debug, Clone)]
pub struct FramePoolStats {
    pub pooled: usize,
    pub max_pooled: usize,
    pub rented: u64,
    pub returned: u64,
    pub fresh_allocations: u64,
}

impl FramePoolStats {
    /// Buffers currently in flight between rent and return.
    pub fn outstanding(&self) -> u64 {
        self.rented.saturating_sub(self.returned)
    }
}
