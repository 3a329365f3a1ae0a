use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Bounded single-producer / single-consumer ring buffer of f32 samples.
///
/// Both cursors are monotonically increasing sample counts; the index into
/// storage is `pos % capacity`. The producer publishes data with a Release
/// store of `write_pos`, the consumer releases space with a Release store of
/// `read_pos`, and each side Acquire-loads the other's cursor, so reads
/// always observe fully written samples.
///
/// Contract: exactly one thread writes and exactly one thread reads at any
/// given time. `write` and `read` never block and never allocate; overflow
/// returns a short write count, underflow a short read count. Storage is
/// allocated once in `new` and never reallocated.
pub struct SampleRing {
    storage: Box<[UnsafeCell<f32>]>,
    write_pos: AtomicUsize,
    read_pos: AtomicUsize,
    capacity: usize,
}

// Safety: cursor discipline above guarantees a slot is never read and
// written concurrently; slots are plain f32 with no drop glue.
unsafe impl Send for SampleRing {}
unsafe impl Sync for SampleRing {}

impl SampleRing {
    /// Create a ring holding `capacity` samples. Panics if capacity is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");

        let storage: Vec<UnsafeCell<f32>> =
            (0..capacity).map(|_| UnsafeCell::new(0.0)).collect();

        Self {
            storage: storage.into_boxed_slice(),
            write_pos: AtomicUsize::new(0),
            read_pos: AtomicUsize::new(0),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples currently readable.
    pub fn available_read(&self) -> usize {
        let w = self.write_pos.load(Ordering::Acquire);
        let r = self.read_pos.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    /// Samples currently writable.
    pub fn free(&self) -> usize {
        self.capacity - self.available_read()
    }

    pub fn is_empty(&self) -> bool {
        self.available_read() == 0
    }

    /// Fill ratio in [0.0, 1.0].
    pub fn fill_ratio(&self) -> f32 {
        self.available_read() as f32 / self.capacity as f32
    }

    /// Write as many samples as fit; returns how many were accepted.
    /// The tail of the input is dropped on overflow.
    pub fn write(&self, samples: &[f32]) -> usize {
        let w = self.write_pos.load(Ordering::Relaxed);
        let r = self.read_pos.load(Ordering::Acquire);
        let free = self.capacity - w.wrapping_sub(r);
        let n = samples.len().min(free);

        for (i, &sample) in samples[..n].iter().enumerate() {
            let idx = w.wrapping_add(i) % self.capacity;
            // Safety: slots in [w, w+n) are unreachable by the consumer
            // until the Release store below.
            unsafe { *self.storage[idx].get() = sample };
        }

        self.write_pos.store(w.wrapping_add(n), Ordering::Release);
        n
    }

    /// Read up to `out.len()` samples; returns how many were produced.
    /// The caller zero-fills any remainder (an underrun is the consumer's
    /// event to report, not the ring's).
    pub fn read(&self, out: &mut [f32]) -> usize {
        let r = self.read_pos.load(Ordering::Relaxed);
        let w = self.write_pos.load(Ordering::Acquire);
        let avail = w.wrapping_sub(r);
        let n = out.len().min(avail);

        for (i, slot) in out[..n].iter_mut().enumerate() {
            let idx = r.wrapping_add(i) % self.capacity;
            // Safety: slots in [r, r+n) were published by the producer's
            // Release store observed by the Acquire load above.
            *slot = unsafe { *self.storage[idx].get() };
        }

        self.read_pos.store(r.wrapping_add(n), Ordering::Release);
        n
    }

    /// Discard everything currently buffered.
    ///
    /// CAS loop so a racing `read` on the consumer thread cannot rewind the
    /// cursor; losing the race simply retries against the newer position.
    pub fn clear(&self) {
        loop {
            let r = self.read_pos.load(Ordering::Acquire);
            let w = self.write_pos.load(Ordering::Acquire);
            if r == w {
                return;
            }
            if self
                .read_pos
                .compare_exchange(r, w, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_write_then_read_round_trip() {
        let ring = SampleRing::new(8);
        let written = ring.write(&[1.0, 2.0, 3.0]);
        assert_eq!(written, 3);
        assert_eq!(ring.available_read(), 3);

        let mut out = [0.0f32; 3];
        let read = ring.read(&mut out);
        assert_eq!(read, 3);
        assert_eq!(out, [1.0, 2.0, 3.0]);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_overflow_drops_tail() {
        let ring = SampleRing::new(4);
        let written = ring.write(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(written, 4);
        assert_eq!(ring.free(), 0);

        let mut out = [0.0f32; 4];
        ring.read(&mut out);
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_underflow_returns_short_count() {
        let ring = SampleRing::new(8);
        ring.write(&[0.5, 0.25]);

        let mut out = [9.0f32; 6];
        let read = ring.read(&mut out);
        assert_eq!(read, 2);
        assert_eq!(&out[..2], &[0.5, 0.25]);
    }

    #[test]
    fn test_wrap_around_preserves_order() {
        let ring = SampleRing::new(4);
        let mut out = [0.0f32; 2];

        ring.write(&[1.0, 2.0, 3.0]);
        ring.read(&mut out);
        assert_eq!(out, [1.0, 2.0]);

        // Crosses the physical end of storage.
        assert_eq!(ring.write(&[4.0, 5.0, 6.0]), 3);
        let mut out4 = [0.0f32; 4];
        assert_eq!(ring.read(&mut out4), 4);
        assert_eq!(out4, [3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_available_plus_free_is_capacity() {
        let ring = SampleRing::new(16);
        assert_eq!(ring.available_read() + ring.free(), 16);
        ring.write(&[0.0; 10]);
        assert_eq!(ring.available_read() + ring.free(), 16);
        let mut out = [0.0f32; 7];
        ring.read(&mut out);
        assert_eq!(ring.available_read() + ring.free(), 16);
    }

    #[test]
    fn test_clear_discards_buffered_samples() {
        let ring = SampleRing::new(8);
        ring.write(&[1.0; 5]);
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.free(), 8);
    }

    #[test]
    fn test_concurrent_producer_consumer() {
        const TOTAL: usize = 100_000;
        let ring = Arc::new(SampleRing::new(256));

        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut next = 0usize;
                while next < TOTAL {
                    let end = (next + 64).min(TOTAL);
                    let chunk: Vec<f32> = (next..end).map(|i| i as f32).collect();
                    let written = ring.write(&chunk);
                    next += written;
                    if written == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                let mut expected = 0usize;
                let mut buf = [0.0f32; 64];
                while expected < TOTAL {
                    let read = ring.read(&mut buf);
                    for &sample in &buf[..read] {
                        assert_eq!(sample, expected as f32);
                        expected += 1;
                    }
                    if read == 0 {
                        thread::yield_now();
                    }
                }
            })
        };

        producer.join().unwrap();
        consumer.join().unwrap();
    }
}
