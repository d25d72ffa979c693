//! SPSC audio ring with overwrite-oldest overrun discipline.
//!
//! The capture callback runs on an OS audio thread at elevated priority and
//! **must not** allocate, block, or fail. `RingProducer::push` is therefore
//! wait-free: it always writes, and when the ring is full the oldest unread
//! samples are overwritten. The consumer detects the overwrite on its next
//! read, advances its cursor past the hole, and charges the overrun counter
//! with the exact number of dropped samples.
//!
//! Samples are stored as `AtomicU32` bit patterns of `f32`, so each slot
//! read/write is atomic and the structure needs no unsafe code and no locks.
//! Cursors are monotonic sample counts; slot index is `pos % capacity`.

use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc,
};

struct RingShared {
    slots: Box<[AtomicU32]>,
    capacity: u64,
    /// Total samples ever written. Producer-owned.
    write_pos: AtomicU64,
    /// Total samples consumed or dropped. Consumer-owned.
    read_pos: AtomicU64,
    /// Total samples lost to overruns.
    overruns: AtomicU64,
}

/// Producer half — held by the capture callback. Not `Clone`: single producer.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

/// Consumer half — held by the read side. Not `Clone`: single consumer.
pub struct RingConsumer {
    shared: Arc<RingShared>,
}

/// Create a matched producer/consumer pair with room for `capacity` samples.
pub fn create_ring(capacity: usize) -> (RingProducer, RingConsumer) {
    assert!(capacity > 0, "ring capacity must be non-zero");
    let slots = (0..capacity).map(|_| AtomicU32::new(0)).collect();
    let shared = Arc::new(RingShared {
        slots,
        capacity: capacity as u64,
        write_pos: AtomicU64::new(0),
        read_pos: AtomicU64::new(0),
        overruns: AtomicU64::new(0),
    });
    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer { shared },
    )
}

impl RingProducer {
    /// Append samples, overwriting the oldest unread data when full.
    ///
    /// Wait-free: stores each sample and publishes the new write cursor with
    /// a release store. Never fails, never blocks.
    pub fn push(&mut self, samples: &[f32]) {
        let shared = &self.shared;
        let start = shared.write_pos.load(Ordering::Relaxed);
        for (i, &sample) in samples.iter().enumerate() {
            let idx = ((start + i as u64) % shared.capacity) as usize;
            shared.slots[idx].store(sample.to_bits(), Ordering::Relaxed);
        }
        shared
            .write_pos
            .store(start + samples.len() as u64, Ordering::Release);
    }
}

impl RingConsumer {
    /// Drain everything currently readable, appending to `out`.
    ///
    /// Returns the number of samples appended. If the producer lapped the
    /// read cursor since the last call, the cursor is advanced past the
    /// overwritten region first and the overrun counter is charged with the
    /// dropped sample count.
    pub fn pop_available(&mut self, out: &mut Vec<f32>) -> usize {
        let shared = &self.shared;
        let wp = shared.write_pos.load(Ordering::Acquire);
        let mut rp = shared.read_pos.load(Ordering::Relaxed);

        let backlog = wp - rp;
        if backlog > shared.capacity {
            // Producer lapped us: the oldest `backlog - capacity` samples
            // were overwritten before we got to them.
            let dropped = backlog - shared.capacity;
            shared.overruns.fetch_add(dropped, Ordering::Relaxed);
            rp += dropped;
        }

        let n = (wp - rp) as usize;
        out.reserve(n);
        for i in 0..n as u64 {
            let idx = ((rp + i) % shared.capacity) as usize;
            out.push(f32::from_bits(shared.slots[idx].load(Ordering::Relaxed)));
        }

        shared.read_pos.store(rp + n as u64, Ordering::Release);
        n
    }

    /// Number of samples currently readable (saturates at capacity).
    pub fn len(&self) -> usize {
        let shared = &self.shared;
        let wp = shared.write_pos.load(Ordering::Acquire);
        let rp = shared.read_pos.load(Ordering::Relaxed);
        (wp - rp).min(shared.capacity) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total samples lost to overruns since creation.
    pub fn overrun_count(&self) -> u64 {
        self.shared.overruns.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_pop_round_trips() {
        let (mut prod, mut cons) = create_ring(16);
        prod.push(&[0.1, 0.2, 0.3]);

        let mut out = Vec::new();
        let n = cons.pop_available(&mut out);

        assert_eq!(n, 3);
        assert_eq!(out, vec![0.1, 0.2, 0.3]);
        assert_eq!(cons.overrun_count(), 0);
        assert!(cons.is_empty());
    }

    #[test]
    fn partial_drains_preserve_order() {
        let (mut prod, mut cons) = create_ring(8);
        prod.push(&[1.0, 2.0]);

        let mut out = Vec::new();
        cons.pop_available(&mut out);
        prod.push(&[3.0, 4.0]);
        cons.pop_available(&mut out);

        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn full_ring_overwrites_oldest_and_counts_dropped() {
        let (mut prod, mut cons) = create_ring(4);
        // 6 samples into a 4-slot ring: samples 0 and 1 are overwritten.
        prod.push(&[0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);

        let mut out = Vec::new();
        let n = cons.pop_available(&mut out);

        assert_eq!(n, 4);
        assert_eq!(out, vec![2.0, 3.0, 4.0, 5.0]);
        assert_eq!(cons.overrun_count(), 2);
    }

    #[test]
    fn overrun_counter_accumulates_across_laps() {
        let (mut prod, mut cons) = create_ring(2);
        prod.push(&[1.0, 2.0, 3.0]);
        let mut out = Vec::new();
        cons.pop_available(&mut out);
        assert_eq!(cons.overrun_count(), 1);

        prod.push(&[4.0, 5.0, 6.0, 7.0]);
        out.clear();
        cons.pop_available(&mut out);
        assert_eq!(out, vec![6.0, 7.0]);
        assert_eq!(cons.overrun_count(), 3);
    }

    #[test]
    fn len_saturates_at_capacity() {
        let (mut prod, cons) = create_ring(4);
        prod.push(&[0.0; 10]);
        assert_eq!(cons.len(), 4);
    }

    #[test]
    fn producer_and_consumer_on_separate_threads() {
        let (mut prod, mut cons) = create_ring(1 << 14);
        let writer = std::thread::spawn(move || {
            for block in 0..64 {
                let chunk: Vec<f32> = (0..128).map(|i| (block * 128 + i) as f32).collect();
                prod.push(&chunk);
            }
        });

        let mut out = Vec::new();
        while out.len() < 64 * 128 {
            cons.pop_available(&mut out);
        }
        writer.join().unwrap();

        assert_eq!(out.len(), 64 * 128);
        // Ring is larger than the total written: no drops, strict order.
        assert_eq!(cons.overrun_count(), 0);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i as f32);
        }
    }
}
