//! Sample queue between the protocol thread and the audio callback
//!
//! The writer side pushes decoded samples; the cpal callback pops them.
//! The queue is a `ringbuf` ring sized to the device capacity, and a soft
//! limit below that capacity plays the role of the device buffer size so it
//! can grow while the stream keeps running.
//!
//! ## Design Notes
//!
//! The consumer sits behind a mutex only so `clear()` can flush from the
//! writer side. The callback uses `try_lock()` and plays silence if a flush
//! holds the lock, it never waits.

use std::sync::{Arc, Mutex, PoisonError};

use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

/// Writer half of the queue
pub struct SampleQueue {
    producer: HeapProd<f32>,
    consumer: Arc<Mutex<HeapCons<f32>>>,
    /// Maximum samples allowed in flight
    limit: usize,
}

/// Callback half of the queue
#[derive(Clone)]
pub struct QueueReader {
    consumer: Arc<Mutex<HeapCons<f32>>>,
}

impl SampleQueue {
    /// Create a queue holding at most `capacity` samples
    pub fn new(capacity: usize) -> (Self, QueueReader) {
        let (producer, consumer) = HeapRb::<f32>::new(capacity.max(1)).split();
        let consumer = Arc::new(Mutex::new(consumer));
        let queue = Self {
            producer,
            consumer: Arc::clone(&consumer),
            limit: capacity.max(1),
        };
        (queue, QueueReader { consumer })
    }

    pub fn capacity(&self) -> usize {
        self.producer.capacity().get()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Change the soft limit, clamped to the ring capacity
    pub fn set_limit(&mut self, samples: usize) {
        self.limit = samples.clamp(1, self.capacity());
    }

    /// Samples waiting to be played
    pub fn queued(&self) -> usize {
        self.producer.occupied_len()
    }

    /// Room left under the soft limit
    pub fn vacant(&self) -> usize {
        self.limit.saturating_sub(self.queued())
    }

    /// Push as many samples as fit under the limit, returning how many did
    pub fn push(&mut self, samples: &[f32]) -> usize {
        let room = self.vacant().min(samples.len());
        self.producer.push_slice(&samples[..room])
    }

    /// Drop everything not yet played
    pub fn clear(&self) {
        let mut consumer = self.consumer.lock().unwrap_or_else(PoisonError::into_inner);
        let queued = consumer.occupied_len();
        consumer.skip(queued);
    }
}

impl QueueReader {
    /// Pop into `out` without blocking.
    ///
    /// Returns `None` if the writer is flushing right now.
    pub fn pop_into(&self, out: &mut [f32]) -> Option<usize> {
        let mut consumer = self.consumer.try_lock().ok()?;
        Some(consumer.pop_slice(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_respects_limit() {
        let (mut queue, _reader) = SampleQueue::new(8);
        queue.set_limit(4);

        assert_eq!(queue.push(&[0.1; 6]), 4);
        assert_eq!(queue.vacant(), 0);
        assert_eq!(queue.push(&[0.1]), 0);

        queue.set_limit(100);
        assert_eq!(queue.limit(), 8);
        assert_eq!(queue.push(&[0.2; 6]), 4);
    }

    #[test]
    fn test_reader_drains_in_order() {
        let (mut queue, reader) = SampleQueue::new(8);
        queue.push(&[1.0, 2.0, 3.0]);

        let mut out = [0.0; 2];
        assert_eq!(reader.pop_into(&mut out), Some(2));
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(queue.queued(), 1);
    }

    #[test]
    fn test_clear_drops_pending_samples() {
        let (mut queue, reader) = SampleQueue::new(8);
        queue.push(&[1.0; 5]);
        queue.clear();

        assert_eq!(queue.queued(), 0);
        let mut out = [0.0; 4];
        assert_eq!(reader.pop_into(&mut out), Some(0));
    }
}
