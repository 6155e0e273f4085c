//! Bounded batch accumulation.

use vidstream_pipeline::{Batch, Frame};

/// Collects frames until a batch is full.
///
/// Never holds more than `batch_size` frames: the frame that fills the batch
/// is returned together with the rest of it.
#[derive(Debug)]
pub struct BatchAccumulator {
    batch_size: usize,
    frames: Vec<Frame>,
}

impl BatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            batch_size,
            frames: Vec::with_capacity(batch_size),
        }
    }

    /// Append a frame; returns the completed batch when it reaches `batch_size`.
    pub fn push(&mut self, frame: Frame) -> Option<Batch> {
        self.frames.push(frame);
        if self.frames.len() >= self.batch_size {
            let frames = std::mem::replace(&mut self.frames, Vec::with_capacity(self.batch_size));
            Some(Batch::new(frames))
        } else {
            None
        }
    }

    /// Take whatever is pending as a partial batch.
    pub fn drain(&mut self) -> Option<Batch> {
        if self.frames.is_empty() {
            return None;
        }
        Some(Batch::new(std::mem::take(&mut self.frames)))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u64) -> Frame {
        Frame::from_jpeg(id, 1.0, 2, 2, b"x")
    }

    #[test]
    fn test_emits_exactly_at_batch_size() {
        let mut acc = BatchAccumulator::new(3);
        assert!(acc.push(frame(0)).is_none());
        assert!(acc.push(frame(1)).is_none());

        let batch = acc.push(frame(2)).unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(
            batch.frames.iter().map(|f| f.frame_id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(acc.is_empty());
    }

    #[test]
    fn test_never_exceeds_batch_size() {
        let mut acc = BatchAccumulator::new(4);
        for id in 0..10 {
            if let Some(batch) = acc.push(frame(id)) {
                assert_eq!(batch.len(), 4);
            }
            assert!(acc.len() < acc.batch_size());
        }
        assert_eq!(acc.len(), 2);
    }

    #[test]
    fn test_drain_partial_batch() {
        let mut acc = BatchAccumulator::new(25);
        assert!(acc.drain().is_none());

        acc.push(frame(0));
        acc.push(frame(1));
        let partial = acc.drain().unwrap();
        assert_eq!(partial.len(), 2);
        assert!(acc.drain().is_none());
    }

    #[test]
    fn test_zero_batch_size_treated_as_one() {
        let mut acc = BatchAccumulator::new(0);
        assert_eq!(acc.push(frame(0)).map(|b| b.len()), Some(1));
    }
}
