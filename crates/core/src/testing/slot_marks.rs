//! Batch that records which slots processed it.

use std::sync::atomic::{AtomicBool, Ordering};

/// One flag per processor slot.
///
/// Created with the processor count the batch is expected to be forked
/// across.
#[derive(Debug)]
pub struct SlotMarks {
    marks: Vec<AtomicBool>,
}

impl SlotMarks {
    pub fn new(processors: usize) -> Self {
        Self {
            marks: (0..processors).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    /// Record that `slot` processed this batch.
    ///
    /// Fails if the slot is out of range or already marked.
    pub fn mark(&self, slot: usize) -> anyhow::Result<()> {
        let Some(mark) = self.marks.get(slot) else {
            anyhow::bail!("slot {} outside of {} expected slots", slot, self.marks.len());
        };
        if mark.swap(true, Ordering::SeqCst) {
            anyhow::bail!("slot {} processed the same batch twice", slot);
        }
        Ok(())
    }

    /// Number of slots the batch expects.
    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }

    /// Number of slots that marked the batch.
    pub fn marked(&self) -> usize {
        self.marks
            .iter()
            .filter(|mark| mark.load(Ordering::SeqCst))
            .count()
    }

    /// Whether every expected slot marked the batch.
    pub fn is_complete(&self) -> bool {
        self.marked() == self.marks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mark_all() {
        let marks = SlotMarks::new(3);
        assert!(!marks.is_complete());
        for slot in 0..3 {
            marks.mark(slot).unwrap();
        }
        assert!(marks.is_complete());
        assert_eq!(marks.marked(), 3);
    }

    #[test]
    fn test_double_mark_fails() {
        let marks = SlotMarks::new(2);
        marks.mark(1).unwrap();
        assert!(marks.mark(1).is_err());
    }

    #[test]
    fn test_out_of_range_fails() {
        let marks = SlotMarks::new(2);
        assert!(marks.mark(2).is_err());
        assert_eq!(marks.marked(), 0);
    }
}
