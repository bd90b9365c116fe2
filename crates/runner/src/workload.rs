//! Synthetic record workload for the runner.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::runtime::{Handle, RuntimeFlavor};

use batchstage_core::ForkedProcess;

/// A batch of consecutive record ids and the digest computed for each.
#[derive(Debug)]
pub struct RecordBatch {
    ids: Vec<u64>,
    digests: Vec<AtomicU64>,
}

impl RecordBatch {
    pub fn new(first_id: u64, size: usize) -> Self {
        Self {
            ids: (first_id..first_id + size as u64).collect(),
            digests: (0..size).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn first_id(&self) -> Option<u64> {
        self.ids.first().copied()
    }

    /// Whether every record has its digest.
    pub fn is_digested(&self) -> bool {
        self.digests
            .iter()
            .all(|digest| digest.load(Ordering::Acquire) != 0)
    }
}

/// Record digest, never zero.
pub fn digest(id: u64) -> u64 {
    let mut z = id.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    (z ^ (z >> 31)) | 1
}

/// Digests the records a slot owns, partitioned by `id % processors`.
///
/// Hashing is CPU work, so it leaves the async workers when the runtime
/// has threads to spare.
pub struct Digest;

impl Digest {
    fn digest_owned(slot: usize, processors: usize, batch: &RecordBatch) -> anyhow::Result<()> {
        let owned = batch
            .ids
            .iter()
            .zip(&batch.digests)
            .filter(|(id, _)| (**id % processors as u64) as usize == slot);
        for (id, slot_digest) in owned {
            let previous = slot_digest.swap(digest(*id), Ordering::AcqRel);
            anyhow::ensure!(previous == 0, "record {} digested twice", id);
        }
        Ok(())
    }
}

#[async_trait]
impl ForkedProcess<RecordBatch> for Digest {
    async fn forked_process(
        &self,
        slot: usize,
        processors: usize,
        batch: &RecordBatch,
    ) -> anyhow::Result<()> {
        match Handle::current().runtime_flavor() {
            RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| Self::digest_owned(slot, processors, batch))
            }
            _ => Self::digest_owned(slot, processors, batch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_slots_digest_whole_batch() {
        let batch = RecordBatch::new(100, 37);
        let processors = 4;
        for slot in 0..processors {
            tokio_test::block_on(Digest.forked_process(slot, processors, &batch)).unwrap();
        }
        assert_eq!(batch.first_id(), Some(100));
        assert!(batch.is_digested());
    }

    #[test]
    fn test_missing_slot_leaves_records_undigested() {
        let batch = RecordBatch::new(0, 8);
        tokio_test::block_on(Digest.forked_process(0, 2, &batch)).unwrap();
        assert!(!batch.is_digested());
    }

    #[test]
    fn test_double_processing_fails() {
        let batch = RecordBatch::new(0, 4);
        tokio_test::block_on(Digest.forked_process(0, 1, &batch)).unwrap();
        let err = tokio_test::block_on(Digest.forked_process(0, 1, &batch)).unwrap_err();
        assert!(err.to_string().contains("digested twice"));
    }

    #[test]
    fn test_digest_is_never_zero() {
        assert!((0..1000u64).all(|id| digest(id) != 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_digest_on_multi_thread_runtime() {
        let batch = RecordBatch::new(0, 64);
        for slot in 0..3 {
            Digest.forked_process(slot, 3, &batch).await.unwrap();
        }
        assert!(batch.is_digested());
    }
}
