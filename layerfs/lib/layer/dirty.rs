use parking_lot::Mutex;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Blocks written by a layer and not yet flushed.
///
/// Appends and drains are the only operations; the mutex is held just for the splice.
#[derive(Debug, Default)]
pub struct DirtyQueue {
    blocks: Mutex<Vec<u64>>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirtyQueue {
    /// Appends a block to the queue.
    pub fn push(&self, block: u64) {
        self.blocks.lock().push(block);
    }

    /// Takes every queued block, oldest first.
    pub fn drain(&self) -> Vec<u64> {
        std::mem::take(&mut *self.blocks.lock())
    }

    /// Number of queued blocks.
    pub fn len(&self) -> usize {
        self.blocks.lock().len()
    }

    /// Returns `true` if nothing is waiting for writeback.
    pub fn is_empty(&self) -> bool {
        self.blocks.lock().is_empty()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread};

    use super::*;

    #[test]
    fn test_dirty_queue_drain_takes_everything_in_order() {
        let queue = DirtyQueue::default();
        queue.push(3);
        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.drain(), vec![3, 1, 2]);
        assert!(queue.is_empty());
        assert!(queue.drain().is_empty());
    }

    #[test]
    fn test_dirty_queue_concurrent_appends() {
        let queue = Arc::new(DirtyQueue::default());
        let writers: Vec<_> = (0..4)
            .map(|t| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || {
                    for block in 0..100 {
                        queue.push(t * 1000 + block);
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }

        let mut blocks = queue.drain();
        assert_eq!(blocks.len(), 400);
        blocks.sort_unstable();
        blocks.dedup();
        assert_eq!(blocks.len(), 400);
    }
}
