use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic id sequence shared by every resolution task.
///
/// Seeded with the highest id already persisted so a restart never hands out an id twice.
#[derive(Debug)]
pub struct IdGenerator {
    last: AtomicU64,
}

impl IdGenerator {
    pub fn new(last_persisted: u64) -> Self {
        IdGenerator {
            last: AtomicU64::new(last_persisted),
        }
    }

    pub fn next_id(&self) -> u64 {
        self.last.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn last_id(&self) -> u64 {
        self.last.load(Ordering::SeqCst)
    }
}
