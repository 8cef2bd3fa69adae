use crate::application_port::SessionPair;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Where the client keeps its current token pair. Calls are short and
/// synchronous so they can run under the coordinator's lock.
pub trait TokenVault: Send + Sync {
    fn load(&self) -> Option<SessionPair>;
    fn save(&self, pair: SessionPair);
    fn clear(&self);
}

#[derive(Default)]
pub struct MemoryVault {
    pair: Mutex<Option<SessionPair>>,
    clears: AtomicUsize,
}

impl MemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pair(pair: SessionPair) -> Self {
        MemoryVault {
            pair: Mutex::new(Some(pair)),
            clears: AtomicUsize::new(0),
        }
    }

    /// How many times local session state has been wiped.
    pub fn clear_count(&self) -> usize {
        self.clears.load(Ordering::SeqCst)
    }
}

impl TokenVault for MemoryVault {
    fn load(&self) -> Option<SessionPair> {
        match self.pair.lock() {
            Ok(pair) => pair.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn save(&self, pair: SessionPair) {
        match self.pair.lock() {
            Ok(mut slot) => *slot = Some(pair),
            Err(poisoned) => *poisoned.into_inner() = Some(pair),
        }
    }

    fn clear(&self) {
        match self.pair.lock() {
            Ok(mut slot) => *slot = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
        self.clears.fetch_add(1, Ordering::SeqCst);
    }
}
