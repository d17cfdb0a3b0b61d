//! Recycling identifier pool.
//!
//! Executors, sockets and acceptors each draw a process-unique small integer
//! identity from a shared pool seeded with 1..=0xFFFF. Identities return to
//! the pool when the owner drops, so no two live owners of the same kind
//! observe the same value concurrently.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// Highest identity the pool hands out. Values above this range denote
/// remote (out-of-process) parties in the RPC layer.
pub const LOCAL_LIMIT: u32 = 0xFFFF;

struct Distributor {
    pool: Mutex<VecDeque<u16>>,
}

impl Distributor {
    fn new() -> Self {
        Self {
            pool: Mutex::new((1..=LOCAL_LIMIT as u16).collect()),
        }
    }

    fn acquire(&self) -> Option<u16> {
        self.pool.lock().pop_front()
    }

    fn release(&self, value: u16) {
        self.pool.lock().push_back(value);
    }

    fn instance() -> &'static Arc<Distributor> {
        static INSTANCE: std::sync::OnceLock<Arc<Distributor>> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(|| Arc::new(Distributor::new()))
    }
}

/// A pooled identity. Acquired at construction, returned on drop.
pub struct Ident {
    pool: Arc<Distributor>,
    value: u16,
}

impl Ident {
    /// Draw the next free identity. Panics only if all 65535 identities are
    /// live at once, which exceeds any realistic executor/socket population.
    pub fn acquire() -> Ident {
        let pool = Distributor::instance().clone();
        let value = pool.acquire().expect("identifier pool exhausted");
        Ident { pool, value }
    }

    pub fn value(&self) -> u16 {
        self.value
    }
}

impl Drop for Ident {
    fn drop(&mut self) {
        if self.value > 0 {
            self.pool.release(self.value);
        }
    }
}

impl std::fmt::Debug for Ident {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ident({})", self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identities_are_unique_while_live() {
        let a = Ident::acquire();
        let b = Ident::acquire();
        let c = Ident::acquire();
        assert_ne!(a.value(), b.value());
        assert_ne!(b.value(), c.value());
        assert_ne!(a.value(), c.value());
    }

    #[test]
    fn identity_recycles_after_drop() {
        let value = {
            let id = Ident::acquire();
            id.value()
        };
        // The released value went to the back of the ring; cycling the pool
        // one identity at a time must bring it around again.
        for attempt in 0.. {
            let id = Ident::acquire();
            if id.value() == value {
                return;
            }
            assert!(attempt < LOCAL_LIMIT, "released id never reappeared");
        }
    }
}
