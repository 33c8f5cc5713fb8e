//! The process-wide GC lock.
//!
//! Every heap-mutating operation — allocation, ivar writes, method table
//! edits, collection itself — holds this re-entrant mutex. Re-entrancy
//! matters: a native method already holding the lock may allocate, and
//! allocation may trigger a collection, all without deadlocking.

use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::sync::OnceLock;

static GC_LOCK: OnceLock<ReentrantMutex<()>> = OnceLock::new();

/// Acquire the global recursive GC lock.
pub fn gc_lock() -> ReentrantMutexGuard<'static, ()> {
    GC_LOCK.get_or_init(|| ReentrantMutex::new(())).lock()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_is_reentrant() {
        let _outer = gc_lock();
        let _inner = gc_lock();
    }

    #[test]
    fn test_lock_excludes_other_threads() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::sync::Arc;

        let entered = Arc::new(AtomicBool::new(false));
        let guard = gc_lock();
        let handle = {
            let entered = entered.clone();
            std::thread::spawn(move || {
                let _g = gc_lock();
                entered.store(true, Ordering::SeqCst);
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }
}
