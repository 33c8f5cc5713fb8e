//! Thread registry and stop-the-world coordination.
//!
//! Collection only runs on the main thread. Before marking, every other
//! registered thread must be *at a safepoint*: parked in
//! [`ThreadState::park_at_safepoint`], waiting for the GC lock, or inside a
//! blocking syscall wrapped in [`blocking_region`]. In each case the thread
//! has published a snapshot — its stack-top address and a spill of its
//! callee-saved registers — which the collector scans conservatively in
//! place of the live registers.
//!
//! Safepoints are cooperative and ride on allocation: a thread that never
//! allocates and never blocks cannot be stopped, which is acceptable because
//! such a thread also cannot mutate the heap (all heap mutation takes the GC
//! lock, and lock acquisition publishes a safepoint).

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Callee-saved register spill, scanned like stack memory.
///
/// On unsupported architectures the snapshot is empty; values live in
/// registers alone can then be missed, so ports must fill this in.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterSnapshot {
    words: [usize; 16],
    len: usize,
}

impl RegisterSnapshot {
    /// The captured words.
    #[inline]
    pub fn words(&self) -> &[usize] {
        &self.words[..self.len]
    }
}

/// Spill the callee-saved registers into a snapshot.
///
/// `#[inline(never)]` keeps the reads at a real call boundary, where the
/// callee-saved set still holds the caller's values.
#[inline(never)]
pub fn capture_registers() -> RegisterSnapshot {
    #[allow(unused_mut)]
    let mut snapshot = RegisterSnapshot::default();

    // One asm block per register: a combined block could allocate an
    // output into a callee-saved register that a later read still needs.
    #[allow(unused_macros)]
    macro_rules! read_reg {
        ($slot:expr, $name:literal) => {{
            let word: usize;
            unsafe {
                std::arch::asm!(
                    concat!("mov {0}, ", $name),
                    out(reg) word,
                    options(nostack, nomem, preserves_flags),
                );
            }
            snapshot.words[$slot] = word;
        }};
    }

    #[cfg(target_arch = "x86_64")]
    {
        read_reg!(0, "rbx");
        read_reg!(1, "rbp");
        read_reg!(2, "r12");
        read_reg!(3, "r13");
        read_reg!(4, "r14");
        read_reg!(5, "r15");
        snapshot.len = 6;
    }

    #[cfg(target_arch = "aarch64")]
    {
        read_reg!(0, "x19");
        read_reg!(1, "x20");
        read_reg!(2, "x21");
        read_reg!(3, "x22");
        read_reg!(4, "x23");
        read_reg!(5, "x24");
        read_reg!(6, "x25");
        read_reg!(7, "x26");
        read_reg!(8, "x27");
        read_reg!(9, "x28");
        snapshot.len = 10;
    }

    snapshot
}

/// The context a stopped thread publishes for the collector.
#[derive(Debug, Clone, Copy, Default)]
pub struct SavedContext {
    /// Deepest stack address at the time of publishing (stacks grow down).
    pub stack_top: usize,
    /// Callee-saved register spill.
    pub registers: RegisterSnapshot,
}

/// One pipe per thread so the runtime can interrupt its blocking reads:
/// the read end is added to every blocking `select`, and writing the other
/// end (or closing it, for `Thread#kill`) wakes the thread.
#[derive(Debug)]
pub struct WakePipe {
    read_fd: i32,
    write_fd: i32,
}

impl WakePipe {
    fn new() -> Option<Self> {
        let mut fds = [0i32; 2];
        let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if rc != 0 {
            return None;
        }
        Some(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Fd to include in blocking `select` sets.
    #[inline]
    pub fn read_fd(&self) -> i32 {
        self.read_fd
    }

    /// Wake the owning thread out of a blocking wait.
    pub fn wake(&self) {
        let byte = [1u8];
        unsafe {
            let _ = libc::write(self.write_fd, byte.as_ptr() as *const libc::c_void, 1);
        }
    }
}

impl Drop for WakePipe {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

/// Per-thread GC state.
pub struct ThreadState {
    id: u64,
    is_main: bool,
    /// Address of the top of the stack at thread start (highest address).
    start_of_stack: AtomicUsize,
    /// True while the thread is parked, lock-waiting, or sleeping — i.e.
    /// while `saved` is a faithful stand-in for its live state.
    at_safepoint: AtomicBool,
    saved: Mutex<SavedContext>,
    wake_pipe: Option<WakePipe>,
}

impl ThreadState {
    /// Registry-assigned id.
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Is this the main (collecting) thread?
    #[inline]
    pub fn is_main(&self) -> bool {
        self.is_main
    }

    /// Highest stack address, set at registration.
    #[inline]
    pub fn start_of_stack(&self) -> usize {
        self.start_of_stack.load(Ordering::Relaxed)
    }

    /// The thread's wake pipe, if the platform provided one.
    #[inline]
    pub fn wake_pipe(&self) -> Option<&WakePipe> {
        self.wake_pipe.as_ref()
    }

    /// Is this thread currently stoppable, with a published snapshot?
    #[inline]
    pub fn at_safepoint(&self) -> bool {
        self.at_safepoint.load(Ordering::Acquire)
    }

    /// The published snapshot. Meaningful only while [`Self::at_safepoint`].
    pub fn saved_context(&self) -> SavedContext {
        *self.saved.lock()
    }

    /// Publish the current stack top and registers and flag the thread
    /// stoppable. The snapshot stays valid until [`Self::leave_safepoint`].
    pub fn publish_safepoint(&self) {
        let marker: usize = 0;
        let context = SavedContext {
            stack_top: &marker as *const usize as usize,
            registers: capture_registers(),
        };
        *self.saved.lock() = context;
        self.at_safepoint.store(true, Ordering::Release);
        ThreadRegistry::the().stopped.notify_all();
    }

    /// Withdraw the snapshot, first waiting out any collection in progress.
    pub fn leave_safepoint(&self) {
        let registry = ThreadRegistry::the();
        let mut stop = registry.stop_requested.lock();
        while *stop {
            registry.resumed.wait(&mut stop);
        }
        self.at_safepoint.store(false, Ordering::Release);
    }

    /// Park until the collector wakes the world. Publishes first.
    pub fn park_at_safepoint(&self) {
        self.publish_safepoint();
        self.leave_safepoint();
    }
}

/// Registry of every thread the runtime runs Ruby code on.
pub struct ThreadRegistry {
    threads: Mutex<Vec<Arc<ThreadState>>>,
    next_id: AtomicUsize,
    stop_requested: Mutex<bool>,
    /// Signaled when the collector clears the stop request.
    resumed: Condvar,
    /// Signaled when a thread publishes a safepoint.
    stopped: Condvar,
}

thread_local! {
    static CURRENT: std::cell::RefCell<Option<Arc<ThreadState>>> =
        const { std::cell::RefCell::new(None) };
}

impl ThreadRegistry {
    /// The process-wide registry.
    pub fn the() -> &'static ThreadRegistry {
        static REGISTRY: OnceLock<ThreadRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| ThreadRegistry {
            threads: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            stop_requested: Mutex::new(false),
            resumed: Condvar::new(),
            stopped: Condvar::new(),
        })
    }

    /// Register the calling thread. `start_of_stack` is the highest stack
    /// address, captured as the address of a local in the thread's outermost
    /// frame.
    pub fn register_current(&self, is_main: bool, start_of_stack: usize) -> Arc<ThreadState> {
        let state = Arc::new(ThreadState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed) as u64,
            is_main,
            start_of_stack: AtomicUsize::new(start_of_stack),
            at_safepoint: AtomicBool::new(false),
            saved: Mutex::new(SavedContext::default()),
            wake_pipe: WakePipe::new(),
        });
        self.threads.lock().push(state.clone());
        CURRENT.with(|c| *c.borrow_mut() = Some(state.clone()));
        state
    }

    /// Drop the calling thread from the registry.
    pub fn unregister_current(&self) {
        if let Some(state) = CURRENT.with(|c| c.borrow_mut().take()) {
            self.threads.lock().retain(|t| t.id != state.id);
        }
    }

    /// The calling thread's state, if registered.
    pub fn current(&self) -> Option<Arc<ThreadState>> {
        CURRENT.with(|c| c.borrow().clone())
    }

    /// Snapshot of all registered threads.
    pub fn all(&self) -> Vec<Arc<ThreadState>> {
        self.threads.lock().clone()
    }

    /// Cooperative safepoint: if a stop is requested and the calling thread
    /// is registered and not the collector, park until the world resumes.
    pub fn safepoint(&self) {
        let Some(state) = self.current() else { return };
        if state.is_main {
            return;
        }
        let requested = *self.stop_requested.lock();
        if requested {
            state.park_at_safepoint();
        }
    }

    /// Request every other registered thread to stop, then wait until each
    /// has a published snapshot. Called by the collector with the GC lock
    /// held.
    pub fn stop_the_world(&self) {
        *self.stop_requested.lock() = true;
        let current_id = self.current().map(|t| t.id);

        let mut stop = self.stop_requested.lock();
        loop {
            let all_stopped = self
                .threads
                .lock()
                .iter()
                .filter(|t| Some(t.id) != current_id)
                .all(|t| t.at_safepoint());
            if all_stopped {
                break;
            }
            self.stopped
                .wait_for(&mut stop, std::time::Duration::from_millis(5));
        }
    }

    /// Clear the stop request and release every parked thread.
    pub fn wake_the_world(&self) {
        *self.stop_requested.lock() = false;
        self.resumed.notify_all();
    }
}

/// Run a blocking operation with the calling thread marked sleeping.
///
/// The snapshot taken on entry lets the collector proceed without waiting
/// for this thread; on exit the thread waits out any collection still in
/// flight before touching the heap again.
pub fn blocking_region<R>(f: impl FnOnce() -> R) -> R {
    match ThreadRegistry::the().current() {
        Some(state) if !state.is_main() => {
            state.publish_safepoint();
            let result = f();
            state.leave_safepoint();
            result
        }
        _ => f(),
    }
}
