use std::cell::Cell;

thread_local! {
    static DEPTH: Cell<usize> = Cell::new(0);
    static ENTRIES: Cell<usize> = Cell::new(0);
}

/// Counts critical section entries per thread instead of masking anything.
struct CountingCriticalSection;
critical_section::set_impl!(CountingCriticalSection);

unsafe impl critical_section::Impl for CountingCriticalSection {
    unsafe fn acquire() -> critical_section::RawRestoreState {
        DEPTH.with(|depth| depth.set(depth.get() + 1));
        ENTRIES.with(|entries| entries.set(entries.get() + 1));
    }

    unsafe fn release(_restore_state: critical_section::RawRestoreState) {
        DEPTH.with(|depth| depth.set(depth.get() - 1));
    }
}

/// How many critical sections the current thread is inside.
pub fn depth() -> usize {
    DEPTH.with(|depth| depth.get())
}

/// How many critical sections the current thread has entered.
pub fn entries() -> usize {
    ENTRIES.with(|entries| entries.get())
}
