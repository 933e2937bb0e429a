//! Per-thread restriction flags.
//!
//! The reactor thread must never block on a wait or perform blocking I/O;
//! both flags are cleared when the thread starts. The assertions compile to
//! nothing in release builds.

use std::cell::Cell;

thread_local! {
    static WAIT_ALLOWED: Cell<bool> = Cell::new(true);
    static IO_ALLOWED: Cell<bool> = Cell::new(true);
}

pub fn set_wait_allowed(allowed: bool) {
    WAIT_ALLOWED.with(|flag| flag.set(allowed));
}

pub fn set_io_allowed(allowed: bool) {
    IO_ALLOWED.with(|flag| flag.set(allowed));
}

pub fn wait_allowed() -> bool {
    WAIT_ALLOWED.with(|flag| flag.get())
}

pub fn io_allowed() -> bool {
    IO_ALLOWED.with(|flag| flag.get())
}

/// Asserts (debug builds) that the current thread may block on a wait.
pub fn assert_wait_allowed(context: &str) {
    debug_assert!(
        wait_allowed(),
        "blocking wait on a thread that disallows waiting: {}",
        context
    );
}

/// Asserts (debug builds) that the current thread may perform blocking I/O.
pub fn assert_io_allowed(context: &str) {
    debug_assert!(
        io_allowed(),
        "blocking I/O on a thread that disallows it: {}",
        context
    );
}
