//! Panic reporting.
//!
//! Every panic is logged. One nothing catches is also reported to the owning
//! process as an `error` event, since the task or thread it killed cannot
//! report anything itself.

use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};

use crate::ipc::EventSink;

thread_local! {
    /// Set while `catch` runs on this thread; its caller reports the panic.
    static CAUGHT: Cell<bool> = const { Cell::new(false) };
}

pub fn install_hook(sink: EventSink) {
    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        log::error!("panic in thread {name}: {info}");
        if !CAUGHT.with(Cell::get) {
            sink.error(
                None,
                format!("internal error in {name}: {}", message(info.payload())),
            );
        }
        default_hook(info);
    }));
}

/// Run `f`, turning a panic into its message.
pub fn catch<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    let outer = CAUGHT.with(|caught| caught.replace(true));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    CAUGHT.with(|caught| caught.set(outer));
    result.map_err(|payload| message(payload.as_ref()))
}

pub fn message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
