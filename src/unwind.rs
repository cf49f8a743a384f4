//! Unwinding recovery utilities taken from rayon.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::panic::catch_unwind;
use std::process::abort;
use std::thread::Result;

use crate::error::TaskFailure;
use crate::platform::*;

/// Executes `f` and captures any panic, translating that panic into a
/// `Err` result. The panic is reported later as a [`TaskFailure`], and hence
/// `f` can be treated as exception safe.
#[inline(always)]
pub fn halt_unwinding<F, R>(func: F) -> Result<R>
where
    F: FnOnce() -> R,
{
    catch_unwind(AssertUnwindSafe(func))
}

/// Converts a panic payload into a failure that can be stored in a task and
/// cloned out to every joiner.
#[cold]
pub fn panic_failure(payload: Box<dyn Any + Send>) -> TaskFailure {
    let message: Arc<str> = if let Some(message) = payload.downcast_ref::<&'static str>() {
        Arc::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        Arc::from(message.as_str())
    } else {
        Arc::from("non-string panic payload")
    };
    TaskFailure::Panicked(message)
}

/// Aborts the program when dropped.
pub struct AbortOnDrop;

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        eprintln!("fjord: detected unexpected panic in scheduler; aborting");
        abort();
    }
}
