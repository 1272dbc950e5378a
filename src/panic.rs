//! Helpers for turning panic payloads into log text and errors.
//!
//! Collaborator code runs inside the dispatch loop, so a panic there is
//! caught and reported like any other collaborator failure.

use std::{
    any::Any,
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
};

use crate::error::{BoxError, TransportError};

/// Wrapper that formats a panic payload when logged or displayed.
///
/// The payload is downcast to `String` or `&'static str` if possible and falls
/// back to `Debug` formatting otherwise.
///
/// ```
/// use shuffle_transport::panic::format_panic;
/// assert_eq!(format_panic(&"boom").to_string(), "boom");
/// assert_eq!(format_panic(&String::from("boom")).to_string(), "boom");
/// assert!(format_panic(&5_u32).to_string().contains("Any"));
/// ```
#[must_use]
pub struct PanicMessage<'a>(&'a (dyn Any + Send));

impl fmt::Display for PanicMessage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(s) = self.0.downcast_ref::<String>() {
            f.write_str(s)
        } else if let Some(s) = self.0.downcast_ref::<&'static str>() {
            f.write_str(s)
        } else {
            write!(f, "{:?}", self.0)
        }
    }
}

/// Create a [`PanicMessage`] for the given payload.
///
/// Pass the payload itself (`&*payload`), not the box holding it.
pub fn format_panic(panic: &(dyn Any + Send)) -> PanicMessage<'_> { PanicMessage(panic) }

/// Run a collaborator call, converting a panic into
/// [`TransportError::HandlerPanicked`].
///
/// # Errors
///
/// Returns the call's own error, or the converted panic.
pub fn guard<T>(f: impl FnOnce() -> Result<T, BoxError>) -> Result<T, BoxError> {
    catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|panic| {
        Err(Box::new(TransportError::HandlerPanicked {
            message: format_panic(&*panic).to_string(),
        }))
    })
}

/// Like [`guard`] for calls that cannot fail, returning the panic text.
///
/// # Errors
///
/// Returns the formatted panic payload.
pub fn guard_infallible(f: impl FnOnce()) -> Result<(), String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| format_panic(&*panic).to_string())
}
