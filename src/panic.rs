//! Panic capture for caller-supplied code.
//!
//! Processors and delivery callbacks run code the node does not control. A
//! panic in one of them is caught, rendered once into a [`PanicMessage`] and
//! logged; the dispatching task carries on with the next message.

use std::{any::Any, borrow::Cow, fmt, panic::AssertUnwindSafe};

/// Text of a caught panic.
///
/// ```
/// use hyperroute::panic::format_panic;
/// assert_eq!(format_panic(Box::new("boom")).as_str(), "boom");
/// assert_eq!(format_panic(Box::new(String::from("bang"))).as_str(), "bang");
/// assert_eq!(format_panic(Box::new(5_u32)).as_str(), "non-string panic payload");
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
#[must_use]
pub struct PanicMessage(Cow<'static, str>);

impl PanicMessage {
    #[must_use]
    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for PanicMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

/// Render a panic payload.
///
/// `panic!` payloads are a `&'static str` or a `String`; anything else is
/// reported generically.
pub fn format_panic(payload: Box<dyn Any + Send>) -> PanicMessage {
    let text = match payload.downcast::<String>() {
        Ok(owned) => Cow::Owned(*owned),
        Err(payload) => match payload.downcast_ref::<&'static str>() {
            Some(text) => Cow::Borrowed(*text),
            None => Cow::Borrowed("non-string panic payload"),
        },
    };
    PanicMessage(text)
}

/// Run `f`, converting a panic into its rendered payload.
///
/// ```
/// use hyperroute::panic::catch_panic;
/// assert_eq!(catch_panic(|| 7).ok(), Some(7));
/// let err = catch_panic(|| -> u8 { panic!("callback failed") }).unwrap_err();
/// assert_eq!(err.to_string(), "callback failed");
/// ```
///
/// # Errors
///
/// Returns the [`PanicMessage`] when `f` panics.
pub fn catch_panic<T>(f: impl FnOnce() -> T) -> Result<T, PanicMessage> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).map_err(format_panic)
}
