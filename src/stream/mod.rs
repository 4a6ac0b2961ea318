//! Stream combinators for monitoring output.

mod throttle;

pub use throttle::{Throttle, ThrottleExt};
