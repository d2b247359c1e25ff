//! Cooperative cancellation shared by the driver loop and handlers.

mod token;

pub use token::{CancelCallback, CancellationToken};
