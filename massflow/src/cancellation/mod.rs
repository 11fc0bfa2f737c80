//! Cooperative cancellation used to shut a running frame down.

mod token;

pub use token::CancellationToken;
