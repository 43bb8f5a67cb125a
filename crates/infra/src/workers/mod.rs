//! Background loops driving the claimer and reaper.

pub mod relay;

pub use relay::{OutboxRelay, RelayHandle};
