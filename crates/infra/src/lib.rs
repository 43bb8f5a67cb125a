//! Infrastructure layer: outbox storage, delivery workers, configuration.

pub mod claimer;
pub mod config;
pub mod outbox;
pub mod reaper;
pub mod workers;

pub use claimer::{ClaimReport, Claimer, ClaimerError};
pub use config::{ConfigError, OutboxConfig};
pub use reaper::{Reaper, ReaperError};
pub use workers::{OutboxRelay, RelayHandle};
