mod analytics;
mod fifo;
mod ledger;
mod reconstruct;
mod recommendations;
mod snapshot;

pub use analytics::*;
pub use fifo::*;
pub use ledger::*;
pub use reconstruct::*;
pub use recommendations::*;
pub use snapshot::*;
