/// Out-of-band TCP bootstrap: QP and MR credential exchange.
mod bootstrap;

pub use bootstrap::*;
