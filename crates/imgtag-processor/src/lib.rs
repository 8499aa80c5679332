//! `Processor` implementations: a single supervised child
//! ([`SubprocessProcessor`]) and a fixed-size pool of them
//! ([`PooledProcessor`]) fanned out behind one `Processor` facade
//!.

mod pool;
mod subprocess;

pub use pool::PooledProcessor;
pub use subprocess::SubprocessProcessor;
