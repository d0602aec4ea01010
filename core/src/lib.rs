//! # Ember Core
//!
//! Building blocks shared by the Ember renderer crates: the lock-free
//! ring queue used to hand work between threads, the handle arena that
//! backs the resource pool, and the profiling macros.

pub mod arena;
pub mod profiling;
pub mod ring_queue;

pub use arena::{Arena, Handle};
pub use ring_queue::{Consumer, Producer, RingQueue};

/// Core library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log the core library version.
pub fn init() {
    log::info!("Ember Core v{} initialized", VERSION);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
