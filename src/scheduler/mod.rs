//! Background tasks owned by the engine.

mod retention;

pub use retention::*;
