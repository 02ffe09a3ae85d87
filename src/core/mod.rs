// Modeling engine seam and per-model execution

pub mod engine;
pub mod executor;

pub use engine::*;
pub use executor::*;
