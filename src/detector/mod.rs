pub mod alerts;
pub mod classifier;
pub mod signals;

pub use alerts::{AlertEngine, AlertStats};
