pub mod orchestrator;
pub mod resolver;

pub use orchestrator::{BatchSummary, Orchestrator};
pub use resolver::{EntityResolver, StoreResolver};
