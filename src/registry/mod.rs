pub mod market_types;

pub use market_types::{MarketTypeRegistry, RegistryMetrics};
