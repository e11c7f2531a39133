pub mod odds_state;

pub use odds_state::{outcome_label, ApplyOutcome, EventContext, OddsStateTracker};
