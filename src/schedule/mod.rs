pub mod decay;
pub mod interval;

pub use decay::{evaluate_decay, DecayDecision, DecayVerdict};
pub use interval::{compute_interval, hour_in_range, is_quiet_hours};
