mod decoder;
mod rate_gate;
mod throttle_key;

pub use decoder::decode;
pub use rate_gate::{CommitStrategy, RateGate};
pub use throttle_key::{ThrottleKeyExtractor, ThrottleKeyStrategy};
