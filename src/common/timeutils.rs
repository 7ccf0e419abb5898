use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as float epoch seconds, the unit every
/// timestamp column in the store uses.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("System clock is before the unix epoch")
        .as_secs_f64()
}
