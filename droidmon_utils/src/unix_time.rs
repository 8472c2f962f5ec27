use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time as unix milliseconds. Clocks before the epoch
/// read as zero.
pub fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current wall-clock time as unix seconds.
pub fn unix_now() -> u64 {
    unix_now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_after_2020() {
        assert!(unix_now() > 1_577_836_800); // 2020-01-01
        assert!(unix_now_ms() >= unix_now() * 1000);
    }
}
