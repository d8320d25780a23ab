//! Exponential backoff helper shared by retry loops that poll for a
//! condition to become true within a deadline.

use std::time::Duration;

/// Returns the delay to sleep before the `attempt`'th retry (0-indexed),
/// starting at `base` and doubling on every attempt up to `cap`.
pub fn delay_for_attempt(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let cap_ms = cap.as_millis() as u64;
    let mut delay_ms = cap_ms;
    if let Some(doubled_ms) = (base.as_millis() as u64).checked_shl(attempt) {
        delay_ms = std::cmp::min(cap_ms, doubled_ms);
    }
    Duration::from_millis(delay_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let base = Duration::from_millis(1);
        let cap = Duration::from_millis(1000);
        assert_eq!(delay_for_attempt(0, base, cap), Duration::from_millis(1));
        assert_eq!(delay_for_attempt(1, base, cap), Duration::from_millis(2));
        assert_eq!(delay_for_attempt(10, base, cap), cap);
    }
}
