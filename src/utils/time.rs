use std::time::Duration;

use tokio::time::Instant;

// Roughly 30 years, the same horizon tokio uses for a sleep that never fires.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `base + delay`, clamped to a far-future instant instead of overflowing.
pub(crate) fn instant_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_delay_is_exact() {
        let base = Instant::now();
        assert_eq!(instant_after(base, Duration::from_secs(5)), base + Duration::from_secs(5));
    }

    #[test]
    fn test_huge_delay_saturates() {
        let base = Instant::now();
        let at = instant_after(base, Duration::from_secs(u64::MAX));
        assert!(at > base + Duration::from_secs(86_400 * 365));
    }
}
