//! Shared guardrails for window sizes, cache budgets and timer bounds.

// Viewport guards
pub const MAX_PREFETCH_MARGIN: u64 = 10_000;
pub const MAX_DEBOUNCE_MS: u64 = 5_000;

// Fetch guards
pub const MIN_WINDOW_ROWS: u64 = 1;
pub const MAX_WINDOW_ROWS: u64 = 100_000;
pub const MAX_FETCH_ATTEMPTS: u32 = 10;

// Cache guards
pub const MIN_CACHED_ROWS: usize = 1;
pub const MAX_CACHED_ROWS: usize = 10_000_000;

pub fn clamp_u64(value: u64, minimum: u64, maximum: u64) -> u64 {
    value.max(minimum).min(maximum)
}

pub fn clamp_usize(value: usize, minimum: usize, maximum: usize) -> usize {
    value.max(minimum).min(maximum)
}

pub fn clamp_margin(value: u64) -> u64 {
    clamp_u64(value, 0, MAX_PREFETCH_MARGIN)
}

pub fn clamp_window_rows(value: u64) -> u64 {
    clamp_u64(value, MIN_WINDOW_ROWS, MAX_WINDOW_ROWS)
}

pub fn clamp_cached_rows(value: usize) -> usize {
    clamp_usize(value, MIN_CACHED_ROWS, MAX_CACHED_ROWS)
}

pub fn clamp_attempts(value: u32) -> u32 {
    value.clamp(1, MAX_FETCH_ATTEMPTS)
}

pub fn clamp_debounce_ms(value: u64) -> u64 {
    clamp_u64(value, 0, MAX_DEBOUNCE_MS)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamps_hold_bounds() {
        assert_eq!(clamp_margin(u64::MAX), MAX_PREFETCH_MARGIN);
        assert_eq!(clamp_window_rows(0), MIN_WINDOW_ROWS);
        assert_eq!(clamp_cached_rows(0), MIN_CACHED_ROWS);
        assert_eq!(clamp_attempts(0), 1);
        assert_eq!(clamp_attempts(99), MAX_FETCH_ATTEMPTS);
        assert_eq!(clamp_debounce_ms(60), 60);
    }
}
