/// Utility functions for common operations across the codebase

/// Get current timestamp in milliseconds since epoch
///
/// Schedules and job reception times are expressed in epoch milliseconds.
pub fn current_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Clamp a raw size into `[1, max]`, treating a zero max as 1
pub fn clamp_size(size: usize, max: usize) -> usize {
    size.clamp(1, max.max(1))
}
