use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Check whether an optional cancellation flag has been raised.
#[must_use]
pub fn cancel_requested(cancel: &Option<Arc<AtomicBool>>) -> bool {
    cancel
        .as_ref()
        .map(|flag| flag.load(Ordering::SeqCst))
        .unwrap_or(false)
}

/// Render a human-friendly transfer speed string.
#[must_use]
pub fn format_speed(bytes_per_sec: f32) -> String {
    const KIB: f32 = 1024.0;
    const MIB: f32 = KIB * 1024.0;

    if bytes_per_sec < KIB {
        format!("{bytes_per_sec:.0} B/s")
    } else if bytes_per_sec < MIB {
        format!("{:.1} KB/s", bytes_per_sec / KIB)
    } else {
        format!("{:.1} MB/s", bytes_per_sec / MIB)
    }
}

/// Fraction of a transfer completed, or `None` when the total is unknown.
#[must_use]
pub fn transfer_fraction(done: u64, total: Option<u64>) -> Option<f32> {
    match total {
        Some(total) if total > 0 => Some((done as f64 / total as f64).clamp(0.0, 1.0) as f32),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn formats_speed_human_readable() {
        assert_eq!(format_speed(512.0), "512 B/s");
        assert_eq!(format_speed(2_048.0), "2.0 KB/s");
        assert_eq!(format_speed(5_242_880.0), "5.0 MB/s");
    }

    #[test]
    fn calculates_transfer_fraction() {
        assert_eq!(transfer_fraction(0, Some(10)), Some(0.0));
        assert_eq!(transfer_fraction(5, Some(10)), Some(0.5));
        assert_eq!(transfer_fraction(10, Some(10)), Some(1.0));
        assert_eq!(transfer_fraction(12, Some(10)), Some(1.0));
        assert_eq!(transfer_fraction(5, None), None);
        assert_eq!(transfer_fraction(5, Some(0)), None);
    }

    #[test]
    fn respects_optional_cancel_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!cancel_requested(&Some(flag.clone())));
        flag.store(true, Ordering::SeqCst);
        assert!(cancel_requested(&Some(flag)));
        assert!(!cancel_requested(&None));
    }
}
