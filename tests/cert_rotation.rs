//! Certificate rotation tolerance between independently clocked nodes.
//!
//! A dialer pins the hashes of the previous, current and next window. Any
//! listener whose clock is within one rotation period of the dialer's must
//! present a certificate from that set.

use tsnode::constants::cert::ROTATION_PERIOD_MS;
use tsnode::network::cert::{accepted_hashes_at, issue_at, window_start};

const T: i64 = 1_760_000_000_000;
const DAY_MS: i64 = 24 * 60 * 60 * 1000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skew_within_one_period_is_accepted() {
        let accepted = accepted_hashes_at(T).unwrap();
        assert_eq!(accepted.len(), 3);

        let mut skew = -ROTATION_PERIOD_MS;
        while skew <= ROTATION_PERIOD_MS {
            let listener = issue_at(T + skew, 0).unwrap();
            assert!(
                accepted.contains(&listener.hash()),
                "listener skewed by {} days rejected",
                skew / DAY_MS
            );
            skew += DAY_MS;
        }
    }

    #[test]
    fn test_window_edges() {
        let start = window_start(T, 0);
        let end = start + ROTATION_PERIOD_MS;

        // First and last millisecond of a window share a certificate
        assert_eq!(
            issue_at(start, 0).unwrap().hash(),
            issue_at(end - 1, 0).unwrap().hash()
        );
        // The next millisecond rolls over
        assert_ne!(
            issue_at(end - 1, 0).unwrap().hash(),
            issue_at(end, 0).unwrap().hash()
        );
        assert_eq!(
            issue_at(end - 1, 1).unwrap().hash(),
            issue_at(end, 0).unwrap().hash()
        );
    }

    #[test]
    fn test_distant_listener_is_rejected() {
        let accepted = accepted_hashes_at(T).unwrap();
        let ahead = issue_at(T + 2 * ROTATION_PERIOD_MS, 0).unwrap();
        let behind = issue_at(T - 2 * ROTATION_PERIOD_MS, 0).unwrap();
        assert!(!accepted.contains(&ahead.hash()));
        assert!(!accepted.contains(&behind.hash()));
    }

    #[test]
    fn test_windows_before_epoch_floor_correctly() {
        assert_eq!(window_start(-1, 0), -ROTATION_PERIOD_MS);
        assert_eq!(window_start(0, 0), 0);
        assert_eq!(window_start(ROTATION_PERIOD_MS - 1, 1), ROTATION_PERIOD_MS);
    }
}
