//! Property tests for capacity/request-counter invariants and round-trip
//! idempotence.

use chrono::Utc;
use fleet_controller::Registry;
use proptest::prelude::*;

proptest! {
    /// `tryReserveSlot` never pushes `current_count` above `max_count`,
    /// regardless of how many reservations are attempted.
    #[test]
    fn capacity_counter_stays_within_bounds(max_count in 0i64..20, attempts in 0u32..40) {
        let registry = Registry::open_in_memory().unwrap();
        registry.migrate(max_count).unwrap();

        for _ in 0..attempts {
            let _ = registry.try_reserve_slot().unwrap();
        }

        let cap = registry.get_capacity().unwrap();
        prop_assert!(cap.current_count >= 0);
        prop_assert!(cap.current_count <= cap.max_count);
    }

    /// Reserve then release is a no-op on the counter, for any sequence
    /// length.
    #[test]
    fn reserve_release_round_trips(rounds in 1u32..10) {
        let registry = Registry::open_in_memory().unwrap();
        registry.migrate(5).unwrap();
        let before = registry.get_capacity().unwrap().current_count;

        for _ in 0..rounds {
            if registry.try_reserve_slot().unwrap() {
                registry.release_slot().unwrap();
            }
        }

        let after = registry.get_capacity().unwrap().current_count;
        prop_assert_eq!(before, after);
    }

    /// `recordInstance` followed by k decrements returns `active_requests`
    /// to its pre-call value, and it never goes negative.
    #[test]
    fn active_requests_never_negative_and_round_trips(k in 0i64..20) {
        let registry = Registry::open_in_memory().unwrap();
        registry.migrate(10).unwrap();
        let now = Utc::now();

        registry.record_instance("inst", 0, true, now).unwrap();
        registry.increment_requests("inst", now, true, k).unwrap();

        for _ in 0..k {
            registry.decrement_requests("inst", now).unwrap();
        }

        let rec = registry.get_instance_by_name("inst").unwrap().unwrap();
        prop_assert_eq!(rec.active_requests, 0);
        prop_assert!(rec.active_requests >= 0);
    }

    /// Decrementing past zero always clamps rather than going negative.
    #[test]
    fn decrement_clamps_at_zero_for_any_starting_point(start in 0i64..5, extra_decrements in 0u32..10) {
        let registry = Registry::open_in_memory().unwrap();
        registry.migrate(10).unwrap();
        let now = Utc::now();

        registry.record_instance("inst", start, true, now).unwrap();
        for _ in 0..(start as u32 + extra_decrements) {
            registry.decrement_requests("inst", now).unwrap();
        }

        let rec = registry.get_instance_by_name("inst").unwrap().unwrap();
        prop_assert_eq!(rec.active_requests, 0);
    }
}
