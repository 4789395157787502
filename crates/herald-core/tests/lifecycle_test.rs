//! Property-based tests for the notification lifecycle state machine.

#![allow(clippy::unwrap_used)]

use chrono::{Duration, Utc};
use herald_core::{ChannelKind, CoreError, Notification, NotificationStatus};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};

fn proptest_config() -> ProptestConfig {
    ProptestConfig { cases: 100, failure_persistence: None, ..ProptestConfig::default() }
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Pending,
    Delivered,
    Failed,
}

fn step_strategy() -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop::sample::select(vec![Step::Pending, Step::Delivered, Step::Failed]),
        0..20,
    )
}

fn status_strategy() -> impl Strategy<Value = NotificationStatus> {
    prop::sample::select(vec![
        NotificationStatus::Queued,
        NotificationStatus::Pending,
        NotificationStatus::Delivered,
        NotificationStatus::Failed,
    ])
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Arbitrary step sequences never break the lifecycle invariants.
    #[test]
    fn lifecycle_invariants_hold_for_any_step_sequence(steps in step_strategy()) {
        let start = Utc::now();
        let mut notification =
            Notification::queued(ChannelKind::Sms, "+15550100", None, "code 1234", start);
        let mut previous_attempts = 0;

        for (i, step) in steps.into_iter().enumerate() {
            let now = start + Duration::seconds(i as i64);
            let before = notification.status;
            let result = match step {
                Step::Pending => notification.mark_pending(now),
                Step::Delivered => notification.mark_delivered("sms", now),
                Step::Failed => notification.mark_failed("rejected", now),
            };

            if before.is_terminal() {
                let is_transition_error =
                    matches!(result, Err(CoreError::InvalidTransition { .. }));
                prop_assert!(is_transition_error);
                prop_assert_eq!(notification.status, before);
            }

            prop_assert!(notification.attempts >= previous_attempts);
            prop_assert_eq!(
                notification.delivered_at.is_some(),
                notification.status == NotificationStatus::Delivered
            );
            previous_attempts = notification.attempts;
        }
    }

    /// Terminal states have no outgoing transitions.
    #[test]
    fn terminal_states_are_sinks(from in status_strategy(), to in status_strategy()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }
}

#[test]
fn queued_can_fail_without_an_attempt() {
    let mut notification =
        Notification::queued(ChannelKind::Push, "device-token", None, "ping", Utc::now());

    notification.mark_failed("no adapter registered", Utc::now()).unwrap();

    assert_eq!(notification.status, NotificationStatus::Failed);
    assert_eq!(notification.attempts, 0);
}

#[test]
fn status_serializes_lowercase() {
    let json = serde_json::to_string(&NotificationStatus::Delivered).unwrap();
    assert_eq!(json, "\"delivered\"");

    let kind: ChannelKind = serde_json::from_str("\"email\"").unwrap();
    assert_eq!(kind, ChannelKind::Email);
}
