//! Property-based test generators using proptest.
//!
//! Provides strategies for generating random sync-layer data that
//! maintains required invariants.

use proptest::prelude::*;
use tether_core::{RetryConfig, TaskOp};

/// Strategy for generating entity ids (client-generated temporary ids
/// and server-assigned ids alike).
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9]{4,24}").expect("Invalid regex")
}

/// Strategy for generating entity type names.
pub fn entity_type_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating task operations.
pub fn task_op_strategy() -> impl Strategy<Value = TaskOp> {
    prop_oneof![
        Just(TaskOp::Create),
        Just(TaskOp::Update),
        Just(TaskOp::Replace),
        Just(TaskOp::Delete),
    ]
}

/// Strategy for generating flat JSON entity payloads with an id field.
pub fn payload_strategy() -> impl Strategy<Value = serde_json::Value> {
    (
        entity_id_strategy(),
        prop::collection::btree_map(
            prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
            prop::string::string_regex("[a-zA-Z0-9 ]{0,16}").expect("Invalid regex"),
            0..5,
        ),
    )
        .prop_map(|(id, fields)| {
            let mut map = serde_json::Map::new();
            map.insert("id".into(), serde_json::Value::String(id));
            for (k, v) in fields {
                map.insert(k, serde_json::Value::String(v));
            }
            serde_json::Value::Object(map)
        })
}

/// Strategy for generating retry configurations with sane bounds.
pub fn retry_config_strategy() -> impl Strategy<Value = RetryConfig> {
    (1u32..10, 1u64..5000, 1u64..120).prop_map(|(attempts, initial_ms, max_secs)| {
        RetryConfig::new(attempts)
            .with_initial_delay(std::time::Duration::from_millis(initial_ms))
            .with_max_delay(std::time::Duration::from_secs(max_secs))
            .without_jitter()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::DependencyGraph;

    proptest! {
        #[test]
        fn retry_delays_are_monotone_and_bounded(config in retry_config_strategy()) {
            let mut previous = std::time::Duration::ZERO;
            for attempt in 0..20u32 {
                let delay = config.delay_for_attempt(attempt);
                prop_assert!(delay >= previous);
                prop_assert!(delay <= config.max_delay.max(config.initial_delay));
                previous = delay;
            }
        }

        #[test]
        fn first_retry_delay_is_initial(config in retry_config_strategy()) {
            let expected = config.initial_delay.min(config.max_delay);
            prop_assert_eq!(config.delay_for_attempt(0), expected);
        }

        #[test]
        fn jitter_stays_above_floor(initial_ms in 1u64..2000) {
            let config = RetryConfig::new(5)
                .with_initial_delay(std::time::Duration::from_millis(initial_ms));
            for attempt in 0..10u32 {
                prop_assert!(config.delay_for_attempt(attempt) >= config.floor_for_attempt(attempt));
            }
        }

        #[test]
        fn registered_children_sit_above_parents(
            parents in prop::collection::hash_set("[a-d]", 1..4),
            child in "[e-h]",
        ) {
            let mut graph = DependencyGraph::new();
            for parent in &parents {
                graph.register(child.clone(), format!("{parent}_id"), parent.clone()).unwrap();
            }
            for parent in &parents {
                prop_assert!(graph.level(&child) > graph.level(parent));
            }
        }

        #[test]
        fn payloads_always_carry_an_id(payload in payload_strategy()) {
            prop_assert!(payload.get("id").and_then(|v| v.as_str()).is_some());
        }
    }
}
