//! Envelope enrichment
//!
//! Pure transformations applied to an envelope on its way through the
//! connector. Nothing here performs I/O: the current time and the id source
//! are passed in through [`EnrichContext`], so every step is deterministic
//! under test.
//!
//! Order of the steps for one destination:
//!
//! 1. identity defaulting (`id`, `time`)
//! 2. correlation propagation
//! 3. expiry check
//! 4. test-traffic check
//! 5. route append for the topic the envelope is actually sent to

use chrono::{DateTime, Utc};
use event_bus::EventEnvelope;

use crate::context::IdGenerator;

/// Inputs shared by every enrichment pass of one record lifecycle
#[derive(Clone, Copy)]
pub struct EnrichContext<'a> {
    /// Captured once per lifecycle
    pub now: DateTime<Utc>,
    pub ids: &'a dyn IdGenerator,
    /// Where diverted test traffic goes
    pub test_topic: &'a str,
}

/// Result of enriching an envelope for one destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Enriched {
    /// Send to the requested destination
    Deliver { topic: String },
    /// Test traffic; send to the test-observation topic instead
    TestFiltered { topic: String },
    /// Must not reach any normal destination
    Expired,
}

impl Enriched {
    /// Topic the envelope is to be sent to, if any
    pub fn target(&self) -> Option<&str> {
        match self {
            Enriched::Deliver { topic } | Enriched::TestFiltered { topic } => Some(topic),
            Enriched::Expired => None,
        }
    }
}

/// Result of the pre-invocation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validation {
    Valid,
    Expired,
}

/// Fill in a missing id and time
pub fn apply_identity_defaults<T>(envelope: &mut EventEnvelope<T>, ctx: &EnrichContext<'_>) {
    if envelope.id.trim().is_empty() {
        envelope.id = ctx.ids.next_id();
    }
    if envelope.time.is_none() {
        envelope.time = Some(ctx.now);
    }
}

/// Make the envelope its own correlation root unless it already has one
pub fn propagate_correlation<T>(envelope: &mut EventEnvelope<T>) {
    if envelope.correlation_id.is_none() {
        envelope.correlation_id = Some(envelope.id.clone());
    }
}

/// Expired when the expiry lies strictly before `now`
pub fn is_expired<T>(envelope: &EventEnvelope<T>, now: DateTime<Utc>) -> bool {
    envelope.expiry.is_some_and(|expiry| expiry < now)
}

/// Whether a test message must be diverted instead of reaching `destination`
pub fn diverts_before<T>(envelope: &EventEnvelope<T>, destination: &str) -> bool {
    envelope.is_test_message
        && envelope
            .filter_out_before_topic
            .as_deref()
            .is_some_and(|topic| topic == destination)
}

pub fn append_route<T>(envelope: &mut EventEnvelope<T>, topic: &str) {
    envelope.route.push_topic(topic);
}

/// Record the topic the envelope was consumed from
///
/// Skipped when the producer already recorded that topic as the last step.
pub fn record_arrival<T>(envelope: &mut EventEnvelope<T>, topic: &str) -> bool {
    envelope.route.push_topic_if_new(topic)
}

/// Steps 1 to 3, run once before invocation
pub fn validate<T>(envelope: &mut EventEnvelope<T>, ctx: &EnrichContext<'_>) -> Validation {
    apply_identity_defaults(envelope, ctx);
    propagate_correlation(envelope);
    if is_expired(envelope, ctx.now) {
        Validation::Expired
    } else {
        Validation::Valid
    }
}

/// All steps for one destination
///
/// `envelope` must be the destination's private copy: the route step for the
/// actual send target is appended to it.
pub fn enrich<T>(
    envelope: &mut EventEnvelope<T>,
    ctx: &EnrichContext<'_>,
    destination: &str,
) -> Enriched {
    if validate(envelope, ctx) == Validation::Expired {
        return Enriched::Expired;
    }

    let outcome = if diverts_before(envelope, destination) {
        Enriched::TestFiltered {
            topic: ctx.test_topic.to_string(),
        }
    } else {
        Enriched::Deliver {
            topic: destination.to_string(),
        }
    };

    if let Some(target) = outcome.target() {
        append_route(envelope, target);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SequentialIds;
    use chrono::{Duration, TimeZone};
    use event_bus::RouteLedger;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
    }

    fn ctx(ids: &SequentialIds) -> EnrichContext<'_> {
        EnrichContext {
            now: now(),
            ids,
            test_topic: "fn.test",
        }
    }

    fn envelope() -> EventEnvelope {
        EventEnvelope::new("svc", "thing.happened").with_data(json!({"n": 1}))
    }

    #[test]
    fn test_missing_identity_is_generated() {
        let ids = SequentialIds::new("gen");
        let mut env = envelope();

        apply_identity_defaults(&mut env, &ctx(&ids));

        assert_eq!(env.id, "gen-1");
        assert_eq!(env.time, Some(now()));
    }

    #[test]
    fn test_existing_identity_is_kept() {
        let ids = SequentialIds::new("gen");
        let earlier = now() - Duration::hours(1);
        let mut env = envelope().with_id("X").with_time(earlier);

        apply_identity_defaults(&mut env, &ctx(&ids));

        assert_eq!(env.id, "X");
        assert_eq!(env.time, Some(earlier));
    }

    #[test]
    fn test_correlation_defaults_to_generated_id() {
        let ids = SequentialIds::new("gen");
        let mut env = envelope();

        assert_eq!(validate(&mut env, &ctx(&ids)), Validation::Valid);
        assert_eq!(env.correlation_id.as_deref(), Some("gen-1"));
        assert_eq!(env.correlation_id.as_deref(), Some(env.id.as_str()));
    }

    #[test]
    fn test_preset_correlation_survives_repeated_passes() {
        let ids = SequentialIds::new("gen");
        let mut env = envelope().with_id("X").with_correlation_id("C");

        for _ in 0..3 {
            enrich(&mut env, &ctx(&ids), "fn.out");
        }

        assert_eq!(env.correlation_id.as_deref(), Some("C"));
        assert_eq!(env.id, "X");
    }

    #[test]
    fn test_expiry_is_strictly_before_now() {
        let past = envelope().with_expiry(now() - Duration::seconds(1));
        let exact = envelope().with_expiry(now());
        let future = envelope().with_expiry(now() + Duration::seconds(1));

        assert!(is_expired(&past, now()));
        assert!(!is_expired(&exact, now()));
        assert!(!is_expired(&future, now()));
        assert!(!is_expired(&envelope(), now()));
    }

    #[test]
    fn test_expired_envelope_gets_no_route_step() {
        let ids = SequentialIds::new("gen");
        let mut env = envelope().with_expiry(now() - Duration::minutes(5));

        assert_eq!(enrich(&mut env, &ctx(&ids), "fn.out"), Enriched::Expired);
        assert!(env.route.is_empty());
        // identity is still filled in for the error wrapper
        assert_eq!(env.id, "gen-1");
    }

    #[test]
    fn test_delivery_appends_destination() {
        let ids = SequentialIds::new("gen");
        let mut env = envelope().with_route(["t1", "fn.in"].into_iter().collect());

        let outcome = enrich(&mut env, &ctx(&ids), "fn.out");

        assert_eq!(
            outcome,
            Enriched::Deliver {
                topic: "fn.out".to_string()
            }
        );
        assert_eq!(env.route.topics(), vec!["t1", "fn.in", "fn.out"]);
    }

    #[test]
    fn test_test_message_is_diverted_before_its_topic() {
        let ids = SequentialIds::new("gen");
        let mut diverted = envelope().as_test_message("fn.out");
        let mut passing = envelope().as_test_message("fn.out");

        let a = enrich(&mut diverted, &ctx(&ids), "fn.out");
        let b = enrich(&mut passing, &ctx(&ids), "fn.audit");

        assert_eq!(
            a,
            Enriched::TestFiltered {
                topic: "fn.test".to_string()
            }
        );
        assert!(diverted.route.ends_with_topic("fn.test"));
        assert!(!diverted.route.contains_topic("fn.out"));

        assert_eq!(b.target(), Some("fn.audit"));
        assert!(passing.route.ends_with_topic("fn.audit"));
    }

    #[test]
    fn test_filter_topic_without_test_flag_is_ignored() {
        let mut env = envelope();
        env.filter_out_before_topic = Some("fn.out".to_string());

        assert!(!diverts_before(&env, "fn.out"));
    }

    #[test]
    fn test_record_arrival_skips_repeat() {
        let mut fresh = envelope().with_route(RouteLedger::from_iter(["t1"]));
        let mut relayed = envelope().with_route(RouteLedger::from_iter(["t1", "fn.in"]));

        assert!(record_arrival(&mut fresh, "fn.in"));
        assert!(!record_arrival(&mut relayed, "fn.in"));
        assert_eq!(fresh.route, relayed.route);
    }
}
