//! Route ledger: the ordered trail of topics an envelope has traversed.

use serde::{Deserialize, Serialize};

/// Step kind recorded for topic hops
pub const TOPIC_STEP: &str = "topic";

/// One traversal step, e.g. `{"type": "topic", "id": "orders.out"}`
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouteStep {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: String,
}

impl RouteStep {
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            kind: TOPIC_STEP.to_string(),
            id: name.into(),
        }
    }

    pub fn is_topic(&self, name: &str) -> bool {
        self.kind == TOPIC_STEP && self.id == name
    }
}

/// Append-only ledger of route steps, oldest first.
///
/// The ledger is an owned value. Cloning an envelope deep-copies its ledger, so
/// copies fanned out to different destinations can never observe each other's
/// appends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteLedger(Vec<RouteStep>);

impl RouteLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_topic(&mut self, topic: &str) {
        self.0.push(RouteStep::topic(topic));
    }

    /// Append `topic` unless it is already the most recent step
    ///
    /// Returns whether a step was appended.
    pub fn push_topic_if_new(&mut self, topic: &str) -> bool {
        if self.ends_with_topic(topic) {
            return false;
        }
        self.push_topic(topic);
        true
    }

    pub fn last(&self) -> Option<&RouteStep> {
        self.0.last()
    }

    pub fn ends_with_topic(&self, topic: &str) -> bool {
        self.last().is_some_and(|step| step.is_topic(topic))
    }

    pub fn contains_topic(&self, topic: &str) -> bool {
        self.0.iter().any(|step| step.is_topic(topic))
    }

    pub fn steps(&self) -> &[RouteStep] {
        &self.0
    }

    /// Topic names in traversal order
    pub fn topics(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|step| step.kind == TOPIC_STEP)
            .map(|step| step.id.as_str())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<RouteStep>> for RouteLedger {
    fn from(steps: Vec<RouteStep>) -> Self {
        Self(steps)
    }
}

impl<'a> FromIterator<&'a str> for RouteLedger {
    fn from_iter<I: IntoIterator<Item = &'a str>>(iter: I) -> Self {
        Self(iter.into_iter().map(RouteStep::topic).collect())
    }
}
