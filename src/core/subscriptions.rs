//! Pattern-based event subscriptions.
//!
//! Subscriptions are consulted only at publish time to compute the
//! subscriber set stamped on the event; they never mutate events and
//! there is no push delivery. Patterns are typed rather than ad hoc
//! string globs: exact, prefix, suffix, or universal.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A typed action pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPattern {
    /// Matches one action name exactly
    Exact(String),

    /// `foo*`: matches actions starting with the stem
    Prefix(String),

    /// `*foo`: matches actions ending with the stem
    Suffix(String),

    /// `*`: matches every action
    Universal,
}

impl ActionPattern {
    /// Parse the wire form: `*`, `stem*`, `*stem`, or an exact name.
    pub fn parse(s: &str) -> Self {
        if s == "*" {
            Self::Universal
        } else if let Some(stem) = s.strip_suffix('*') {
            Self::Prefix(stem.to_string())
        } else if let Some(stem) = s.strip_prefix('*') {
            Self::Suffix(stem.to_string())
        } else {
            Self::Exact(s.to_string())
        }
    }

    pub fn matches(&self, action: &str) -> bool {
        match self {
            Self::Exact(name) => action == name,
            Self::Prefix(stem) => action.starts_with(stem.as_str()),
            Self::Suffix(stem) => action.ends_with(stem.as_str()),
            Self::Universal => true,
        }
    }
}

impl fmt::Display for ActionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(name) => write!(f, "{}", name),
            Self::Prefix(stem) => write!(f, "{}*", stem),
            Self::Suffix(stem) => write!(f, "*{}", stem),
            Self::Universal => write!(f, "*"),
        }
    }
}

/// One agent's interest in a class of actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    /// Subscribing agent name
    pub agent: String,

    /// Which actions the agent wants to see
    pub pattern: ActionPattern,

    /// Higher priority sorts earlier in the computed subscriber list
    #[serde(default)]
    pub priority: i32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Subscription {
    pub fn new(agent: &str, pattern: &str) -> Self {
        Self {
            agent: agent.to_string(),
            pattern: ActionPattern::parse(pattern),
            priority: 0,
            enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// The set of registered subscriptions.
#[derive(Debug, Default)]
pub struct SubscriptionTable {
    subs: Vec<Subscription>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, sub: Subscription) {
        self.subs.push(sub);
    }

    /// Remove every subscription for `agent` matching `pattern`.
    pub fn remove(&mut self, agent: &str, pattern: &ActionPattern) {
        self.subs
            .retain(|s| !(s.agent == agent && &s.pattern == pattern));
    }

    pub fn set_enabled(&mut self, agent: &str, enabled: bool) {
        for sub in self.subs.iter_mut().filter(|s| s.agent == agent) {
            sub.enabled = enabled;
        }
    }

    /// Union of enabled subscribers matching `action`, priority order,
    /// each agent listed once.
    pub fn subscribers_for(&self, action: &str) -> Vec<String> {
        let mut matched: Vec<&Subscription> = self
            .subs
            .iter()
            .filter(|s| s.enabled && s.pattern.matches(action))
            .collect();
        matched.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.agent.cmp(&b.agent)));

        let mut agents = Vec::new();
        for sub in matched {
            if !agents.contains(&sub.agent) {
                agents.push(sub.agent.clone());
            }
        }
        agents
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_parsing() {
        assert_eq!(ActionPattern::parse("*"), ActionPattern::Universal);
        assert_eq!(
            ActionPattern::parse("chain_*"),
            ActionPattern::Prefix("chain_".to_string())
        );
        assert_eq!(
            ActionPattern::parse("*_failed"),
            ActionPattern::Suffix("_failed".to_string())
        );
        assert_eq!(
            ActionPattern::parse("backup_completed"),
            ActionPattern::Exact("backup_completed".to_string())
        );
    }

    #[test]
    fn test_pattern_matching() {
        assert!(ActionPattern::parse("chain_*").matches("chain_started"));
        assert!(!ActionPattern::parse("chain_*").matches("step_started"));
        assert!(ActionPattern::parse("*_failed").matches("step_failed"));
        assert!(ActionPattern::parse("*").matches("anything"));
        assert!(ActionPattern::parse("quote").matches("quote"));
        assert!(!ActionPattern::parse("quote").matches("quotes"));
    }

    #[test]
    fn test_pattern_display_round_trip() {
        for raw in ["*", "chain_*", "*_failed", "quote"] {
            let pattern = ActionPattern::parse(raw);
            assert_eq!(ActionPattern::parse(&pattern.to_string()), pattern);
        }
    }

    #[test]
    fn test_subscriber_computation() {
        let mut table = SubscriptionTable::new();
        table.add(Subscription::new("auditor", "*").with_priority(10));
        table.add(Subscription::new("alerter", "*_failed"));
        table.add(Subscription::new("dashboard", "chain_*"));

        let subs = table.subscribers_for("chain_failed");
        assert_eq!(subs, vec!["auditor", "alerter", "dashboard"]);

        let subs = table.subscribers_for("quote");
        assert_eq!(subs, vec!["auditor"]);
    }

    #[test]
    fn test_disabled_subscriptions_skipped() {
        let mut table = SubscriptionTable::new();
        table.add(Subscription::new("auditor", "*"));
        table.set_enabled("auditor", false);

        assert!(table.subscribers_for("anything").is_empty());
    }

    #[test]
    fn test_duplicate_agent_listed_once() {
        let mut table = SubscriptionTable::new();
        table.add(Subscription::new("auditor", "*"));
        table.add(Subscription::new("auditor", "chain_*"));

        assert_eq!(table.subscribers_for("chain_started"), vec!["auditor"]);
    }

    #[test]
    fn test_remove_subscription() {
        let mut table = SubscriptionTable::new();
        table.add(Subscription::new("auditor", "*"));
        table.remove("auditor", &ActionPattern::Universal);
        assert!(table.is_empty());
    }
}
