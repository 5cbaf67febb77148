//! Per-client state projection.
//!
//! A `ProjectionTable` is a declarative mapping from canonical-state paths to
//! included/excluded, evaluated as a pure function against a canonical
//! snapshot. It replaces runtime proxy/trap machinery with an explicit rule
//! walk: the most specific (longest) matching rule governs a subtree, later
//! declarations win ties, and unmatched paths are excluded.
//!
//! Patterns are key sequences where `"*"` matches any object key, the
//! "included as wildcard for all keys" form. Arrays are carried wholesale by
//! whichever decision governs them; rules do not descend into array elements.

use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternSegment {
    Key(String),
    AnyKey,
}

impl From<&str> for PatternSegment {
    fn from(segment: &str) -> Self {
        if segment == "*" {
            PatternSegment::AnyKey
        } else {
            PatternSegment::Key(segment.to_string())
        }
    }
}

impl From<String> for PatternSegment {
    fn from(segment: String) -> Self {
        PatternSegment::from(segment.as_str())
    }
}

impl PatternSegment {
    fn matches(&self, key: &str) -> bool {
        match self {
            PatternSegment::Key(name) => name == key,
            PatternSegment::AnyKey => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleAction {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
struct ProjectionRule {
    pattern: Vec<PatternSegment>,
    action: RuleAction,
}

/// Declarative projection of canonical state for one client.
#[derive(Debug, Clone, Default)]
pub struct ProjectionTable {
    rules: Vec<ProjectionRule>,
}

impl ProjectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The identity projection: the client sees the whole canonical state.
    pub fn include_all() -> Self {
        Self::new().include(Vec::<&str>::new())
    }

    pub fn include<I>(mut self, pattern: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PatternSegment>,
    {
        self.rules.push(ProjectionRule {
            pattern: pattern.into_iter().map(Into::into).collect(),
            action: RuleAction::Include,
        });
        self
    }

    pub fn exclude<I>(mut self, pattern: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<PatternSegment>,
    {
        self.rules.push(ProjectionRule {
            pattern: pattern.into_iter().map(Into::into).collect(),
            action: RuleAction::Exclude,
        });
        self
    }

    /// Computes the client's view of `state`. Pure and total: re-running on an
    /// unchanged snapshot yields a structurally equal value, and exclusion is
    /// expressed as absence, never as an error.
    pub fn project(&self, state: &Value) -> Value {
        let active: Vec<(&ProjectionRule, usize)> =
            self.rules.iter().map(|rule| (rule, 0)).collect();
        self.project_node(state, RuleAction::Exclude, &active)
            .unwrap_or_else(|| Value::Object(Map::new()))
    }

    fn project_node(
        &self,
        node: &Value,
        inherited: RuleAction,
        active: &[(&ProjectionRule, usize)],
    ) -> Option<Value> {
        // Rules whose pattern ends exactly here override the inherited
        // decision; iteration order makes later declarations win.
        let mut decision = inherited;
        for (rule, position) in active {
            if *position == rule.pattern.len() {
                decision = rule.action;
            }
        }

        let descending: Vec<(&ProjectionRule, usize)> = active
            .iter()
            .filter(|(rule, position)| *position < rule.pattern.len())
            .map(|(rule, position)| (*rule, *position))
            .collect();

        let Value::Object(map) = node else {
            return match decision {
                RuleAction::Include => Some(node.clone()),
                RuleAction::Exclude => None,
            };
        };

        if descending.is_empty() {
            return match decision {
                RuleAction::Include => Some(node.clone()),
                RuleAction::Exclude => None,
            };
        }

        let mut projected = Map::new();
        for (key, child) in map {
            let child_active: Vec<(&ProjectionRule, usize)> = descending
                .iter()
                .filter(|(rule, position)| rule.pattern[*position].matches(key))
                .map(|(rule, position)| (*rule, position + 1))
                .collect();

            if let Some(value) = self.project_node(child, decision, &child_active) {
                projected.insert(key.clone(), value);
            }
        }

        if projected.is_empty() && decision == RuleAction::Exclude {
            None
        } else {
            Some(Value::Object(projected))
        }
    }
}
