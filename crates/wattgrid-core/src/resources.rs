//! Resource descriptors: what a request needs from each node it lands on.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::CoreResult;
use crate::expr::{Expr, ExprError, Value};

/// One constraint expression, kept alongside its source text.
///
/// A constraint that failed to parse is kept (so it can still be shown and
/// serialized) but never matches any node.
#[derive(Debug, Clone)]
pub struct Constraint {
    source: String,
    parsed: Result<Expr, ExprError>,
}

impl Constraint {
    /// Parse, surfacing syntax errors to the caller.
    pub fn parse(source: &str) -> CoreResult<Self> {
        let parsed = Expr::parse(source)?;
        Ok(Self {
            source: source.trim().to_string(),
            parsed: Ok(parsed),
        })
    }

    /// Parse, keeping a malformed expression as a never-matching one.
    pub fn lenient(source: &str) -> Self {
        Self {
            source: source.trim().to_string(),
            parsed: Expr::parse(source),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn error(&self) -> Option<&ExprError> {
        self.parsed.as_ref().err()
    }

    /// Evaluation errors and non-boolean results count as "no match".
    pub fn matches(&self, attributes: &BTreeMap<String, Value>) -> bool {
        match &self.parsed {
            Ok(expr) => expr.eval_bool(attributes).unwrap_or(false),
            Err(_) => false,
        }
    }
}

impl PartialEq for Constraint {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Serialize for Constraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Constraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Ok(Constraint::lenient(&source))
    }
}

/// Capacity a single task needs on a node. Immutable once attached to a
/// request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub slots: Option<f64>,
    pub memory: Option<f64>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

impl ResourceDescriptor {
    pub fn new(slots: Option<f64>, memory: Option<f64>) -> Self {
        Self {
            slots,
            memory,
            constraints: Vec::new(),
        }
    }

    /// Add a constraint, rejecting it if it does not parse.
    pub fn with_constraint(mut self, source: &str) -> CoreResult<Self> {
        self.constraints.push(Constraint::parse(source)?);
        Ok(self)
    }

    /// First constraint that failed to parse, if any.
    pub fn invalid_constraint(&self) -> Option<(&str, &ExprError)> {
        self.constraints
            .iter()
            .find_map(|c| c.error().map(|e| (c.source(), e)))
    }

    /// Slots taken by one allocation (absent means none).
    pub fn slot_amount(&self) -> f64 {
        self.slots.unwrap_or(0.0)
    }

    /// Memory taken by one allocation (absent means none).
    pub fn memory_amount(&self) -> f64 {
        self.memory.unwrap_or(0.0)
    }
}

impl fmt::Display for ResourceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fmt_opt = |v: Option<f64>| v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string());
        write!(f, "{} slots, {} memory", fmt_opt(self.slots), fmt_opt(self.memory))?;
        if !self.constraints.is_empty() {
            let sources: Vec<&str> = self.constraints.iter().map(Constraint::source).collect();
            write!(f, " [{}]", sources.join("; "))?;
        }
        Ok(())
    }
}

fn one() -> u32 {
    1
}

/// A descriptor plus how many copies of it are needed and how densely
/// they may be packed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub resources: ResourceDescriptor,
    #[serde(default = "one")]
    pub task_count: u32,
    #[serde(default = "one")]
    pub max_tasks_per_node: u32,
}

impl ResourceRequirement {
    /// One task on one node.
    pub fn single(resources: ResourceDescriptor) -> Self {
        Self::for_tasks(resources, 1, 1)
    }

    /// One task on each of `nodes` distinct nodes.
    pub fn for_nodes(resources: ResourceDescriptor, nodes: u32) -> Self {
        Self::for_tasks(resources, nodes, 1)
    }

    pub fn for_tasks(resources: ResourceDescriptor, task_count: u32, max_tasks_per_node: u32) -> Self {
        Self {
            resources,
            task_count,
            max_tasks_per_node: max_tasks_per_node.max(1),
        }
    }

    /// Fewest nodes the tasks can be spread over.
    pub fn node_count(&self) -> u32 {
        self.task_count.div_ceil(self.max_tasks_per_node.max(1))
    }
}

impl fmt::Display for ResourceRequirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} tasks (max {}/node) of {}",
            self.task_count, self.max_tasks_per_node, self.resources
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_constraint_rejects_bad_syntax() {
        let res = ResourceDescriptor::new(Some(1.0), None).with_constraint("gpus >=");
        assert!(res.is_err());
    }

    #[test]
    fn lenient_constraint_never_matches() {
        let c = Constraint::lenient("gpus >=");
        assert!(c.error().is_some());
        let mut attrs = BTreeMap::new();
        attrs.insert("gpus".to_string(), Value::Number(4.0));
        assert!(!c.matches(&attrs));
    }

    #[test]
    fn constraints_serialize_as_source_text() {
        let d = ResourceDescriptor::new(Some(2.0), Some(1024.0))
            .with_constraint("arch == 'x86_64'")
            .unwrap();
        let json = serde_json::to_string(&d).unwrap();
        assert!(json.contains("arch == 'x86_64'"));
        let back: ResourceDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
        assert!(back.invalid_constraint().is_none());
    }

    #[test]
    fn node_count_rounds_up() {
        let d = ResourceDescriptor::new(Some(1.0), None);
        assert_eq!(ResourceRequirement::for_tasks(d.clone(), 5, 2).node_count(), 3);
        assert_eq!(ResourceRequirement::for_nodes(d.clone(), 4).node_count(), 4);
        assert_eq!(ResourceRequirement::for_tasks(d, 3, 0).max_tasks_per_node, 1);
    }

    #[test]
    fn missing_amounts_count_as_zero() {
        let d = ResourceDescriptor::new(None, Some(512.0));
        assert_eq!(d.slot_amount(), 0.0);
        assert_eq!(d.memory_amount(), 512.0);
    }
}
