//! Node-selector requirements and matching.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single node-selector requirement.
///
/// Requirements on an ImageSync are combined by conjunction; an empty
/// requirement list matches every node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSelector {
    pub key: String,
    pub operator: Operator,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Selector operators, mirroring label-selector semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Evaluate a conjunction of requirements against a node's labels.
pub fn matches(selectors: &[NodeSelector], labels: &BTreeMap<String, String>) -> bool {
    selectors.iter().all(|s| matches_one(s, labels))
}

fn matches_one(selector: &NodeSelector, labels: &BTreeMap<String, String>) -> bool {
    let value = labels.get(&selector.key);
    match selector.operator {
        Operator::In => value.is_some_and(|v| selector.values.iter().any(|want| want == v)),
        Operator::NotIn => value.is_none_or(|v| !selector.values.iter().any(|want| want == v)),
        Operator::Exists => value.is_some(),
        Operator::DoesNotExist => value.is_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn selector(key: &str, operator: Operator, values: &[&str]) -> NodeSelector {
        NodeSelector {
            key: key.to_string(),
            operator,
            values: values.iter().map(|v| v.to_string()).collect(),
        }
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(matches(&[], &labels(&[])));
        assert!(matches(&[], &labels(&[("zone", "us-east-1a")])));
    }

    #[test]
    fn test_in_operator() {
        let node = labels(&[("zone", "us-east-1a")]);
        assert!(matches(
            &[selector("zone", Operator::In, &["us-east-1a", "us-east-1b"])],
            &node
        ));
        assert!(!matches(
            &[selector("zone", Operator::In, &["us-west-2a"])],
            &node
        ));
        assert!(!matches(
            &[selector("region", Operator::In, &["us-east-1"])],
            &node
        ));
    }

    #[test]
    fn test_not_in_operator() {
        let node = labels(&[("zone", "us-east-1a")]);
        assert!(matches(
            &[selector("zone", Operator::NotIn, &["us-west-2a"])],
            &node
        ));
        assert!(!matches(
            &[selector("zone", Operator::NotIn, &["us-east-1a"])],
            &node
        ));
        // Absent key is not in any value set.
        assert!(matches(
            &[selector("region", Operator::NotIn, &["us-east-1"])],
            &node
        ));
    }

    #[test]
    fn test_exists_operators() {
        let node = labels(&[("gpu", "true")]);
        assert!(matches(&[selector("gpu", Operator::Exists, &[])], &node));
        assert!(!matches(&[selector("tpu", Operator::Exists, &[])], &node));
        assert!(matches(&[selector("tpu", Operator::DoesNotExist, &[])], &node));
        assert!(!matches(&[selector("gpu", Operator::DoesNotExist, &[])], &node));
    }

    #[test]
    fn test_conjunction() {
        let node = labels(&[("zone", "us-east-1a"), ("gpu", "true")]);
        let selectors = [
            selector("zone", Operator::In, &["us-east-1a"]),
            selector("gpu", Operator::Exists, &[]),
        ];
        assert!(matches(&selectors, &node));

        let selectors = [
            selector("zone", Operator::In, &["us-east-1a"]),
            selector("tpu", Operator::Exists, &[]),
        ];
        assert!(!matches(&selectors, &node));
    }

    #[test]
    fn test_operator_serialization() {
        let s = selector("zone", Operator::DoesNotExist, &[]);
        let json = serde_json::to_string(&s).unwrap();
        assert!(json.contains("\"DoesNotExist\""));
        let back: NodeSelector = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
