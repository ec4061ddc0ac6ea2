//! Flag and segment payloads.
//!
//! Only the fields the synchronization core needs are modelled explicitly:
//! the identity, version and deletion marker of every item, and for flags the
//! prerequisite keys and segment-match clauses that produce dependency edges.
//! Everything else is carried through untouched in `attributes` so that an
//! item read from the store serializes back to the JSON it arrived as.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Clause operator that references segments by key.
pub const SEGMENT_MATCH_OP: &str = "segmentMatch";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(default)]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub rules: Vec<FlagRule>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl FeatureFlag {
    pub fn new<K: Into<String>>(key: K, version: i64) -> Self {
        FeatureFlag {
            key: key.into(),
            version,
            deleted: false,
            prerequisites: Vec::new(),
            rules: Vec::new(),
            attributes: Map::new(),
        }
    }

    /// Keys of every segment referenced by a segment-match clause.
    pub fn referenced_segments(&self) -> impl Iterator<Item = &str> {
        self.rules
            .iter()
            .flat_map(|rule| rule.clauses.iter())
            .filter(|clause| clause.is_segment_match())
            .flat_map(|clause| clause.values.iter().filter_map(Value::as_str))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prerequisite {
    pub key: String,
    #[serde(default)]
    pub variation: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FlagRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    pub op: String,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Clause {
    pub fn segment_match<I, S>(segment_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Clause {
            attribute: String::new(),
            op: SEGMENT_MATCH_OP.to_string(),
            values: segment_keys
                .into_iter()
                .map(|k| Value::String(k.into()))
                .collect(),
            negate: false,
            attributes: Map::new(),
        }
    }

    pub fn is_segment_match(&self) -> bool {
        self.op == SEGMENT_MATCH_OP
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    #[serde(flatten)]
    pub attributes: Map<String, Value>,
}

impl Segment {
    pub fn new<K: Into<String>>(key: K, version: i64) -> Self {
        Segment {
            key: key.into(),
            version,
            deleted: false,
            attributes: Map::new(),
        }
    }
}

/// A live (non-deleted) configuration item.
#[derive(Clone, Debug, PartialEq)]
pub enum StoreItem {
    Flag(FeatureFlag),
    Segment(Segment),
}

impl StoreItem {
    pub fn key(&self) -> &str {
        match self {
            StoreItem::Flag(flag) => &flag.key,
            StoreItem::Segment(segment) => &segment.key,
        }
    }

    pub fn as_flag(&self) -> Option<&FeatureFlag> {
        match self {
            StoreItem::Flag(flag) => Some(flag),
            StoreItem::Segment(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_keeps_unknown_fields() {
        let json = serde_json::json!({
            "key": "f1",
            "version": 3,
            "on": true,
            "variations": [true, false],
            "prerequisites": [{"key": "f0", "variation": 1}],
            "rules": [{
                "id": "r1",
                "clauses": [{"attribute": "key", "op": "segmentMatch", "values": ["s1", 7]}]
            }]
        });
        let flag: FeatureFlag = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(flag.version, 3);
        assert_eq!(flag.prerequisites[0].key, "f0");
        assert_eq!(flag.referenced_segments().collect::<Vec<_>>(), vec!["s1"]);

        let back = serde_json::to_value(&flag).unwrap();
        assert_eq!(back["on"], json["on"]);
        assert_eq!(back["variations"], json["variations"]);
        assert_eq!(back["rules"][0]["id"], "r1");
        assert!(back.get("deleted").is_none());
    }

    #[test]
    fn test_non_segment_clauses_are_ignored() {
        let mut flag = FeatureFlag::new("f1", 1);
        flag.rules.push(FlagRule {
            clauses: vec![Clause {
                attribute: "email".into(),
                op: "in".into(),
                values: vec![Value::String("s1".into())],
                negate: false,
                attributes: Map::new(),
            }],
            attributes: Map::new(),
        });
        assert_eq!(flag.referenced_segments().count(), 0);
    }
}
