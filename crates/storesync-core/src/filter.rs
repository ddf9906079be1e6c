//! Domain filters for export selection
//!
//! A small predicate language over record payloads, mirroring the search
//! domains the host system uses to scope exports (for example
//! "active products only", "customers that are active").

use serde::{Deserialize, Serialize};

/// A predicate over a local record payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DomainFilter {
    /// Matches every record.
    All,

    /// Matches records whose payload field equals the given value.
    Field {
        field: String,
        value: serde_json::Value,
    },

    /// Matches records satisfying every inner filter.
    And(Vec<DomainFilter>),
}

impl DomainFilter {
    /// Equality filter on a payload field.
    pub fn field(field: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        DomainFilter::Field {
            field: field.into(),
            value: value.into(),
        }
    }

    /// Conjunction of filters.
    #[must_use]
    pub fn and(filters: Vec<DomainFilter>) -> Self {
        DomainFilter::And(filters)
    }

    /// Evaluate the filter against a record payload.
    #[must_use]
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        match self {
            DomainFilter::All => true,
            DomainFilter::Field { field, value } => payload.get(field) == Some(value),
            DomainFilter::And(filters) => filters.iter().all(|f| f.matches(payload)),
        }
    }
}

impl Default for DomainFilter {
    fn default() -> Self {
        DomainFilter::All
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_all_matches_everything() {
        assert!(DomainFilter::All.matches(&json!({})));
        assert!(DomainFilter::All.matches(&json!({"active": false})));
    }

    #[test]
    fn test_field_equality() {
        let filter = DomainFilter::field("active", true);
        assert!(filter.matches(&json!({"active": true, "sku": "A"})));
        assert!(!filter.matches(&json!({"active": false})));
        assert!(!filter.matches(&json!({})));
    }

    #[test]
    fn test_and_requires_all() {
        let filter = DomainFilter::and(vec![
            DomainFilter::field("active", true),
            DomainFilter::field("customer", true),
        ]);
        assert!(filter.matches(&json!({"active": true, "customer": true})));
        assert!(!filter.matches(&json!({"active": true, "customer": false})));
    }

    #[test]
    fn test_empty_and_matches() {
        assert!(DomainFilter::And(Vec::new()).matches(&json!({})));
    }

    #[test]
    fn test_serde_roundtrip() {
        let filter = DomainFilter::and(vec![DomainFilter::field("active", true)]);
        let json = serde_json::to_string(&filter).unwrap();
        let back: DomainFilter = serde_json::from_str(&json).unwrap();
        assert_eq!(filter, back);
    }
}
