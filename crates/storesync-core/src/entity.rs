//! Synchronized entity kinds
//!
//! The closed set of record categories the engine reconciles, each carrying
//! its own matching and validation policy. Job priority encodes dependency
//! order so that referential prerequisites are exported/imported before
//! their dependents (categories before products, customers before orders).

use serde::{Deserialize, Serialize};

/// A category of synchronized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// Product category.
    Category,

    /// Product.
    Product,

    /// Customer.
    Customer,

    /// Sale order.
    Order,
}

impl EntityKind {
    /// All kinds in dependency order (lowest priority first).
    pub const ALL: [EntityKind; 4] = [
        EntityKind::Category,
        EntityKind::Product,
        EntityKind::Customer,
        EntityKind::Order,
    ];

    /// Convert to string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Category => "category",
            EntityKind::Product => "product",
            EntityKind::Customer => "customer",
            EntityKind::Order => "order",
        }
    }

    /// Job priority for this kind, lowest runs first.
    ///
    /// The ordering is advisory for throughput; dependent-entity handlers
    /// must still tolerate a missing prerequisite.
    #[must_use]
    pub fn priority(&self) -> i64 {
        match self {
            EntityKind::Category => 1,
            EntityKind::Product => 2,
            EntityKind::Customer => 3,
            EntityKind::Order => 4,
        }
    }

    /// The payload field used as the cross-system business key.
    #[must_use]
    pub fn business_key_field(&self) -> &'static str {
        match self {
            EntityKind::Category => "slug",
            EntityKind::Product => "sku",
            EntityKind::Customer => "email",
            EntityKind::Order => "number",
        }
    }

    /// Extract the business key from a payload, if present and non-empty.
    #[must_use]
    pub fn business_key(&self, payload: &serde_json::Value) -> Option<String> {
        let value = payload.get(self.business_key_field())?;
        let key = match value {
            serde_json::Value::String(s) => s.trim().to_string(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };
        if key.is_empty() {
            None
        } else {
            Some(key)
        }
    }

    /// Payload fields a remote record of this kind must carry.
    #[must_use]
    pub fn required_fields(&self) -> &'static [&'static str] {
        match self {
            EntityKind::Category => &["name"],
            EntityKind::Product => &["name", "sku"],
            EntityKind::Customer => &["email"],
            EntityKind::Order => &["number"],
        }
    }

    /// Validate an inbound payload against this kind's policy.
    ///
    /// Returns the name of the first missing required field.
    pub fn validate(&self, payload: &serde_json::Value) -> Result<(), &'static str> {
        for field in self.required_fields() {
            match payload.get(field) {
                Some(serde_json::Value::Null) | None => return Err(field),
                Some(serde_json::Value::String(s)) if s.trim().is_empty() => return Err(field),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "category" => Ok(EntityKind::Category),
            "product" => Ok(EntityKind::Product),
            "customer" => Ok(EntityKind::Customer),
            "order" => Ok(EntityKind::Order),
            _ => Err(format!("Unknown entity kind: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_roundtrip() {
        for kind in EntityKind::ALL {
            let parsed: EntityKind = kind.as_str().parse().unwrap();
            assert_eq!(kind, parsed);
        }
    }

    #[test]
    fn test_priority_encodes_dependency_order() {
        assert!(EntityKind::Category.priority() < EntityKind::Product.priority());
        assert!(EntityKind::Product.priority() < EntityKind::Customer.priority());
        assert!(EntityKind::Customer.priority() < EntityKind::Order.priority());
    }

    #[test]
    fn test_all_is_sorted_by_priority() {
        let priorities: Vec<i64> = EntityKind::ALL.iter().map(EntityKind::priority).collect();
        let mut sorted = priorities.clone();
        sorted.sort_unstable();
        assert_eq!(priorities, sorted);
    }

    #[test]
    fn test_business_key_extraction() {
        let payload = json!({"sku": "WIDGET-1", "name": "Widget"});
        assert_eq!(
            EntityKind::Product.business_key(&payload),
            Some("WIDGET-1".to_string())
        );
        assert_eq!(EntityKind::Customer.business_key(&payload), None);
    }

    #[test]
    fn test_business_key_accepts_numbers() {
        let payload = json!({"number": 1042});
        assert_eq!(
            EntityKind::Order.business_key(&payload),
            Some("1042".to_string())
        );
    }

    #[test]
    fn test_business_key_rejects_blank() {
        let payload = json!({"email": "   "});
        assert_eq!(EntityKind::Customer.business_key(&payload), None);
    }

    #[test]
    fn test_validate_missing_field() {
        let payload = json!({"name": "Widget"});
        assert_eq!(EntityKind::Product.validate(&payload), Err("sku"));
        assert!(EntityKind::Category.validate(&payload).is_ok());
    }

    #[test]
    fn test_validate_null_and_blank_count_as_missing() {
        assert_eq!(
            EntityKind::Customer.validate(&json!({"email": null})),
            Err("email")
        );
        assert_eq!(
            EntityKind::Customer.validate(&json!({"email": ""})),
            Err("email")
        );
    }
}
