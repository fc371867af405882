use std::collections::hash_map;
use std::collections::HashMap;
use std::fmt;

use serde::de::{Error as _, MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Amount, EntityId};

/// Running cumulative balance per entity.
///
/// An entity is inserted with balance zero the first time it is touched. Entries
/// may sit at zero until [`BalanceMap::retain_non_zero`] is called; a removed key
/// simply starts again from zero on its next addition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BalanceMap {
    entries: HashMap<EntityId, Amount>,
}

impl BalanceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, entity: EntityId, amount: Amount) {
        *self.entries.entry(entity).or_insert(0) += amount;
    }

    pub fn get(&self, entity: &str) -> Option<Amount> {
        self.entries.get(entity).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn non_zero_len(&self) -> usize {
        self.entries.values().filter(|v| **v != 0).count()
    }

    pub fn iter(&self) -> hash_map::Iter<'_, EntityId, Amount> {
        self.entries.iter()
    }

    /// Drops zero-balance entries and returns how many were removed.
    pub fn retain_non_zero(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, v| *v != 0);
        self.entries.shrink_to_fit();
        before - self.entries.len()
    }
}

impl FromIterator<(EntityId, Amount)> for BalanceMap {
    fn from_iter<I: IntoIterator<Item = (EntityId, Amount)>>(iter: I) -> Self {
        let mut map = BalanceMap::new();
        for (entity, amount) in iter {
            map.add(entity, amount);
        }
        map
    }
}

// Amounts are written as decimal strings so wei-sized values survive tools
// that read JSON numbers as f64.
impl Serialize for BalanceMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            self.entries
                .iter()
                .map(|(entity, amount)| (entity, amount.to_string())),
        )
    }
}

impl<'de> Deserialize<'de> for BalanceMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_map(BalanceMapVisitor)
    }
}

struct BalanceMapVisitor;

impl<'de> Visitor<'de> for BalanceMapVisitor {
    type Value = BalanceMap;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a map of entity ids to decimal amount strings")
    }

    fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
        let mut entries = HashMap::with_capacity(access.size_hint().unwrap_or(0));
        while let Some((entity, text)) = access.next_entry::<EntityId, String>()? {
            let amount = text
                .parse::<Amount>()
                .map_err(|_| A::Error::custom(format!("invalid amount {text:?} for {entity}")))?;
            entries.insert(entity, amount);
        }
        Ok(BalanceMap { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_defaults_unseen_entities_to_zero() {
        let mut map = BalanceMap::new();
        map.add("A".into(), 100);
        map.add("B".into(), 50);
        map.add("A".into(), -30);
        assert_eq!(map.get("A"), Some(70));
        assert_eq!(map.get("B"), Some(50));
        assert_eq!(map.get("C"), None);
    }

    #[test]
    fn retain_non_zero_reports_removed_entries() {
        let mut map: BalanceMap = [("A".to_string(), 5), ("B".to_string(), 0), ("C".to_string(), 0)]
            .into_iter()
            .collect();
        assert_eq!(map.non_zero_len(), 1);
        assert_eq!(map.retain_non_zero(), 2);
        assert_eq!(map.len(), 1);

        map.add("B".into(), 3);
        assert_eq!(map.get("B"), Some(3));
    }

    #[test]
    fn serializes_amounts_as_strings() {
        let mut map = BalanceMap::new();
        map.add("whale".into(), 120_000_000_000_000_000_000_000_000);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"whale":"120000000000000000000000000"}"#);
        let back: BalanceMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn rejects_non_numeric_amounts() {
        let err = serde_json::from_str::<BalanceMap>(r#"{"a":"ten"}"#).unwrap_err();
        assert!(err.to_string().contains("invalid amount"));
    }
}
