//! Output views over the balance map: top-K snapshots and the weekly table.

use serde::{Deserialize, Serialize};
use tb_core::{Amount, BalanceMap, EntityId};

pub mod table;

pub use table::{Column, OutputTable, TableWriter};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopKConfig {
    pub k: usize,
    /// Keep the entity id next to each value.
    pub with_ids: bool,
}

impl Default for TopKConfig {
    fn default() -> Self {
        Self {
            k: 10_000,
            with_ids: false,
        }
    }
}

impl TopKConfig {
    pub fn extract(&self, balances: &BalanceMap) -> TopK {
        top_k(balances, self.k, self.with_ids)
    }
}

/// Largest balances in descending order. `ids`, when present, is aligned with `values`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopK {
    pub values: Vec<Amount>,
    pub ids: Option<Vec<EntityId>>,
}

impl TopK {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The `k` largest non-zero balances, value descending.
///
/// Equal values come out in an implementation-defined order. Today that is
/// ascending entity id, which keeps output reproducible between processes, but
/// callers should not rely on it. The map is only read.
pub fn top_k(balances: &BalanceMap, k: usize, with_ids: bool) -> TopK {
    if k == 0 {
        return TopK {
            values: Vec::new(),
            ids: with_ids.then(Vec::new),
        };
    }

    let mut ranked: Vec<(&str, Amount)> = balances
        .iter()
        .filter(|(_, amount)| **amount != 0)
        .map(|(entity, amount)| (entity.as_str(), *amount))
        .collect();
    let order = |a: &(&str, Amount), b: &(&str, Amount)| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0));
    if ranked.len() > k {
        ranked.select_nth_unstable_by(k - 1, order);
        ranked.truncate(k);
    }
    ranked.sort_unstable_by(order);

    TopK {
        values: ranked.iter().map(|(_, amount)| *amount).collect(),
        ids: with_ids.then(|| ranked.iter().map(|(entity, _)| entity.to_string()).collect()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(entries: &[(&str, i128)]) -> BalanceMap {
        entries.iter().map(|(e, a)| (e.to_string(), *a)).collect()
    }

    #[test]
    fn returns_largest_values_descending() {
        let balances = map(&[("A", 70), ("B", 50), ("C", 90), ("D", -5)]);
        assert_eq!(top_k(&balances, 2, false).values, [90, 70]);
        assert_eq!(top_k(&balances, 10, false).values, [90, 70, 50, -5]);
    }

    #[test]
    fn skips_zero_balances() {
        let balances = map(&[("A", 0), ("B", 3), ("C", 0)]);
        let top = top_k(&balances, 5, true);
        assert_eq!(top.values, [3]);
        assert_eq!(top.ids.unwrap(), ["B"]);
    }

    #[test]
    fn ids_align_with_values() {
        let balances = map(&[("A", 70), ("B", 50), ("C", 90)]);
        let top = top_k(&balances, 2, true);
        assert_eq!(top.values, [90, 70]);
        assert_eq!(top.ids.unwrap(), ["C", "A"]);
        assert!(top_k(&balances, 2, false).ids.is_none());
    }

    #[test]
    fn ties_have_a_stable_order() {
        let balances = map(&[("B", 5), ("A", 5), ("C", 5), ("D", 1)]);
        let first = top_k(&balances, 3, true);
        let second = top_k(&balances, 3, true);
        assert_eq!(first, second);
        assert_eq!(first.values, [5, 5, 5]);
    }

    #[test]
    fn zero_k_is_empty() {
        let balances = map(&[("A", 1)]);
        assert!(top_k(&balances, 0, false).is_empty());
    }

    #[test]
    fn selection_matches_a_full_sort() {
        let balances: BalanceMap = (0..500)
            .map(|i| (format!("E{i}"), ((i * 7919) % 1013) as i128 - 300))
            .collect();
        let mut all: Vec<i128> = balances.iter().map(|(_, a)| *a).filter(|a| *a != 0).collect();
        all.sort_unstable_by(|a, b| b.cmp(a));
        all.truncate(37);
        assert_eq!(top_k(&balances, 37, false).values, all);
    }
}
