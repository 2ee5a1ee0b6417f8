//! Doubly-linked list of vault ids kept in descending nominal-ratio order.
//!
//! Callers pass (prev, next) hints obtained off-core; a correct hint makes
//! insertion O(1), a wrong one degrades to a walk from the nearest usable
//! anchor. Equal ratios keep insertion order: a new entry lands after every
//! existing entry with the same ratio.

use crate::numeric::Ratio;
use crate::vault::VaultId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct Node {
    prev: Option<VaultId>,
    next: Option<VaultId>,
    nicr: Ratio,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortedVaults {
    head: Option<VaultId>,
    tail: Option<VaultId>,
    nodes: BTreeMap<VaultId, Node>,
}

impl SortedVaults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: VaultId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Highest nominal ratio.
    pub fn first(&self) -> Option<VaultId> {
        self.head
    }

    /// Lowest nominal ratio, the weakest position.
    pub fn last(&self) -> Option<VaultId> {
        self.tail
    }

    /// Neighbor toward the tail (lower ratio).
    pub fn next(&self, id: VaultId) -> Option<VaultId> {
        self.nodes.get(&id).and_then(|n| n.next)
    }

    /// Neighbor toward the head (higher ratio).
    pub fn prev(&self, id: VaultId) -> Option<VaultId> {
        self.nodes.get(&id).and_then(|n| n.prev)
    }

    pub fn nicr_of(&self, id: VaultId) -> Option<Ratio> {
        self.nodes.get(&id).map(|n| n.nicr)
    }

    pub fn iter(&self) -> impl Iterator<Item = VaultId> + '_ {
        std::iter::successors(self.head, move |id| self.next(*id))
    }

    pub fn insert(
        &mut self,
        id: VaultId,
        nicr: Ratio,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    ) {
        assert!(!self.contains(id), "vault {} is already in the sorted list", id);
        assert!(!nicr.is_zero(), "vault {} has a zero nominal ratio", id);
        let (prev, next) = self.find_insert_position(nicr, prev_hint, next_hint);
        self.nodes.insert(id, Node { prev, next, nicr });
        match prev {
            Some(p) => self.nodes.get_mut(&p).unwrap().next = Some(id),
            None => self.head = Some(id),
        }
        match next {
            Some(n) => self.nodes.get_mut(&n).unwrap().prev = Some(id),
            None => self.tail = Some(id),
        }
    }

    pub fn remove(&mut self, id: VaultId) {
        let Some(node) = self.nodes.remove(&id) else {
            panic!("vault {} is not in the sorted list", id);
        };
        match node.prev {
            Some(p) => self.nodes.get_mut(&p).unwrap().next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(n) => self.nodes.get_mut(&n).unwrap().prev = node.prev,
            None => self.tail = node.prev,
        }
    }

    pub fn reinsert(
        &mut self,
        id: VaultId,
        new_nicr: Ratio,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    ) {
        self.remove(id);
        self.insert(id, new_nicr, prev_hint, next_hint);
    }

    /// A position (prev, next) admits `nicr` when prev and next are adjacent
    /// and `nicr(prev) >= nicr > nicr(next)`. The strict right-hand
    /// comparison is what pushes equal ratios after their elders.
    fn valid_insert_position(
        &self,
        nicr: Ratio,
        prev: Option<VaultId>,
        next: Option<VaultId>,
    ) -> bool {
        match (prev, next) {
            (None, None) => self.is_empty(),
            (None, Some(n)) => self.head == Some(n) && nicr > self.nodes[&n].nicr,
            (Some(p), None) => self.tail == Some(p) && nicr <= self.nodes[&p].nicr,
            (Some(p), Some(n)) => {
                self.nodes[&p].next == Some(n)
                    && self.nodes[&p].nicr >= nicr
                    && nicr > self.nodes[&n].nicr
            }
        }
    }

    fn descend(&self, nicr: Ratio, start: VaultId) -> (Option<VaultId>, Option<VaultId>) {
        if self.head == Some(start) && nicr > self.nodes[&start].nicr {
            return (None, self.head);
        }
        let mut prev = Some(start);
        let mut next = self.nodes[&start].next;
        while prev.is_some() && !self.valid_insert_position(nicr, prev, next) {
            prev = next;
            next = prev.and_then(|id| self.nodes[&id].next);
        }
        (prev, next)
    }

    fn ascend(&self, nicr: Ratio, start: VaultId) -> (Option<VaultId>, Option<VaultId>) {
        if self.tail == Some(start) && nicr <= self.nodes[&start].nicr {
            return (self.tail, None);
        }
        let mut next = Some(start);
        let mut prev = self.nodes[&start].prev;
        while next.is_some() && !self.valid_insert_position(nicr, prev, next) {
            next = prev;
            prev = next.and_then(|id| self.nodes[&id].prev);
        }
        (prev, next)
    }

    pub fn find_insert_position(
        &self,
        nicr: Ratio,
        prev_hint: Option<VaultId>,
        next_hint: Option<VaultId>,
    ) -> (Option<VaultId>, Option<VaultId>) {
        let prev = prev_hint.filter(|id| self.contains(*id) && self.nodes[id].nicr >= nicr);
        let next = next_hint.filter(|id| self.contains(*id) && nicr > self.nodes[id].nicr);
        match (prev, next) {
            (None, None) => match self.head {
                Some(head) => self.descend(nicr, head),
                None => (None, None),
            },
            (None, Some(n)) => self.ascend(nicr, n),
            (Some(p), None) => self.descend(nicr, p),
            (Some(p), Some(n)) => {
                if self.valid_insert_position(nicr, Some(p), Some(n)) {
                    (Some(p), Some(n))
                } else {
                    self.descend(nicr, p)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    fn ratio(n: u32) -> Ratio {
        Ratio::from(Decimal::from(n))
    }

    fn ids(list: &SortedVaults) -> Vec<VaultId> {
        list.iter().collect()
    }

    #[test]
    fn inserts_descending_without_hints() {
        let mut list = SortedVaults::new();
        list.insert(1, ratio(150), None, None);
        list.insert(2, ratio(300), None, None);
        list.insert(3, ratio(200), None, None);
        assert_eq!(ids(&list), vec![2, 3, 1]);
        assert_eq!(list.first(), Some(2));
        assert_eq!(list.last(), Some(1));
    }

    #[test]
    fn equal_ratios_keep_insertion_order() {
        let mut list = SortedVaults::new();
        list.insert(10, ratio(200), None, None);
        list.insert(11, ratio(200), None, None);
        list.insert(12, ratio(200), None, None);
        assert_eq!(ids(&list), vec![10, 11, 12]);
    }

    #[test]
    fn wrong_hints_are_repaired() {
        let mut list = SortedVaults::new();
        for (id, r) in [(1, 400), (2, 300), (3, 200), (4, 100)] {
            list.insert(id, ratio(r), None, None);
        }
        // Hints point at the wrong end of the list.
        list.insert(5, ratio(250), Some(4), Some(1));
        assert_eq!(ids(&list), vec![1, 2, 5, 3, 4]);
    }

    #[test]
    fn stale_hints_pointing_at_removed_nodes_are_ignored() {
        let mut list = SortedVaults::new();
        list.insert(1, ratio(300), None, None);
        list.insert(2, ratio(100), None, None);
        list.remove(1);
        list.insert(3, ratio(200), Some(1), Some(2));
        assert_eq!(ids(&list), vec![3, 2]);
    }

    #[test]
    fn remove_relinks_neighbors() {
        let mut list = SortedVaults::new();
        for (id, r) in [(1, 300), (2, 200), (3, 100)] {
            list.insert(id, ratio(r), None, None);
        }
        list.remove(2);
        assert_eq!(ids(&list), vec![1, 3]);
        assert_eq!(list.next(1), Some(3));
        assert_eq!(list.prev(3), Some(1));
        list.remove(1);
        list.remove(3);
        assert!(list.is_empty());
        assert_eq!(list.first(), None);
        assert_eq!(list.last(), None);
    }

    #[test]
    #[should_panic(expected = "already in the sorted list")]
    fn duplicate_insert_panics() {
        let mut list = SortedVaults::new();
        list.insert(1, ratio(300), None, None);
        list.insert(1, ratio(200), None, None);
    }

    #[test]
    #[should_panic(expected = "zero nominal ratio")]
    fn zero_ratio_insert_panics() {
        let mut list = SortedVaults::new();
        list.insert(1, Ratio::default(), None, None);
    }

    #[test]
    #[should_panic(expected = "not in the sorted list")]
    fn removing_an_absent_entry_panics() {
        let mut list = SortedVaults::new();
        list.insert(1, ratio(300), None, None);
        list.remove(2);
    }

    #[test]
    fn reinsert_moves_entry_to_new_rank() {
        let mut list = SortedVaults::new();
        for (id, r) in [(1, 300), (2, 200), (3, 100)] {
            list.insert(id, ratio(r), None, None);
        }
        list.reinsert(3, ratio(250), None, None);
        assert_eq!(ids(&list), vec![1, 3, 2]);
    }
}
