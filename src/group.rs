//! Process groups.
//!
//! A [`Group`] is an ordered, immutable list of process identities. Rank `i`
//! of a group is the process stored at index `i`. Groups are cheap to clone
//! (the member list is shared) and compare equal iff they hold the same
//! processes in the same order.

use crate::error::{Error, Result};
use crate::UNDEFINED;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Universe-unique identity of one simulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProcessId(pub(crate) u64);

impl ProcessId {
    /// The raw identity value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Result of comparing two groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRelation {
    /// Same members in the same order
    Identical,
    /// Same members, different order
    Similar,
    /// Different members
    Unequal,
}

/// An ordered, immutable set of processes.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Group {
    members: Arc<[ProcessId]>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.members.iter()).finish()
    }
}

impl Group {
    pub(crate) fn from_members(members: Vec<ProcessId>) -> Self {
        Group {
            members: members.into(),
        }
    }

    /// The group with no members.
    pub fn empty() -> Self {
        Group::from_members(Vec::new())
    }

    /// Number of processes in the group.
    pub fn size(&self) -> i32 {
        self.members.len() as i32
    }

    /// Members in rank order.
    pub fn members(&self) -> &[ProcessId] {
        &self.members
    }

    /// The process at `rank`, if `rank` is in range.
    pub fn process(&self, rank: i32) -> Option<ProcessId> {
        usize::try_from(rank)
            .ok()
            .and_then(|r| self.members.get(r).copied())
    }

    /// Rank of `pid` in this group, if it is a member.
    pub fn rank_of(&self, pid: ProcessId) -> Option<i32> {
        self.members
            .iter()
            .position(|m| *m == pid)
            .map(|r| r as i32)
    }

    /// Compare membership and order with another group.
    pub fn compare(&self, other: &Group) -> GroupRelation {
        if self.members == other.members {
            return GroupRelation::Identical;
        }
        if self.members.len() == other.members.len() {
            let mine: HashSet<_> = self.members.iter().collect();
            if other.members.iter().all(|m| mine.contains(m)) {
                return GroupRelation::Similar;
            }
        }
        GroupRelation::Unequal
    }

    /// Translate ranks of this group into ranks of `other`.
    ///
    /// Ranks whose process is not in `other` map to [`UNDEFINED`];
    /// `PROC_NULL` maps to itself.
    pub fn translate_ranks(&self, ranks: &[i32], other: &Group) -> Result<Vec<i32>> {
        ranks
            .iter()
            .map(|&r| {
                if r == crate::PROC_NULL {
                    return Ok(crate::PROC_NULL);
                }
                let pid = self.process(r).ok_or(Error::InvalidRank(r))?;
                Ok(other.rank_of(pid).unwrap_or(UNDEFINED))
            })
            .collect()
    }

    /// The group made of the listed ranks, in the listed order.
    pub fn include(&self, ranks: &[i32]) -> Result<Group> {
        let mut seen = HashSet::with_capacity(ranks.len());
        let mut members = Vec::with_capacity(ranks.len());
        for &r in ranks {
            let pid = self.process(r).ok_or(Error::InvalidRank(r))?;
            if !seen.insert(r) {
                return Err(Error::InvalidGroup(format!("rank {r} listed twice")));
            }
            members.push(pid);
        }
        Ok(Group::from_members(members))
    }

    /// The group without the listed ranks, keeping the remaining order.
    pub fn exclude(&self, ranks: &[i32]) -> Result<Group> {
        let mut dropped = HashSet::with_capacity(ranks.len());
        for &r in ranks {
            if self.process(r).is_none() {
                return Err(Error::InvalidRank(r));
            }
            if !dropped.insert(r) {
                return Err(Error::InvalidGroup(format!("rank {r} listed twice")));
            }
        }
        let members = (0..self.size())
            .filter(|r| !dropped.contains(r))
            .filter_map(|r| self.process(r))
            .collect();
        Ok(Group::from_members(members))
    }

    /// All members of `self` followed by the members of `other` not in `self`.
    pub fn union(&self, other: &Group) -> Group {
        let mut members = self.members.to_vec();
        for pid in other.members.iter() {
            if !members.contains(pid) {
                members.push(*pid);
            }
        }
        Group::from_members(members)
    }

    /// Members of `self` that are also in `other`, in `self`'s order.
    pub fn intersection(&self, other: &Group) -> Group {
        let theirs: HashSet<_> = other.members.iter().collect();
        Group::from_members(
            self.members
                .iter()
                .filter(|m| theirs.contains(m))
                .copied()
                .collect(),
        )
    }

    /// Members of `self` that are not in `other`, in `self`'s order.
    pub fn difference(&self, other: &Group) -> Group {
        let theirs: HashSet<_> = other.members.iter().collect();
        Group::from_members(
            self.members
                .iter()
                .filter(|m| !theirs.contains(m))
                .copied()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(ids: &[u64]) -> Group {
        Group::from_members(ids.iter().map(|&i| ProcessId(i)).collect())
    }

    #[test]
    fn compare_relations() {
        let a = group(&[1, 2, 3]);
        assert_eq!(a.compare(&group(&[1, 2, 3])), GroupRelation::Identical);
        assert_eq!(a.compare(&group(&[3, 1, 2])), GroupRelation::Similar);
        assert_eq!(a.compare(&group(&[1, 2])), GroupRelation::Unequal);
        assert_eq!(a.compare(&group(&[1, 2, 4])), GroupRelation::Unequal);
        assert_eq!(Group::empty().compare(&Group::empty()), GroupRelation::Identical);
    }

    #[test]
    fn equality_is_order_sensitive() {
        assert_eq!(group(&[4, 5]), group(&[4, 5]));
        assert_ne!(group(&[4, 5]), group(&[5, 4]));
    }

    #[test]
    fn include_keeps_listed_order() {
        let g = group(&[10, 11, 12, 13]);
        let sub = g.include(&[3, 1]).unwrap();
        assert_eq!(sub.members(), &[ProcessId(13), ProcessId(11)]);
        assert_eq!(g.include(&[4]).unwrap_err(), Error::InvalidRank(4));
        assert!(matches!(
            g.include(&[1, 1]).unwrap_err(),
            Error::InvalidGroup(_)
        ));
    }

    #[test]
    fn exclude_keeps_remaining_order() {
        let g = group(&[10, 11, 12, 13]);
        let sub = g.exclude(&[0, 2]).unwrap();
        assert_eq!(sub.members(), &[ProcessId(11), ProcessId(13)]);
        assert_eq!(g.exclude(&[-1]).unwrap_err(), Error::InvalidRank(-1));
    }

    #[test]
    fn translate_ranks_between_groups() {
        let a = group(&[1, 2, 3, 4]);
        let b = group(&[4, 2]);
        let out = a
            .translate_ranks(&[0, 1, 3, crate::PROC_NULL], &b)
            .unwrap();
        assert_eq!(out, vec![UNDEFINED, 1, 0, crate::PROC_NULL]);
        assert_eq!(a.translate_ranks(&[9], &b).unwrap_err(), Error::InvalidRank(9));
    }

    #[test]
    fn set_operations() {
        let a = group(&[1, 2, 3]);
        let b = group(&[3, 4, 1]);
        assert_eq!(a.union(&b), group(&[1, 2, 3, 4]));
        assert_eq!(a.intersection(&b), group(&[1, 3]));
        assert_eq!(a.difference(&b), group(&[2]));
    }

    #[test]
    fn process_lookup() {
        let g = group(&[7, 8]);
        assert_eq!(g.process(1), Some(ProcessId(8)));
        assert_eq!(g.process(2), None);
        assert_eq!(g.process(-1), None);
        assert_eq!(g.rank_of(ProcessId(7)), Some(0));
        assert_eq!(g.rank_of(ProcessId(9)), None);
        assert_eq!(format!("{}", ProcessId(7)), "p7");
    }
}
