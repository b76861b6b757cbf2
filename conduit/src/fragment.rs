//! Splitting an oversized outgoing payload into MTU-sized fragments, and
//! reassembling fragments back into a payload on receive, per
//! `spec.md` §4.4.6.
//!
//! Grounded in the registry/shard tables the teacher builds with
//! `indexmap::IndexMap` (`registry.rs`, `system.rs`) rather than
//! `std::collections::HashMap` — the crate already leans on `indexmap`
//! for keyed lookup tables, so reassembly state follows the same
//! convention instead of introducing a second map type.

use crate::wire::FragmentHeader;
use indexmap::IndexMap;

/// Splits `payload` into chunks no larger than `max_fragment_bytes`,
/// returning `None` if it already fits in a single piece.
pub fn split(payload: &[u8], max_fragment_bytes: usize) -> Option<Vec<&[u8]>> {
    if payload.len() <= max_fragment_bytes {
        return None;
    }

    Some(payload.chunks(max_fragment_bytes).collect())
}

struct PartialGroup {
    count: u16,
    received: u16,
    parts: Vec<Option<Vec<u8>>>,
}

impl PartialGroup {
    fn new(count: u16) -> Self {
        PartialGroup {
            count,
            received: 0,
            parts: vec![None; count as usize],
        }
    }

    fn is_complete(&self) -> bool {
        self.received == self.count
    }

    fn concatenate(self) -> Vec<u8> {
        let mut out = Vec::new();
        for part in self.parts {
            out.extend(part.expect("all parts present when group is complete"));
        }
        out
    }
}

/// Accumulates fragments across reassembly groups until each is
/// complete. One instance is shared across every channel of a
/// connection, keyed by the fragment's group id, since group ids are
/// drawn from the same sequence space that is already unique per
/// connection.
pub struct ReassemblyBuffer {
    groups: IndexMap<u32, PartialGroup>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        ReassemblyBuffer {
            groups: IndexMap::new(),
        }
    }

    /// Folds one fragment into its group, returning the fully
    /// reassembled payload once every fragment in the group has
    /// arrived.
    pub fn insert(&mut self, header: FragmentHeader, payload: Vec<u8>) -> Option<Vec<u8>> {
        let group = self
            .groups
            .entry(header.group)
            .or_insert_with(|| PartialGroup::new(header.count));

        let slot = &mut group.parts[header.index as usize];
        if slot.is_none() {
            *slot = Some(payload);
            group.received += 1;
        }

        if group.is_complete() {
            let (_, group) = self.groups.swap_remove_entry(&header.group).unwrap();
            Some(group.concatenate())
        } else {
            None
        }
    }

    /// Drops any in-progress group whose connection is being torn down,
    /// so a half-received fragment set doesn't linger forever.
    pub fn clear(&mut self) {
        self.groups.clear();
    }

    pub fn pending_groups(&self) -> usize {
        self.groups.len()
    }
}

impl Default for ReassemblyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_below_threshold_is_not_fragmented() {
        assert!(split(&[1, 2, 3], 10).is_none());
    }

    #[test]
    fn split_above_threshold_chunks_evenly() {
        let payload: Vec<u8> = (0..25).collect();
        let fragments = split(&payload, 10).unwrap();
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].len(), 10);
        assert_eq!(fragments[2].len(), 5);
    }

    #[test]
    fn reassembly_completes_out_of_order() {
        let mut buf = ReassemblyBuffer::new();

        let h = |index| FragmentHeader { group: 7, index, count: 3 };

        assert!(buf.insert(h(2), vec![2]).is_none());
        assert!(buf.insert(h(0), vec![0]).is_none());
        let result = buf.insert(h(1), vec![1]);

        assert_eq!(result, Some(vec![0, 1, 2]));
        assert_eq!(buf.pending_groups(), 0);
    }

    #[test]
    fn duplicate_fragment_is_ignored() {
        let mut buf = ReassemblyBuffer::new();
        let h = |index| FragmentHeader { group: 1, index, count: 2 };

        assert!(buf.insert(h(0), vec![0]).is_none());
        assert!(buf.insert(h(0), vec![99]).is_none()); // duplicate, ignored
        let result = buf.insert(h(1), vec![1]);

        assert_eq!(result, Some(vec![0, 1]));
    }

    #[test]
    fn independent_groups_do_not_interfere() {
        let mut buf = ReassemblyBuffer::new();
        buf.insert(FragmentHeader { group: 1, index: 0, count: 2 }, vec![1]);
        buf.insert(FragmentHeader { group: 2, index: 0, count: 2 }, vec![2]);
        assert_eq!(buf.pending_groups(), 2);
    }

    #[test]
    fn clear_drops_in_progress_groups() {
        let mut buf = ReassemblyBuffer::new();
        buf.insert(FragmentHeader { group: 1, index: 0, count: 2 }, vec![1]);
        buf.clear();
        assert_eq!(buf.pending_groups(), 0);
    }
}
