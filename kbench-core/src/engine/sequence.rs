use std::collections::BTreeSet;

use serde::Serialize;

/// Set of unique application-level sequence numbers observed by a consumer.
#[derive(Debug, Default)]
pub struct SequenceSet {
    seen: BTreeSet<u64>,
}

/// Missing-sequence report for a `[low, high]` bound: the complement of the
/// observed set, plus the same values run-length-encoded into inclusive
/// ranges (`"3"` for a singleton, `"3-6"` for a run).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingReport {
    pub missing: Vec<u64>,
    pub ranges: Vec<String>,
    pub total_missing: usize,
    pub total_expected: u64,
    pub total_received: u64,
}

impl SequenceSet {
    /// Returns true when the sequence was not seen before.
    pub fn insert(&mut self, seq: u64) -> bool {
        self.seen.insert(seq)
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Compute missing sequences within `bounds`, or within the observed
    /// min/max when no bounds are supplied. An empty observed set with no
    /// bounds yields an empty report rather than an error.
    pub fn missing(&self, bounds: Option<(u64, u64)>) -> MissingReport {
        let (low, high) = match bounds {
            Some((low, high)) => (low, high),
            None => match (self.seen.first(), self.seen.last()) {
                (Some(&low), Some(&high)) => (low, high),
                _ => return MissingReport::default(),
            },
        };

        if low > high {
            return MissingReport::default();
        }

        let mut missing = Vec::new();
        for seq in low..=high {
            if !self.seen.contains(&seq) {
                missing.push(seq);
            }
        }

        let ranges = encode_ranges(&missing);
        let total_missing = missing.len();

        MissingReport {
            missing,
            ranges,
            total_missing,
            total_expected: high - low + 1,
            total_received: self.seen.len() as u64,
        }
    }
}

fn encode_ranges(missing: &[u64]) -> Vec<String> {
    let mut ranges = Vec::new();
    let mut iter = missing.iter().copied();

    let Some(mut start) = iter.next() else {
        return ranges;
    };
    let mut prev = start;

    for seq in iter {
        if seq != prev + 1 {
            ranges.push(render_range(start, prev));
            start = seq;
        }
        prev = seq;
    }
    ranges.push(render_range(start, prev));

    ranges
}

fn render_range(start: u64, end: u64) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}-{end}")
    }
}
