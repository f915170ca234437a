use super::metrics::{MetricType, Stats};
use crate::clock::unix_nanos;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// Region events recorded by one rank during one round.
/// Each region's events alternate start, end, start, end, ...
pub struct LocalRegions {
    pub events: BTreeMap<String, Vec<u64>>,
}
impl LocalRegions {
    /// Record an event for `region` now.
    pub fn mark(&mut self, region: &str) {
        self.mark_at(region, unix_nanos());
    }

    /// Record an event for `region` at an absolute unix time in nanoseconds.
    pub fn mark_at(&mut self, region: &str, unix_ns: u64) {
        self.events.entry(region.to_string()).or_default().push(unix_ns);
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Run `body` between a start and an end event for `region`.
    pub fn scoped<T>(&mut self, region: &str, body: impl FnOnce() -> T) -> T {
        self.mark(region);
        let r = body();
        self.mark(region);
        r
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// A named region across all ranks of one run
pub struct Region {
    pub id: String,
    /// rank → event times in seconds since that rank's round start
    pub raw_data: BTreeMap<usize, Vec<f64>>,
    #[serde(default)]
    pub runs_per_rank: Option<Stats>,
    #[serde(default)]
    pub metrics: BTreeMap<MetricType, Stats>,
    #[serde(default)]
    pub processed: bool,
}

/// Merge every rank's events into per-region records, relative to each rank's own round start.
/// `ranks` holds `(rank, round_start_ns, events)`.
pub fn assemble_regions(ranks: &[(usize, u64, &LocalRegions)]) -> BTreeMap<String, Region> {
    let mut regions: BTreeMap<String, Region> = BTreeMap::new();
    for (rank, start_ns, local) in ranks {
        for (name, events) in &local.events {
            let region = regions.entry(name.clone()).or_insert_with(|| Region {
                id: name.clone(),
                ..Default::default()
            });
            region.raw_data.insert(
                *rank,
                events
                    .iter()
                    .map(|t| (*t as i128 - *start_ns as i128) as f64 / 1e9)
                    .collect(),
            );
        }
    }
    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regions_relative_per_rank() {
        let mut r0 = LocalRegions::default();
        r0.mark_at("solve", 2_000_000_000);
        r0.mark_at("solve", 3_500_000_000);
        let mut r1 = LocalRegions::default();
        r1.mark_at("solve", 11_000_000_000);
        r1.mark_at("solve", 12_000_000_000);
        r1.mark_at("io", 12_500_000_000);

        let regions = assemble_regions(&[(0, 1_000_000_000, &r0), (1, 10_000_000_000, &r1)]);
        assert_eq!(regions.len(), 2);
        let solve = &regions["solve"];
        assert_eq!(solve.raw_data[&0], vec![1.0, 2.5]);
        assert_eq!(solve.raw_data[&1], vec![1.0, 2.0]);
        assert_eq!(regions["io"].raw_data[&1], vec![2.5]);
        assert!(!solve.processed);
    }

    #[test]
    fn scoped_marks_both_ends() {
        let mut regions = LocalRegions::default();
        let out = regions.scoped("work", || 7);
        assert_eq!(out, 7);
        let events = &regions.events["work"];
        assert_eq!(events.len(), 2);
        assert!(events[0] <= events[1]);
    }
}
