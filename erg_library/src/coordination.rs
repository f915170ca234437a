//! Decides which rank samples which sensor.
//! Every host gets exactly one sampling rank, the lowest rank id running on it.
use crate::comm::{CommExt, Communicator};
use crate::data::{DeviceType, Unit};
use crate::monitor_config::MonitorConfig;
use crate::sensor::{SensorDescriptor, VisibleSensors};
use crate::transaction::TransactionId;
use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// A sensor a rank is responsible for sampling
pub struct AssignedSensor {
    pub backend: String,
    pub device_type: DeviceType,
    pub unit: Unit,
}

/// sensor id → where to find it
pub type SensorAssignment = BTreeMap<String, AssignedSensor>;

/// hostname → ranks running on it, in first-seen order
pub type HostRanks = Vec<(String, Vec<usize>)>;

/// Group ranks by hostname. `hostnames[i]` is the hostname of rank `i`.
pub fn group_by_host(hostnames: &[String]) -> HostRanks {
    let mut out: HostRanks = vec![];
    for (rank, name) in hostnames.iter().enumerate() {
        match out.iter_mut().find(|(h, _)| h == name) {
            Some((_, ranks)) => ranks.push(rank),
            None => out.push((name.clone(), vec![rank])),
        }
    }
    out
}

/// Merge the sensors of every rank on a host into the lowest rank of that host.
/// All other ranks end up with nothing to sample.
pub fn assign_sensors(mut visible: Vec<VisibleSensors>, host_ranks: &HostRanks) -> Vec<VisibleSensors> {
    for (_host, ranks) in host_ranks {
        let lowest = match ranks.iter().min() {
            Some(r) => *r,
            None => continue,
        };
        for &rank in ranks {
            if rank == lowest || rank >= visible.len() {
                continue;
            }
            let theirs = std::mem::take(&mut visible[rank]);
            let into = &mut visible[lowest];
            for (backend, sensors) in theirs {
                let merged = into.entry(backend).or_default();
                for (id, desc) in sensors {
                    merged.entry(id).or_insert(desc);
                }
            }
        }
    }
    visible
}

/// Include/exclude patterns for backends and sensors.
/// A pattern matches when it matches at the start of the id.
#[derive(Debug, Default)]
pub struct SensorFilters {
    include_backends: Option<Vec<Regex>>,
    exclude_backends: Option<Vec<Regex>>,
    include_sensors: Option<Vec<Regex>>,
    exclude_sensors: Option<Vec<Regex>>,
}
impl SensorFilters {
    pub fn new(
        include_backends: &Option<Vec<String>>,
        exclude_backends: &Option<Vec<String>>,
        include_sensors: &Option<Vec<String>>,
        exclude_sensors: &Option<Vec<String>>,
        tid: &TransactionId,
    ) -> Result<Self> {
        let mut include_backends = compile(include_backends, tid)?;
        let exclude_backends = compile(exclude_backends, tid)?;
        let mut include_sensors = compile(include_sensors, tid)?;
        let exclude_sensors = compile(exclude_sensors, tid)?;
        if include_backends.is_some() && exclude_backends.is_some() {
            warn!(tid=tid, "Both include and exclude backend filters are set, only excluding");
            include_backends = None;
        }
        if include_sensors.is_some() && exclude_sensors.is_some() {
            warn!(tid=tid, "Both include and exclude sensor filters are set, only excluding");
            include_sensors = None;
        }
        Ok(SensorFilters {
            include_backends,
            exclude_backends,
            include_sensors,
            exclude_sensors,
        })
    }

    pub fn from_config(cfg: &MonitorConfig, tid: &TransactionId) -> Result<Self> {
        Self::new(
            &cfg.include_backends,
            &cfg.exclude_backends,
            &cfg.include_sensors,
            &cfg.exclude_sensors,
            tid,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.include_backends.is_none()
            && self.exclude_backends.is_none()
            && self.include_sensors.is_none()
            && self.exclude_sensors.is_none()
    }

    pub fn allows(&self, backend: &str, sensor: &str) -> bool {
        if let Some(inc) = &self.include_backends {
            if !matches_one_of(inc, backend) {
                return false;
            }
        }
        if let Some(exc) = &self.exclude_backends {
            if matches_one_of(exc, backend) {
                return false;
            }
        }
        if let Some(inc) = &self.include_sensors {
            if !matches_one_of(inc, sensor) {
                return false;
            }
        }
        if let Some(exc) = &self.exclude_sensors {
            if matches_one_of(exc, sensor) {
                return false;
            }
        }
        true
    }

    pub fn apply(&self, sensors: VisibleSensors, tid: &TransactionId) -> VisibleSensors {
        if self.is_empty() {
            return sensors;
        }
        let before: usize = sensors.values().map(|s| s.len()).sum();
        let filtered: VisibleSensors = sensors
            .into_iter()
            .map(|(backend, s)| {
                let kept: BTreeMap<String, SensorDescriptor> =
                    s.into_iter().filter(|(id, _)| self.allows(&backend, id)).collect();
                (backend, kept)
            })
            .filter(|(_, s)| !s.is_empty())
            .collect();
        let after: usize = filtered.values().map(|s| s.len()).sum();
        if after == 0 && before > 0 {
            warn!(tid=tid, "No sensors matched the include and exclude filters");
        }
        debug!(tid=tid, before=before, after=after, "Filtered sensors");
        filtered
    }
}

fn compile(patterns: &Option<Vec<String>>, tid: &TransactionId) -> Result<Option<Vec<Regex>>> {
    let patterns = match patterns {
        Some(p) if !p.is_empty() => p,
        _ => return Ok(None),
    };
    let mut out = Vec::with_capacity(patterns.len());
    for p in patterns {
        match Regex::new(&format!("^(?:{})", p)) {
            Ok(r) => out.push(r),
            Err(e) => crate::bail_error!(tid=tid, pattern=%p, error=%e, "Invalid sensor filter pattern"),
        }
    }
    Ok(Some(out))
}

fn matches_one_of(patterns: &[Regex], id: &str) -> bool {
    patterns.iter().any(|p| p.is_match(id))
}

/// Flatten a backend → sensor map into a sensor → backend assignment.
/// On an id collision between backends the first backend keeps the sensor.
pub fn to_assignment(sensors: &VisibleSensors, tid: &TransactionId) -> SensorAssignment {
    let mut out = SensorAssignment::new();
    for (backend, s) in sensors {
        for (id, desc) in s {
            if let Some(prev) = out.get(id) {
                warn!(tid=tid, sensor=%id, kept=%prev.backend, dropped=%backend, "Sensor id offered by two backends");
                continue;
            }
            out.insert(
                id.clone(),
                AssignedSensor {
                    backend: backend.clone(),
                    device_type: desc.device_type,
                    unit: desc.unit,
                },
            );
        }
    }
    out
}

/// Exchange hostnames and visible sensors with every rank, then pick what this rank samples.
pub fn discover_and_assign(
    comm: &dyn Communicator,
    visible: &VisibleSensors,
    hostname: &str,
    filters: &SensorFilters,
    tid: &TransactionId,
) -> Result<(HostRanks, SensorAssignment)> {
    let hostnames: Vec<String> = comm.all_gather(&hostname.to_string())?;
    let host_ranks = group_by_host(&hostnames);
    debug!(tid=tid, hosts=?host_ranks, "Grouped ranks by host");

    let all_visible: Vec<VisibleSensors> = comm.all_gather(visible)?;
    let mut assigned = assign_sensors(all_visible, &host_ranks);
    let mine = match assigned.get_mut(comm.rank()) {
        Some(m) => std::mem::take(m),
        None => crate::bail_error!(tid=tid, rank=comm.rank(), size=comm.size(), "Rank missing from gathered sensors"),
    };
    let mine = filters.apply(mine, tid);
    let assignment = to_assignment(&mine, tid);
    info!(tid=tid, rank=comm.rank(), sensors=assignment.len(), "Sensors assigned");
    Ok((host_ranks, assignment))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;
    use rstest::rstest;
    use std::collections::BTreeSet;

    fn sensors(layout: &[(&str, &[&str])]) -> VisibleSensors {
        layout.iter()
            .map(|(b, ids)| {
                let s = ids
                    .iter()
                    .map(|id| {
                        (
                            id.to_string(),
                            SensorDescriptor {
                                device_type: DeviceType::Cpu,
                                unit: Unit::Joule,
                            },
                        )
                    })
                    .collect();
                (b.to_string(), s)
            })
            .collect()
    }

    fn ids(v: &VisibleSensors) -> BTreeMap<String, BTreeSet<String>> {
        v.iter()
            .map(|(b, s)| (b.clone(), s.keys().cloned().collect()))
            .collect()
    }

    fn hosts(names: &[&str]) -> HostRanks {
        group_by_host(&names.iter().map(|s| s.to_string()).collect::<Vec<_>>())
    }

    #[test]
    fn groups_preserve_first_seen_order() {
        let h = hosts(&["b", "a", "b", "c", "a"]);
        assert_eq!(
            h,
            vec![
                ("b".to_string(), vec![0, 2]),
                ("a".to_string(), vec![1, 4]),
                ("c".to_string(), vec![3]),
            ]
        );
    }

    #[test]
    fn single_rank_keeps_everything() {
        let out = assign_sensors(vec![sensors(&[("b", &["s1", "s2", "s3"])])], &hosts(&["host0"]));
        assert_eq!(ids(&out[0]), ids(&sensors(&[("b", &["s1", "s2", "s3"])])));
    }

    #[test]
    fn equal_devices_go_to_lowest_rank() {
        let dev = sensors(&[("b", &["s1", "s2", "s3"])]);
        let out = assign_sensors(vec![dev.clone(), dev.clone()], &hosts(&["host0", "host0"]));
        assert_eq!(ids(&out[0]), ids(&dev));
        assert!(out[1].is_empty());
    }

    #[test]
    fn different_devices_are_merged() {
        let out = assign_sensors(
            vec![sensors(&[("b", &["s1", "s2"])]), sensors(&[("b", &["s2", "s3"])])],
            &hosts(&["host0", "host0"]),
        );
        assert_eq!(ids(&out[0]), ids(&sensors(&[("b", &["s1", "s2", "s3"])])));
        assert!(out[1].is_empty());
    }

    #[test]
    fn different_backends_are_merged() {
        let out = assign_sensors(
            vec![
                sensors(&[("b0", &["s1", "s2"]), ("b1", &["s1", "s0"])]),
                sensors(&[("b0", &["s2", "s3"])]),
                sensors(&[("b1", &["s2"])]),
            ],
            &hosts(&["host0", "host0", "host0"]),
        );
        assert_eq!(
            ids(&out[0]),
            ids(&sensors(&[("b0", &["s1", "s2", "s3"]), ("b1", &["s0", "s1", "s2"])]))
        );
        assert!(out[1].is_empty());
        assert!(out[2].is_empty());
    }

    #[test]
    fn two_hosts_single_ranks() {
        let dev = sensors(&[("b", &["s1", "s2"])]);
        let out = assign_sensors(vec![dev.clone(), dev.clone()], &hosts(&["host0", "host1"]));
        assert_eq!(ids(&out[0]), ids(&dev));
        assert_eq!(ids(&out[1]), ids(&dev));
    }

    #[test]
    fn two_hosts_multiple_ranks() {
        let out = assign_sensors(
            vec![
                sensors(&[("b0", &["s1", "s2"]), ("b1", &["s1", "s0"])]),
                sensors(&[("b0", &["s2", "s3"])]),
                sensors(&[("b1", &["s1", "s0"])]),
                sensors(&[("b0", &["s2", "s3"])]),
            ],
            &hosts(&["host0", "host0", "host1", "host1"]),
        );
        assert_eq!(
            ids(&out[0]),
            ids(&sensors(&[("b0", &["s1", "s2", "s3"]), ("b1", &["s0", "s1"])]))
        );
        assert!(out[1].is_empty());
        assert_eq!(
            ids(&out[2]),
            ids(&sensors(&[("b0", &["s2", "s3"]), ("b1", &["s0", "s1"])]))
        );
        assert!(out[3].is_empty());
    }

    #[test]
    fn interleaved_hosts_use_lowest_rank() {
        let out = assign_sensors(
            vec![
                sensors(&[("b", &["a"])]),
                sensors(&[("b", &["b"])]),
                sensors(&[("b", &["c"])]),
                sensors(&[("b", &["d"])]),
            ],
            &hosts(&["h1", "h0", "h1", "h0"]),
        );
        assert_eq!(ids(&out[0]), ids(&sensors(&[("b", &["a", "c"])])));
        assert_eq!(ids(&out[1]), ids(&sensors(&[("b", &["b", "d"])])));
        assert!(out[2].is_empty());
        assert!(out[3].is_empty());
    }

    #[test]
    fn empty_host_yields_empty_assignment() {
        let out = assign_sensors(vec![VisibleSensors::new(), VisibleSensors::new()], &hosts(&["h", "h"]));
        assert!(out.iter().all(|v| v.is_empty()));
    }

    fn pats(p: &[&str]) -> Option<Vec<String>> {
        Some(p.iter().map(|s| s.to_string()).collect())
    }

    #[rstest]
    #[case(pats(&["powercap"]), None, None, None, vec!["cpu_0_package", "cpu_0_dram"])]
    #[case(None, pats(&["powercap"]), None, None, vec!["CPU_USAGE"])]
    #[case(None, None, pats(&["cpu_"]), None, vec!["cpu_0_package", "cpu_0_dram"])]
    #[case(None, None, None, pats(&["cpu_0_d", "CPU"]), vec!["cpu_0_package"])]
    #[case(None, None, pats(&["cpu"]), pats(&["cpu_0_d"]), vec!["cpu_0_package", "CPU_USAGE"])]
    #[case(None, None, pats(&["package"]), None, vec![])]
    #[case(Some(vec![]), None, None, None, vec!["cpu_0_package", "cpu_0_dram", "CPU_USAGE"])]
    fn filters_apply(
        #[case] inc_b: Option<Vec<String>>,
        #[case] exc_b: Option<Vec<String>>,
        #[case] inc_s: Option<Vec<String>>,
        #[case] exc_s: Option<Vec<String>>,
        #[case] expected: Vec<&str>,
    ) {
        let f = SensorFilters::new(&inc_b, &exc_b, &inc_s, &exc_s, &TEST_TID).unwrap();
        let all = sensors(&[("powercap_rapl", &["cpu_0_package", "cpu_0_dram"]), ("procfs", &["CPU_USAGE"])]);
        let out = to_assignment(&f.apply(all, &TEST_TID), &TEST_TID);
        let got: BTreeSet<&str> = out.keys().map(|s| s.as_str()).collect();
        let expected: BTreeSet<&str> = expected.into_iter().collect();
        assert_eq!(got, expected);
    }

    #[test]
    fn invalid_pattern_errors() {
        assert!(SensorFilters::new(&pats(&["("]), &None, &None, &None, &TEST_TID).is_err());
    }

    #[test]
    fn assignment_records_backend() {
        let out = to_assignment(&sensors(&[("b0", &["x"]), ("b1", &["x", "y"])]), &TEST_TID);
        assert_eq!(out["x"].backend, "b0");
        assert_eq!(out["y"].backend, "b1");
    }
}
