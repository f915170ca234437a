use super::{Backend, SensorDescriptor, SensorHandle};
use crate::data::{DeviceType, Magnitude, MetricMetadata, NumericKind, Unit};
use crate::transaction::TransactionId;
use anyhow::Result;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{read_to_string, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const POWERCAP_PTH: &str = "/sys/class/powercap";

/// One RAPL domain exposed through powercap
#[derive(Debug, Clone)]
struct Zone {
    id: String,
    device_type: DeviceType,
    energy_path: PathBuf,
    max_uj: u64,
}

/// Energy counters of CPU packages and DRAM via the Linux (powercap)<https://www.kernel.org/doc/html/latest/power/powercap/powercap.html> interface.
/// Counters are in µJ and wrap around at `max_energy_range_uj`.
pub struct PowercapBackend {
    zones: Vec<Zone>,
    metadata: BTreeMap<String, serde_json::Value>,
}
impl PowercapBackend {
    pub const ID: &'static str = "powercap_rapl";

    pub fn new(tid: &TransactionId) -> Result<Self> {
        Self::with_root(Path::new(POWERCAP_PTH), tid)
    }

    /// Discover zones below `root` instead of the system powercap directory.
    pub fn with_root(root: &Path, tid: &TransactionId) -> Result<Self> {
        if !root.is_dir() {
            bail_error!(tid=tid, root=%root.display(), "No powercap interface");
        }
        let top = Regex::new(r"^intel-rapl:(\d+)$")?;
        let sub = Regex::new(r"^intel-rapl:\d+:\d+$")?;
        let mut zones = vec![];
        for entry in std::fs::read_dir(root)? {
            let entry = entry?;
            let dir_name = entry.file_name().to_string_lossy().to_string();
            let socket = match top.captures(&dir_name).and_then(|c| c.get(1)) {
                Some(m) => m.as_str().to_string(),
                None => continue,
            };
            let Some(zone) = Self::read_zone(&entry.path(), &socket, tid) else {
                continue;
            };
            zones.push(zone);
            for child in std::fs::read_dir(entry.path())? {
                let child = child?;
                if !sub.is_match(&child.file_name().to_string_lossy()) {
                    continue;
                }
                if let Some(zone) = Self::read_zone(&child.path(), &socket, tid) {
                    zones.push(zone);
                }
            }
        }
        if zones.is_empty() {
            bail_error!(tid=tid, root=%root.display(), "No readable RAPL zones were found");
        }
        zones.sort_by(|a, b| a.id.cmp(&b.id));
        debug!(tid=tid, zones=?zones.iter().map(|z| &z.id).collect::<Vec<_>>(), "Powercap RAPL zones");
        Ok(PowercapBackend {
            zones,
            metadata: cpu_metadata(),
        })
    }

    /// `None` for zones that are not package or DRAM domains, or that cannot be read.
    fn read_zone(dir: &Path, socket: &str, tid: &TransactionId) -> Option<Zone> {
        let name = read_to_string(dir.join("name")).ok()?.trim().to_string();
        let device_type = if name.contains("dram") {
            DeviceType::Ram
        } else if name.contains("package") {
            DeviceType::Cpu
        } else {
            trace!(tid=tid, zone=%name, "Skipping RAPL zone");
            return None;
        };
        let energy_path = dir.join("energy_uj");
        if let Err(e) = File::open(&energy_path) {
            debug!(tid=tid, path=%energy_path.display(), error=%e, "RAPL counter is not readable");
            return None;
        }
        let max_uj = match read_uj(&dir.join("max_energy_range_uj")) {
            Ok(m) => m,
            Err(e) => {
                debug!(tid=tid, zone=%name, error=%e, "RAPL zone has no energy range");
                return None;
            },
        };
        Some(Zone {
            id: format!("{}_{}_{}", device_type.name(), socket, name),
            device_type,
            energy_path,
            max_uj,
        })
    }
}

fn read_uj(pth: &Path) -> Result<u64> {
    Ok(read_to_string(pth)?.trim().parse::<u64>()?)
}

fn cpu_metadata() -> BTreeMap<String, serde_json::Value> {
    let mut md = BTreeMap::new();
    if let Ok(info) = read_to_string("/proc/cpuinfo") {
        if let Some(model) = info
            .lines()
            .find(|l| l.starts_with("model name"))
            .and_then(|l| l.split(':').nth(1))
        {
            md.insert("cpu_model".to_string(), model.trim().into());
        }
    }
    md
}

impl Backend for PowercapBackend {
    fn id(&self) -> &str {
        Self::ID
    }
    fn name(&self) -> &str {
        "Powercap RAPL"
    }

    fn available_sensors(&self) -> BTreeMap<String, SensorDescriptor> {
        self.zones
            .iter()
            .map(|z| {
                (
                    z.id.clone(),
                    SensorDescriptor {
                        device_type: z.device_type,
                        unit: Unit::Joule,
                    },
                )
            })
            .collect()
    }

    fn get_sensors(&self, ids: &BTreeSet<String>, tid: &TransactionId) -> Result<Vec<SensorHandle>> {
        let mut out = vec![];
        for id in ids {
            let zone = match self.zones.iter().find(|z| &z.id == id) {
                Some(z) => z,
                None => bail_error!(tid=tid, sensor=%id, "Unknown RAPL sensor"),
            };
            let mut file = match File::open(&zone.energy_path) {
                Ok(f) => f,
                Err(e) => bail_error!(tid=tid, error=%e, path=%zone.energy_path.display(), "Failed to open RAPL counter"),
            };
            let max = zone.max_uj as f64;
            let md = MetricMetadata::new(Unit::Joule, Magnitude::Micro, NumericKind::U64, 0.0, max, max);
            let mut buf = String::with_capacity(24);
            let reader = Box::new(move || -> Result<f64> {
                buf.clear();
                file.seek(SeekFrom::Start(0))?;
                file.read_to_string(&mut buf)?;
                Ok(buf.trim().parse::<u64>()? as f64)
            });
            out.push(SensorHandle::new(id, Self::ID, zone.device_type, md, reader).with_metadata(self.metadata.clone()));
        }
        Ok(out)
    }

    fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        self.metadata.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;

    fn zone(root: &Path, dir: &str, name: &str, uj: u64, max: u64) {
        let pth = root.join(dir);
        std::fs::create_dir_all(&pth).unwrap();
        std::fs::write(pth.join("name"), format!("{}\n", name)).unwrap();
        std::fs::write(pth.join("energy_uj"), format!("{}\n", uj)).unwrap();
        std::fs::write(pth.join("max_energy_range_uj"), format!("{}\n", max)).unwrap();
    }

    #[test]
    fn discovers_package_and_dram() {
        let root = tempfile::tempdir().unwrap();
        zone(root.path(), "intel-rapl:0", "package-0", 1000, 262143328850);
        zone(root.path(), "intel-rapl:0/intel-rapl:0:0", "core", 10, 262143328850);
        zone(root.path(), "intel-rapl:0/intel-rapl:0:1", "dram", 20, 65712999613);
        zone(root.path(), "intel-rapl:1", "psys", 5, 100);
        let backend = PowercapBackend::with_root(root.path(), &TEST_TID).unwrap();
        let sensors = backend.available_sensors();
        let ids: Vec<&String> = sensors.keys().collect();
        assert_eq!(ids, vec!["cpu_0_package-0", "ram_0_dram"]);
        assert_eq!(sensors["ram_0_dram"].device_type, DeviceType::Ram);
    }

    #[test]
    fn reads_counter_each_time() {
        let root = tempfile::tempdir().unwrap();
        zone(root.path(), "intel-rapl:0", "package-0", 1000, 5000);
        let backend = PowercapBackend::with_root(root.path(), &TEST_TID).unwrap();
        let ids = BTreeSet::from(["cpu_0_package-0".to_string()]);
        let mut handle = backend.get_sensors(&ids, &TEST_TID).unwrap().remove(0);
        assert_eq!(handle.data_type.max, 5000.0);
        assert_eq!(handle.data_type.mag, Magnitude::Micro);
        assert_eq!(handle.read().unwrap(), 1000.0);
        std::fs::write(root.path().join("intel-rapl:0").join("energy_uj"), "1234\n").unwrap();
        assert_eq!(handle.read().unwrap(), 1234.0);
    }

    #[test]
    fn missing_interface_errors() {
        let root = tempfile::tempdir().unwrap();
        assert!(PowercapBackend::with_root(&root.path().join("nope"), &TEST_TID).is_err());
        assert!(PowercapBackend::with_root(root.path(), &TEST_TID).is_err());
    }
}
