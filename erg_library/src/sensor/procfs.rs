use super::{Backend, SensorDescriptor, SensorHandle, SensorReader};
use crate::data::{DeviceType, Magnitude, MetricMetadata, NumericKind, Unit};
use crate::transaction::TransactionId;
use anyhow::{Context, Result};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use tracing::debug;

const PROC_PTH: &str = "/proc";

const CPU_USAGE: &str = "CPU_USAGE";
const RAM_USAGE: &str = "RAM_USAGE";
const NET_READ: &str = "NET_READ_BYTES";
const NET_WRITE: &str = "NET_WRITE_BYTES";
const DISK_READ: &str = "DISK_READ_BYTES";
const DISK_WRITE: &str = "DISK_WRITE_BYTES";

/// Utilization, memory, network, and disk counters of the whole machine, read from `/proc`
pub struct ProcfsBackend {
    root: PathBuf,
    sensors: BTreeMap<String, SensorDescriptor>,
}
impl ProcfsBackend {
    pub const ID: &'static str = "procfs";

    pub fn new(tid: &TransactionId) -> Result<Self> {
        Self::with_root(Path::new(PROC_PTH), tid)
    }

    pub fn with_root(root: &Path, tid: &TransactionId) -> Result<Self> {
        if !root.join("stat").is_file() {
            bail_error!(tid=tid, root=%root.display(), "No procfs interface");
        }
        let mut sensors = BTreeMap::new();
        let mut add = |id: &str, device_type: DeviceType, unit: Unit| {
            sensors.insert(id.to_string(), SensorDescriptor { device_type, unit });
        };
        add(CPU_USAGE, DeviceType::Cpu, Unit::Percent);
        if root.join("meminfo").is_file() {
            add(RAM_USAGE, DeviceType::Ram, Unit::Byte);
        }
        if root.join("net/dev").is_file() {
            add(NET_READ, DeviceType::Net, Unit::Byte);
            add(NET_WRITE, DeviceType::Net, Unit::Byte);
        }
        if root.join("diskstats").is_file() {
            add(DISK_READ, DeviceType::Disk, Unit::Byte);
            add(DISK_WRITE, DeviceType::Disk, Unit::Byte);
        }
        debug!(tid=tid, sensors=?sensors.keys().collect::<Vec<_>>(), "procfs sensors");
        Ok(ProcfsBackend {
            root: root.to_path_buf(),
            sensors,
        })
    }

    fn reader(&self, id: &str) -> Result<SensorReader> {
        let root = self.root.clone();
        let reader: SensorReader = match id {
            CPU_USAGE => {
                let stat = root.join("stat");
                let mut prev = parse_cpu_times(&read_to_string(&stat)?)?;
                Box::new(move || -> Result<f64> {
                    let cur = parse_cpu_times(&read_to_string(&stat)?)?;
                    let pct = cpu_percent(prev, cur);
                    prev = cur;
                    Ok(pct)
                })
            },
            RAM_USAGE => {
                let pth = root.join("meminfo");
                Box::new(move || -> Result<f64> { parse_mem_used(&read_to_string(&pth)?) })
            },
            NET_READ | NET_WRITE => {
                let pth = root.join("net/dev");
                let read = id == NET_READ;
                Box::new(move || -> Result<f64> {
                    let (rx, tx) = parse_net_bytes(&read_to_string(&pth)?)?;
                    Ok(if read { rx } else { tx })
                })
            },
            DISK_READ | DISK_WRITE => {
                let pth = root.join("diskstats");
                let read = id == DISK_READ;
                let partition = Regex::new(r"^((sd|vd|hd|xvd)[a-z]+\d+|nvme\d+n\d+p\d+|mmcblk\d+p\d+|loop\d+|ram\d+|dm-\d+)$")?;
                Box::new(move || -> Result<f64> {
                    let (r, w) = parse_disk_bytes(&read_to_string(&pth)?, &partition)?;
                    Ok(if read { r } else { w })
                })
            },
            _ => anyhow::bail!("Unknown procfs sensor '{}'", id),
        };
        Ok(reader)
    }
}

fn data_type(unit: Unit) -> MetricMetadata {
    match unit {
        Unit::Percent => MetricMetadata::new(Unit::Percent, Magnitude::One, NumericKind::F32, 0.0, 100.0, -1.0),
        _ => {
            let max = u64::MAX as f64;
            MetricMetadata::new(unit, Magnitude::One, NumericKind::U64, 0.0, max, max)
        },
    }
}

/// `(busy, total)` jiffies from the aggregate `cpu` line
fn parse_cpu_times(stat: &str) -> Result<(u64, u64)> {
    let line = stat
        .lines()
        .find(|l| l.starts_with("cpu "))
        .context("no aggregate cpu line in stat")?;
    let fields = line
        .split_ascii_whitespace()
        .skip(1)
        .map(|f| f.parse::<u64>())
        .collect::<Result<Vec<u64>, _>>()?;
    if fields.len() < 4 {
        anyhow::bail!("cpu line has {} fields", fields.len());
    }
    let total: u64 = fields.iter().take(8).sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Ok((total - idle, total))
}

fn cpu_percent(prev: (u64, u64), cur: (u64, u64)) -> f64 {
    let total = cur.1.saturating_sub(prev.1);
    if total == 0 {
        return 0.0;
    }
    let busy = cur.0.saturating_sub(prev.0);
    100.0 * busy as f64 / total as f64
}

fn parse_mem_used(meminfo: &str) -> Result<f64> {
    let field = |name: &str| -> Result<u64> {
        let line = meminfo
            .lines()
            .find(|l| l.starts_with(name))
            .with_context(|| format!("no {} in meminfo", name))?;
        let kb = line
            .split_ascii_whitespace()
            .nth(1)
            .with_context(|| format!("malformed {} line", name))?;
        Ok(kb.parse::<u64>()?)
    };
    let used_kb = field("MemTotal:")?.saturating_sub(field("MemAvailable:")?);
    Ok((used_kb * 1024) as f64)
}

/// Received and transmitted bytes over every interface except loopback
fn parse_net_bytes(dev: &str) -> Result<(f64, f64)> {
    let mut rx = 0u64;
    let mut tx = 0u64;
    for line in dev.lines().skip(2) {
        let Some((iface, counters)) = line.split_once(':') else {
            continue;
        };
        if iface.trim() == "lo" {
            continue;
        }
        let fields: Vec<&str> = counters.split_ascii_whitespace().collect();
        if fields.len() < 9 {
            anyhow::bail!("malformed net/dev line for '{}'", iface.trim());
        }
        rx += fields[0].parse::<u64>()?;
        tx += fields[8].parse::<u64>()?;
    }
    Ok((rx as f64, tx as f64))
}

/// Bytes read and written by whole disks, partitions and virtual devices are skipped
fn parse_disk_bytes(diskstats: &str, skip: &Regex) -> Result<(f64, f64)> {
    let mut read = 0u64;
    let mut written = 0u64;
    for line in diskstats.lines() {
        let fields: Vec<&str> = line.split_ascii_whitespace().collect();
        if fields.len() < 10 || skip.is_match(fields[2]) {
            continue;
        }
        read += fields[5].parse::<u64>()? * 512;
        written += fields[9].parse::<u64>()? * 512;
    }
    Ok((read as f64, written as f64))
}

impl Backend for ProcfsBackend {
    fn id(&self) -> &str {
        Self::ID
    }
    fn name(&self) -> &str {
        "Linux procfs"
    }

    fn available_sensors(&self) -> BTreeMap<String, SensorDescriptor> {
        self.sensors.clone()
    }

    fn get_sensors(&self, ids: &BTreeSet<String>, tid: &TransactionId) -> Result<Vec<SensorHandle>> {
        let mut out = vec![];
        for id in ids {
            let desc = match self.sensors.get(id) {
                Some(d) => d,
                None => bail_error!(tid=tid, sensor=%id, "Unknown procfs sensor"),
            };
            let reader = match self.reader(id) {
                Ok(r) => r,
                Err(e) => bail_error!(tid=tid, sensor=%id, error=%e, "Failed to open procfs sensor"),
            };
            out.push(SensorHandle::new(id, Self::ID, desc.device_type, data_type(desc.unit), reader));
        }
        Ok(out)
    }

    fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([("root".to_string(), self.root.to_string_lossy().to_string().into())])
    }
}
