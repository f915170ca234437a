//! Turns raw sensor samples into metrics and rolls them up the result tree.
use crate::data::{
    AggregateType, DeviceType, Magnitude, Metric, MetricMetadata, MetricType, MetricValue, NodeType, RawData,
    Region, ResultNode, Stats, Unit,
};
use crate::errors::ProcessingError;
use crate::monitor_config::PostProcessingConfig;
use crate::transaction::TransactionId;
use anyhow::Result;
use std::collections::BTreeMap;
use tracing::{debug, trace};

const JOULES_PER_KWH: f64 = 3.6e6;

/// Samples of a sensor scaled to [Magnitude::One], with failed reads removed.
struct Series {
    t: Vec<f64>,
    x: Vec<f64>,
}
impl Series {
    fn from_raw(raw: &RawData) -> Self {
        let t_f = raw.t_md.mag.factor();
        let x_f = raw.v_md.mag.factor();
        let (t, x): (Vec<f64>, Vec<f64>) = raw
            .timesteps
            .iter()
            .zip(raw.values.iter())
            .filter(|(_, v)| !raw.v_md.is_fill(**v))
            .map(|(t, v)| (t * t_f, v * x_f))
            .unzip();
        Series { t, x }
    }
}

/// Difference between two counter readings, assuming at most one wrap-around at `max`.
fn counter_delta(prev: f64, next: f64, max: f64) -> f64 {
    let d = next - prev;
    match d < 0.0 {
        true => d + max,
        false => d,
    }
}

/// Total energy in Joules and average power in Watts of an energy counter.
pub fn energy_from_counter(t: &[f64], x: &[f64], max: f64) -> (f64, f64) {
    if x.len() < 2 {
        return (0.0, 0.0);
    }
    let energy: f64 = x.windows(2).map(|w| counter_delta(w[0], w[1], max)).sum();
    let elapsed = t[t.len() - 1] - t[0];
    let power = match elapsed > 0.0 {
        true => energy / elapsed,
        false => 0.0,
    };
    (energy, power)
}

/// Total energy in Joules and average power in Watts of a power series.
pub fn energy_from_power(t: &[f64], x: &[f64]) -> (f64, f64) {
    if x.is_empty() {
        return (0.0, 0.0);
    }
    let energy: f64 = t
        .windows(2)
        .zip(x.windows(2))
        .map(|(t, x)| (t[1] - t[0]) * (x[0] + x[1]) / 2.0)
        .sum();
    (energy, mean(x))
}

/// Instantaneous power of an energy counter, one value per sample.
/// The first sample repeats the power of the first interval.
fn counter_to_power(t: &[f64], x: &[f64], max: f64) -> Vec<f64> {
    let mut p: Vec<f64> = t
        .windows(2)
        .zip(x.windows(2))
        .map(|(t, x)| {
            let dt = t[1] - t[0];
            match dt > 0.0 {
                true => counter_delta(x[0], x[1], max) / dt,
                false => 0.0,
            }
        })
        .collect();
    if let Some(first) = p.first().copied() {
        p.insert(0, first);
    }
    p
}

fn mean(x: &[f64]) -> f64 {
    match x.is_empty() {
        true => 0.0,
        false => x.iter().sum::<f64>() / x.len() as f64,
    }
}

/// Clip a series to `[start, end]`, inserting linearly interpolated samples at both edges.
/// Outside the series the first or last value is held.
pub fn interpolated_window(t: &[f64], x: &[f64], start: f64, end: f64) -> (Vec<f64>, Vec<f64>) {
    if t.is_empty() || t.len() != x.len() {
        return (vec![], vec![]);
    }
    let mut new_t = Vec::with_capacity(t.len() + 2);
    new_t.push(start);
    new_t.extend(t.iter().copied().filter(|v| *v >= start && *v <= end));
    new_t.push(end);
    let new_x = new_t.iter().map(|q| interp(*q, t, x)).collect();
    (new_t, new_x)
}

fn interp(q: f64, t: &[f64], x: &[f64]) -> f64 {
    let last = t.len() - 1;
    if q <= t[0] {
        return x[0];
    }
    if q >= t[last] {
        return x[last];
    }
    let hi = t.partition_point(|v| *v <= q);
    let lo = hi - 1;
    if t[hi] == t[lo] {
        return x[lo];
    }
    x[lo] + (x[hi] - x[lo]) * (q - t[lo]) / (t[hi] - t[lo])
}

fn energy_kinds(device: Option<DeviceType>) -> Option<(MetricType, MetricType)> {
    match device {
        Some(DeviceType::Cpu) => Some((MetricType::CpuEnergy, MetricType::CpuPower)),
        Some(DeviceType::Gpu) => Some((MetricType::GpuEnergy, MetricType::GpuPower)),
        Some(DeviceType::Ram) => Some((MetricType::DramEnergy, MetricType::DramPower)),
        Some(DeviceType::Other) => Some((MetricType::OtherEnergy, MetricType::OtherPower)),
        _ => None,
    }
}

fn insert(metrics: &mut BTreeMap<MetricType, MetricValue>, m: Metric) {
    metrics.insert(m.kind, MetricValue::Metric(m));
}

/// Derive metrics of a sensor node from its raw data.
/// Nodes without raw data are left untouched.
pub fn process_sensor_data(node: &mut ResultNode) -> Result<()> {
    let raw = match (&node.kind, &node.raw_data) {
        (NodeType::Sensor, Some(raw)) => raw,
        _ => return Ok(()),
    };
    let mut metrics = BTreeMap::new();
    let runtime = raw.timesteps.last().copied().unwrap_or(0.0) * raw.t_md.mag.factor();
    insert(
        &mut metrics,
        Metric::new(MetricType::Runtime, runtime, raw.t_md.normalized(), AggregateType::Max),
    );

    let series = Series::from_raw(raw);
    let v_md = raw.v_md.normalized();
    match raw.v_md.unit {
        Unit::Joule | Unit::Watt => {
            let (energy, power) = match raw.v_md.unit {
                Unit::Joule => energy_from_counter(&series.t, &series.x, v_md.max),
                _ => energy_from_power(&series.t, &series.x),
            };
            let e = Metric::derived(MetricType::Energy, energy, Unit::Joule, AggregateType::Sum);
            let p = Metric::derived(MetricType::Power, power, Unit::Watt, AggregateType::Sum);
            if let Some((ek, pk)) = energy_kinds(node.device_type) {
                insert(&mut metrics, Metric { kind: ek, ..e.clone() });
                insert(&mut metrics, Metric { kind: pk, ..p.clone() });
            }
            insert(&mut metrics, e);
            insert(&mut metrics, p);
        },
        Unit::Percent => {
            let kind = match node.device_type {
                Some(DeviceType::Cpu) => MetricType::CpuUtil,
                Some(DeviceType::Gpu) => MetricType::GpuUtil,
                _ => MetricType::OtherUtil,
            };
            insert(&mut metrics, Metric::new(kind, mean(&series.x), v_md, AggregateType::Mean));
        },
        Unit::Byte => {
            let reads = node.id.contains("READ");
            let counted = |read: MetricType, write: MetricType| match reads {
                true => read,
                false => write,
            };
            let (kind, value) = match node.device_type {
                Some(DeviceType::Net) => (
                    counted(MetricType::NetRead, MetricType::NetWrite),
                    series.x.windows(2).map(|w| counter_delta(w[0], w[1], v_md.max)).sum::<f64>(),
                ),
                Some(DeviceType::Disk) => (
                    counted(MetricType::DiskRead, MetricType::DiskWrite),
                    series.x.windows(2).map(|w| counter_delta(w[0], w[1], v_md.max)).sum::<f64>(),
                ),
                Some(DeviceType::Gpu) => (MetricType::GpuMem, mean(&series.x)),
                Some(DeviceType::Ram) => (MetricType::DramMem, mean(&series.x)),
                _ => (MetricType::OtherMem, mean(&series.x)),
            };
            insert(&mut metrics, Metric::new(kind, value, v_md, AggregateType::Sum));
        },
        Unit::Second | Unit::Scalar | Unit::Gram => (),
    }
    node.metrics = metrics;
    node.processed = true;
    Ok(())
}

fn combine(metrics: &[&Metric]) -> Result<Metric> {
    let first = match metrics.first() {
        Some(m) => *m,
        None => {
            return Err(ProcessingError {
                message: "cannot combine zero metrics".to_string(),
            }
            .into())
        },
    };
    let values = metrics.iter().map(|m| m.value);
    let value: f64 = match first.aggregation {
        AggregateType::Sum => values.sum(),
        AggregateType::Mean => values.sum::<f64>() / metrics.len() as f64,
        AggregateType::Max => values.fold(f64::NEG_INFINITY, f64::max),
        AggregateType::Min => values.fold(f64::INFINITY, f64::min),
    };
    Ok(Metric::new(first.kind, value, first.metadata, first.aggregation))
}

fn group_metrics<'a>(
    nodes: impl Iterator<Item = &'a ResultNode>,
) -> Result<BTreeMap<MetricType, Vec<&'a Metric>>> {
    let mut grouped: BTreeMap<MetricType, Vec<&Metric>> = BTreeMap::new();
    for n in nodes {
        for (kind, value) in &n.metrics {
            if let MetricValue::Metric(m) = value {
                if m.kind != *kind {
                    return Err(ProcessingError {
                        message: format!("metric '{}' stored under '{}' in node '{}'", m.kind, kind, n.id),
                    }
                    .into());
                }
                grouped.entry(*kind).or_default().push(m);
            }
        }
    }
    Ok(grouped)
}

/// Stats per metric kind over the metrics of `runs`.
pub fn aggregate_multi_run<'a>(runs: impl Iterator<Item = &'a ResultNode>) -> Result<BTreeMap<MetricType, Stats>> {
    group_metrics(runs)?
        .into_iter()
        .map(|(kind, ms)| Ok((kind, Stats::from_metrics(&ms)?)))
        .collect()
}

/// Derive the metrics of `node` and every unprocessed node below it.
/// Already processed nodes are left as they are unless `force` is set.
pub fn process_data_node(
    node: &mut ResultNode,
    cfg: &PostProcessingConfig,
    force: bool,
    tid: &TransactionId,
) -> Result<()> {
    if node.processed && !force {
        trace!(tid=tid, node=%node.id, "Already processed");
        return Ok(());
    }
    if node.kind == NodeType::Sensor {
        return process_sensor_data(node);
    }
    for child in node.children_mut() {
        if !child.processed || force {
            process_data_node(child, cfg, force, tid)?;
        }
    }

    let mut metrics = BTreeMap::new();
    match node.kind {
        NodeType::MultiRun => {
            for (kind, s) in aggregate_multi_run(node.children().iter())? {
                metrics.insert(kind, MetricValue::Stats(s));
            }
        },
        NodeType::App => {
            let runs = node.children().iter().flat_map(|mr| mr.children().iter());
            for (kind, s) in aggregate_multi_run(runs)? {
                metrics.insert(kind, MetricValue::Stats(s));
            }
        },
        _ => {
            for (kind, ms) in group_metrics(node.children().iter())? {
                metrics.insert(kind, MetricValue::Metric(combine(&ms)?));
            }
        },
    }

    match node.kind {
        NodeType::Host => add_power_overhead(&mut metrics, cfg.power_overhead),
        NodeType::Run => add_energy_costs(&mut metrics, cfg),
        _ => (),
    }
    node.metrics = metrics;

    if node.kind == NodeType::Run {
        if let Some(mut regions) = node.regions.take() {
            let r = process_regions(&mut regions, node, force, tid);
            node.regions = Some(regions);
            r?;
        }
    }
    node.processed = true;
    debug!(tid=tid, node=%node.id, kind=?node.kind, metrics=node.metrics.len(), "Processed node");
    Ok(())
}

fn metric_mut(metrics: &mut BTreeMap<MetricType, MetricValue>, kind: MetricType) -> Option<&mut Metric> {
    match metrics.get_mut(&kind) {
        Some(MetricValue::Metric(m)) => Some(m),
        _ => None,
    }
}

/// Constant draw of components no sensor covers.
fn add_power_overhead(metrics: &mut BTreeMap<MetricType, MetricValue>, overhead: f64) {
    if overhead == 0.0 {
        return;
    }
    let runtime = match metrics.get(&MetricType::Runtime) {
        Some(r) => r.value(),
        None => 0.0,
    };
    match metric_mut(metrics, MetricType::Power) {
        Some(p) => p.value += overhead,
        None => return,
    }
    if let Some(e) = metric_mut(metrics, MetricType::Energy) {
        e.value += runtime * overhead;
    }
}

/// Scale energy by the PUE and derive price and emissions.
fn add_energy_costs(metrics: &mut BTreeMap<MetricType, MetricValue>, cfg: &PostProcessingConfig) {
    let energy = match metric_mut(metrics, MetricType::Energy) {
        Some(e) => {
            e.value *= cfg.pue;
            e.value
        },
        None => return,
    };
    let kwh = energy / JOULES_PER_KWH;
    insert(
        metrics,
        Metric::derived(MetricType::Money, kwh * cfg.price_factor, Unit::Scalar, AggregateType::Sum),
    );
    insert(
        metrics,
        Metric::new(
            MetricType::Co2,
            kwh * cfg.emissions_factor,
            MetricMetadata::derived(Unit::Gram, Magnitude::Kilo),
            AggregateType::Sum,
        ),
    );
}

fn stats_of(kind: MetricType, unit: Unit, values: Vec<f64>) -> Option<Stats> {
    if values.is_empty() {
        return None;
    }
    Some(Stats::from_values(
        kind,
        MetricMetadata::derived(unit, Magnitude::One),
        values.into_iter(),
    ))
}

/// Runtime and occurrence counts of every region, plus the power and CPU utilization
/// of each rank's host inside every occurrence.
fn process_regions(
    regions: &mut BTreeMap<String, Region>,
    run: &ResultNode,
    force: bool,
    tid: &TransactionId,
) -> Result<()> {
    for region in regions.values_mut() {
        if region.processed && !force {
            continue;
        }
        let mut runs = vec![];
        let mut runtimes = vec![];
        let mut power = vec![];
        let mut util = vec![];
        for (rank, events) in &region.raw_data {
            runs.push((events.len() / 2) as f64);
            let windows: Vec<(f64, f64)> = events.chunks_exact(2).map(|w| (w[0], w[1])).collect();
            runtimes.extend(windows.iter().map(|(s, e)| e - s));
            let host = match host_of_rank(run, *rank) {
                Some(h) => h,
                None => {
                    debug!(tid=tid, rank=rank, region=%region.id, "No host data for rank");
                    continue;
                },
            };
            for (start, end) in &windows {
                let (p, u) = host_window(host.0, host.1, *start, *end);
                if let Some(p) = p {
                    power.push(p);
                }
                if let Some(u) = u {
                    util.push(u);
                }
            }
        }
        region.runs_per_rank = stats_of(MetricType::NRuns, Unit::Scalar, runs);
        region.metrics.clear();
        let derived = [
            stats_of(MetricType::Runtime, Unit::Second, runtimes),
            stats_of(MetricType::Power, Unit::Watt, power),
            stats_of(MetricType::CpuUtil, Unit::Percent, util),
        ];
        for s in derived.into_iter().flatten() {
            region.metrics.insert(s.kind, s);
        }
        region.processed = true;
    }
    Ok(())
}

/// The host node sampling for `rank`, with that rank's round start in unix nanoseconds.
fn host_of_rank(run: &ResultNode, rank: usize) -> Option<(&ResultNode, u64)> {
    for host in run.children() {
        let ranks = host.metadata.get("ranks").and_then(|r| r.as_array());
        let starts = host.metadata.get("round_start_ns").and_then(|r| r.as_array());
        if let (Some(ranks), Some(starts)) = (ranks, starts) {
            for (r, s) in ranks.iter().zip(starts.iter()) {
                if r.as_u64() == Some(rank as u64) {
                    return s.as_u64().map(|s| (host, s));
                }
            }
        }
    }
    None
}

/// Summed power and CPU utilization of a host's sensors inside `[start, end]`,
/// given in seconds since `round_start_ns`.
fn host_window(host: &ResultNode, round_start_ns: u64, start: f64, end: f64) -> (Option<f64>, Option<f64>) {
    let mut power = None;
    let mut util = None;
    let mut visit = |n: &ResultNode| {
        let raw = match &n.raw_data {
            Some(r) => r,
            None => return,
        };
        let offset = (round_start_ns as i128 - raw.start_ns as i128) as f64 / 1e9;
        let series = Series::from_raw(raw);
        if series.t.is_empty() {
            return;
        }
        let (ws, we) = (start + offset, end + offset);
        match (raw.v_md.unit, n.device_type) {
            (Unit::Joule, Some(DeviceType::Cpu | DeviceType::Gpu | DeviceType::Ram)) => {
                let p = counter_to_power(&series.t, &series.x, raw.v_md.normalized().max);
                let (_, p) = interpolated_window(&series.t, &p, ws, we);
                *power.get_or_insert(0.0) += mean(&p);
            },
            (Unit::Watt, Some(DeviceType::Cpu | DeviceType::Gpu | DeviceType::Ram)) => {
                let (_, p) = interpolated_window(&series.t, &series.x, ws, we);
                *power.get_or_insert(0.0) += mean(&p);
            },
            (Unit::Percent, Some(DeviceType::Cpu)) => {
                let (_, u) = interpolated_window(&series.t, &series.x, ws, we);
                *util.get_or_insert(0.0) += mean(&u);
            },
            _ => (),
        }
    };
    host.walk(&mut visit);
    (power, util)
}
