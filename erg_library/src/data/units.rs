use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Joule,
    Watt,
    Byte,
    Second,
    Percent,
    /// Dimensionless, also used for currency
    Scalar,
    Gram,
}
impl Unit {
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Joule => "J",
            Unit::Watt => "W",
            Unit::Byte => "B",
            Unit::Second => "s",
            Unit::Percent => "%",
            Unit::Scalar => "",
            Unit::Gram => "g",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Power-of-ten prefix of a value
pub enum Magnitude {
    Pico,
    Nano,
    Micro,
    Milli,
    One,
    Kilo,
    Mega,
    Giga,
    Tera,
}
impl Magnitude {
    pub const ALL: [Magnitude; 9] = [
        Magnitude::Pico,
        Magnitude::Nano,
        Magnitude::Micro,
        Magnitude::Milli,
        Magnitude::One,
        Magnitude::Kilo,
        Magnitude::Mega,
        Magnitude::Giga,
        Magnitude::Tera,
    ];

    pub fn factor(&self) -> f64 {
        match self {
            Magnitude::Pico => 1e-12,
            Magnitude::Nano => 1e-9,
            Magnitude::Micro => 1e-6,
            Magnitude::Milli => 1e-3,
            Magnitude::One => 1.0,
            Magnitude::Kilo => 1e3,
            Magnitude::Mega => 1e6,
            Magnitude::Giga => 1e9,
            Magnitude::Tera => 1e12,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Magnitude::Pico => "p",
            Magnitude::Nano => "n",
            Magnitude::Micro => "µ",
            Magnitude::Milli => "m",
            Magnitude::One => "",
            Magnitude::Kilo => "k",
            Magnitude::Mega => "M",
            Magnitude::Giga => "G",
            Magnitude::Tera => "T",
        }
    }

    /// Factor to multiply a value in `self` by to express it in `to`.
    pub fn transform_factor(&self, to: Magnitude) -> f64 {
        self.factor() / to.factor()
    }

    /// The prefix that keeps `value` (given in `self`) between 1 and 1000 when shown.
    /// Values too small or too large for any prefix get the closest one.
    pub fn best_for(&self, value: f64) -> Magnitude {
        let base = (value * self.factor()).abs();
        if base == 0.0 || !base.is_finite() {
            return *self;
        }
        let mut best = Magnitude::Pico;
        for mag in Magnitude::ALL {
            if base >= mag.factor() {
                best = mag;
            }
        }
        best
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// Storage type a sensor natively reports in
pub enum NumericKind {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}
impl NumericKind {
    pub fn is_unsigned(&self) -> bool {
        matches!(self, NumericKind::U8 | NumericKind::U16 | NumericKind::U32 | NumericKind::U64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
/// Unit, range, and overflow convention of a sensor or metric
pub struct MetricMetadata {
    pub unit: Unit,
    pub mag: Magnitude,
    pub kind: NumericKind,
    /// Smallest valid reading.
    pub min: f64,
    /// Largest valid reading. For counters this is the wrap-around point.
    pub max: f64,
    /// Recorded in place of a reading that failed.
    pub fill: f64,
}
impl MetricMetadata {
    pub fn new(unit: Unit, mag: Magnitude, kind: NumericKind, min: f64, max: f64, fill: f64) -> Self {
        MetricMetadata {
            unit,
            mag,
            kind,
            min,
            max,
            fill,
        }
    }

    /// Metadata for a value computed by the pipeline rather than read from hardware.
    pub fn derived(unit: Unit, mag: Magnitude) -> Self {
        MetricMetadata::new(unit, mag, NumericKind::F64, 0.0, f64::MAX, 0.0)
    }

    pub fn seconds() -> Self {
        Self::derived(Unit::Second, Magnitude::One)
    }

    /// True if `value` is the fill value recorded for a failed read.
    /// A fill value inside the valid range `[min, max)` is indistinguishable from a reading and never matches.
    pub fn is_fill(&self, value: f64) -> bool {
        value == self.fill && !(self.min <= value && value < self.max)
    }

    /// Same metadata, but describing values already scaled to [Magnitude::One].
    pub fn normalized(&self) -> Self {
        let f = self.mag.factor();
        MetricMetadata {
            mag: Magnitude::One,
            min: self.min * f,
            max: self.max * f,
            fill: self.fill * f,
            ..*self
        }
    }
}

/// Human readable rendering, e.g. `12.346 kJ`.
/// `value` is in `md.mag`.
pub fn format_value(value: f64, md: &MetricMetadata) -> String {
    let best = md.mag.best_for(value);
    let shown = value * md.mag.transform_factor(best);
    format!("{:.3} {}{}", shown, best.symbol(), md.unit.symbol())
}
