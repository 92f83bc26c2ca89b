use std::collections::BTreeMap;
use std::fmt;

/// Scalar written into the domain XML.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => f.write_str(s),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => f.write_str(&format_float(*x)),
            // libvirt spells booleans yes/no
            Value::Bool(true) => f.write_str("yes"),
            Value::Bool(false) => f.write_str("no"),
        }
    }
}

/// Shortest round-tripping form with a signed, two digit exponent: `1.5`, `1e+16`, `1e-07`.
fn format_float(x: f64) -> String {
    if x.is_nan() {
        return "nan".to_string();
    }
    let repr = format!("{x:?}");
    match repr.split_once('e') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(digits) => ('-', digits),
                None => ('+', exponent),
            };
            format!("{mantissa}e{sign}{digits:0>2}")
        }
        None => repr,
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Str(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Str(value)
    }
}

impl From<&String> for Value {
    fn from(value: &String) -> Self {
        Value::Str(value.clone())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<u32> for Value {
    fn from(value: u32) -> Self {
        Value::Int(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

/// Attribute name/value pairs, applied in order.
pub type Attributes = Vec<(String, Value)>;

macro_rules! attributes {
    ($($k:expr => $v:expr),* $(,)?) => {{
        vec![$(($k.to_string(), $crate::structs::Value::from($v)),)*]
    }};
}
pub(crate) use attributes;

/// Settings merged into a domain definition. `None` and empty collections leave the
/// matching part of the document as it was.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TuningConfig {
    pub cpu: Option<CpuConfig>,
    pub numatune: Option<NumaTuneConfig>,
    pub mem: Option<MemConfig>,
    pub hypervisor_features: Option<HypervisorFeatures>,
    pub clock: Option<ClockConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Custom,
    HostModel,
    HostPassthrough,
    Maximum,
}

impl CpuMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CpuMode::Custom => "custom",
            CpuMode::HostModel => "host-model",
            CpuMode::HostPassthrough => "host-passthrough",
            CpuMode::Maximum => "maximum",
        }
    }

    /// The `match` attribute of `<cpu>` only applies to custom models.
    pub fn excludes_match(&self) -> bool {
        matches!(self, CpuMode::HostModel | CpuMode::HostPassthrough)
    }
}

impl fmt::Display for CpuMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<CpuMode> for Value {
    fn from(mode: CpuMode) -> Self {
        Value::Str(mode.as_str().to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CpuConfig {
    pub placement: Option<String>,
    /// Maximum number of vcpus.
    pub maximum: Option<u32>,
    pub topology: Option<CpuTopology>,
    pub mode: Option<CpuMode>,
    pub check: Option<String>,
    /// Feature name and policy, in document order.
    pub features: Vec<(String, String)>,
    pub tuning: Option<CpuTuning>,
    /// Guest NUMA cells keyed by cell id.
    pub numa: BTreeMap<u32, NumaCell>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTopology {
    pub sockets: Option<u32>,
    pub cores: Option<u32>,
    pub threads: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CpuTuning {
    /// vcpu id to host cpuset.
    pub vcpupin: BTreeMap<u32, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NumaCell {
    pub cpus: Option<String>,
    /// `"<value> <unit>"`; only MiB amounts are written.
    pub memory: Option<String>,
    /// Distance to each cell, keyed by sibling cell id.
    pub distances: BTreeMap<u32, u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NumaTuneConfig {
    pub memory: Option<NumaMemory>,
    /// Attributes of each `memnode`, keyed by cell id.
    pub memnodes: BTreeMap<u32, Attributes>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NumaMemory {
    pub mode: Option<String>,
    pub nodeset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemConfig {
    /// `"<value> <unit>"`
    pub boot: Option<String>,
    pub current: Option<String>,
    /// `Some(false)` removes an existing `nosharepages`, `None` leaves it alone.
    pub nosharepages: Option<bool>,
    pub hugepages: Vec<HugePage>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HugePage {
    pub size: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HypervisorFeatures {
    /// Only ever switches the hint on.
    pub kvm_hint_dedicated: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClockConfig {
    /// Timer name and its attributes, in document order.
    pub timers: Vec<(String, Attributes)>,
}

/// Host NUMA cell as reported by the hypervisor capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cell {
    pub id: u32,
    pub cpus: Vec<HostCpu>,
    pub memory_kib: u64,
    pub distances: BTreeMap<u32, u32>,
    pub pages: Vec<PageInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostCpu {
    pub id: u32,
    pub socket_id: u32,
    pub core_id: u32,
    /// Comma separated ids of the logical cpus sharing this core.
    pub siblings: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub size_kib: u64,
    pub count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_serialization() {
        assert_eq!(Value::from(true).to_string(), "yes");
        assert_eq!(Value::from(false).to_string(), "no");
        assert_eq!(Value::from(16u32).to_string(), "16");
        assert_eq!(Value::from(-3i64).to_string(), "-3");
        assert_eq!(Value::from(1.5).to_string(), "1.5");
        assert_eq!(Value::from(1e16).to_string(), "1e+16");
        assert_eq!(Value::from(1e-7).to_string(), "1e-07");
        assert_eq!(Value::from(2.5e-300).to_string(), "2.5e-300");
        assert_eq!(Value::from(1e15).to_string(), "1000000000000000.0");
        assert_eq!(Value::from("catchup").to_string(), "catchup");
        assert_eq!(Value::from(CpuMode::HostPassthrough).to_string(), "host-passthrough");
    }

    #[test]
    fn attributes_macro_keeps_order() {
        let attrs: Attributes = attributes! { "present" => false, "tickpolicy" => "catchup" };
        assert_eq!(
            attrs,
            vec![
                ("present".to_string(), Value::Bool(false)),
                ("tickpolicy".to_string(), Value::Str("catchup".to_string())),
            ]
        );
    }

    #[test]
    fn match_exclusion() {
        assert!(CpuMode::HostModel.excludes_match());
        assert!(CpuMode::HostPassthrough.excludes_match());
        assert!(!CpuMode::Custom.excludes_match());
        assert!(!CpuMode::Maximum.excludes_match());
    }
}
