//! Resource specification grammars.
//!
//! These are the value grammars shared by script directives, CLI flags,
//! and the on-disk record fields: GPU lists, CPU affinity, memory caps,
//! and retry exit-code filters. All of them render back to the exact
//! field form via `to_field`, with `N/A` standing for "not set".

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder for unset fields in records and sidecars.
pub const NOT_APPLICABLE: &str = "N/A";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SpecError {
    #[error("invalid GPU spec '{0}': expected comma list of ids, 'auto', 'auto:K', or 'any'")]
    Gpu(String),
    #[error("invalid CPU spec '{0}': expected count, range a-b, or comma list")]
    Cpu(String),
    #[error("invalid memory spec '{0}': expected <num><K|M|G|T|%>")]
    Memory(String),
    #[error("invalid retry-on spec '{0}': expected comma list of exit codes or 'any'")]
    RetryOn(String),
}

/// GPU assignment requested by a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum GpuSpec {
    /// No GPUs requested.
    #[default]
    None,
    /// Explicit device ids.
    Ids(Vec<u32>),
    /// Pick the K lowest-indexed free devices (`auto` = 1).
    Auto(usize),
    /// Pick any single free device.
    Any,
}

impl GpuSpec {
    /// Whether resolution against the free list is deferred to dispatch.
    pub fn is_symbolic(&self) -> bool {
        matches!(self, GpuSpec::Auto(_) | GpuSpec::Any)
    }

    /// Number of devices this spec will occupy once resolved.
    pub fn device_count(&self) -> usize {
        match self {
            GpuSpec::None => 0,
            GpuSpec::Ids(ids) => ids.len(),
            GpuSpec::Auto(k) => *k,
            GpuSpec::Any => 1,
        }
    }

    pub fn to_field(&self) -> String {
        match self {
            GpuSpec::None => NOT_APPLICABLE.to_string(),
            GpuSpec::Ids(ids) => ids
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
            GpuSpec::Auto(1) => "auto".to_string(),
            GpuSpec::Auto(k) => format!("auto:{k}"),
            GpuSpec::Any => "any".to_string(),
        }
    }
}

impl FromStr for GpuSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == NOT_APPLICABLE {
            return Ok(GpuSpec::None);
        }
        if s == "auto" {
            return Ok(GpuSpec::Auto(1));
        }
        if let Some(k) = s.strip_prefix("auto:") {
            let k: usize = k.parse().map_err(|_| SpecError::Gpu(s.to_string()))?;
            if k == 0 {
                return Err(SpecError::Gpu(s.to_string()));
            }
            return Ok(GpuSpec::Auto(k));
        }
        if s == "any" {
            return Ok(GpuSpec::Any);
        }
        let mut ids = Vec::new();
        for part in s.split(',') {
            let id: u32 = part
                .trim()
                .parse()
                .map_err(|_| SpecError::Gpu(s.to_string()))?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        if ids.is_empty() {
            return Err(SpecError::Gpu(s.to_string()));
        }
        Ok(GpuSpec::Ids(ids))
    }
}

impl fmt::Display for GpuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_field())
    }
}

/// CPU affinity requested by a job.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CpuSpec {
    #[default]
    None,
    /// First N logical CPUs (`0..N-1`).
    Count(u32),
    /// Inclusive range `a-b`.
    Range(u32, u32),
    /// Explicit list.
    List(Vec<u32>),
}

impl CpuSpec {
    /// Concrete CPU ids for the affinity wrapper.
    pub fn cpu_ids(&self) -> Option<Vec<u32>> {
        match self {
            CpuSpec::None => None,
            CpuSpec::Count(n) => Some((0..*n).collect()),
            CpuSpec::Range(a, b) => Some((*a..=*b).collect()),
            CpuSpec::List(ids) => Some(ids.clone()),
        }
    }

    pub fn to_field(&self) -> String {
        match self {
            CpuSpec::None => NOT_APPLICABLE.to_string(),
            CpuSpec::Count(n) => n.to_string(),
            CpuSpec::Range(a, b) => format!("{a}-{b}"),
            CpuSpec::List(ids) => ids
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl FromStr for CpuSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == NOT_APPLICABLE {
            return Ok(CpuSpec::None);
        }
        if let Some((a, b)) = s.split_once('-') {
            let a: u32 = a.trim().parse().map_err(|_| SpecError::Cpu(s.to_string()))?;
            let b: u32 = b.trim().parse().map_err(|_| SpecError::Cpu(s.to_string()))?;
            if a > b {
                return Err(SpecError::Cpu(s.to_string()));
            }
            return Ok(CpuSpec::Range(a, b));
        }
        if s.contains(',') {
            let ids = s
                .split(',')
                .map(|p| p.trim().parse::<u32>())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|_| SpecError::Cpu(s.to_string()))?;
            return Ok(CpuSpec::List(ids));
        }
        let n: u32 = s.parse().map_err(|_| SpecError::Cpu(s.to_string()))?;
        if n == 0 {
            return Err(SpecError::Cpu(s.to_string()));
        }
        Ok(CpuSpec::Count(n))
    }
}

impl fmt::Display for CpuSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_field())
    }
}

/// Virtual-memory cap requested by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum MemorySpec {
    #[default]
    None,
    /// Absolute cap in bytes.
    Bytes(u64),
    /// Percentage of total system memory.
    Percent(u8),
}

impl MemorySpec {
    /// Resolve to bytes given the machine's total memory.
    pub fn resolve_bytes(&self, total_memory_bytes: u64) -> Option<u64> {
        match self {
            MemorySpec::None => None,
            MemorySpec::Bytes(b) => Some(*b),
            MemorySpec::Percent(p) => Some(total_memory_bytes / 100 * u64::from(*p)),
        }
    }

    pub fn to_field(&self) -> String {
        match self {
            MemorySpec::None => NOT_APPLICABLE.to_string(),
            MemorySpec::Bytes(b) => format_bytes(*b),
            MemorySpec::Percent(p) => format!("{p}%"),
        }
    }
}

/// Render bytes with the largest exact binary suffix.
fn format_bytes(bytes: u64) -> String {
    const UNITS: [(u64, char); 4] = [
        (1 << 40, 'T'),
        (1 << 30, 'G'),
        (1 << 20, 'M'),
        (1 << 10, 'K'),
    ];
    for (factor, suffix) in UNITS {
        if bytes >= factor && bytes % factor == 0 {
            return format!("{}{}", bytes / factor, suffix);
        }
    }
    bytes.to_string()
}

impl FromStr for MemorySpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == NOT_APPLICABLE {
            return Ok(MemorySpec::None);
        }
        if let Some(p) = s.strip_suffix('%') {
            let p: u8 = p.parse().map_err(|_| SpecError::Memory(s.to_string()))?;
            if p == 0 || p > 100 {
                return Err(SpecError::Memory(s.to_string()));
            }
            return Ok(MemorySpec::Percent(p));
        }
        // Optional trailing B: "512MB" and "512M" are equivalent.
        let trimmed = s.strip_suffix(['B', 'b']).unwrap_or(s);
        let (num, factor) = match trimmed.chars().last() {
            Some('K' | 'k') => (&trimmed[..trimmed.len() - 1], 1u64 << 10),
            Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1u64 << 20),
            Some('G' | 'g') => (&trimmed[..trimmed.len() - 1], 1u64 << 30),
            Some('T' | 't') => (&trimmed[..trimmed.len() - 1], 1u64 << 40),
            _ => (trimmed, 1),
        };
        let value: u64 = num
            .trim()
            .parse()
            .map_err(|_| SpecError::Memory(s.to_string()))?;
        if value == 0 {
            return Err(SpecError::Memory(s.to_string()));
        }
        Ok(MemorySpec::Bytes(value * factor))
    }
}

impl fmt::Display for MemorySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_field())
    }
}

/// Which exit codes trigger the retry loop.
///
/// An empty or absent directive means the same as `any`: retry on every
/// nonzero exit. The distinction existed in the source but both spellings
/// always behaved identically.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetryOn {
    #[default]
    AnyNonzero,
    Codes(Vec<i32>),
}

impl RetryOn {
    pub fn matches(&self, exit_code: i32) -> bool {
        if exit_code == 0 {
            return false;
        }
        match self {
            RetryOn::AnyNonzero => true,
            RetryOn::Codes(codes) => codes.contains(&exit_code),
        }
    }

    pub fn to_field(&self) -> String {
        match self {
            RetryOn::AnyNonzero => "any".to_string(),
            RetryOn::Codes(codes) => codes
                .iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

impl FromStr for RetryOn {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() || s == NOT_APPLICABLE || s == "any" {
            return Ok(RetryOn::AnyNonzero);
        }
        let codes = s
            .split(',')
            .map(|p| p.trim().parse::<i32>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| SpecError::RetryOn(s.to_string()))?;
        Ok(RetryOn::Codes(codes))
    }
}

impl fmt::Display for RetryOn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_field())
    }
}
