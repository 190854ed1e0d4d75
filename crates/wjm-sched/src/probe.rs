//! System resource discovery and the derived GPU allocation view.
//!
//! CPU and memory come from the host directly; GPU inventory comes from
//! `nvidia-smi` when it is installed, and an empty inventory otherwise.
//! The allocation map is never stored; it is derived from live records,
//! which is why GPU exclusivity is always evaluated under the scheduler
//! lock.

use std::collections::BTreeSet;

use serde::Serialize;
use sysinfo::System;
use thiserror::Error;
use tokio::process::Command;

use wjm_core::record::JobRecord;
use wjm_core::spec::GpuSpec;
use wjm_parsers::run_command;

#[derive(Debug, Clone, Serialize)]
pub struct GpuDevice {
    pub index: u32,
    pub name: String,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
    pub utilization_pct: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemResources {
    pub logical_cpus: usize,
    pub physical_cpus: usize,
    pub total_memory_bytes: u64,
    pub available_memory_bytes: u64,
    pub gpus: Vec<GpuDevice>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("not enough free GPUs: requested {requested}, free {free}")]
pub struct GpuResolveError {
    pub requested: usize,
    pub free: usize,
}

/// Probe CPUs, memory, and GPU inventory.
pub async fn probe_system() -> SystemResources {
    let sys = System::new_all();
    let logical_cpus = sys.cpus().len();
    SystemResources {
        logical_cpus,
        physical_cpus: sys.physical_core_count().unwrap_or(logical_cpus),
        total_memory_bytes: sys.total_memory(),
        available_memory_bytes: sys.available_memory(),
        gpus: probe_gpus().await,
    }
}

/// Total system memory, for resolving percent memory caps without a full
/// probe.
pub fn total_memory_bytes() -> u64 {
    let mut sys = System::new();
    sys.refresh_memory();
    sys.total_memory()
}

const NVIDIA_SMI_QUERY: &str = "index,name,memory.total,memory.used,utilization.gpu";

/// GPU inventory via nvidia-smi; empty when the tool is absent or fails.
pub async fn probe_gpus() -> Vec<GpuDevice> {
    let mut cmd = Command::new("nvidia-smi");
    cmd.args([
        &format!("--query-gpu={NVIDIA_SMI_QUERY}"),
        "--format=csv,noheader,nounits",
    ]);
    let stdout = match run_command(&mut cmd, "nvidia-smi").await {
        Ok(stdout) => stdout,
        Err(e) => {
            tracing::debug!(error = %e, "no GPU inventory");
            return Vec::new();
        }
    };

    let mut gpus = Vec::new();
    for line in stdout.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match parse_gpu_line(line) {
            Some(gpu) => gpus.push(gpu),
            None => tracing::warn!(line, "unparseable nvidia-smi line"),
        }
    }
    gpus
}

fn parse_gpu_line(line: &str) -> Option<GpuDevice> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != 5 {
        return None;
    }
    Some(GpuDevice {
        index: fields[0].parse().ok()?,
        name: fields[1].to_string(),
        memory_total_mb: fields[2].parse().ok()?,
        memory_used_mb: fields[3].parse().ok()?,
        utilization_pct: fields[4].parse().ok()?,
    })
}

/// Union of explicit GPU ids across the given records.
///
/// Callers pass live (RUNNING or PAUSED) records only; symbolic specs
/// never appear on a live record because dispatch resolves them.
pub fn allocated_gpus<'a>(records: impl IntoIterator<Item = &'a JobRecord>) -> BTreeSet<u32> {
    let mut allocated = BTreeSet::new();
    for record in records {
        if let GpuSpec::Ids(ids) = &record.gpu {
            allocated.extend(ids.iter().copied());
        }
    }
    allocated
}

/// Device ids present in the inventory but not allocated, ascending.
pub fn free_gpu_ids(gpus: &[GpuDevice], allocated: &BTreeSet<u32>) -> Vec<u32> {
    let mut free: Vec<u32> = gpus
        .iter()
        .map(|g| g.index)
        .filter(|i| !allocated.contains(i))
        .collect();
    free.sort_unstable();
    free
}

/// Resolve a spec to concrete device ids against the free list.
///
/// Explicit ids pass through untouched (conflicts are admission's call);
/// `auto`/`auto:K`/`any` pick the lowest-indexed free devices.
pub fn resolve_gpu_spec(spec: &GpuSpec, free: &[u32]) -> Result<Vec<u32>, GpuResolveError> {
    match spec {
        GpuSpec::None => Ok(Vec::new()),
        GpuSpec::Ids(ids) => Ok(ids.clone()),
        GpuSpec::Auto(k) => {
            if free.len() < *k {
                return Err(GpuResolveError {
                    requested: *k,
                    free: free.len(),
                });
            }
            Ok(free[..*k].to_vec())
        }
        GpuSpec::Any => {
            let Some(first) = free.first() else {
                return Err(GpuResolveError {
                    requested: 1,
                    free: 0,
                });
            };
            Ok(vec![*first])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(index: u32) -> GpuDevice {
        GpuDevice {
            index,
            name: "Test GPU".to_string(),
            memory_total_mb: 16384,
            memory_used_mb: 0,
            utilization_pct: 0,
        }
    }

    #[test]
    fn test_parse_gpu_line() {
        let gpu = parse_gpu_line("0, NVIDIA RTX A5000, 24564, 1210, 37").unwrap();
        assert_eq!(gpu.index, 0);
        assert_eq!(gpu.name, "NVIDIA RTX A5000");
        assert_eq!(gpu.memory_total_mb, 24564);
        assert_eq!(gpu.memory_used_mb, 1210);
        assert_eq!(gpu.utilization_pct, 37);
        assert!(parse_gpu_line("garbage").is_none());
    }

    #[test]
    fn test_free_gpu_ids() {
        let gpus = vec![device(0), device(1), device(2)];
        let allocated = BTreeSet::from([1]);
        assert_eq!(free_gpu_ids(&gpus, &allocated), vec![0, 2]);
    }

    #[test]
    fn test_resolve_auto_picks_lowest() {
        let free = vec![1, 3, 4];
        assert_eq!(resolve_gpu_spec(&GpuSpec::Auto(2), &free), Ok(vec![1, 3]));
        assert_eq!(resolve_gpu_spec(&GpuSpec::Any, &free), Ok(vec![1]));
        assert_eq!(
            resolve_gpu_spec(&GpuSpec::Auto(4), &free),
            Err(GpuResolveError {
                requested: 4,
                free: 3
            })
        );
    }

    #[test]
    fn test_resolve_explicit_passes_through() {
        // Conflicts with allocated devices are admission's decision.
        let resolved = resolve_gpu_spec(&GpuSpec::Ids(vec![0, 1]), &[]).unwrap();
        assert_eq!(resolved, vec![0, 1]);
    }

    #[test]
    fn test_probe_system_has_cpus() {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let resources = rt.block_on(probe_system());
        assert!(resources.logical_cpus > 0);
        assert!(resources.total_memory_bytes > 0);
    }
}
