//! Capacity admission: may this job start right now?
//!
//! Pure decision logic over the current usage snapshot. Callers hold the
//! `Scheduler` lock for the full decision-plus-dispatch section, except
//! on the drain path, which is already serialized by `QueueDrain` and
//! must not acquire `Scheduler` on top (lock order forbids it).

use std::collections::BTreeSet;

use wjm_core::record::JobId;
use wjm_core::spec::GpuSpec;
use wjm_core::Config;

use crate::probe::resolve_gpu_spec;
use crate::scan::RunningUsage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionRequest<'a> {
    pub weight: u32,
    pub gpu: &'a GpuSpec,
    pub dependencies: &'a [JobId],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Admitted; symbolic GPU specs are resolved to these device ids.
    Start { gpu_ids: Vec<u32> },
    /// Refused for now; the reason becomes the queue entry's
    /// human-readable `queue_reason`.
    Defer { reason: String },
}

/// Evaluate one candidate against current usage.
///
/// `free_gpus` must already exclude every allocated device.
pub fn evaluate(
    config: &Config,
    usage: &RunningUsage,
    free_gpus: &[u32],
    completed: &BTreeSet<JobId>,
    request: &AdmissionRequest<'_>,
) -> AdmissionOutcome {
    if config.max_concurrent_jobs > 0 && usage.count >= config.max_concurrent_jobs {
        return AdmissionOutcome::Defer {
            reason: format!(
                "concurrent job limit reached ({} running, limit {})",
                usage.count, config.max_concurrent_jobs
            ),
        };
    }

    if config.max_total_weight > 0 {
        let proposed = usage.weight + u64::from(request.weight);
        if proposed > u64::from(config.max_total_weight) {
            return AdmissionOutcome::Defer {
                reason: format!(
                    "weight limit: {}+{}={} exceeds {}",
                    usage.weight, request.weight, proposed, config.max_total_weight
                ),
            };
        }
    }

    if let GpuSpec::Ids(ids) = request.gpu {
        let conflicts: Vec<u32> = ids.iter().copied().filter(|i| usage.gpus.contains(i)).collect();
        if !conflicts.is_empty() {
            let list = conflicts
                .iter()
                .map(|i| i.to_string())
                .collect::<Vec<_>>()
                .join(",");
            return AdmissionOutcome::Defer {
                reason: format!("GPU {list} in use"),
            };
        }
    }
    let gpu_ids = match resolve_gpu_spec(request.gpu, free_gpus) {
        Ok(ids) => ids,
        Err(e) => {
            return AdmissionOutcome::Defer {
                reason: e.to_string(),
            }
        }
    };

    if config.dependencies_enabled {
        for dep in request.dependencies {
            if !completed.contains(dep) {
                return AdmissionOutcome::Defer {
                    reason: format!("waiting for dependency {dep}"),
                };
            }
        }
    }

    AdmissionOutcome::Start { gpu_ids }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_jobs: u32, max_weight: u32) -> Config {
        let mut config = Config::with_root("/tmp/wjm-test".into());
        config.max_concurrent_jobs = max_jobs;
        config.max_total_weight = max_weight;
        config
    }

    fn usage(count: u32, weight: u64, gpus: &[u32]) -> RunningUsage {
        RunningUsage {
            count,
            weight,
            gpus: gpus.iter().copied().collect(),
        }
    }

    fn request<'a>(weight: u32, gpu: &'a GpuSpec, deps: &'a [JobId]) -> AdmissionRequest<'a> {
        AdmissionRequest {
            weight,
            gpu,
            dependencies: deps,
        }
    }

    #[test]
    fn test_admits_within_capacity() {
        let outcome = evaluate(
            &config(2, 100),
            &usage(1, 40, &[]),
            &[],
            &BTreeSet::new(),
            &request(40, &GpuSpec::None, &[]),
        );
        assert_eq!(outcome, AdmissionOutcome::Start { gpu_ids: vec![] });
    }

    #[test]
    fn test_defers_on_weight() {
        let outcome = evaluate(
            &config(0, 100),
            &usage(2, 80, &[]),
            &[],
            &BTreeSet::new(),
            &request(40, &GpuSpec::None, &[]),
        );
        match outcome {
            AdmissionOutcome::Defer { reason } => {
                assert!(reason.contains("weight"), "reason: {reason}");
                assert!(reason.contains("120"), "reason: {reason}");
            }
            other => panic!("expected defer, got {other:?}"),
        }
    }

    #[test]
    fn test_defers_on_count() {
        let outcome = evaluate(
            &config(2, 0),
            &usage(2, 20, &[]),
            &[],
            &BTreeSet::new(),
            &request(10, &GpuSpec::None, &[]),
        );
        assert!(matches!(outcome, AdmissionOutcome::Defer { .. }));
    }

    #[test]
    fn test_zero_limits_are_unlimited() {
        let outcome = evaluate(
            &config(0, 0),
            &usage(50, 5000, &[]),
            &[],
            &BTreeSet::new(),
            &request(500, &GpuSpec::None, &[]),
        );
        assert!(matches!(outcome, AdmissionOutcome::Start { .. }));
    }

    #[test]
    fn test_gpu_conflict_names_device() {
        let gpu: GpuSpec = "0,1".parse().unwrap();
        let outcome = evaluate(
            &config(0, 0),
            &usage(1, 10, &[0]),
            &[1],
            &BTreeSet::new(),
            &request(10, &gpu, &[]),
        );
        match outcome {
            AdmissionOutcome::Defer { reason } => {
                assert!(reason.contains("GPU 0"), "reason: {reason}")
            }
            other => panic!("expected defer, got {other:?}"),
        }
    }

    #[test]
    fn test_symbolic_gpu_resolution() {
        let gpu: GpuSpec = "auto:2".parse().unwrap();
        let outcome = evaluate(
            &config(0, 0),
            &usage(0, 0, &[]),
            &[1, 2, 3],
            &BTreeSet::new(),
            &request(10, &gpu, &[]),
        );
        assert_eq!(
            outcome,
            AdmissionOutcome::Start {
                gpu_ids: vec![1, 2]
            }
        );
    }

    #[test]
    fn test_symbolic_gpu_defers_when_insufficient() {
        let gpu: GpuSpec = "auto:2".parse().unwrap();
        let outcome = evaluate(
            &config(0, 0),
            &usage(0, 0, &[]),
            &[3],
            &BTreeSet::new(),
            &request(10, &gpu, &[]),
        );
        assert!(matches!(outcome, AdmissionOutcome::Defer { .. }));
    }

    #[test]
    fn test_dependency_gate() {
        let dep: JobId = "job_001".parse().unwrap();
        let deps = [dep];
        let outcome = evaluate(
            &config(0, 0),
            &usage(0, 0, &[]),
            &[],
            &BTreeSet::new(),
            &request(10, &GpuSpec::None, &deps),
        );
        match outcome {
            AdmissionOutcome::Defer { reason } => {
                assert!(reason.contains("job_001"), "reason: {reason}")
            }
            other => panic!("expected defer, got {other:?}"),
        }

        let completed = BTreeSet::from([dep]);
        let outcome = evaluate(
            &config(0, 0),
            &usage(0, 0, &[]),
            &[],
            &completed,
            &request(10, &GpuSpec::None, &deps),
        );
        assert!(matches!(outcome, AdmissionOutcome::Start { .. }));
    }

    #[test]
    fn test_dependencies_can_be_disabled() {
        let mut config = config(0, 0);
        config.dependencies_enabled = false;
        let dep: JobId = "job_001".parse().unwrap();
        let deps = [dep];
        let outcome = evaluate(
            &config,
            &usage(0, 0, &[]),
            &[],
            &BTreeSet::new(),
            &request(10, &GpuSpec::None, &deps),
        );
        assert!(matches!(outcome, AdmissionOutcome::Start { .. }));
    }
}
