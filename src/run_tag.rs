//! Default run tag derivation for workloads launched under a tagging wrapper.
//!
//! The wrapper exports the tag as [`crate::RUN_TAG_ENV`] in the child's
//! environment; the collector later reads it back from `/proc/<pid>/environ`.

use uuid::Uuid;

/// Scheduler variable that identifies a batch job
pub const SLURM_JOB_ENV: &str = "SLURM_JOB_ID";

/// Set to the pod name inside Kubernetes containers
pub const HOSTNAME_ENV: &str = "HOSTNAME";

/// Tag precedence: batch job id, then pod name, then a random short id.
///
/// `lookup` resolves environment variables; empty values count as unset.
pub fn derive_run_tag<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(job) = get(SLURM_JOB_ENV) {
        return format!("slurm-{}", job.trim());
    }
    if let Some(pod) = get(HOSTNAME_ENV) {
        return format!("pod-{}", pod.trim());
    }
    let hex = Uuid::new_v4().simple().to_string();
    format!("run-{}", &hex[..8])
}

/// [`derive_run_tag`] against the current process environment
pub fn derive_run_tag_from_env() -> String {
    derive_run_tag(|key| std::env::var(key).ok())
}
