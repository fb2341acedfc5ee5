// ============================================================================
// PROCESS ENRICHMENT
// ============================================================================
// Attributes a GPU sample to the process using it: name, owning user and the
// run tag exported in the process environment. Lookups degrade to the
// "unknown" sentinel and never fail a poll.
// ============================================================================

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sysinfo::Users;
use tracing::{debug, warn};

use crate::sample::Sample;
use crate::UNKNOWN_SENTINEL;

/// What could be learned about a process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessMeta {
    pub name: String,
    pub user: String,
    pub run_tag: Option<String>,
}

impl ProcessMeta {
    pub fn unknown() -> Self {
        Self {
            name: UNKNOWN_SENTINEL.to_string(),
            user: UNKNOWN_SENTINEL.to_string(),
            run_tag: None,
        }
    }
}

/// Blocking process metadata source.
///
/// `None` means the process is gone or not inspectable.
pub trait ProcessInspector: Send + Sync {
    fn inspect(&self, pid: u32) -> Option<ProcessMeta>;
}

// ----------------------------------------------------------------------------
// procfs Inspector
// ----------------------------------------------------------------------------

/// Reads `<proc_root>/<pid>/{comm,status,environ}`.
pub struct ProcfsInspector {
    proc_root: PathBuf,
    run_tag_env: String,
    users: Mutex<Users>,
}

impl fmt::Debug for ProcfsInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcfsInspector")
            .field("proc_root", &self.proc_root)
            .field("run_tag_env", &self.run_tag_env)
            .finish()
    }
}

impl ProcfsInspector {
    pub fn new(proc_root: impl Into<PathBuf>, run_tag_env: impl Into<String>) -> Self {
        Self {
            proc_root: proc_root.into(),
            run_tag_env: run_tag_env.into(),
            users: Mutex::new(Users::new_with_refreshed_list()),
        }
    }

    fn pid_dir(&self, pid: u32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    /// User name for a uid; the numeric id when no account matches.
    fn user_name(&self, uid: u32) -> String {
        let mut users = self.users.lock();
        let lookup = |users: &Users| {
            users
                .iter()
                .find(|u| **u.id() == uid)
                .map(|u| u.name().to_string())
        };

        if let Some(name) = lookup(&*users) {
            return name;
        }
        // accounts may have been created since startup
        users.refresh_list();
        lookup(&*users).unwrap_or_else(|| uid.to_string())
    }

    fn read_tag(&self, dir: &Path) -> Option<String> {
        let raw = fs::read(dir.join("environ")).ok()?;
        environ_value(&raw, &self.run_tag_env)
    }
}

impl ProcessInspector for ProcfsInspector {
    fn inspect(&self, pid: u32) -> Option<ProcessMeta> {
        let dir = self.pid_dir(pid);

        let name = fs::read_to_string(dir.join("comm")).ok()?.trim().to_string();
        let status = fs::read_to_string(dir.join("status")).ok()?;
        let uid = parse_status_uid(&status)?;

        Some(ProcessMeta {
            name,
            user: self.user_name(uid),
            run_tag: self.read_tag(&dir),
        })
    }
}

/// Real uid from the `Uid:` line of `/proc/<pid>/status`
pub fn parse_status_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

/// Value of `key` in a NUL-separated environment block
pub fn environ_value(raw: &[u8], key: &str) -> Option<String> {
    raw.split(|b| *b == 0)
        .filter_map(|entry| std::str::from_utf8(entry).ok())
        .find_map(|entry| {
            let (k, v) = entry.split_once('=')?;
            (k == key).then(|| v.to_string())
        })
}

// ----------------------------------------------------------------------------
// Enricher
// ----------------------------------------------------------------------------

/// Runs inspector lookups on the blocking pool, each under a deadline.
#[derive(Clone)]
pub struct ProcessEnricher {
    inspector: Arc<dyn ProcessInspector>,
    timeout: Duration,
}

impl fmt::Debug for ProcessEnricher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessEnricher")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ProcessEnricher {
    pub fn new(inspector: Arc<dyn ProcessInspector>, timeout: Duration) -> Self {
        Self { inspector, timeout }
    }

    /// Attribute `base` to `pid`.
    pub async fn enrich(&self, base: Sample, pid: u32) -> Sample {
        let inspector = Arc::clone(&self.inspector);
        let lookup = tokio::task::spawn_blocking(move || inspector.inspect(pid));

        let meta = match tokio::time::timeout(self.timeout, lookup).await {
            Ok(Ok(Some(meta))) => meta,
            Ok(Ok(None)) => {
                debug!(target: "gpu_doctor::enrich", pid, "Process gone or not inspectable");
                ProcessMeta::unknown()
            }
            Ok(Err(e)) => {
                warn!(target: "gpu_doctor::enrich", pid, error = %e, "Process lookup task failed");
                ProcessMeta::unknown()
            }
            Err(_) => {
                warn!(
                    target: "gpu_doctor::enrich",
                    pid,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Process lookup timed out"
                );
                ProcessMeta::unknown()
            }
        };

        Sample {
            process_id: Some(pid),
            process_name: Some(meta.name),
            process_user: Some(meta.user),
            run_tag: meta.run_tag,
            ..base
        }
    }

    /// Enrich every sample that carries a pid; idle samples pass through.
    pub async fn enrich_all(&self, samples: Vec<Sample>) -> Vec<Sample> {
        let mut out = Vec::with_capacity(samples.len());
        for sample in samples {
            match sample.process_id {
                Some(pid) => out.push(self.enrich(sample, pid).await),
                None => out.push(sample),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::PollStamp;
    use pretty_assertions::assert_eq;

    struct FixedInspector(Option<ProcessMeta>);

    impl ProcessInspector for FixedInspector {
        fn inspect(&self, _pid: u32) -> Option<ProcessMeta> {
            self.0.clone()
        }
    }

    struct SlowInspector;

    impl ProcessInspector for SlowInspector {
        fn inspect(&self, _pid: u32) -> Option<ProcessMeta> {
            std::thread::sleep(Duration::from_millis(300));
            Some(ProcessMeta {
                name: "late".into(),
                user: "late".into(),
                run_tag: None,
            })
        }
    }

    fn base() -> Sample {
        Sample::idle(&PollStamp::now("node-a"), 0)
    }

    fn fake_proc(pid: u32, environ: Option<&[u8]>) -> tempfile::TempDir {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join(pid.to_string());
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("comm"), "python\n").unwrap();
        fs::write(dir.join("status"), "Name:\tpython\nUmask:\t0022\nUid:\t0\t0\t0\t0\nGid:\t0\t0\t0\t0\n").unwrap();
        if let Some(env) = environ {
            fs::write(dir.join("environ"), env).unwrap();
        }
        root
    }

    #[test]
    fn test_parse_status_uid() {
        assert_eq!(parse_status_uid("Name:\tx\nUid:\t1000\t1000\t1000\t1000\n"), Some(1000));
        assert_eq!(parse_status_uid("Name:\tx\n"), None);
    }

    #[test]
    fn test_environ_value() {
        let raw = b"PATH=/usr/bin\0GPU_DOC_RUN_TAG=run-42\0EMPTY=\0";
        assert_eq!(environ_value(raw, "GPU_DOC_RUN_TAG"), Some("run-42".to_string()));
        assert_eq!(environ_value(raw, "EMPTY"), Some(String::new()));
        assert_eq!(environ_value(raw, "MISSING"), None);
    }

    #[test]
    fn test_procfs_inspector_reads_tag() {
        let root = fake_proc(4242, Some(b"HOME=/root\0GPU_DOC_RUN_TAG=run-42\0"));
        let inspector = ProcfsInspector::new(root.path(), "GPU_DOC_RUN_TAG");

        let meta = inspector.inspect(4242).unwrap();
        assert_eq!(meta.name, "python");
        assert_ne!(meta.user, UNKNOWN_SENTINEL);
        assert_eq!(meta.run_tag.as_deref(), Some("run-42"));
    }

    #[test]
    fn test_procfs_unreadable_environ_keeps_name() {
        let root = fake_proc(77, None);
        let inspector = ProcfsInspector::new(root.path(), "GPU_DOC_RUN_TAG");

        let meta = inspector.inspect(77).unwrap();
        assert_eq!(meta.name, "python");
        assert_eq!(meta.run_tag, None);
    }

    #[test]
    fn test_procfs_missing_process() {
        let root = tempfile::tempdir().unwrap();
        let inspector = ProcfsInspector::new(root.path(), "GPU_DOC_RUN_TAG");
        assert_eq!(inspector.inspect(999_999), None);
    }

    #[tokio::test]
    async fn test_enrich_sets_process_fields() {
        let enricher = ProcessEnricher::new(
            Arc::new(FixedInspector(Some(ProcessMeta {
                name: "train.py".into(),
                user: "mira".into(),
                run_tag: Some("run-42".into()),
            }))),
            Duration::from_secs(2),
        );

        let sample = enricher.enrich(base(), 1234).await;
        assert_eq!(sample.process_id, Some(1234));
        assert_eq!(sample.process_name.as_deref(), Some("train.py"));
        assert_eq!(sample.process_user.as_deref(), Some("mira"));
        assert_eq!(sample.run_tag.as_deref(), Some("run-42"));
    }

    #[tokio::test]
    async fn test_enrich_gone_process_is_unknown() {
        let enricher = ProcessEnricher::new(Arc::new(FixedInspector(None)), Duration::from_secs(2));
        let sample = enricher.enrich(base(), 5).await;

        assert_eq!(sample.process_name.as_deref(), Some(UNKNOWN_SENTINEL));
        assert_eq!(sample.process_user.as_deref(), Some(UNKNOWN_SENTINEL));
        assert_eq!(sample.run_tag, None);
    }

    #[tokio::test]
    async fn test_enrich_timeout_is_unknown() {
        let enricher = ProcessEnricher::new(Arc::new(SlowInspector), Duration::from_millis(20));
        let sample = enricher.enrich(base(), 9).await;
        assert_eq!(sample.process_user.as_deref(), Some(UNKNOWN_SENTINEL));
    }

    #[tokio::test]
    async fn test_enrich_all_skips_idle() {
        let enricher = ProcessEnricher::new(Arc::new(FixedInspector(None)), Duration::from_secs(2));
        let idle = base();
        let busy = idle.for_process(3);

        let out = enricher.enrich_all(vec![idle.clone(), busy]).await;
        assert_eq!(out[0], idle);
        assert_eq!(out[1].process_name.as_deref(), Some(UNKNOWN_SENTINEL));
    }
}
