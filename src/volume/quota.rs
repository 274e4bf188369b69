//! Disk quotas through a privileged helper executable.
//!
//! Limiting a volume needs privileges the store process usually lacks, so the
//! work is delegated to `layerstore-quota`, which is expected to be installed
//! setuid or invoked through a capability-granting wrapper.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Command,
};

use log::debug;

use crate::error::{IoContext, Result, StoreError};

/// The name the helper is looked up under when no path is configured.
pub const DEFAULT_QUOTA_HELPER: &str = "layerstore-quota";

/// Applies and removes disk limits on volumes.
pub trait QuotaHelper: Send + Sync {
    fn limit(&self, volume_path: &Path, bytes: u64, exclusive: bool) -> Result<()>;
    fn destroy(&self, volume_path: &Path) -> Result<()>;
}

/// Runs the quota helper executable.
#[derive(Debug, Clone)]
pub struct ProcessQuotaHelper {
    bin: PathBuf,
}

impl Default for ProcessQuotaHelper {
    fn default() -> Self {
        Self::new(DEFAULT_QUOTA_HELPER)
    }
}

impl ProcessQuotaHelper {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        ProcessQuotaHelper { bin: bin.into() }
    }

    fn run(&self, args: Vec<OsString>) -> Result<()> {
        let command = format!(
            "{} {}",
            self.bin.display(),
            args.iter()
                .map(|arg| arg.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ")
        );
        debug!("running {command}");

        let output = Command::new(&self.bin)
            .args(&args)
            .output()
            .io_context(|| format!("running {command}"))?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(StoreError::Quota(if stderr.is_empty() {
            format!("{command}: {}", output.status)
        } else {
            stderr
        }))
    }
}

impl QuotaHelper for ProcessQuotaHelper {
    fn limit(&self, volume_path: &Path, bytes: u64, exclusive: bool) -> Result<()> {
        let mut args: Vec<OsString> = vec![
            "limit".into(),
            "--volume-path".into(),
            volume_path.into(),
            "--disk-limit-bytes".into(),
            bytes.to_string().into(),
        ];
        if exclusive {
            args.push("--exclusive".into());
        }
        self.run(args)
    }

    fn destroy(&self, volume_path: &Path) -> Result<()> {
        self.run(vec![
            "destroy".into(),
            "--volume-path".into(),
            volume_path.into(),
        ])
    }
}

#[cfg(test)]
mod tests {
    use std::{fs, os::unix::fs::PermissionsExt};

    use similar_asserts::assert_eq;

    use super::*;
    use crate::{error::ErrorKind, test::tempdir};

    /// Write a helper script that records its arguments and then runs `tail`.
    fn fake_helper(dir: &Path, tail: &str) -> (PathBuf, PathBuf) {
        let log = dir.join("args");
        let script = dir.join("helper");
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> {}\n{tail}\n", log.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        (script, log)
    }

    #[test]
    fn test_limit_passes_flags() {
        let tmp = tempdir();
        let (script, log) = fake_helper(tmp.path(), "exit 0");
        let helper = ProcessQuotaHelper::new(&script);

        helper.limit(Path::new("/store/images/x/rootfs"), 1024, true).unwrap();
        helper.limit(Path::new("/store/images/y/rootfs"), 2048, false).unwrap();
        helper.destroy(Path::new("/store/images/x/rootfs")).unwrap();

        assert_eq!(
            fs::read_to_string(log).unwrap(),
            "limit --volume-path /store/images/x/rootfs --disk-limit-bytes 1024 --exclusive\n\
             limit --volume-path /store/images/y/rootfs --disk-limit-bytes 2048\n\
             destroy --volume-path /store/images/x/rootfs\n"
        );
    }

    #[test]
    fn test_failure_reports_stderr() {
        let tmp = tempdir();
        let (script, _) = fake_helper(tmp.path(), "echo 'qgroup not enabled' >&2; exit 1");
        let err = ProcessQuotaHelper::new(&script)
            .limit(Path::new("/nowhere"), 1, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Quota);
        assert_eq!(err.to_string(), "applying disk quota: qgroup not enabled");
    }

    #[test]
    fn test_missing_helper() {
        let err = ProcessQuotaHelper::new("/non/existing/helper")
            .destroy(Path::new("/nowhere"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);
    }
}
