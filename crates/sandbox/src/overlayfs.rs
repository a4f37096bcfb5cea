//! Kernel overlayfs driver.
//!
//! Each sandbox gets `<base>/<id>/{upper,work,merged}`; the scope directory
//! is the read-only lower layer. Mounting shells out to `mount`/`umount`,
//! so the service needs `CAP_SYS_ADMIN` (or an equivalent user namespace).

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use workspace_sandbox_core::{DriverError, DriverResult, OverlayDirs, SandboxId, SandboxTelemetry};

use crate::driver::{DriverCapabilities, OverlayDriver};

pub const DRIVER_NAME: &str = "overlayfs";

/// Field index for mount point in /proc/self/mountinfo.
/// Format: ID PARENT_ID MAJOR:MINOR ROOT MOUNT_POINT OPTIONS ...
const MOUNTINFO_MOUNT_POINT_FIELD: usize = 4;

pub struct OverlayFsDriver {
    base_dir: PathBuf,
    version: String,
}

impl OverlayFsDriver {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn sandbox_dir(&self, id: &SandboxId) -> PathBuf {
        self.base_dir.join(id.as_str())
    }

    fn dirs_for(&self, id: &SandboxId, lower: &str) -> OverlayDirs {
        let root = self.sandbox_dir(id);
        OverlayDirs {
            lower: lower.to_string(),
            upper: root.join("upper").to_string_lossy().into_owned(),
            work: root.join("work").to_string_lossy().into_owned(),
            merged: root.join("merged").to_string_lossy().into_owned(),
        }
    }
}

fn io_error(context: &str, e: std::io::Error) -> DriverError {
    match e.kind() {
        ErrorKind::PermissionDenied => {
            DriverError::InsufficientPrivilege(format!("{}: {}", context, e))
        }
        _ => DriverError::Backend(format!("{}: {}", context, e)),
    }
}

/// Overlay mount options are comma separated and use `:` between lower layers.
fn check_option_safe(path: &str) -> DriverResult<()> {
    if path.contains(',') || path.contains(':') {
        return Err(DriverError::Backend(format!(
            "path {:?} cannot be expressed as an overlay mount option",
            path
        )));
    }
    Ok(())
}

async fn run(program: &str, args: &[&str]) -> DriverResult<()> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::NotFound => DriverError::Unavailable(format!("{} not found", program)),
            _ => io_error(program, e),
        })?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission denied") || lowered.contains("only root") {
        Err(DriverError::InsufficientPrivilege(stderr))
    } else {
        Err(DriverError::Backend(format!("{} failed: {}", program, stderr)))
    }
}

/// Mount points are octal-escaped in mountinfo (`\040` for space).
fn unescape_mountinfo(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let code = std::str::from_utf8(&bytes[i + 1..i + 4])
                .ok()
                .and_then(|digits| u8::from_str_radix(digits, 8).ok());
            if let Some(code) = code {
                out.push(code);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

async fn is_mounted(mount_point: &str) -> DriverResult<bool> {
    let mountinfo = tokio::fs::read_to_string("/proc/self/mountinfo")
        .await
        .map_err(|e| DriverError::Unavailable(format!("cannot read mountinfo: {}", e)))?;
    Ok(mountinfo.lines().any(|line| {
        line.split_whitespace()
            .nth(MOUNTINFO_MOUNT_POINT_FIELD)
            .map(|field| unescape_mountinfo(field) == mount_point)
            .unwrap_or(false)
    }))
}

/// Size and file count of everything written into the upper layer.
fn measure_upper(upper: &Path) -> (u64, u64) {
    let mut size_bytes = 0;
    let mut file_count = 0;
    for entry in walkdir::WalkDir::new(upper)
        .follow_links(false)
        .into_iter()
        .flatten()
    {
        if entry.file_type().is_file() {
            file_count += 1;
            size_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    (size_bytes, file_count)
}

/// Processes whose working directory is inside the merged view.
fn pids_using(merged: &Path) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    let mut pids: Vec<u32> = entries
        .flatten()
        .filter_map(|entry| {
            let pid = entry.file_name().to_str()?.parse::<u32>().ok()?;
            let cwd = std::fs::read_link(entry.path().join("cwd")).ok()?;
            cwd.starts_with(merged).then_some(pid)
        })
        .collect();
    pids.sort_unstable();
    pids
}

#[async_trait]
impl OverlayDriver for OverlayFsDriver {
    fn name(&self) -> &str {
        DRIVER_NAME
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities {
            resumable: true,
            telemetry: true,
            requires_privilege: true,
        }
    }

    async fn prepare(
        &self,
        id: &SandboxId,
        scope_path: &str,
        _project_root: &str,
    ) -> DriverResult<OverlayDirs> {
        let lower = tokio::fs::metadata(scope_path)
            .await
            .map_err(|e| io_error("lower directory", e))?;
        if !lower.is_dir() {
            return Err(DriverError::Backend(format!(
                "lower {} is not a directory",
                scope_path
            )));
        }

        let dirs = self.dirs_for(id, scope_path);
        for dir in [&dirs.lower, &dirs.upper, &dirs.work, &dirs.merged] {
            check_option_safe(dir)?;
        }
        for dir in [&dirs.upper, &dirs.work, &dirs.merged] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| io_error("create overlay directory", e))?;
        }

        tracing::debug!(sandbox_id = %id, upper = %dirs.upper, "Overlay directories prepared");
        Ok(dirs)
    }

    async fn activate(&self, id: &SandboxId, dirs: &OverlayDirs) -> DriverResult<()> {
        if is_mounted(&dirs.merged).await? {
            return Err(DriverError::AlreadyActive);
        }

        let options = format!(
            "lowerdir={},upperdir={},workdir={}",
            dirs.lower, dirs.upper, dirs.work
        );
        run(
            "mount",
            &["-t", "overlay", "overlay", "-o", &options, &dirs.merged],
        )
        .await?;

        tracing::info!(sandbox_id = %id, merged = %dirs.merged, "Overlay mounted");
        Ok(())
    }

    async fn deactivate(&self, id: &SandboxId, dirs: &OverlayDirs) -> DriverResult<()> {
        if !is_mounted(&dirs.merged).await? {
            return Err(DriverError::NotActive);
        }
        run("umount", &[&dirs.merged]).await?;
        tracing::info!(sandbox_id = %id, merged = %dirs.merged, "Overlay unmounted");
        Ok(())
    }

    async fn destroy(&self, id: &SandboxId, dirs: Option<&OverlayDirs>) -> DriverResult<()> {
        let merged = match dirs {
            Some(d) => d.merged.clone(),
            None => self.dirs_for(id, "").merged,
        };
        if is_mounted(&merged).await? {
            run("umount", &[&merged]).await?;
        }

        // Only the sandbox's own subtree is removed; lower is never touched.
        match tokio::fs::remove_dir_all(self.sandbox_dir(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error("remove overlay directories", e)),
        }

        tracing::info!(sandbox_id = %id, "Overlay destroyed");
        Ok(())
    }

    async fn stat(&self, id: &SandboxId, dirs: &OverlayDirs) -> DriverResult<SandboxTelemetry> {
        let upper = PathBuf::from(&dirs.upper);
        let merged = PathBuf::from(&dirs.merged);
        if tokio::fs::metadata(&upper).await.is_err() {
            return Err(DriverError::NotAvailable(format!(
                "upper directory for {} is missing",
                id
            )));
        }

        tokio::task::spawn_blocking(move || {
            let (size_bytes, file_count) = measure_upper(&upper);
            SandboxTelemetry {
                size_bytes,
                file_count,
                active_pids: pids_using(&merged),
            }
        })
        .await
        .map_err(|e| DriverError::NotAvailable(e.to_string()))
    }

    async fn is_available(&self) -> bool {
        tokio::fs::read_to_string("/proc/filesystems")
            .await
            .map(|fs| fs.lines().any(|l| l.trim_end().ends_with("overlay")))
            .unwrap_or(false)
    }
}
