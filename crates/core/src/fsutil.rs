use std::path::Path;

use tracing::debug;

/// Write `data` to `path` via a temp file and rename, so observers never see
/// a partial file.
pub fn write_atomic(path: &Path, data: &str) -> anyhow::Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)
        .map_err(|err| anyhow::anyhow!("writing {}: {err}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .map_err(|err| anyhow::anyhow!("renaming {} into place: {err}", tmp.display()))?;
    Ok(())
}

/// Best-effort recursive delete; missing directories are fine.
pub fn rmtree(dir: &Path) {
    debug!("delete folder: {}", dir.display());
    let _ = std::fs::remove_dir_all(dir);
}

/// Best-effort file delete.
pub fn rm(path: &Path) {
    debug!("delete file: {}", path.display());
    let _ = std::fs::remove_file(path);
}

/// Mark a script executable for owner, group and others.
#[cfg(unix)]
pub fn mark_executable(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let meta = std::fs::metadata(path)
        .map_err(|err| anyhow::anyhow!("stat {}: {err}", path.display()))?;
    let mut perms = meta.permissions();
    perms.set_mode(perms.mode() | 0o111);
    std::fs::set_permissions(path, perms)
        .map_err(|err| anyhow::anyhow!("chmod {}: {err}", path.display()))?;
    Ok(())
}
