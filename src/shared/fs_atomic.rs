use std::fs;
use std::io::Write;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Permission bits for private state files (profiles).
pub const PRIVATE_FILE_MODE: u32 = 0o600;
/// Permission bits for state directories.
pub const STATE_DIR_MODE: u32 = 0o755;

pub fn atomic_write_file(path: &Path, content: &[u8]) -> std::io::Result<()> {
    atomic_write_file_with_mode(path, content, None)
}

/// Writes `content` to a sibling temp file and renames it into place so readers
/// never observe a partially written file.
pub fn atomic_write_file_with_mode(
    path: &Path,
    content: &[u8],
    mode: Option<u32>,
) -> std::io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| std::io::Error::other("path has no parent"))?;
    let tmp_name = format!(
        ".{}.tmp-{}-{}",
        path.file_name().and_then(|v| v.to_str()).unwrap_or("state"),
        std::process::id(),
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0),
    );
    let tmp_path = parent.join(tmp_name);

    let written = (|| {
        let mut options = fs::OpenOptions::new();
        options.create_new(true).write(true);
        apply_file_mode(&mut options, mode);
        let mut file = options.open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()
    })();
    if let Err(err) = written {
        let _ = fs::remove_file(&tmp_path);
        return Err(err);
    }

    fs::rename(&tmp_path, path)?;
    sync_parent_dir(parent)?;
    Ok(())
}

/// Creates `path` and any missing parents. On unix new directories get `mode`.
pub fn create_dir_all_with_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    let mut builder = fs::DirBuilder::new();
    builder.recursive(true);
    apply_dir_mode(&mut builder, mode);
    builder.create(path)
}

#[cfg(unix)]
fn apply_file_mode(options: &mut fs::OpenOptions, mode: Option<u32>) {
    use std::os::unix::fs::OpenOptionsExt;
    if let Some(mode) = mode {
        options.mode(mode);
    }
}

#[cfg(not(unix))]
fn apply_file_mode(_options: &mut fs::OpenOptions, _mode: Option<u32>) {}

#[cfg(unix)]
fn apply_dir_mode(builder: &mut fs::DirBuilder, mode: u32) {
    use std::os::unix::fs::DirBuilderExt;
    builder.mode(mode);
}

#[cfg(not(unix))]
fn apply_dir_mode(_builder: &mut fs::DirBuilder, _mode: u32) {}

#[cfg(unix)]
fn sync_parent_dir(parent: &Path) -> std::io::Result<()> {
    fs::File::open(parent)?.sync_all()
}

#[cfg(not(unix))]
fn sync_parent_dir(_parent: &Path) -> std::io::Result<()> {
    Ok(())
}
