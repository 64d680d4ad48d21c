//! tar + zstd archives for the filestore and config producers.

use crate::fs::walker::{walk_directory, WalkOptions};
use crate::utils::errors::{DrError, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// Archive `source` (file or directory) into a zstd-compressed tar at `out`.
///
/// Entries are stored under the source's own name, so a directory
/// `/etc/nginx` becomes `nginx/...` inside the archive. Returns the number of
/// entries written.
pub fn create_archive(source: &Path, out: &Path, level: i32) -> Result<usize> {
    let top = source
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("root"));

    let encoder = zstd::Encoder::new(BufWriter::new(File::create(out)?), level)
        .map_err(|e| DrError::Archive(format!("zstd init failed: {}", e)))?;
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut count = 0;
    let meta = std::fs::symlink_metadata(source)?;
    if meta.is_dir() {
        builder.append_dir(&top, source)?;
        count += 1;
        let options = WalkOptions {
            include_dirs: true,
            ..Default::default()
        };
        for entry in walk_directory(source, &options)? {
            let name = top.join(&entry.relative_path);
            if entry.is_dir {
                builder.append_dir(&name, &entry.path)?;
            } else {
                builder.append_path_with_name(&entry.path, &name)?;
            }
            count += 1;
        }
    } else {
        builder.append_path_with_name(source, &top)?;
        count += 1;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder
        .finish()
        .map_err(|e| DrError::Archive(format!("zstd finish failed: {}", e)))?;
    std::io::Write::flush(&mut writer)?;
    let file = writer
        .into_inner()
        .map_err(|e| DrError::Io(e.into_error()))?;
    file.sync_all()?;

    Ok(count)
}

/// List every entry of an archive; fails if it is not a readable tar.zst.
pub fn list_archive(path: &Path) -> Result<usize> {
    let decoder = zstd::Decoder::new(BufReader::new(File::open(path)?))
        .map_err(|e| DrError::Archive(format!("not a zstd stream: {}", e)))?;
    let mut archive = tar::Archive::new(decoder);

    let mut count = 0;
    let entries = archive
        .entries()
        .map_err(|e| DrError::Archive(format!("unreadable archive: {}", e)))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| DrError::Archive(format!("corrupt entry: {}", e)))?;
        // reading the body forces zstd to validate the whole stream
        std::io::copy(&mut entry, &mut std::io::sink())
            .map_err(|e| DrError::Archive(format!("corrupt entry data: {}", e)))?;
        count += 1;
    }
    if count == 0 {
        return Err(DrError::Archive("archive contains no entries".into()));
    }
    Ok(count)
}
