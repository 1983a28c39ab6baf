//! Transfer paths and directory listings.

use crate::error::RendezvousError;
use flapwire_protocol::listing::FLAG_DIRECTORY;
use flapwire_protocol::{DirectoryListing, ListingEntry};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

/// Derives the `/`-separated name a file is sent under.
///
/// `file` must lie strictly below `root`. With a `folder_name`, the name is
/// prefixed by it; a trailing `/` on the folder name is optional.
pub fn transfer_path(root: &Path, file: &Path, folder_name: Option<&str>) -> Result<String, RendezvousError> {
    let relative = file
        .strip_prefix(root)
        .map_err(|_| RendezvousError::invalid_path(file, "not below the transfer root"))?;

    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(RendezvousError::invalid_path(file, "not below the transfer root")),
        }
    }
    if parts.is_empty() {
        return Err(RendezvousError::invalid_path(file, "is the transfer root itself"));
    }

    let name = parts.join("/");
    Ok(match folder_name.map(|f| f.trim_end_matches('/')) {
        Some(folder) if !folder.is_empty() => format!("{}/{}", folder, name),
        _ => name,
    })
}

/// Resolves a received name under `dest`, refusing names that escape it.
pub fn receive_path(dest: &Path, name: &str) -> Result<PathBuf, RendezvousError> {
    let mut path = dest.to_path_buf();
    let mut pushed = false;
    for part in name.split(['/', '\\']) {
        match part {
            "" | "." => {}
            ".." => return Err(RendezvousError::invalid_path(name, "escapes the destination")),
            part => {
                if Path::new(part).is_absolute() || part.contains(':') {
                    return Err(RendezvousError::invalid_path(name, "escapes the destination"));
                }
                path.push(part);
                pushed = true;
            }
        }
    }
    if !pushed {
        return Err(RendezvousError::invalid_path(name, "empty file name"));
    }
    Ok(path)
}

/// A file found under a transfer root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    /// Name the file is sent under.
    pub name: String,
    pub size: u64,
    /// Seconds since the Unix epoch.
    pub modified: u32,
}

fn modified_secs(meta: &std::fs::Metadata) -> u32 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map_or(0, |d| d.as_secs().min(u32::MAX as u64) as u32)
}

/// Collects the files to send for `path`: the file itself, or every file
/// below a directory, in name order.
pub fn collect_files(path: &Path, folder_name: Option<&str>) -> Result<Vec<SourceFile>, RendezvousError> {
    let meta = std::fs::metadata(path)?;
    if meta.is_file() {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| RendezvousError::invalid_path(path, "has no file name"))?;
        return Ok(vec![SourceFile {
            path: path.to_path_buf(),
            name,
            size: meta.len(),
            modified: modified_secs(&meta),
        }]);
    }

    let mut files = Vec::new();
    let mut pending = vec![path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let entry_meta = entry.metadata()?;
            let entry_path = entry.path();
            if entry_meta.is_dir() {
                pending.push(entry_path);
            } else if entry_meta.is_file() {
                files.push(SourceFile {
                    name: transfer_path(path, &entry_path, folder_name)?,
                    path: entry_path,
                    size: entry_meta.len(),
                    modified: modified_secs(&entry_meta),
                });
            }
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    tracing::debug!("Collected {} files under {}", files.len(), path.display());
    Ok(files)
}

/// Builds a listing of everything below `root`, folders included.
pub fn build_listing(root: &Path) -> Result<DirectoryListing, RendezvousError> {
    let mut entries = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            let entry_path = entry.path();
            let name = transfer_path(root, &entry_path, None)?;
            if meta.is_dir() {
                entries.push(ListingEntry {
                    name,
                    size: 0,
                    modified: modified_secs(&meta),
                    flags: FLAG_DIRECTORY,
                });
                pending.push(entry_path);
            } else {
                let size = u32::try_from(meta.len()).map_err(|_| RendezvousError::FileTooLarge(meta.len()))?;
                entries.push(ListingEntry::file(name, size, modified_secs(&meta)));
            }
        }
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(DirectoryListing::new(entries))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_to_root() {
        assert_eq!(transfer_path(Path::new("x"), Path::new("x/y"), None).unwrap(), "y");
    }

    #[test]
    fn test_folder_name_prefix() {
        assert_eq!(
            transfer_path(Path::new("x"), Path::new("x/y"), Some("d/c/")).unwrap(),
            "d/c/y"
        );
        assert_eq!(
            transfer_path(Path::new("x"), Path::new("x/y"), Some("d/c")).unwrap(),
            "d/c/y"
        );
        assert_eq!(
            transfer_path(Path::new("/home/a"), Path::new("/home/a/b/c.txt"), None).unwrap(),
            "b/c.txt"
        );
    }

    #[test]
    fn test_root_itself_rejected() {
        let err = transfer_path(Path::new("x"), Path::new("x"), None).unwrap_err();
        assert!(matches!(err, RendezvousError::InvalidPath { .. }));
    }

    #[test]
    fn test_outside_root_rejected() {
        let err = transfer_path(Path::new("x"), Path::new("z/y"), None).unwrap_err();
        assert!(matches!(err, RendezvousError::InvalidPath { .. }));
        // Sibling with a shared name prefix is not a descendant
        assert!(transfer_path(Path::new("x"), Path::new("xy/z"), None).is_err());
    }

    #[test]
    fn test_receive_path() {
        let dest = Path::new("/tmp/in");
        assert_eq!(receive_path(dest, "a/b.txt").unwrap(), Path::new("/tmp/in/a/b.txt"));
        assert!(receive_path(dest, "../etc/passwd").is_err());
        assert!(receive_path(dest, "a/../../b").is_err());
        assert!(receive_path(dest, "").is_err());
    }

    #[test]
    fn test_collect_and_list() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        std::fs::write(dir.path().join("sub").join("b.bin"), [0u8; 12]).unwrap();

        let files = collect_files(dir.path(), Some("pics")).unwrap();
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["pics/a.txt", "pics/sub/b.bin"]);
        assert_eq!(files[1].size, 12);

        let listing = build_listing(dir.path()).unwrap();
        let names: Vec<_> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub", "sub/b.bin"]);
        assert!(listing.entries[1].is_directory());
        assert_eq!(listing.total_size(), 17);
    }

    #[test]
    fn test_collect_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt");
        std::fs::write(&path, b"abc").unwrap();
        let files = collect_files(&path, None).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "note.txt");
        assert_eq!(files[0].size, 3);
    }
}
