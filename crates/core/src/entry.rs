use std::path::{Path, PathBuf};
use std::time::SystemTime;

use filetime::FileTime;
use walkdir::WalkDir;

use crate::{Error, Result};

/// A filesystem entry a backup task operates on.
///
/// Entries are thin wrappers over a path: nothing about the underlying file or
/// directory is cached, every query hits the filesystem again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(FileEntry),
    Directory(DirEntry),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    path: PathBuf,
}

impl Entry {
    /// Resolves `path` to the kind currently on disk without following a
    /// final symlink. Anything that is not a real directory (symlinks, dangling
    /// or not, sockets, FIFOs) is a [`FileEntry`]. `None` only when nothing is
    /// there.
    pub fn from_path(path: impl Into<PathBuf>) -> Option<Self> {
        let path = path.into();
        let meta = std::fs::symlink_metadata(&path).ok()?;
        if meta.is_dir() {
            Some(Self::Directory(DirEntry::new(path)))
        } else {
            Some(Self::File(FileEntry::new(path)))
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            Self::File(f) => f.path(),
            Self::Directory(d) => d.path(),
        }
    }

    pub fn name(&self) -> String {
        entry_name(self.path())
    }

    pub fn parent(&self) -> Option<DirEntry> {
        parent_of(self.path())
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Self::Directory(_))
    }

    pub fn exists(&self) -> bool {
        match self {
            Self::File(f) => f.exists(),
            Self::Directory(d) => d.exists(),
        }
    }

    pub fn size(&self) -> Result<u64> {
        match self {
            Self::File(f) => f.size(),
            Self::Directory(d) => d.size(),
        }
    }

    pub fn copy(&self, destination_dir: &DirEntry, overwrite: bool) -> Result<Entry> {
        match self {
            Self::File(f) => f.copy(destination_dir, overwrite).map(Self::File),
            Self::Directory(d) => d.copy(destination_dir, overwrite).map(Self::Directory),
        }
    }

    pub fn move_to(&mut self, destination_dir: &DirEntry, overwrite: bool) -> Result<()> {
        match self {
            Self::File(f) => f.move_to(destination_dir, overwrite),
            Self::Directory(d) => d.move_to(destination_dir, overwrite),
        }
    }

    pub fn rename(&mut self, new_name: &str, overwrite: bool) -> Result<()> {
        match self {
            Self::File(f) => f.rename(new_name, overwrite),
            Self::Directory(d) => d.rename(new_name, overwrite),
        }
    }

    pub fn remove(&self) -> Result<()> {
        match self {
            Self::File(f) => f.remove(),
            Self::Directory(d) => d.remove(),
        }
    }
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        entry_name(&self.path)
    }

    pub fn parent(&self) -> Option<DirEntry> {
        parent_of(&self.path)
    }

    /// Lowercased extension without the leading dot.
    pub fn extension(&self) -> Option<String> {
        self.path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
    }

    /// True for anything at the path except a directory, dangling links included.
    pub fn exists(&self) -> bool {
        std::fs::symlink_metadata(&self.path).is_ok_and(|m| !m.is_dir())
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.metadata()?.len())
    }

    pub fn modified(&self) -> Result<SystemTime> {
        Ok(self.metadata()?.modified()?)
    }

    pub fn copy(&self, destination_dir: &DirEntry, overwrite: bool) -> Result<FileEntry> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let target = destination_dir.path.join(self.name());
        prepare_target(&target, overwrite)?;
        std::fs::create_dir_all(&destination_dir.path)?;
        copy_leaf(&self.path, &target)?;
        Ok(FileEntry::new(target))
    }

    pub fn move_to(&mut self, destination_dir: &DirEntry, overwrite: bool) -> Result<()> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let target = destination_dir.path.join(self.name());
        prepare_target(&target, overwrite)?;
        std::fs::create_dir_all(&destination_dir.path)?;
        move_path(&self.path, &target, false)?;
        self.path = target;
        Ok(())
    }

    pub fn rename(&mut self, new_name: &str, overwrite: bool) -> Result<()> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let target = sibling_path(&self.path, new_name);
        if target == self.path {
            return Ok(());
        }
        prepare_target(&target, overwrite)?;
        std::fs::rename(&self.path, &target)?;
        self.path = target;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        std::fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Metadata of the entry itself; a symlink reports its own size and mtime.
    fn metadata(&self) -> Result<std::fs::Metadata> {
        match std::fs::symlink_metadata(&self.path) {
            Ok(meta) if !meta.is_dir() => Ok(meta),
            Ok(_) => Err(not_found(&self.path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(not_found(&self.path)),
            Err(e) => Err(e.into()),
        }
    }
}

impl DirEntry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn name(&self) -> String {
        entry_name(&self.path)
    }

    pub fn parent(&self) -> Option<DirEntry> {
        parent_of(&self.path)
    }

    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Total size of every regular file below this directory.
    pub fn size(&self) -> Result<u64> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let mut total = 0u64;
        for entry in WalkDir::new(&self.path).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                total = total.saturating_add(entry.metadata()?.len());
            }
        }
        Ok(total)
    }

    /// Immediate children, one level deep. Order is unspecified.
    pub fn entries(&self) -> Result<Vec<Entry>> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let mut out = Vec::new();
        for child in std::fs::read_dir(&self.path)? {
            let child = child?;
            if let Some(entry) = Entry::from_path(child.path()) {
                out.push(entry);
            }
        }
        Ok(out)
    }

    /// Every regular file in the subtree, this directory included.
    pub fn files(&self) -> Result<Vec<FileEntry>> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let mut out = Vec::new();
        for entry in WalkDir::new(&self.path).follow_links(false) {
            let entry = entry?;
            if entry.file_type().is_file() {
                out.push(FileEntry::new(entry.path()));
            }
        }
        Ok(out)
    }

    /// Name-based existence check of `entry` inside this directory.
    pub fn contains(&self, entry: &Entry) -> bool {
        std::fs::symlink_metadata(self.path.join(entry.name())).is_ok()
    }

    /// Builds a handler for a prospective child file; the file need not exist.
    pub fn file(&self, name: &str) -> FileEntry {
        FileEntry::new(self.path.join(name))
    }

    /// Builds a handler for a prospective child directory; it need not exist.
    pub fn directory(&self, name: &str) -> DirEntry {
        DirEntry::new(self.path.join(name))
    }

    /// The existing child called `name`, typed by what is on disk.
    pub fn child(&self, name: &str) -> Option<Entry> {
        Entry::from_path(self.path.join(name))
    }

    pub fn copy(&self, destination_dir: &DirEntry, overwrite: bool) -> Result<DirEntry> {
        self.copy_with(destination_dir, overwrite, |_, _| ())
    }

    /// [`DirEntry::copy`] that calls `before_file` with every nested
    /// non-directory entry and its size right before that entry is written.
    /// Whatever `before_file` returns is held until the write is done.
    pub fn copy_with<G>(
        &self,
        destination_dir: &DirEntry,
        overwrite: bool,
        before_file: impl FnMut(&Path, u64) -> G,
    ) -> Result<DirEntry> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let target = destination_dir.path.join(self.name());
        prepare_target(&target, overwrite)?;
        copy_dir_recursive(&self.path, &target, before_file)?;
        Ok(DirEntry::new(target))
    }

    pub fn move_to(&mut self, destination_dir: &DirEntry, overwrite: bool) -> Result<()> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let target = destination_dir.path.join(self.name());
        prepare_target(&target, overwrite)?;
        std::fs::create_dir_all(&destination_dir.path)?;
        move_path(&self.path, &target, true)?;
        self.path = target;
        Ok(())
    }

    pub fn rename(&mut self, new_name: &str, overwrite: bool) -> Result<()> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        let target = sibling_path(&self.path, new_name);
        if target == self.path {
            return Ok(());
        }
        prepare_target(&target, overwrite)?;
        std::fs::rename(&self.path, &target)?;
        self.path = target;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if !self.exists() {
            return Err(not_found(&self.path));
        }
        std::fs::remove_dir_all(&self.path)?;
        Ok(())
    }
}

fn entry_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn parent_of(path: &Path) -> Option<DirEntry> {
    path.parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(DirEntry::new)
}

fn sibling_path(path: &Path, new_name: &str) -> PathBuf {
    match path.parent() {
        Some(parent) => parent.join(new_name),
        None => PathBuf::from(new_name),
    }
}

fn not_found(path: &Path) -> Error {
    Error::NotFound {
        path: path.to_path_buf(),
    }
}

/// Clears the way for writing `target`: fails when something is already there
/// and overwriting is not allowed, otherwise removes whatever occupies it.
fn prepare_target(target: &Path, overwrite: bool) -> Result<()> {
    let meta = match std::fs::symlink_metadata(target) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if !overwrite {
        return Err(Error::AlreadyExists {
            path: target.to_path_buf(),
        });
    }
    if meta.is_dir() {
        std::fs::remove_dir_all(target)?;
    } else {
        std::fs::remove_file(target)?;
    }
    Ok(())
}

/// Copies one non-directory entry, keeping its mtime. Symlinks are recreated
/// pointing at the same target, dangling or not.
fn copy_leaf(from: &Path, to: &Path) -> Result<()> {
    let meta = std::fs::symlink_metadata(from)?;
    let mtime = FileTime::from_last_modification_time(&meta);
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        let link = std::fs::read_link(from)?;
        std::os::unix::fs::symlink(&link, to)?;
        filetime::set_symlink_file_times(to, FileTime::from_last_access_time(&meta), mtime)?;
    } else if file_type.is_file() {
        std::fs::copy(from, to)?;
        filetime::set_file_mtime(to, mtime)?;
    } else {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("cannot copy special file {}", from.display()),
        )));
    }
    Ok(())
}

fn copy_dir_recursive<G>(
    from: &Path,
    to: &Path,
    mut before_file: impl FnMut(&Path, u64) -> G,
) -> Result<()> {
    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|_| Error::InvalidConfig {
                message: "path strip_prefix failed".to_string(),
            })?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            let _held = before_file(entry.path(), entry.metadata()?.len());
            copy_leaf(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// `rename`, falling back to copy + delete when the paths live on different
/// filesystems.
fn move_path(from: &Path, to: &Path, is_dir: bool) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            if is_dir {
                copy_dir_recursive(from, to, |_, _| ())?;
                std::fs::remove_dir_all(from)?;
            } else {
                copy_leaf(from, to)?;
                std::fs::remove_file(from)?;
            }
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, bytes: &[u8]) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn file_copy_refuses_existing_target_without_overwrite() {
        let temp = tempfile::tempdir().unwrap();
        write_file(&temp.path().join("src/a.txt"), b"new");
        write_file(&temp.path().join("dst/a.txt"), b"old");

        let src = FileEntry::new(temp.path().join("src/a.txt"));
        let dst = DirEntry::new(temp.path().join("dst"));

        let err = src.copy(&dst, false).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
        assert_eq!(std::fs::read(temp.path().join("dst/a.txt")).unwrap(), b"old");

        let copied = src.copy(&dst, true).unwrap();
        assert_eq!(std::fs::read(copied.path()).unwrap(), b"new");
        assert!(src.exists());
    }

    #[test]
    fn file_copy_keeps_modification_time() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("src/a.txt");
        write_file(&path, b"0123456789");
        filetime::set_file_mtime(&path, FileTime::from_unix_time(1_600_000_000, 0)).unwrap();

        let src = FileEntry::new(&path);
        let copied = src
            .copy(&DirEntry::new(temp.path().join("dst")), true)
            .unwrap();

        assert_eq!(copied.modified().unwrap(), src.modified().unwrap());
        assert_eq!(copied.size().unwrap(), 10);
    }

    #[test]
    fn missing_entries_report_not_found() {
        let temp = tempfile::tempdir().unwrap();
        let file = FileEntry::new(temp.path().join("nope.txt"));
        let dir = DirEntry::new(temp.path().join("nope"));

        assert!(!file.exists());
        assert!(matches!(file.size(), Err(Error::NotFound { .. })));
        assert!(matches!(file.remove(), Err(Error::NotFound { .. })));
        assert!(matches!(dir.remove(), Err(Error::NotFound { .. })));
        assert!(matches!(
            file.copy(&DirEntry::new(temp.path()), true),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn directory_copy_is_recursive_and_size_sums_files() {
        let temp = tempfile::tempdir().unwrap();
        write_file(&temp.path().join("src/tree/a.bin"), &[1u8; 10]);
        write_file(&temp.path().join("src/tree/nested/b.bin"), &[2u8; 5]);

        let tree = DirEntry::new(temp.path().join("src/tree"));
        assert_eq!(tree.size().unwrap(), 15);

        let copied = tree.copy(&DirEntry::new(temp.path().join("dst")), false).unwrap();
        assert_eq!(copied.path(), temp.path().join("dst/tree"));
        assert_eq!(copied.size().unwrap(), 15);
        assert_eq!(copied.files().unwrap().len(), 2);
    }

    #[test]
    fn symlinks_are_file_entries_and_copy_as_links() {
        let temp = tempfile::tempdir().unwrap();
        write_file(&temp.path().join("src/tree/real.txt"), b"x");
        std::os::unix::fs::symlink("real.txt", temp.path().join("src/tree/alias")).unwrap();
        std::os::unix::fs::symlink("gone.txt", temp.path().join("src/tree/dangling")).unwrap();

        let tree = DirEntry::new(temp.path().join("src/tree"));
        let dangling = tree.child("dangling");
        assert!(matches!(&dangling, Some(Entry::File(f)) if f.exists()));

        let copied = tree.copy(&DirEntry::new(temp.path().join("dst")), false).unwrap();
        for name in ["alias", "dangling"] {
            let link = copied.path().join(name);
            assert!(std::fs::symlink_metadata(&link).unwrap().file_type().is_symlink());
            assert_eq!(
                std::fs::read_link(&link).unwrap(),
                std::fs::read_link(tree.path().join(name)).unwrap()
            );
        }
        assert_eq!(copied.files().unwrap().len(), 1);

        let dangling = copied.file("dangling");
        assert!(dangling.modified().is_ok());
        dangling.remove().unwrap();
        assert!(!dangling.exists());
    }

    #[test]
    fn directory_copy_calls_hook_for_every_file() {
        let temp = tempfile::tempdir().unwrap();
        write_file(&temp.path().join("src/tree/a.bin"), &[1u8; 10]);
        write_file(&temp.path().join("src/tree/nested/b.bin"), &[2u8; 5]);

        let mut seen = Vec::new();
        DirEntry::new(temp.path().join("src/tree"))
            .copy_with(&DirEntry::new(temp.path().join("dst")), false, |path, size| {
                seen.push((entry_name(path), size));
            })
            .unwrap();

        seen.sort();
        assert_eq!(seen, vec![("a.bin".to_string(), 10), ("b.bin".to_string(), 5)]);
    }

    #[test]
    fn rename_and_move_update_the_handler_in_place() {
        let temp = tempfile::tempdir().unwrap();
        write_file(&temp.path().join("a.txt"), b"x");

        let mut file = FileEntry::new(temp.path().join("a.txt"));
        file.rename("b.txt", false).unwrap();
        assert_eq!(file.path(), temp.path().join("b.txt"));
        assert!(!temp.path().join("a.txt").exists());

        file.move_to(&DirEntry::new(temp.path().join("sub")), false)
            .unwrap();
        assert_eq!(file.path(), temp.path().join("sub/b.txt"));
        assert!(file.exists());
    }

    #[test]
    fn directory_lists_children_and_checks_membership_by_name() {
        let temp = tempfile::tempdir().unwrap();
        write_file(&temp.path().join("a/x.txt"), b"x");
        std::fs::create_dir_all(temp.path().join("a/sub")).unwrap();
        write_file(&temp.path().join("b/x.txt"), b"other");

        let a = DirEntry::new(temp.path().join("a"));
        let b = DirEntry::new(temp.path().join("b"));

        let mut names = a.entries().unwrap().iter().map(Entry::name).collect::<Vec<_>>();
        names.sort();
        assert_eq!(names, vec!["sub".to_string(), "x.txt".to_string()]);

        for entry in a.entries().unwrap() {
            assert_eq!(b.contains(&entry), entry.name() == "x.txt");
        }
        assert!(matches!(a.child("sub"), Some(Entry::Directory(_))));
        assert!(a.child("missing").is_none());
        assert!(!a.file("missing.txt").exists());
    }
}
