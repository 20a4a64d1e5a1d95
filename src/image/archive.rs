//! Gzip-compressed tar archives, for images and volume backups

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::{
    fs,
    io::{self, Read, Write},
    os::unix::fs::{symlink, PermissionsExt},
    path::{Component, Path, PathBuf},
};
use tar::{Archive, Builder, EntryType, Header};

/// Unpack a `.tar.gz` stream into `target`
///
/// Every entry must land inside `target`: paths with `..` components, and
/// paths that pass through a symlink created by an earlier entry, are
/// rejected with the error built by `traversal`. Directories, regular files,
/// and symlinks are supported; other entry types are skipped.
pub fn extract<R, E, F>(compressed: R, target: &Path, traversal: F) -> Result<(), E>
where
    R: Read,
    E: From<io::Error>,
    F: Fn(String) -> E,
{
    fs::create_dir_all(target)?;
    let mut archive = Archive::new(GzDecoder::new(compressed));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().into_owned();
        let relative = match relative_path(&name) {
            Some(path) => path,
            None => return Err(traversal(name)),
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        if passes_through_symlink(target, &relative) {
            return Err(traversal(name));
        }
        let path = target.join(&relative);
        let mode = entry.header().mode()? & 0o7777;
        let kind = entry.header().entry_type();
        match kind {
            EntryType::Directory => {
                fs::create_dir_all(&path)?;
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Regular => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                remove_symlink(&path)?;
                let mut file = fs::File::create(&path)?;
                io::copy(&mut entry, &mut file)?;
                fs::set_permissions(&path, fs::Permissions::from_mode(mode))?;
            }
            EntryType::Symlink => match entry.link_name()? {
                Some(link_name) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    remove_symlink(&path)?;
                    symlink(&link_name, &path)?;
                }
                None => log::warn!("skipping symlink {:?} with no target", name),
            },
            _ => log::warn!("skipping unsupported tar entry type {:?} for {:?}", kind, name),
        }
    }
    Ok(())
}

/// Entry path relative to the extraction root, or `None` if it tries to
/// leave it
fn relative_path(name: &str) -> Option<PathBuf> {
    let mut path = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => return None,
        }
    }
    Some(path)
}

fn passes_through_symlink(target: &Path, relative: &Path) -> bool {
    let mut path = target.to_path_buf();
    let mut components = relative.components().peekable();
    while let Some(component) = components.next() {
        if components.peek().is_none() {
            break;
        }
        path.push(component);
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_symlink() => return true,
            _ => {}
        }
    }
    false
}

fn remove_symlink(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => fs::remove_file(path),
        _ => Ok(()),
    }
}

/// Pack the contents of `dir` into a `.tar.gz` stream
///
/// Symlinks are stored as links, not followed.
pub fn pack_dir<W: Write>(dir: &Path, output: W) -> io::Result<W> {
    let mut builder = Builder::new(GzEncoder::new(output, Compression::default()));
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    builder.into_inner()?.finish()
}

/// Incrementally written `.tar.gz` archive with in-memory contents
pub struct ArchiveWriter<W: Write> {
    builder: Builder<GzEncoder<W>>,
}

impl<W: Write> ArchiveWriter<W> {
    pub fn new(output: W) -> Self {
        ArchiveWriter {
            builder: Builder::new(GzEncoder::new(output, Compression::default())),
        }
    }

    pub fn dir(&mut self, path: &str) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        header.set_mtime(0);
        self.builder.append_data(&mut header, path, io::empty())
    }

    pub fn file(&mut self, path: &str, mode: u32, contents: &[u8]) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(mode);
        header.set_size(contents.len() as u64);
        header.set_mtime(0);
        self.builder.append_data(&mut header, path, contents)
    }

    pub fn symlink(&mut self, path: &str, target: &str) -> io::Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Symlink);
        header.set_mode(0o777);
        header.set_size(0);
        header.set_mtime(0);
        self.builder.append_link(&mut header, path, target)
    }

    pub fn finish(self) -> io::Result<W> {
        self.builder.into_inner()?.finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_dir(tag: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("minibox-archive-{}-{}", tag, rand::random::<u64>()));
        path
    }

    fn unpack(data: &[u8], target: &Path) -> Result<(), io::Error> {
        extract(data, target, |name| {
            io::Error::new(io::ErrorKind::InvalidData, name)
        })
    }

    #[test]
    fn roundtrip_dir() {
        let source = temp_dir("source");
        fs::create_dir_all(source.join("nested")).unwrap();
        fs::write(source.join("nested/file.txt"), b"contents").unwrap();
        symlink("nested/file.txt", source.join("link")).unwrap();
        let packed = pack_dir(&source, Vec::new()).unwrap();

        let target = temp_dir("target");
        unpack(&packed, &target).unwrap();
        assert_eq!(fs::read(target.join("nested/file.txt")).unwrap(), b"contents");
        assert!(fs::symlink_metadata(target.join("link"))
            .unwrap()
            .file_type()
            .is_symlink());
        fs::remove_dir_all(&source).unwrap();
        fs::remove_dir_all(&target).unwrap();
    }

    #[test]
    fn rejects_parent_components() {
        let mut builder = Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_size(4);
        // set_path refuses `..`, so write the raw name bytes
        header.as_old_mut().name[..9].copy_from_slice(b"../escape");
        header.set_cksum();
        builder.append(&header, &b"evil"[..]).unwrap();
        let packed = builder.into_inner().unwrap().finish().unwrap();

        let target = temp_dir("escape");
        let err = unpack(&packed, &target).unwrap_err();
        assert_eq!(err.to_string(), "../escape");
        assert!(!target.parent().unwrap().join("escape").exists());
        fs::remove_dir_all(&target).unwrap();
    }

    #[test]
    fn rejects_writes_through_symlinks() {
        let mut writer = ArchiveWriter::new(Vec::new());
        writer.symlink("etc", "/etc").unwrap();
        writer.file("etc/owned", 0o644, b"no").unwrap();
        let packed = writer.finish().unwrap();

        let target = temp_dir("symlink");
        let err = unpack(&packed, &target).unwrap_err();
        assert_eq!(err.to_string(), "etc/owned");
        fs::remove_dir_all(&target).unwrap();
    }
}
