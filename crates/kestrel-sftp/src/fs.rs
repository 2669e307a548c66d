//! Filesystem access behind the sandbox
//!
//! The session engine only touches the disk through [`SftpFileSystem`],
//! which takes jail-relative [`RootedPath`]s. [`RootedFileSystem`] is the
//! production implementation over `std::fs`, jailed to a configured root
//! directory. Attribute reads distinguish "the backend cannot represent
//! this" (`Ok(None)`) from "the file is gone" (`Err`), so unsupported
//! metadata degrades silently instead of failing requests.

use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::warn;

use crate::attrs::Timestamp;
use crate::path::{from_normalized_rel, RootedPath};

/// Plain stat results every backend can produce.
#[derive(Debug, Clone, Copy)]
pub struct BasicAttributes {
    pub is_directory: bool,
    pub is_regular: bool,
    pub is_symlink: bool,
    pub size: u64,
    pub modified: Option<Timestamp>,
    pub accessed: Option<Timestamp>,
}

impl BasicAttributes {
    fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        BasicAttributes {
            is_directory: ft.is_dir(),
            is_regular: ft.is_file(),
            is_symlink: ft.is_symlink(),
            size: meta.len(),
            modified: meta.modified().ok().and_then(system_time_to_timestamp),
            accessed: meta.accessed().ok().and_then(system_time_to_timestamp),
        }
    }
}

/// POSIX ownership and permission bits.
#[derive(Debug, Clone)]
pub struct PosixAttributes {
    pub owner: String,
    pub group: String,
    pub permissions: u32,
}

/// Platform file bits in the DOS sense; `readonly` is derived from the
/// permission bits on POSIX systems.
#[derive(Debug, Clone, Copy)]
pub struct PlatformBits {
    pub readonly: bool,
    pub archive: bool,
    pub system: bool,
}

/// Translated OPEN semantics.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenOptions {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub create_new: bool,
    pub truncate: bool,
    pub append: bool,
    pub delete_on_close: bool,
}

/// Open file usable by the session: positioned reads and writes over a
/// seekable byte channel.
///
/// `close` exists so close-time failures (deferred write errors, a
/// delete-on-close unlink that cannot complete) reach the caller instead
/// of being swallowed by `Drop`.
pub trait FileChannel: Read + Write + Seek + Send {
    /// Releases the channel, reporting any failure to do so cleanly.
    fn close(&mut self) -> io::Result<()>;
}

impl FileChannel for File {
    fn close(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

/// Directory listing; entries come back as rooted paths.
pub type DirEntries = Box<dyn Iterator<Item = io::Result<RootedPath>> + Send>;

/// Everything the session engine needs from a file store.
pub trait SftpFileSystem: Send + Sync {
    /// Stats a path. `follow_links` selects whether a final symlink is
    /// dereferenced.
    fn read_basic(&self, path: &RootedPath, follow_links: bool) -> io::Result<BasicAttributes>;

    /// POSIX ownership and permissions. `Ok(None)` when the backend has
    /// no POSIX view.
    fn read_posix(&self, path: &RootedPath, follow_links: bool)
        -> io::Result<Option<PosixAttributes>>;

    /// Platform file bits. `Ok(None)` when the backend has none.
    fn read_platform_bits(
        &self,
        path: &RootedPath,
        follow_links: bool,
    ) -> io::Result<Option<PlatformBits>>;

    /// True when the path names a symlink (never follows).
    fn is_symlink(&self, path: &RootedPath) -> bool;

    /// Hidden-file convention for this platform.
    fn is_hidden(&self, path: &RootedPath) -> io::Result<bool>;

    /// True when the path names a directory (follows links).
    fn is_directory(&self, path: &RootedPath) -> bool;

    /// True when the path names anything at all.
    fn exists(&self, path: &RootedPath) -> bool;

    /// Opens a directory for iteration.
    fn read_dir(&self, path: &RootedPath) -> io::Result<DirEntries>;

    /// Opens a file with the translated OPEN semantics.
    fn open(&self, path: &RootedPath, options: &OpenOptions) -> io::Result<Box<dyn FileChannel>>;

    /// Resolves symlinks to the real location, still inside the jail.
    fn canonicalize(&self, path: &RootedPath) -> io::Result<RootedPath>;

    /// Writes the modification time.
    fn set_modified_time(&self, path: &RootedPath, ts: Timestamp) -> io::Result<()>;

    /// Writes POSIX permission bits, where supported.
    fn set_permissions(&self, path: &RootedPath, mode: u32) -> io::Result<()>;
}

fn system_time_to_timestamp(t: SystemTime) -> Option<Timestamp> {
    let d = t.duration_since(UNIX_EPOCH).ok()?;
    Some(Timestamp {
        seconds: i64::try_from(d.as_secs()).ok()?,
        nanoseconds: d.subsec_nanos(),
    })
}

/// Production filesystem jailed to a root directory.
pub struct RootedFileSystem {
    root: PathBuf,
}

impl RootedFileSystem {
    /// Jails the filesystem to `root`, which must be an existing
    /// directory. The root is canonicalized once so later prefix checks
    /// compare like with like.
    pub fn new(root: &Path) -> io::Result<Self> {
        let root = root.canonicalize()?;
        if !root.is_dir() {
            return Err(io::Error::other(format!(
                "root {} is not a directory",
                root.display()
            )));
        }
        Ok(RootedFileSystem { root })
    }

    /// Host path for a jail-relative path.
    fn real(&self, path: &RootedPath) -> PathBuf {
        self.root.join(path.as_rel_path())
    }

    fn metadata(&self, path: &RootedPath, follow_links: bool) -> io::Result<Metadata> {
        let real = self.real(path);
        if follow_links {
            std::fs::metadata(real)
        } else {
            std::fs::symlink_metadata(real)
        }
    }
}

impl SftpFileSystem for RootedFileSystem {
    fn read_basic(&self, path: &RootedPath, follow_links: bool) -> io::Result<BasicAttributes> {
        Ok(BasicAttributes::from_metadata(&self.metadata(path, follow_links)?))
    }

    #[cfg(unix)]
    fn read_posix(
        &self,
        path: &RootedPath,
        follow_links: bool,
    ) -> io::Result<Option<PosixAttributes>> {
        use std::os::unix::fs::MetadataExt;
        let meta = self.metadata(path, follow_links)?;
        // Numeric ids; principal name lookup is a policy question left to
        // the client.
        Ok(Some(PosixAttributes {
            owner: meta.uid().to_string(),
            group: meta.gid().to_string(),
            permissions: meta.mode() & 0o7777,
        }))
    }

    #[cfg(not(unix))]
    fn read_posix(
        &self,
        _path: &RootedPath,
        _follow_links: bool,
    ) -> io::Result<Option<PosixAttributes>> {
        Ok(None)
    }

    #[cfg(unix)]
    fn read_platform_bits(
        &self,
        path: &RootedPath,
        follow_links: bool,
    ) -> io::Result<Option<PlatformBits>> {
        use std::os::unix::fs::MetadataExt;
        let meta = self.metadata(path, follow_links)?;
        Ok(Some(PlatformBits {
            readonly: meta.mode() & 0o222 == 0,
            archive: false,
            system: false,
        }))
    }

    #[cfg(not(unix))]
    fn read_platform_bits(
        &self,
        _path: &RootedPath,
        _follow_links: bool,
    ) -> io::Result<Option<PlatformBits>> {
        Ok(None)
    }

    fn is_symlink(&self, path: &RootedPath) -> bool {
        std::fs::symlink_metadata(self.real(path))
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false)
    }

    fn is_hidden(&self, path: &RootedPath) -> io::Result<bool> {
        // Unix convention; the root itself is never hidden.
        Ok(path.file_name().starts_with('.'))
    }

    fn is_directory(&self, path: &RootedPath) -> bool {
        self.real(path).is_dir()
    }

    fn exists(&self, path: &RootedPath) -> bool {
        std::fs::symlink_metadata(self.real(path)).is_ok()
    }

    fn read_dir(&self, path: &RootedPath) -> io::Result<DirEntries> {
        let parent = path.clone();
        let entries = std::fs::read_dir(self.real(path))?.map(move |entry| {
            let entry = entry?;
            match entry.file_name().into_string() {
                Ok(name) => Ok(parent.child(&name)),
                Err(raw) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non-UTF-8 file name {raw:?}"),
                )),
            }
        });
        Ok(Box::new(entries))
    }

    fn open(&self, path: &RootedPath, options: &OpenOptions) -> io::Result<Box<dyn FileChannel>> {
        let real = self.real(path);
        let mut std_options = std::fs::OpenOptions::new();
        std_options
            .read(options.read)
            .write(options.write || options.append)
            .create(options.create)
            .create_new(options.create_new)
            .truncate(options.truncate)
            .append(options.append);
        let file = std_options.open(&real)?;
        if options.delete_on_close {
            Ok(Box::new(DeleteOnClose {
                file,
                path: real,
                removed: false,
            }))
        } else {
            Ok(Box::new(file))
        }
    }

    fn canonicalize(&self, path: &RootedPath) -> io::Result<RootedPath> {
        let resolved = self.real(path).canonicalize()?;
        // NIST 800-53 AC-3: symlinks must not escape the jail.
        match resolved.strip_prefix(&self.root) {
            Ok(rel) => Ok(from_normalized_rel(rel.to_path_buf())),
            Err(_) => Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "path resolves outside the root",
            )),
        }
    }

    fn set_modified_time(&self, path: &RootedPath, ts: Timestamp) -> io::Result<()> {
        let seconds = u64::try_from(ts.seconds).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "modification time before epoch")
        })?;
        let mtime = UNIX_EPOCH + Duration::new(seconds, ts.nanoseconds);
        let file = File::options().write(true).open(self.real(path))?;
        file.set_modified(mtime)
    }

    #[cfg(unix)]
    fn set_permissions(&self, path: &RootedPath, mode: u32) -> io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(self.real(path), std::fs::Permissions::from_mode(mode))
    }

    #[cfg(not(unix))]
    fn set_permissions(&self, _path: &RootedPath, _mode: u32) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "permission bits not supported on this platform",
        ))
    }
}

/// File wrapper that unlinks its path when the handle is released.
///
/// An explicit `close` reports unlink failures to the caller; `Drop` is
/// the fallback for channels abandoned without one (a dying session) and
/// can only log.
struct DeleteOnClose {
    file: File,
    path: PathBuf,
    removed: bool,
}

impl FileChannel for DeleteOnClose {
    fn close(&mut self) -> io::Result<()> {
        self.file.sync_all()?;
        std::fs::remove_file(&self.path)?;
        self.removed = true;
        Ok(())
    }
}

impl Drop for DeleteOnClose {
    fn drop(&mut self) {
        if self.removed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!("delete-on-close failed for {}: {e}", self.path.display());
        }
    }
}

impl Read for DeleteOnClose {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for DeleteOnClose {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for DeleteOnClose {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
