//! Copy engine: tar streams between host filesystem and container rootfs.
//!
//! `cp SRC DST` where at most one side is `CONTAINER:PATH`. One side
//! produces a tar stream into an in-memory pipe, the other side extracts
//! it; both halves run concurrently and their errors are joined rather
//! than first-error-wins. Container paths resolve symlinks bounded inside
//! the rootfs so a hostile link can never escape it.

use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::mpsc;

// =============================================================================
// Target Parsing
// =============================================================================

/// One side of a copy: host path or container-relative path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopySpec {
    Host(PathBuf),
    Container { name: String, path: PathBuf },
}

impl CopySpec {
    /// Parses `NAME:PATH` vs a plain host path. A leading `/` or `.` or a
    /// single-character prefix means host (paths, not names).
    pub fn parse(s: &str) -> Self {
        if let Some((name, path)) = s.split_once(':') {
            let looks_like_name = !name.is_empty()
                && name.len() > 1
                && !name.starts_with('/')
                && !name.starts_with('.')
                && !name.contains('/');
            if looks_like_name {
                return CopySpec::Container {
                    name: name.to_string(),
                    path: PathBuf::from(path),
                };
            }
        }
        CopySpec::Host(PathBuf::from(s))
    }

    pub fn is_container(&self) -> bool {
        matches!(self, CopySpec::Container { .. })
    }
}

/// Validates the pair: at most one side may name a container.
pub fn parse_pair(src: &str, dst: &str) -> Result<(CopySpec, CopySpec)> {
    let src = CopySpec::parse(src);
    let dst = CopySpec::parse(dst);
    if src.is_container() && dst.is_container() {
        return Err(Error::InvalidArg(
            "copying between containers is not supported".to_string(),
        ));
    }
    Ok((src, dst))
}

// =============================================================================
// Path Resolution
// =============================================================================

/// Resolves `path` inside `rootfs`, following symlinks but clamping every
/// hop to the rootfs. The returned path is on the host, always at or below
/// the rootfs.
pub fn resolve_in_rootfs(rootfs: &Path, path: &Path) -> PathBuf {
    resolve_suffix(rootfs, rootfs.to_path_buf(), 0, path, 0)
}

fn resolve_suffix(
    rootfs: &Path,
    mut resolved: PathBuf,
    mut depth: usize,
    rest: &Path,
    hops: usize,
) -> PathBuf {
    // Symlink-loop guard.
    if hops > 64 {
        return resolved;
    }
    let mut components = rest.components();
    while let Some(component) = components.next() {
        match component {
            Component::RootDir | Component::Prefix(_) | Component::CurDir => {}
            Component::ParentDir => {
                if depth > 0 {
                    resolved.pop();
                    depth -= 1;
                }
            }
            Component::Normal(part) => {
                let candidate = resolved.join(part);
                if let Ok(target) = std::fs::read_link(&candidate) {
                    let (base, base_depth) = if target.is_absolute() {
                        (rootfs.to_path_buf(), 0)
                    } else {
                        (resolved.clone(), depth)
                    };
                    // Re-walk the link target, then whatever remained.
                    let mut rewritten = target;
                    for c in components {
                        rewritten.push(c.as_os_str());
                    }
                    return resolve_suffix(rootfs, base, base_depth, &rewritten, hops + 1);
                }
                resolved = candidate;
                depth += 1;
            }
        }
    }
    resolved
}

/// Resolves a host path through its readlink chain; missing trailing
/// components are kept (copy may create them).
pub fn resolve_host(path: &Path) -> PathBuf {
    match path.canonicalize() {
        Ok(p) => p,
        Err(_) => {
            // Canonicalize the parent, keep the missing base name.
            match (path.parent(), path.file_name()) {
                (Some(parent), Some(name)) => match parent.canonicalize() {
                    Ok(p) => p.join(name),
                    Err(_) => path.to_path_buf(),
                },
                _ => path.to_path_buf(),
            }
        }
    }
}

// =============================================================================
// Resolved Endpoints
// =============================================================================

/// A copy endpoint resolved to a host-visible path.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    /// Host path of the file or directory.
    pub path: PathBuf,
    /// The user wrote a trailing slash (must be a directory).
    pub trailing_slash: bool,
}

impl ResolvedTarget {
    pub fn new(path: PathBuf, original: &str) -> Self {
        Self {
            path,
            trailing_slash: original.ends_with('/'),
        }
    }
}

// =============================================================================
// Copy Pipeline
// =============================================================================

/// Copies `src` to `dst`, both already resolved to host-visible paths.
///
/// Semantics:
/// - missing source fails before the destination is touched;
/// - missing destination parent fails;
/// - missing destination with an existing parent is a base-name rename;
/// - a trailing slash on a missing destination is rejected;
/// - file-to-directory drops the file into the directory;
/// - directory-to-directory copies contents into `dst/<basename>`.
pub fn copy(src: &ResolvedTarget, dst: &ResolvedTarget) -> Result<()> {
    let src_meta = std::fs::symlink_metadata(&src.path)
        .map_err(|_| Error::InvalidArg(format!("{:?}: no such file or directory", src.path)))?;

    let dst_meta = std::fs::symlink_metadata(&dst.path).ok();
    if dst_meta.is_none() {
        if dst.trailing_slash {
            return Err(Error::InvalidArg(format!(
                "destination {:?} ends with a path separator but does not exist",
                dst.path
            )));
        }
        let parent = dst.path.parent().ok_or_else(|| {
            Error::InvalidArg(format!("destination {:?} has no parent", dst.path))
        })?;
        if !parent.exists() {
            return Err(Error::InvalidArg(format!(
                "destination parent {parent:?} does not exist"
            )));
        }
    }

    let dst_is_dir = dst_meta.as_ref().is_some_and(|m| m.is_dir());

    if src_meta.is_dir() {
        if let Some(meta) = &dst_meta {
            if !meta.is_dir() {
                return Err(Error::InvalidArg(
                    "cannot copy a directory onto a file".to_string(),
                ));
            }
        }
        let target = if dst_meta.is_some() {
            dst.path
                .join(src.path.file_name().unwrap_or_default())
        } else {
            dst.path.clone()
        };
        pipe_tree(&src.path, &target)
    } else {
        // File source: into the dir, or file-to-file with base-name rename.
        let target = if dst_is_dir {
            dst.path.join(src.path.file_name().unwrap_or_default())
        } else {
            dst.path.clone()
        };
        pipe_file(&src.path, &target)
    }
}

/// Streams a single file through the tar pipe.
fn pipe_file(src: &Path, dst: &Path) -> Result<()> {
    let file_name = src
        .file_name()
        .ok_or_else(|| Error::InvalidArg(format!("{src:?} has no file name")))?
        .to_os_string();
    let (writer, reader) = chunk_pipe();
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();

    let producer = std::thread::spawn(move || -> Result<()> {
        let mut builder = tar::Builder::new(writer);
        let mut file = std::fs::File::open(&src)?;
        builder.append_file(Path::new(&file_name), &mut file)?;
        builder.finish()?;
        Ok(())
    });
    let consumer = std::thread::spawn(move || -> Result<()> {
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_mtime(true);
        archive.set_preserve_permissions(true);
        for entry in archive.entries().map_err(|e| Error::Internal(e.to_string()))? {
            let mut entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
            // Base-name rename: the archived name becomes the target name.
            entry
                .unpack(&dst)
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        Ok(())
    });

    join_halves(producer, consumer)
}

/// Streams a directory tree through the tar pipe.
fn pipe_tree(src: &Path, dst: &Path) -> Result<()> {
    let (writer, reader) = chunk_pipe();
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();

    let producer = std::thread::spawn(move || -> Result<()> {
        let mut builder = tar::Builder::new(writer);
        builder.append_dir_all(".", &src)?;
        builder.finish()?;
        Ok(())
    });
    let consumer = std::thread::spawn(move || -> Result<()> {
        std::fs::create_dir_all(&dst)?;
        let mut archive = tar::Archive::new(reader);
        archive.set_preserve_mtime(true);
        archive.set_preserve_permissions(true);
        archive
            .unpack(&dst)
            .map_err(|e| Error::Internal(e.to_string()))?;
        Ok(())
    });

    join_halves(producer, consumer)
}

/// Joins both pipeline halves, reporting every error rather than the first.
fn join_halves(
    producer: std::thread::JoinHandle<Result<()>>,
    consumer: std::thread::JoinHandle<Result<()>>,
) -> Result<()> {
    let produced = producer
        .join()
        .map_err(|_| Error::Internal("copy producer panicked".to_string()))?;
    let consumed = consumer
        .join()
        .map_err(|_| Error::Internal("copy consumer panicked".to_string()))?;
    match (produced, consumed) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(p), Err(c)) => Err(Error::Internal(format!("copy failed: {p}; {c}"))),
        (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
    }
}

// =============================================================================
// Stdin Source
// =============================================================================

/// Copies a tar stream (e.g. stdin) into a directory. The stream is
/// buffered to a temp file and validated as an archive before anything is
/// written to the destination.
pub fn copy_from_stream(mut input: impl Read, dst: &ResolvedTarget) -> Result<()> {
    if !dst.path.is_dir() {
        return Err(Error::InvalidArg(
            "streamed copy requires a directory destination".to_string(),
        ));
    }

    let mut tmp = tempfile_in_system()?;
    std::io::copy(&mut input, &mut tmp)?;
    tmp.flush()?;

    // Validate before touching the destination.
    let mut probe = tmp.reopen()?;
    {
        let mut archive = tar::Archive::new(&mut probe);
        let mut entries = archive
            .entries()
            .map_err(|_| Error::InvalidArg("input is not a tar archive".to_string()))?;
        match entries.next() {
            Some(Ok(_)) => {}
            _ => return Err(Error::InvalidArg("input is not a tar archive".to_string())),
        }
    }

    let reader = tmp.reopen()?;
    let mut archive = tar::Archive::new(reader);
    archive
        .unpack(&dst.path)
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(())
}

fn tempfile_in_system() -> Result<NamedTemp> {
    let path = std::env::temp_dir().join(format!(
        "caravel-cp-{}",
        crate::container::config::new_id()
    ));
    let file = std::fs::File::create(&path)?;
    Ok(NamedTemp { path, file })
}

/// Minimal named temp file that cleans up on drop.
struct NamedTemp {
    path: PathBuf,
    file: std::fs::File,
}

impl NamedTemp {
    fn reopen(&self) -> Result<std::fs::File> {
        Ok(std::fs::File::open(&self.path)?)
    }
}

impl Write for NamedTemp {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }
    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

impl Drop for NamedTemp {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

// =============================================================================
// In-Memory Pipe
// =============================================================================

/// Write half of the in-memory pipe.
struct PipeWriter {
    tx: mpsc::SyncSender<Vec<u8>>,
}

/// Read half of the in-memory pipe.
struct PipeReader {
    rx: mpsc::Receiver<Vec<u8>>,
    buffer: Vec<u8>,
    offset: usize,
}

/// A bounded in-memory byte pipe for bridging the two tar halves.
fn chunk_pipe() -> (impl Write + Send, impl Read + Send) {
    let (tx, rx) = mpsc::sync_channel(16);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buffer: Vec::new(),
            offset: 0,
        },
    )
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.tx
            .send(buf.to_vec())
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::BrokenPipe, "reader gone"))?;
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.offset >= self.buffer.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buffer = chunk;
                    self.offset = 0;
                }
                // Writer dropped: EOF.
                Err(_) => return Ok(0),
            }
        }
        let n = (self.buffer.len() - self.offset).min(buf.len());
        buf[..n].copy_from_slice(&self.buffer[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
