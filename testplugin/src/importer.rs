//! Importer over a local directory tree

use snapwire::bridge::PluginConfig;
use snapwire::{FileInfo, Importer, PluginError, ScanError, ScanIter, ScanRecord, ScanResult};
use std::fs::{self, File, Metadata};
use std::io::Read;
use std::os::unix::fs::MetadataExt;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;

/// Config keys:
/// - `root` (required): directory to scan
/// - `endless`: `true` yields synthetic records forever
/// - `fail_after`: with `endless`, fail the scan after this many records
/// - `release_marker`: file created when a scan iterator is dropped
pub struct DirImporter {
    root: PathBuf,
    endless: bool,
    fail_after: Option<u64>,
    release_marker: Option<PathBuf>,
}

impl DirImporter {
    pub fn new(config: &PluginConfig) -> Result<Self, PluginError> {
        let root = config
            .get("root")
            .ok_or_else(|| PluginError::invalid("importer needs a root"))?;
        Ok(Self {
            root: PathBuf::from(root),
            endless: config.get("endless").map(|v| v == "true").unwrap_or(false),
            fail_after: config
                .get("fail_after")
                .map(|v| v.parse().map_err(|_| PluginError::invalid(format!("bad fail_after: {}", v))))
                .transpose()?,
            release_marker: config.get("release_marker").map(PathBuf::from),
        })
    }

    /// Resolve a scanned pathname below the root, refusing `..` escapes.
    fn resolve(&self, pathname: &str) -> Result<PathBuf, PluginError> {
        let relative = Path::new(pathname.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(PluginError::invalid(format!("path escapes root: {}", pathname)));
        }
        Ok(self.root.join(relative))
    }
}

fn file_info(name: &str, meta: &Metadata) -> FileInfo {
    FileInfo {
        name: name.to_string(),
        size: meta.len() as i64,
        mode: meta.mode(),
        mod_time: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        dev: meta.dev(),
        ino: meta.ino(),
        uid: meta.uid() as u64,
        gid: meta.gid() as u64,
        nlink: meta.nlink() as u32,
        username: String::new(),
        groupname: String::new(),
    }
}

/// Depth-first walk in name order. Directories are read only when reached.
struct DirWalk {
    root: PathBuf,
    /// Pending entries, last element is next
    stack: Vec<PathBuf>,
    release_marker: Option<PathBuf>,
}

impl DirWalk {
    fn new(root: PathBuf, release_marker: Option<PathBuf>) -> Self {
        Self {
            stack: vec![root.clone()],
            root,
            release_marker,
        }
    }

    fn pathname(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(rel) if rel.as_os_str().is_empty() => "/".to_string(),
            Ok(rel) => format!("/{}", rel.display()),
            Err(_) => path.display().to_string(),
        }
    }

    /// An entry that cannot be read becomes a `ScanResult::Error`; the root
    /// itself failing ends the scan.
    fn visit(&mut self, path: PathBuf) -> Result<ScanResult, PluginError> {
        let pathname = self.pathname(&path);
        let is_root = path == self.root;
        let error = |message: String| {
            if is_root {
                Err(PluginError::handler(format!("cannot scan {}: {}", path.display(), message)))
            } else {
                Ok(ScanResult::Error(ScanError { pathname: pathname.clone(), message }))
            }
        };

        let meta = match fs::symlink_metadata(&path) {
            Ok(meta) => meta,
            Err(e) => return error(e.to_string()),
        };

        if meta.is_dir() {
            match fs::read_dir(&path) {
                Ok(entries) => {
                    let mut children: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
                    children.sort();
                    self.stack.extend(children.into_iter().rev());
                }
                Err(e) => return error(e.to_string()),
            }
        }

        let target = if meta.file_type().is_symlink() {
            fs::read_link(&path).ok().map(|t| t.display().to_string())
        } else {
            None
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/".to_string());

        Ok(ScanResult::Record(ScanRecord {
            pathname,
            file_info: file_info(&name, &meta),
            target,
            is_xattr: false,
            xattr_name: None,
        }))
    }
}

impl Iterator for DirWalk {
    type Item = Result<ScanResult, PluginError>;

    fn next(&mut self) -> Option<Self::Item> {
        let path = self.stack.pop()?;
        Some(self.visit(path))
    }
}

impl Drop for DirWalk {
    fn drop(&mut self) {
        release(&self.release_marker);
    }
}

/// Synthetic scan that never ends unless told to fail.
struct Endless {
    next: u64,
    fail_after: Option<u64>,
    release_marker: Option<PathBuf>,
}

impl Iterator for Endless {
    type Item = Result<ScanResult, PluginError>;

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.next;
        match self.fail_after {
            Some(limit) if n > limit => return None,
            Some(limit) if n == limit => {
                self.next += 1;
                return Some(Err(PluginError::handler(format!("scan aborted after {} entries", limit))));
            }
            _ => {}
        }
        self.next += 1;
        let name = format!("file-{:08}", n);
        Some(Ok(ScanResult::Record(ScanRecord {
            pathname: format!("/{}", name),
            file_info: FileInfo::regular(&name, 0, 0o100644),
            target: None,
            is_xattr: false,
            xattr_name: None,
        })))
    }
}

impl Drop for Endless {
    fn drop(&mut self) {
        release(&self.release_marker);
    }
}

fn release(marker: &Option<PathBuf>) {
    if let Some(marker) = marker {
        debug!(?marker, "scan iterator released");
        let _ = File::create(marker);
    }
}

impl Importer for DirImporter {
    fn origin(&self) -> Result<String, PluginError> {
        Ok("localhost".to_string())
    }

    fn kind(&self) -> Result<String, PluginError> {
        Ok("fs".to_string())
    }

    fn root(&self) -> Result<String, PluginError> {
        Ok(self.root.display().to_string())
    }

    fn scan(&self) -> Result<ScanIter, PluginError> {
        if self.endless {
            return Ok(Box::new(Endless {
                next: 0,
                fail_after: self.fail_after,
                release_marker: self.release_marker.clone(),
            }));
        }
        if !self.root.is_dir() {
            return Err(PluginError::not_found(format!("{} is not a directory", self.root.display())));
        }
        Ok(Box::new(DirWalk::new(self.root.clone(), self.release_marker.clone())))
    }

    fn open_reader(&self, pathname: &str) -> Result<Box<dyn Read + Send>, PluginError> {
        let path = self.resolve(pathname)?;
        match File::open(&path) {
            Ok(file) => Ok(Box::new(file)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(PluginError::not_found(format!("{} not found", pathname)))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
