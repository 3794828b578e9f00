//! Exporter into a local directory

use snapwire::bridge::PluginConfig;
use snapwire::{Exporter, FileInfo, PluginError};
use std::fs::{self, File, Permissions};
use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Config keys:
/// - `root` (required): destination directory, created if missing
pub struct DirExporter {
    root: PathBuf,
}

impl DirExporter {
    pub fn new(config: &PluginConfig) -> Result<Self, PluginError> {
        let root = config
            .get("root")
            .ok_or_else(|| PluginError::invalid("exporter needs a root"))?;
        fs::create_dir_all(root)?;
        Ok(Self { root: PathBuf::from(root) })
    }

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

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".partial");
    PathBuf::from(name)
}

impl Exporter for DirExporter {
    fn root(&self) -> Result<String, PluginError> {
        Ok(self.root.display().to_string())
    }

    fn create_directory(&self, pathname: &str) -> Result<(), PluginError> {
        fs::create_dir_all(self.resolve(pathname)?)?;
        Ok(())
    }

    fn store_file(&self, pathname: &str, reader: &mut dyn Read, size: u64) -> Result<(), PluginError> {
        let path = self.resolve(pathname)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Only a complete body replaces the destination.
        let partial = partial_path(&path);
        let written = File::create(&partial).and_then(|mut file| {
            let n = io::copy(reader, &mut file)?;
            file.flush()?;
            Ok(n)
        });
        match written {
            Ok(n) => {
                fs::rename(&partial, &path)?;
                debug!(pathname, bytes = n, declared = size, "stored file");
                Ok(())
            }
            Err(e) => {
                let _ = fs::remove_file(&partial);
                Err(e.into())
            }
        }
    }

    fn set_permissions(&self, pathname: &str, info: &FileInfo) -> Result<(), PluginError> {
        let path = self.resolve(pathname)?;
        fs::set_permissions(&path, Permissions::from_mode(info.mode & 0o7777))?;
        Ok(())
    }

    fn close(&self) -> Result<(), PluginError> {
        Ok(())
    }
}
