//! Local directory used as a deployment target.

use super::{Transport, TransportError, TransportOptions, TransportResult};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use walkdir::WalkDir;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

pub struct LocalTransport {
    root: PathBuf,
    file_permissions: Option<u32>,
    dir_permissions: Option<u32>,
}

impl LocalTransport {
    pub fn new(root: impl Into<PathBuf>, options: &TransportOptions) -> Self {
        Self {
            root: root.into(),
            file_permissions: options.file_permissions,
            dir_permissions: options.dir_permissions,
        }
    }
}

#[track_caller]
fn failed(action: &str, path: &str, error: std::io::Error) -> TransportError {
    TransportError::new(format!("Unable to {action} {path}: {error}"))
}

fn exists(path: &str) -> bool {
    fs::symlink_metadata(path).is_ok()
}

#[cfg(unix)]
fn current_mode(path: &str) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path).ok().map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn current_mode(_path: &str) -> Option<u32> {
    None
}

impl Transport for LocalTransport {
    fn connect(&mut self) -> TransportResult<()> {
        if !self.root.is_dir() {
            return Err(TransportError::new(format!(
                "Directory {} doesn't exist",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn read_file(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        fs::copy(remote, local).map_err(|e| failed("read", remote, e))?;
        Ok(())
    }

    fn write_file(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(f64),
    ) -> TransportResult<()> {
        let mut source = File::open(local).map_err(|e| failed("open", &local.display().to_string(), e))?;
        let total = source.metadata()?.len();
        let mut target = File::create(remote).map_err(|e| failed("write", remote, e))?;

        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;
        loop {
            let n = source.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            target
                .write_all(&buffer[..n])
                .map_err(|e| failed("write", remote, e))?;
            written += n as u64;
            if total > 0 {
                progress(written as f64 * 100.0 / total as f64);
            }
        }
        target.flush()?;
        progress(100.0);

        if let Some(mode) = self.file_permissions {
            self.chmod(remote, mode)?;
        }
        Ok(())
    }

    fn remove_file(&mut self, file: &str) -> TransportResult<()> {
        if exists(file) {
            fs::remove_file(file).map_err(|e| failed("remove file", file, e))?;
        }
        Ok(())
    }

    fn rename_file(&mut self, old: &str, new: &str) -> TransportResult<()> {
        let mode = current_mode(new);
        fs::rename(old, new).map_err(|e| failed("rename file", old, e))?;
        if let Some(mode) = mode {
            self.chmod(new, mode)?;
        }
        Ok(())
    }

    fn create_dir(&mut self, dir: &str) -> TransportResult<()> {
        if Path::new(dir).is_dir() {
            return Ok(());
        }
        fs::create_dir_all(dir).map_err(|e| failed("create directory", dir, e))?;
        if let Some(mode) = self.dir_permissions {
            self.chmod(dir, mode)?;
        }
        Ok(())
    }

    fn remove_dir(&mut self, dir: &str) -> TransportResult<()> {
        if exists(dir) {
            fs::remove_dir(dir).map_err(|e| failed("remove directory", dir, e))?;
        }
        Ok(())
    }

    fn purge(&mut self, dir: &str, on_entry: &mut dyn FnMut(&str)) -> TransportResult<()> {
        let Ok(metadata) = fs::symlink_metadata(dir) else {
            return Ok(());
        };
        if !metadata.is_dir() {
            on_entry(dir);
            return fs::remove_file(dir).map_err(|e| failed("remove file", dir, e));
        }

        for entry in WalkDir::new(dir).min_depth(1).contents_first(true) {
            let entry = entry.map_err(|e| TransportError::new(format!("Unable to purge {dir}: {e}")))?;
            let path = entry.path().to_string_lossy().into_owned();
            on_entry(&path);
            if entry.file_type().is_dir() {
                fs::remove_dir(entry.path()).map_err(|e| failed("remove directory", &path, e))?;
            } else {
                fs::remove_file(entry.path()).map_err(|e| failed("remove file", &path, e))?;
            }
        }
        Ok(())
    }

    fn root_dir(&mut self) -> TransportResult<String> {
        Ok(self.root.to_string_lossy().trim_end_matches('/').to_string())
    }

    fn execute(&mut self, command: &str) -> TransportResult<String> {
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.root)
            .output()
            .map_err(|e| failed("execute", command, e))?;

        if !output.status.success() {
            return Err(TransportError::new(format!(
                "Command {command} failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    #[cfg(unix)]
    fn chmod(&mut self, path: &str, mode: u32) -> TransportResult<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| failed("chmod", path, e))
    }

    #[cfg(not(unix))]
    fn chmod(&mut self, _path: &str, _mode: u32) -> TransportResult<()> {
        Ok(())
    }
}
