//! Remote targets.
//!
//! A [`Transport`] exposes the handful of file operations the deployer needs.
//! Paths passed to a transport are absolute remote paths, built by joining
//! [`Transport::root_dir`] with a manifest path.

pub mod ftp;
pub mod local;
pub mod retry;
pub mod sftp;

use percent_encoding::percent_decode_str;
use std::fmt;
use std::panic::Location;
use std::path::{Path, PathBuf};
use url::Url;

pub use ftp::FtpTransport;
pub use local::LocalTransport;
pub use retry::RetryTransport;
pub use sftp::SftpTransport;

/// Failure reported by a transport, with the place where it was raised.
#[derive(Debug, Clone)]
pub struct TransportError {
    message: String,
    location: &'static Location<'static>,
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

impl TransportError {
    #[track_caller]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: Location::caller(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Source location (`file:line`) that produced the error.
    pub fn location(&self) -> String {
        format!("{}:{}", self.location.file(), self.location.line())
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for TransportError {}

impl From<std::io::Error> for TransportError {
    #[track_caller]
    fn from(error: std::io::Error) -> Self {
        Self::new(error.to_string())
    }
}

impl From<ssh2::Error> for TransportError {
    #[track_caller]
    fn from(error: ssh2::Error) -> Self {
        Self::new(error.message().to_string())
    }
}

impl From<suppaftp::FtpError> for TransportError {
    #[track_caller]
    fn from(error: suppaftp::FtpError) -> Self {
        Self::new(error.to_string())
    }
}

/// Operations a deployment target must support.
pub trait Transport: Send {
    /// Open (or re-open) the connection.
    fn connect(&mut self) -> TransportResult<()>;

    /// Download `remote` into the local file `local`.
    fn read_file(&mut self, remote: &str, local: &Path) -> TransportResult<()>;

    /// Like [`read_file`](Self::read_file), but never retried by a wrapping
    /// transport. Used for files that may legitimately be missing.
    fn read_file_once(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        self.read_file(remote, local)
    }

    /// Upload `local` to `remote`, reporting progress as a percentage.
    fn write_file(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(f64),
    ) -> TransportResult<()>;

    /// Remove a file. Missing files are not an error.
    fn remove_file(&mut self, file: &str) -> TransportResult<()>;

    /// Move `old` over `new`, keeping the permissions of an existing `new`.
    fn rename_file(&mut self, old: &str, new: &str) -> TransportResult<()>;

    /// Create a directory and its missing parents.
    fn create_dir(&mut self, dir: &str) -> TransportResult<()>;

    /// Remove an empty directory. Missing directories are not an error.
    fn remove_dir(&mut self, dir: &str) -> TransportResult<()>;

    /// Recursively delete the contents of `dir`, keeping `dir` itself. A file
    /// is deleted; a missing path is not an error.
    fn purge(&mut self, dir: &str, on_entry: &mut dyn FnMut(&str)) -> TransportResult<()>;

    /// Remote base directory, without a trailing slash.
    fn root_dir(&mut self) -> TransportResult<String>;

    /// Run a command on the target and return its output.
    fn execute(&mut self, command: &str) -> TransportResult<String>;

    fn chmod(&mut self, path: &str, mode: u32) -> TransportResult<()>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self) -> TransportResult<()> {
        (**self).connect()
    }

    fn read_file(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        (**self).read_file(remote, local)
    }

    fn read_file_once(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        (**self).read_file_once(remote, local)
    }

    fn write_file(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(f64),
    ) -> TransportResult<()> {
        (**self).write_file(local, remote, progress)
    }

    fn remove_file(&mut self, file: &str) -> TransportResult<()> {
        (**self).remove_file(file)
    }

    fn rename_file(&mut self, old: &str, new: &str) -> TransportResult<()> {
        (**self).rename_file(old, new)
    }

    fn create_dir(&mut self, dir: &str) -> TransportResult<()> {
        (**self).create_dir(dir)
    }

    fn remove_dir(&mut self, dir: &str) -> TransportResult<()> {
        (**self).remove_dir(dir)
    }

    fn purge(&mut self, dir: &str, on_entry: &mut dyn FnMut(&str)) -> TransportResult<()> {
        (**self).purge(dir, on_entry)
    }

    fn root_dir(&mut self) -> TransportResult<String> {
        (**self).root_dir()
    }

    fn execute(&mut self, command: &str) -> TransportResult<String> {
        (**self).execute(command)
    }

    fn chmod(&mut self, path: &str, mode: u32) -> TransportResult<()> {
        (**self).chmod(path, mode)
    }
}

/// Connection settings that do not fit in a URL.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Overrides the URL user name.
    pub user: Option<String>,

    /// Overrides the URL password.
    pub password: Option<String>,

    /// FTP only.
    pub passive_mode: bool,

    /// Mode applied to uploaded files.
    pub file_permissions: Option<u32>,

    /// Mode applied to created directories.
    pub dir_permissions: Option<u32>,

    /// SFTP key authentication.
    pub public_key: Option<PathBuf>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            user: None,
            password: None,
            passive_mode: true,
            file_permissions: None,
            dir_permissions: None,
            public_key: None,
            private_key: None,
            passphrase: None,
        }
    }
}

/// Parsed remote location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
    pub password: Option<String>,
    /// Base path without trailing slash; empty for the server root.
    pub path: String,
}

impl Endpoint {
    fn parse(url: &Url, options: &TransportOptions) -> TransportResult<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| TransportError::new(format!("Missing host in URL {}", redact(url))))?;
        let url_user = decode(url.username());
        let url_password = url.password().map(decode);

        Ok(Self {
            host: host.to_string(),
            port: url.port(),
            user: options.user.clone().unwrap_or(url_user),
            password: options.password.clone().or(url_password),
            path: decode(url.path()).trim_end_matches('/').to_string(),
        })
    }
}

fn decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}

/// URL with the password blanked out, for messages.
pub fn redact(url: &Url) -> String {
    let mut shown = url.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("****"));
    }
    shown.to_string()
}

/// Build the transport for `remote`.
///
/// Supported schemes are `ftp`, `ftps` (explicit TLS), `sftp` and `file`.
/// The returned transport is not connected yet.
///
/// # Example
/// ```
/// use deploy_engine::transport::{from_url, TransportOptions};
///
/// let transport = from_url("file:///var/www/site", &TransportOptions::default());
/// assert!(transport.is_ok());
/// assert!(from_url("gopher://example.com/", &TransportOptions::default()).is_err());
/// ```
pub fn from_url(remote: &str, options: &TransportOptions) -> TransportResult<Box<dyn Transport>> {
    let url = Url::parse(remote)
        .map_err(|e| TransportError::new(format!("Invalid URL {remote}: {e}")))?;

    match url.scheme() {
        "ftp" | "ftps" => {
            let endpoint = Endpoint::parse(&url, options)?;
            Ok(Box::new(FtpTransport::new(endpoint, url.scheme() == "ftps", options)))
        }
        "sftp" => {
            let endpoint = Endpoint::parse(&url, options)?;
            Ok(Box::new(SftpTransport::new(endpoint, options)))
        }
        "file" => {
            let root = url
                .to_file_path()
                .map_err(|_| TransportError::new(format!("Invalid local path in {remote}")))?;
            Ok(Box::new(LocalTransport::new(root, options)))
        }
        scheme => Err(TransportError::new(format!(
            "Unsupported protocol {scheme} in {}",
            redact(&url)
        ))),
    }
}
