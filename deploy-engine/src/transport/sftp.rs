//! SFTP target over libssh2.

use super::{Endpoint, Transport, TransportError, TransportOptions, TransportResult};
use ssh2::{FileStat, Session, Sftp};
use std::fs::File;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::path::{Path, PathBuf};
use tracing::debug;

const DEFAULT_PORT: u16 = 22;
const CHUNK_SIZE: usize = 32 * 1024;
const DEFAULT_DIR_MODE: i32 = 0o777;

#[derive(Debug, PartialEq, Eq)]
enum AuthMethod<'a> {
    Password(&'a str),
    KeyFile { public_key: &'a Path, private_key: &'a Path },
    Agent,
}

/// Every ancestor of `dir` from the root down, `dir` included.
fn dir_prefixes(dir: &str) -> Vec<String> {
    let mut current = String::new();
    dir.split('/')
        .filter(|part| !part.is_empty())
        .map(|part| {
            current.push('/');
            current.push_str(part);
            current.clone()
        })
        .collect()
}

/// Name a directory is renamed to before its contents are deleted.
fn staging_name(dir: &str) -> String {
    format!("{}/.delete{}", dir.trim_end_matches('/'), uuid::Uuid::new_v4().simple())
}

pub struct SftpTransport {
    endpoint: Endpoint,
    public_key: Option<PathBuf>,
    private_key: Option<PathBuf>,
    passphrase: Option<String>,
    file_permissions: Option<u32>,
    dir_permissions: Option<u32>,
    session: Option<(Session, Sftp)>,
}

impl SftpTransport {
    pub(crate) fn new(endpoint: Endpoint, options: &TransportOptions) -> Self {
        Self {
            endpoint,
            public_key: options.public_key.clone(),
            private_key: options.private_key.clone(),
            passphrase: options.passphrase.clone(),
            file_permissions: options.file_permissions,
            dir_permissions: options.dir_permissions,
            session: None,
        }
    }

    fn sftp(&self) -> TransportResult<&Sftp> {
        self.session
            .as_ref()
            .map(|(_, sftp)| sftp)
            .ok_or_else(|| TransportError::new("Not connected"))
    }

    fn session(&self) -> TransportResult<&Session> {
        self.session
            .as_ref()
            .map(|(session, _)| session)
            .ok_or_else(|| TransportError::new("Not connected"))
    }

    fn stat(&self, path: &str) -> Option<FileStat> {
        self.sftp().ok()?.stat(Path::new(path)).ok()
    }

    fn set_mode(&self, path: &str, mode: u32) -> TransportResult<()> {
        let stat = FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(mode),
            atime: None,
            mtime: None,
        };
        self.sftp()?.setstat(Path::new(path), stat)?;
        Ok(())
    }

    fn auth_method(&self) -> AuthMethod<'_> {
        if let Some(password) = &self.endpoint.password {
            AuthMethod::Password(password)
        } else if let (Some(public_key), Some(private_key)) = (&self.public_key, &self.private_key) {
            AuthMethod::KeyFile {
                public_key: public_key.as_path(),
                private_key: private_key.as_path(),
            }
        } else {
            AuthMethod::Agent
        }
    }

    fn authenticate(&self, session: &Session) -> TransportResult<()> {
        let user = &self.endpoint.user;
        match self.auth_method() {
            AuthMethod::Password(password) => session.userauth_password(user, password)?,
            AuthMethod::KeyFile { public_key, private_key } => session.userauth_pubkey_file(
                user,
                Some(public_key),
                private_key,
                self.passphrase.as_deref(),
            )?,
            AuthMethod::Agent => session.userauth_agent(user)?,
        }

        if !session.authenticated() {
            return Err(TransportError::new(format!(
                "SSH authentication failed for user {user}"
            )));
        }
        Ok(())
    }
}

impl Transport for SftpTransport {
    fn connect(&mut self) -> TransportResult<()> {
        self.session = None;

        let address = format!(
            "{}:{}",
            self.endpoint.host,
            self.endpoint.port.unwrap_or(DEFAULT_PORT)
        );
        debug!("Connecting to {}", address);
        let tcp = TcpStream::connect(&address)
            .map_err(|e| TransportError::new(format!("Cannot connect to {address}: {e}")))?;

        let mut session = Session::new()?;
        session.set_tcp_stream(tcp);
        session.handshake()?;
        self.authenticate(&session)?;

        let sftp = session.sftp()?;
        self.session = Some((session, sftp));
        Ok(())
    }

    fn read_file(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        let mut source = self.sftp()?.open(Path::new(remote))?;
        let mut target = File::create(local)?;
        io::copy(&mut source, &mut target)?;
        Ok(())
    }

    fn write_file(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(f64),
    ) -> TransportResult<()> {
        let mut source = File::open(local)?;
        let size = source.metadata()?.len().max(1);
        let mut target = self.sftp()?.create(Path::new(remote))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        let mut sent = 0u64;
        loop {
            let n = source.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            target.write_all(&buffer[..n])?;
            sent += n as u64;
            progress(sent as f64 * 100.0 / size as f64);
        }
        drop(target);

        if let Some(mode) = self.file_permissions {
            self.set_mode(remote, mode)?;
        }
        Ok(())
    }

    fn remove_file(&mut self, file: &str) -> TransportResult<()> {
        if self.stat(file).is_some() {
            self.sftp()?.unlink(Path::new(file))?;
        }
        Ok(())
    }

    fn rename_file(&mut self, old: &str, new: &str) -> TransportResult<()> {
        let previous = self.stat(new);
        if previous.is_some() {
            self.remove_file(new)?;
        }
        self.sftp()?.rename(Path::new(old), Path::new(new), None)?;
        if let Some(mode) = previous.and_then(|stat| stat.perm) {
            self.set_mode(new, mode & 0o7777)?;
        }
        Ok(())
    }

    fn create_dir(&mut self, dir: &str) -> TransportResult<()> {
        if dir.trim_matches('/').is_empty() || self.stat(dir).is_some() {
            return Ok(());
        }

        let mode = self.dir_permissions.map_or(DEFAULT_DIR_MODE, |mode| mode as i32);
        for current in dir_prefixes(dir) {
            if self.stat(&current).is_none() {
                self.sftp()?.mkdir(Path::new(&current), mode)?;
            }
        }
        Ok(())
    }

    fn remove_dir(&mut self, dir: &str) -> TransportResult<()> {
        if self.stat(dir).is_some() {
            self.sftp()?.rmdir(Path::new(dir))?;
        }
        Ok(())
    }

    fn purge(&mut self, dir: &str, on_entry: &mut dyn FnMut(&str)) -> TransportResult<()> {
        let Some(target) = self.stat(dir) else {
            return Ok(());
        };
        if !target.is_dir() {
            on_entry(dir);
            self.sftp()?.unlink(Path::new(dir))?;
            return Ok(());
        }

        let entries = self.sftp()?.readdir(Path::new(dir))?;

        let mut staged = Vec::new();
        for (path, stat) in entries {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_default();
            if stat.is_dir() {
                let temp = staging_name(dir);
                self.sftp()?.rename(&path, Path::new(&temp), None)?;
                staged.push(temp);
            } else {
                self.sftp()?.unlink(&path)?;
            }
            on_entry(&name);
        }

        for subdir in staged {
            self.purge(&subdir, on_entry)?;
            self.sftp()?.rmdir(Path::new(&subdir))?;
        }
        Ok(())
    }

    fn root_dir(&mut self) -> TransportResult<String> {
        Ok(self.endpoint.path.clone())
    }

    fn execute(&mut self, command: &str) -> TransportResult<String> {
        let mut channel = self.session()?.channel_session()?;
        channel.exec(command)?;

        let mut stdout = String::new();
        channel.read_to_string(&mut stdout)?;
        channel.wait_close()?;
        Ok(stdout)
    }

    fn chmod(&mut self, path: &str, mode: u32) -> TransportResult<()> {
        self.set_mode(path, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(password: Option<&str>, options: TransportOptions) -> SftpTransport {
        let endpoint = Endpoint {
            host: "example.com".to_string(),
            port: None,
            user: "deploy".to_string(),
            password: password.map(str::to_string),
            path: "/var/www".to_string(),
        };
        SftpTransport::new(endpoint, &options)
    }

    #[test]
    fn test_dir_prefixes() {
        assert_eq!(dir_prefixes("/var/www/app/"), vec!["/var", "/var/www", "/var/www/app"]);
        assert_eq!(dir_prefixes("a//b"), vec!["/a", "/a/b"]);
        assert!(dir_prefixes("/").is_empty());
    }

    #[test]
    fn test_staging_name_stays_in_dir() {
        let first = staging_name("/var/www/cache/");
        let second = staging_name("/var/www/cache");
        assert!(first.starts_with("/var/www/cache/.delete"));
        assert_eq!(first.len(), "/var/www/cache/.delete".len() + 32);
        assert_ne!(first, second);
    }

    #[test]
    fn test_auth_method_order() {
        let keys = TransportOptions {
            public_key: Some(PathBuf::from("/home/deploy/.ssh/id.pub")),
            private_key: Some(PathBuf::from("/home/deploy/.ssh/id")),
            ..TransportOptions::default()
        };

        assert_eq!(transport(Some("secret"), keys.clone()).auth_method(), AuthMethod::Password("secret"));
        assert_eq!(
            transport(None, keys).auth_method(),
            AuthMethod::KeyFile {
                public_key: Path::new("/home/deploy/.ssh/id.pub"),
                private_key: Path::new("/home/deploy/.ssh/id"),
            }
        );
        let half = TransportOptions {
            private_key: Some(PathBuf::from("/home/deploy/.ssh/id")),
            ..TransportOptions::default()
        };
        assert_eq!(transport(None, half).auth_method(), AuthMethod::Agent);
    }
}
