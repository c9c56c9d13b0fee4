//! FTP and explicit-TLS FTPS target.

use super::{Endpoint, Transport, TransportError, TransportOptions, TransportResult};
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use suppaftp::native_tls::TlsConnector;
use suppaftp::types::FileType;
use suppaftp::{FtpStream, Mode, NativeTlsConnector, NativeTlsFtpStream};
use tracing::{debug, warn};

const DEFAULT_PORT: u16 = 21;

/// Attempts at uploading a single file before giving up.
const UPLOAD_RETRIES: u32 = 10;

/// Progress is reported once per block.
const BLOCK_SIZE: usize = 400_000;

enum FtpSession {
    Plain(FtpStream),
    Secure(NativeTlsFtpStream),
}

/// Runs `$body` against the underlying stream, whichever flavour it is.
macro_rules! with_stream {
    ($session:expr, $stream:ident => $body:expr) => {
        match $session {
            FtpSession::Plain($stream) => $body,
            FtpSession::Secure($stream) => $body,
        }
    };
}

/// Shell-like commands understood by `execute`; anything else goes to `SITE EXEC`.
#[derive(Debug, PartialEq, Eq)]
enum FtpCommand<'a> {
    Mkdir(&'a str),
    Rmdir(&'a str),
    Unlink(&'a str),
    Rename(&'a str, &'a str),
    Chmod(&'a str, u32),
    Site(&'a str),
}

fn parse_command(command: &str) -> TransportResult<FtpCommand<'_>> {
    let words: Vec<&str> = command.split_whitespace().collect();
    Ok(match words.as_slice() {
        ["mkdir", dir] => FtpCommand::Mkdir(dir),
        ["rmdir", dir] => FtpCommand::Rmdir(dir),
        ["unlink", file] => FtpCommand::Unlink(file),
        ["mv", old, new] => FtpCommand::Rename(old, new),
        ["chmod", mode, path] => {
            let mode = u32::from_str_radix(mode, 8)
                .map_err(|_| TransportError::new(format!("Invalid mode {mode}")))?;
            FtpCommand::Chmod(path, mode)
        }
        _ => FtpCommand::Site(command),
    })
}

/// Full path of a purge listing entry, or None for `.`, `..` and `dir` itself.
fn purge_entry(dir: &str, entry: &str) -> Option<String> {
    let name = entry.rsplit('/').next().unwrap_or_default();
    if entry.is_empty() || entry == dir || name.chars().all(|c| c == '.') {
        return None;
    }
    if entry.contains('/') {
        Some(entry.to_string())
    } else {
        Some(format!("{dir}/{entry}"))
    }
}

/// Where an interrupted upload continues; a remote larger than the source restarts.
fn resume_offset(remote_size: Option<u64>, local_size: u64) -> u64 {
    remote_size.filter(|&size| size <= local_size).unwrap_or(0)
}

pub struct FtpTransport {
    endpoint: Endpoint,
    secure: bool,
    passive_mode: bool,
    file_permissions: Option<u32>,
    dir_permissions: Option<u32>,
    session: Option<FtpSession>,
}

impl FtpTransport {
    pub(crate) fn new(endpoint: Endpoint, secure: bool, options: &TransportOptions) -> Self {
        Self {
            endpoint,
            secure,
            passive_mode: options.passive_mode,
            file_permissions: options.file_permissions,
            dir_permissions: options.dir_permissions,
            session: None,
        }
    }

    fn session(&mut self) -> TransportResult<&mut FtpSession> {
        self.session
            .as_mut()
            .ok_or_else(|| TransportError::new("Not connected"))
    }

    fn open(&self) -> TransportResult<FtpSession> {
        let address = format!(
            "{}:{}",
            self.endpoint.host,
            self.endpoint.port.unwrap_or(DEFAULT_PORT)
        );
        debug!("Connecting to {}", address);

        if self.secure {
            let connector = TlsConnector::new()
                .map_err(|e| TransportError::new(format!("Cannot initialise TLS: {e}")))?;
            let stream = NativeTlsFtpStream::connect(&address)?
                .into_secure(NativeTlsConnector::from(connector), &self.endpoint.host)?;
            Ok(FtpSession::Secure(stream))
        } else {
            Ok(FtpSession::Plain(FtpStream::connect(&address)?))
        }
    }

    fn is_dir(&mut self, dir: &str) -> TransportResult<bool> {
        let current = self.root_dir()?;
        let found = with_stream!(self.session()?, s => s.cwd(dir).is_ok());
        let back = if current.is_empty() { "/" } else { current.as_str() };
        with_stream!(self.session()?, s => s.cwd(back))?;
        Ok(found)
    }

    /// Whether `path` shows up in a listing of its own name.
    fn is_listed(&mut self, path: &str) -> TransportResult<bool> {
        let pattern = format!("{path}*");
        let listing = with_stream!(self.session()?, s => s.nlst(Some(pattern.as_str()))).unwrap_or_default();
        Ok(listing.iter().any(|entry| entry == path))
    }

    fn site(&mut self, command: &str) -> TransportResult<()> {
        with_stream!(self.session()?, s => s.site(command))?;
        Ok(())
    }

    /// Size of a partially uploaded file, if the server reports one.
    fn remote_size(&mut self, remote: &str) -> Option<u64> {
        let session = self.session().ok()?;
        with_stream!(session, s => s.size(remote)).ok().map(|size| size as u64)
    }

    /// Send `local` from byte `offset` on; a non-zero offset is announced with `REST`.
    fn upload_once(
        &mut self,
        local: &Path,
        remote: &str,
        offset: u64,
        size: u64,
        progress: &mut dyn FnMut(f64),
    ) -> TransportResult<()> {
        let mut source = File::open(local)?;
        source.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; BLOCK_SIZE];
        let mut sent = offset;

        with_stream!(self.session()?, s => {
            if offset > 0 {
                s.resume_transfer(offset as usize)?;
            }
            let mut data = s.put_with_stream(remote)?;
            loop {
                progress((sent as f64 * 100.0 / size as f64).min(100.0));
                let n = source.read(&mut buffer)?;
                if n == 0 {
                    break;
                }
                data.write_all(&buffer[..n])?;
                sent += n as u64;
            }
            s.finalize_put_stream(data)?;
        });
        Ok(())
    }
}

impl Transport for FtpTransport {
    fn connect(&mut self) -> TransportResult<()> {
        if let Some(mut old) = self.session.take() {
            let _ = with_stream!(&mut old, s => s.quit());
        }

        let mut session = self.open()?;
        let user = self.endpoint.user.clone();
        let password = self.endpoint.password.clone().unwrap_or_default();
        let mode = if self.passive_mode {
            Mode::Passive
        } else {
            Mode::Active
        };
        let path = self.endpoint.path.clone();

        with_stream!(&mut session, s => {
            s.login(&user, &password)?;
            s.transfer_type(FileType::Binary)?;
            s.set_mode(mode);
            if !path.is_empty() {
                s.cwd(&path)?;
            }
        });

        self.session = Some(session);
        Ok(())
    }

    fn read_file(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        let mut content = with_stream!(self.session()?, s => s.retr_as_buffer(remote))?;
        let mut target = File::create(local)?;
        io::copy(&mut content, &mut target)?;
        Ok(())
    }

    fn write_file(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(f64),
    ) -> TransportResult<()> {
        let length = std::fs::metadata(local)?.len();
        let size = length.max(1);

        let mut attempt = 1;
        let mut offset = 0;
        while let Err(error) = self.upload_once(local, remote, offset, size, progress) {
            if attempt >= UPLOAD_RETRIES {
                return Err(TransportError::new(format!(
                    "Cannot upload file {}, number of retries exceeded. Error: {}",
                    local.display(),
                    error
                )));
            }
            warn!("Upload of {} interrupted, reconnecting: {}", remote, error);
            self.connect()?;
            offset = resume_offset(self.remote_size(remote), length);
            attempt += 1;
        }

        if let Some(mode) = self.file_permissions {
            self.chmod(remote, mode)?;
        }
        progress(100.0);
        Ok(())
    }

    fn remove_file(&mut self, file: &str) -> TransportResult<()> {
        if let Err(error) = with_stream!(self.session()?, s => s.rm(file)) {
            if self.is_listed(file)? {
                return Err(error.into());
            }
        }
        Ok(())
    }

    fn rename_file(&mut self, old: &str, new: &str) -> TransportResult<()> {
        self.remove_file(new)?;
        with_stream!(self.session()?, s => s.rename(old, new))?;
        Ok(())
    }

    fn create_dir(&mut self, dir: &str) -> TransportResult<()> {
        if dir.trim_matches('/').is_empty() || self.is_dir(dir)? {
            return Ok(());
        }

        let mut path = String::new();
        for part in dir.split('/') {
            path.push_str(part);
            if !path.is_empty() {
                let created = with_stream!(self.session()?, s => s.mkdir(&path));
                match created {
                    Ok(()) => {
                        if let Some(mode) = self.dir_permissions {
                            self.chmod(&path, mode)?;
                        }
                    }
                    Err(_) if self.is_dir(&path)? => {}
                    Err(_) => {
                        return Err(TransportError::new(format!("Cannot create directory '{path}'.")));
                    }
                }
            }
            path.push('/');
        }
        Ok(())
    }

    fn remove_dir(&mut self, dir: &str) -> TransportResult<()> {
        if let Err(error) = with_stream!(self.session()?, s => s.rmdir(dir)) {
            if self.is_listed(dir)? {
                return Err(error.into());
            }
        }
        Ok(())
    }

    fn purge(&mut self, dir: &str, on_entry: &mut dyn FnMut(&str)) -> TransportResult<()> {
        if !self.is_dir(dir)? {
            if self.is_listed(dir)? {
                on_entry(dir);
                with_stream!(self.session()?, s => s.rm(dir))?;
            }
            return Ok(());
        }

        let listing = with_stream!(self.session()?, s => s.nlst(Some(dir)))?;

        let mut staged = Vec::new();
        for entry in listing.iter().filter_map(|entry| purge_entry(dir, entry)) {
            if self.is_dir(&entry)? {
                let temp = format!("{dir}/.delete{}", uuid::Uuid::new_v4().simple());
                with_stream!(self.session()?, s => s.rename(&entry, &temp))?;
                staged.push(temp);
            } else {
                with_stream!(self.session()?, s => s.rm(&entry))?;
            }
            on_entry(&entry);
        }

        for subdir in staged {
            self.purge(&subdir, on_entry)?;
            with_stream!(self.session()?, s => s.rmdir(&subdir))?;
        }
        Ok(())
    }

    fn root_dir(&mut self) -> TransportResult<String> {
        let current = with_stream!(self.session()?, s => s.pwd())?;
        Ok(current.trim_end_matches('/').to_string())
    }

    fn execute(&mut self, command: &str) -> TransportResult<String> {
        match parse_command(command)? {
            FtpCommand::Mkdir(dir) => self.create_dir(dir)?,
            FtpCommand::Rmdir(dir) => self.remove_dir(dir)?,
            FtpCommand::Unlink(file) => self.remove_file(file)?,
            FtpCommand::Rename(old, new) => self.rename_file(old, new)?,
            FtpCommand::Chmod(path, mode) => self.chmod(path, mode)?,
            FtpCommand::Site(command) => self.site(&format!("EXEC {command}"))?,
        }
        Ok(String::new())
    }

    fn chmod(&mut self, path: &str, mode: u32) -> TransportResult<()> {
        self.site(&format!("CHMOD {mode:o} {path}"))
    }
}
