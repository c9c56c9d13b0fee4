//! Hooks run before and after a deployment.
//!
//! Jobs are written as `kind: payload` strings in the configuration and parsed
//! once into [`Job`] values:
//!
//! - `local: <command>` runs a shell command on this machine;
//! - `remote: <command>` runs a command through the transport;
//! - `upload: <local> <remote>` / `download: <local> <remote>` copy a single
//!   file, with both paths relative to the respective roots;
//! - `http://...` / `https://...` requests a URL (POST when a form is given).
//!
//! Callbacks can be registered programmatically.

pub mod runner;

use crate::transport::Transport;
use crate::utils::errors::JobError;
use crate::utils::logger::Logger;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

pub use runner::{JobOutput, JobRunner};

/// Programmatic hook. Returning `Ok(false)` fails the deployment.
///
/// Callbacks get the connected transport and a [`JobContext`] with the local
/// and remote roots, not the deployer, which is borrowed for the whole run.
pub type JobCallback =
    Arc<dyn Fn(&mut dyn Transport, &dyn Logger, &JobContext) -> crate::Result<bool> + Send + Sync>;

#[derive(Clone)]
pub enum Job {
    Local(String),
    Remote(String),
    Upload { local: String, remote: String },
    Download { local: String, remote: String },
    Http {
        url: String,
        form: Option<BTreeMap<String, String>>,
    },
    Callback(JobCallback),
}

/// What a job gets to know about the deployment it runs in.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub local_root: PathBuf,
    /// Remote base directory, without a trailing slash.
    pub remote_root: String,
    pub test_mode: bool,
}

impl Job {
    /// Parse a `kind: payload` job definition.
    ///
    /// # Example
    /// ```
    /// use deploy_engine::jobs::Job;
    ///
    /// let job = Job::parse("upload: config.prod.php app/config.php").unwrap();
    /// assert_eq!(job.to_string(), "upload: config.prod.php app/config.php");
    /// assert!(Job::parse("ftp: nope").is_err());
    /// ```
    pub fn parse(definition: &str) -> Result<Self, JobError> {
        let definition = definition.trim();
        let invalid = || JobError::Invalid(definition.to_string());

        let (kind, payload) = definition.split_once(':').ok_or_else(invalid)?;
        let payload = payload.trim();
        if payload.is_empty() {
            return Err(invalid());
        }

        match kind.trim() {
            "local" => Ok(Job::Local(payload.to_string())),
            "remote" => Ok(Job::Remote(payload.to_string())),
            "upload" | "download" => {
                let parts: Vec<&str> = payload.split_whitespace().collect();
                let [local, remote] = parts.as_slice() else {
                    return Err(invalid());
                };
                let (local, remote) = (local.to_string(), remote.to_string());
                if kind.trim() == "upload" {
                    Ok(Job::Upload { local, remote })
                } else {
                    Ok(Job::Download { local, remote })
                }
            }
            "http" | "https" => Ok(Job::Http {
                url: definition.to_string(),
                form: None,
            }),
            _ => Err(invalid()),
        }
    }

    /// HTTP POST job sending `form` as `application/x-www-form-urlencoded`.
    pub fn http_post(url: impl Into<String>, form: BTreeMap<String, String>) -> Self {
        Job::Http {
            url: url.into(),
            form: Some(form),
        }
    }

    pub fn callback<F>(f: F) -> Self
    where
        F: Fn(&mut dyn Transport, &dyn Logger, &JobContext) -> crate::Result<bool> + Send + Sync + 'static,
    {
        Job::Callback(Arc::new(f))
    }

    /// Local jobs run straight after connecting, before anything is compared.
    pub fn is_local(&self) -> bool {
        matches!(self, Job::Local(_))
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::Local(command) => write!(f, "local: {command}"),
            Job::Remote(command) => write!(f, "remote: {command}"),
            Job::Upload { local, remote } => write!(f, "upload: {local} {remote}"),
            Job::Download { local, remote } => write!(f, "download: {local} {remote}"),
            Job::Http { url, form: None } => f.write_str(url),
            Job::Http { url, form: Some(_) } => write!(f, "POST {url}"),
            Job::Callback(_) => f.write_str("callback"),
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Job({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kinds() {
        assert!(matches!(Job::parse("local: make dist").unwrap(), Job::Local(c) if c == "make dist"));
        assert!(matches!(Job::parse("remote:rm -rf cache").unwrap(), Job::Remote(c) if c == "rm -rf cache"));
        assert!(matches!(
            Job::parse("download: backup.sql db/dump.sql").unwrap(),
            Job::Download { local, remote } if local == "backup.sql" && remote == "db/dump.sql"
        ));
        assert!(matches!(
            Job::parse("https://example.com/hook?x=1").unwrap(),
            Job::Http { url, form: None } if url == "https://example.com/hook?x=1"
        ));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for definition in ["", "local:", "local:   ", "ftp: x", "upload: only-one", "upload: a b c", "make"] {
            assert!(
                matches!(Job::parse(definition), Err(JobError::Invalid(_))),
                "accepted {definition:?}"
            );
        }
    }

    #[test]
    fn test_only_local_jobs_are_local() {
        assert!(Job::parse("local: true").unwrap().is_local());
        assert!(!Job::parse("remote: true").unwrap().is_local());
        assert!(!Job::callback(|_, _, _| Ok(true)).is_local());
    }

    #[test]
    fn test_display() {
        let mut form = BTreeMap::new();
        form.insert("key".to_string(), "value".to_string());
        assert_eq!(Job::http_post("http://x/", form).to_string(), "POST http://x/");
        assert_eq!(Job::parse("local:  ls").unwrap().to_string(), "local: ls");
    }
}
