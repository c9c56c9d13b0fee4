//! Executes parsed jobs.

use super::{Job, JobContext};
use crate::transport::Transport;
use crate::utils::errors::JobError;
use crate::utils::logger::Logger;
use std::collections::BTreeMap;
use std::process::Command;
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("deployment/", env!("CARGO_PKG_VERSION"));
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a job. A job failed when `error` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    pub output: Option<String>,
    pub error: Option<String>,
}

impl JobOutput {
    fn ok(output: impl Into<String>) -> Self {
        Self {
            output: Some(output.into()),
            error: None,
        }
    }
}

pub struct JobRunner<'a> {
    transport: &'a mut dyn Transport,
    logger: &'a dyn Logger,
    context: &'a JobContext,
}

impl<'a> JobRunner<'a> {
    pub fn new(transport: &'a mut dyn Transport, logger: &'a dyn Logger, context: &'a JobContext) -> Self {
        Self {
            transport,
            logger,
            context,
        }
    }

    pub fn run(&mut self, job: &Job) -> crate::Result<JobOutput> {
        debug!("Running job {}", job);
        match job {
            Job::Local(command) => Ok(self.local(command)),
            Job::Remote(command) => self.remote(command),
            Job::Upload { local, remote } => self.upload(local, remote),
            Job::Download { local, remote } => self.download(local, remote),
            Job::Http { url, form } => Ok(self.http(url, form.as_ref())),
            Job::Callback(callback) => {
                let succeeded = callback(&mut *self.transport, self.logger, self.context)?;
                Ok(JobOutput {
                    output: None,
                    error: (!succeeded).then(|| "callback returned false".to_string()),
                })
            }
        }
    }

    pub fn local(&self, command: &str) -> JobOutput {
        match Command::new("sh").arg("-c").arg(command).output() {
            Ok(output) => JobOutput {
                output: Some(String::from_utf8_lossy(&output.stdout).trim().to_string()),
                error: (!output.status.success())
                    .then(|| format!("exit code {}", output.status.code().unwrap_or(-1))),
            },
            Err(e) => JobOutput {
                output: None,
                error: Some(format!("cannot run command: {e}")),
            },
        }
    }

    pub fn remote(&mut self, command: &str) -> crate::Result<JobOutput> {
        Ok(JobOutput::ok(self.transport.execute(command)?))
    }

    pub fn upload(&mut self, local: &str, remote: &str) -> crate::Result<JobOutput> {
        let local_file = self.context.local_root.join(local);
        if !local_file.is_file() {
            return Err(JobError::SourceMissing(local_file.display().to_string()).into());
        }

        let remote_path = self.remote_path(remote);
        if let Some((parent, _)) = remote_path.rsplit_once('/') {
            if !parent.is_empty() {
                self.transport.create_dir(parent)?;
            }
        }
        self.transport
            .write_file(&local_file, &remote_path, &mut |_: f64| {})?;
        Ok(JobOutput::default())
    }

    pub fn download(&mut self, local: &str, remote: &str) -> crate::Result<JobOutput> {
        let local_file = self.context.local_root.join(local);
        if local_file.is_file() {
            return Err(JobError::DestinationExists(local_file.display().to_string()).into());
        }

        if let Some(parent) = local_file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let remote_path = self.remote_path(remote);
        self.transport.read_file(&remote_path, &local_file)?;
        Ok(JobOutput::default())
    }

    /// Fetch `url`. Failures are reported in [`JobOutput::error`], never as `Err`.
    pub fn http(&self, url: &str, form: Option<&BTreeMap<String, String>>) -> JobOutput {
        let client = match reqwest::blocking::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(HTTP_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                return JobOutput {
                    output: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let request = match form {
            Some(form) => client.post(url).form(form),
            None => client.get(url),
        };

        match request.send() {
            Ok(response) => {
                let status = response.status();
                let body = response.text().unwrap_or_default();
                JobOutput {
                    output: Some(body),
                    error: (status.as_u16() >= 400)
                        .then(|| format!("responds with HTTP code {}", status.as_u16())),
                }
            }
            Err(e) => JobOutput {
                output: None,
                error: Some(e.to_string()),
            },
        }
    }

    fn remote_path(&self, relative: &str) -> String {
        format!(
            "{}/{}",
            self.context.remote_root,
            relative.replace('\\', "/").trim_start_matches('/')
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{LocalTransport, TransportOptions};
    use crate::utils::logger::TracingLogger;
    use std::fs;
    use tempfile::TempDir;

    struct Fixture {
        local: TempDir,
        remote: TempDir,
        context: JobContext,
    }

    fn fixture() -> std::io::Result<Fixture> {
        let local = TempDir::new()?;
        let remote = TempDir::new()?;
        let context = JobContext {
            local_root: local.path().to_path_buf(),
            remote_root: remote.path().to_string_lossy().into_owned(),
            test_mode: false,
        };
        Ok(Fixture {
            local,
            remote,
            context,
        })
    }

    fn run(fixture: &Fixture, job: &Job) -> crate::Result<JobOutput> {
        let mut transport = LocalTransport::new(fixture.remote.path(), &TransportOptions::default());
        let logger = TracingLogger::new(false);
        JobRunner::new(&mut transport, &logger, &fixture.context).run(job)
    }

    #[test]
    fn test_local_exit_code() -> crate::Result<()> {
        let fixture = fixture()?;
        let output = run(&fixture, &Job::parse("local: echo hi; exit 3")?)?;
        assert_eq!(output.output.as_deref(), Some("hi"));
        assert_eq!(output.error.as_deref(), Some("exit code 3"));

        let output = run(&fixture, &Job::parse("local: true")?)?;
        assert_eq!(output.error, None);
        Ok(())
    }

    #[test]
    fn test_remote_runs_through_transport() -> crate::Result<()> {
        let fixture = fixture()?;
        fs::write(fixture.remote.path().join("here.txt"), b"")?;
        let output = run(&fixture, &Job::parse("remote: ls")?)?;
        assert_eq!(output.output.as_deref().map(str::trim), Some("here.txt"));
        Ok(())
    }

    #[test]
    fn test_upload_creates_parent() -> crate::Result<()> {
        let fixture = fixture()?;
        fs::write(fixture.local.path().join("config.prod"), b"prod")?;

        run(&fixture, &Job::parse("upload: config.prod app/config/local.neon")?)?;

        let uploaded = fixture.remote.path().join("app/config/local.neon");
        assert_eq!(fs::read(uploaded)?, b"prod");
        Ok(())
    }

    #[test]
    fn test_upload_missing_source() -> crate::Result<()> {
        let fixture = fixture()?;
        let error = run(&fixture, &Job::parse("upload: missing.txt x.txt")?).unwrap_err();
        assert!(matches!(error, crate::DeployError::Job(JobError::SourceMissing(_))));
        Ok(())
    }

    #[test]
    fn test_download_refuses_to_overwrite() -> crate::Result<()> {
        let fixture = fixture()?;
        fs::write(fixture.remote.path().join("dump.sql"), b"data")?;

        run(&fixture, &Job::parse("download: backup/dump.sql dump.sql")?)?;
        assert_eq!(fs::read(fixture.local.path().join("backup/dump.sql"))?, b"data");

        let error = run(&fixture, &Job::parse("download: backup/dump.sql dump.sql")?).unwrap_err();
        assert!(matches!(error, crate::DeployError::Job(JobError::DestinationExists(_))));
        Ok(())
    }

    #[test]
    fn test_callback_false_is_an_error() -> crate::Result<()> {
        let fixture = fixture()?;
        let output = run(&fixture, &Job::callback(|_, _, context| Ok(context.test_mode)))?;
        assert!(output.error.is_some());
        Ok(())
    }

    #[test]
    fn test_callback_uses_transport_and_context() -> crate::Result<()> {
        let fixture = fixture()?;
        let job = Job::callback(|transport, _, context| {
            transport.create_dir(&format!("{}/var/cache", context.remote_root))?;
            Ok(context.local_root.is_dir())
        });

        let output = run(&fixture, &job)?;

        assert_eq!(output.error, None);
        assert!(fixture.remote.path().join("var/cache").is_dir());
        Ok(())
    }

    #[test]
    fn test_http_unreachable_is_reported_not_raised() -> crate::Result<()> {
        let fixture = fixture()?;
        let output = run(&fixture, &Job::parse("http://127.0.0.1:9/hook")?)?;
        assert!(output.error.is_some());
        Ok(())
    }
}
