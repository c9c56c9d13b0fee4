//! Retrying decorator for unreliable connections.
//!
//! Every operation except `connect` is retried when it fails: the error is
//! logged (once per distinct message), the connection is re-established and
//! the call is repeated after a pause, up to a fixed number of times.

use super::{Transport, TransportResult};
use crate::utils::logger::{Logger, Tone};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub const DEFAULT_RETRIES: u32 = 20;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(2);

pub struct RetryTransport<T: Transport> {
    inner: T,
    logger: Arc<dyn Logger>,
    retries: u32,
    delay: Duration,
}

impl<T: Transport> RetryTransport<T> {
    pub fn new(inner: T, logger: Arc<dyn Logger>) -> Self {
        Self {
            inner,
            logger,
            retries: DEFAULT_RETRIES,
            delay: DEFAULT_DELAY,
        }
    }

    /// Override the retry bound and the pause between attempts.
    pub fn with_policy(mut self, retries: u32, delay: Duration) -> Self {
        self.retries = retries;
        self.delay = delay;
        self
    }

    /// Run `f` against the wrapped transport, without retrying.
    pub fn without_retry<R>(&mut self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.inner)
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    fn reconnect(&mut self) -> TransportResult<()> {
        self.retry(false, |inner| inner.connect())
    }

    fn retry<R, F>(&mut self, reconnect: bool, mut op: F) -> TransportResult<R>
    where
        F: FnMut(&mut T) -> TransportResult<R>,
    {
        let mut counter = 0usize;
        let mut last_error: Option<String> = None;

        loop {
            let error = match op(&mut self.inner) {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };
            if counter >= self.retries as usize {
                return Err(error);
            }

            if last_error.as_deref() != Some(error.message()) {
                self.logger.log(
                    &format!("Error: {} in {}", error, error.location()),
                    Tone::Failure,
                );
                last_error = Some(error.message().to_string());
            }

            if reconnect {
                self.reconnect()?;
            }

            counter += 1;
            self.logger
                .progress(&format!("retrying {:<40}", ".".repeat(counter % 40)));
            thread::sleep(self.delay);
        }
    }
}

impl<T: Transport> Transport for RetryTransport<T> {
    fn connect(&mut self) -> TransportResult<()> {
        self.inner.connect()
    }

    fn read_file(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        self.retry(true, |inner| inner.read_file(remote, local))
    }

    fn read_file_once(&mut self, remote: &str, local: &Path) -> TransportResult<()> {
        self.inner.read_file_once(remote, local)
    }

    fn write_file(
        &mut self,
        local: &Path,
        remote: &str,
        progress: &mut dyn FnMut(f64),
    ) -> TransportResult<()> {
        self.retry(true, |inner| inner.write_file(local, remote, &mut *progress))
    }

    fn remove_file(&mut self, file: &str) -> TransportResult<()> {
        self.retry(true, |inner| inner.remove_file(file))
    }

    fn rename_file(&mut self, old: &str, new: &str) -> TransportResult<()> {
        self.retry(true, |inner| inner.rename_file(old, new))
    }

    fn create_dir(&mut self, dir: &str) -> TransportResult<()> {
        self.retry(true, |inner| inner.create_dir(dir))
    }

    fn remove_dir(&mut self, dir: &str) -> TransportResult<()> {
        self.retry(true, |inner| inner.remove_dir(dir))
    }

    fn purge(&mut self, dir: &str, on_entry: &mut dyn FnMut(&str)) -> TransportResult<()> {
        self.retry(true, |inner| inner.purge(dir, &mut *on_entry))
    }

    fn root_dir(&mut self) -> TransportResult<String> {
        self.retry(true, |inner| inner.root_dir())
    }

    fn execute(&mut self, command: &str) -> TransportResult<String> {
        self.retry(true, |inner| inner.execute(command))
    }

    fn chmod(&mut self, path: &str, mode: u32) -> TransportResult<()> {
        self.retry(true, |inner| inner.chmod(path, mode))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;
    use std::sync::Mutex;

    /// Fails `remove_file` until `failures` calls have been made.
    #[derive(Default)]
    struct Flaky {
        failures: usize,
        calls: usize,
        connects: usize,
    }

    impl Transport for Flaky {
        fn connect(&mut self) -> TransportResult<()> {
            self.connects += 1;
            Ok(())
        }
        fn read_file(&mut self, _: &str, _: &Path) -> TransportResult<()> {
            Err(TransportError::new("not found"))
        }
        fn write_file(&mut self, _: &Path, _: &str, _: &mut dyn FnMut(f64)) -> TransportResult<()> {
            Ok(())
        }
        fn remove_file(&mut self, _: &str) -> TransportResult<()> {
            self.calls += 1;
            if self.calls <= self.failures {
                Err(TransportError::new("connection reset"))
            } else {
                Ok(())
            }
        }
        fn rename_file(&mut self, _: &str, _: &str) -> TransportResult<()> {
            Ok(())
        }
        fn create_dir(&mut self, _: &str) -> TransportResult<()> {
            Ok(())
        }
        fn remove_dir(&mut self, _: &str) -> TransportResult<()> {
            Ok(())
        }
        fn purge(&mut self, _: &str, _: &mut dyn FnMut(&str)) -> TransportResult<()> {
            Ok(())
        }
        fn root_dir(&mut self) -> TransportResult<String> {
            Ok(String::new())
        }
        fn execute(&mut self, _: &str) -> TransportResult<String> {
            Ok(String::new())
        }
        fn chmod(&mut self, _: &str, _: u32) -> TransportResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        lines: Mutex<Vec<String>>,
    }

    impl Logger for Recorder {
        fn log(&self, message: &str, _tone: Tone) {
            self.lines.lock().unwrap().push(message.to_string());
        }
        fn progress(&self, _message: &str) {}
    }

    fn wrap(inner: Flaky, logger: Arc<Recorder>) -> RetryTransport<Flaky> {
        RetryTransport::new(inner, logger).with_policy(DEFAULT_RETRIES, Duration::ZERO)
    }

    #[test]
    fn test_gives_up_after_retries() {
        let logger = Arc::new(Recorder::default());
        let mut transport = wrap(
            Flaky {
                failures: usize::MAX,
                ..Flaky::default()
            },
            logger.clone(),
        );

        let error = transport.remove_file("/x").unwrap_err();

        assert_eq!(error.message(), "connection reset");
        let inner = transport.into_inner();
        assert_eq!(inner.calls, DEFAULT_RETRIES as usize + 1);
        assert_eq!(inner.connects, DEFAULT_RETRIES as usize);
        assert_eq!(logger.lines.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_recovers_after_transient_failures() {
        let logger = Arc::new(Recorder::default());
        let mut transport = wrap(
            Flaky {
                failures: 2,
                ..Flaky::default()
            },
            logger,
        );

        assert!(transport.remove_file("/x").is_ok());
        assert_eq!(transport.without_retry(|inner| inner.calls), 3);
    }

    #[test]
    fn test_read_once_is_not_retried() {
        let logger = Arc::new(Recorder::default());
        let mut transport = wrap(Flaky::default(), logger.clone());

        assert!(transport.read_file_once("/.htdeployment", Path::new("/tmp/x")).is_err());
        assert_eq!(transport.without_retry(|inner| inner.connects), 0);
        assert!(logger.lines.lock().unwrap().is_empty());
    }
}
