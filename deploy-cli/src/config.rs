//! Deployment configuration file.
//!
//! A file either describes one target with top-level keys, or several named
//! targets as tables. Global keys (logging, temp directory, ...) live at the
//! top level in both layouts.
//!
//! ```toml
//! log_level = "debug"
//!
//! [production]
//! remote = "sftp://deploy@example.com/var/www"
//! ignore = """
//!     /temp/*
//!     /log/*
//! """
//! after = ["remote: php artisan migrate", { url = "https://example.com/hook", post = { token = "x" } }]
//! ```

use anyhow::{bail, Context, Result};
use deploy_engine::deployer::{DeployOptions, DEFAULT_DEPLOYMENT_FILE, DEFAULT_IGNORE_MASKS};
use deploy_engine::jobs::Job;
use deploy_engine::manifest::Compression;
use deploy_engine::transport::TransportOptions;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

/// Preprocess masks used when `preprocess = true`.
const DEFAULT_PREPROCESS_MASKS: &[&str] = &["*.js", "*.css"];

#[derive(Debug, Clone)]
pub struct Config {
    pub global: GlobalConfig,
    /// Sections in file order. A single-target file yields one section named `""`.
    pub sections: Vec<(String, SectionConfig)>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// Log file. Defaults to the config path with a `.log` extension.
    #[serde(default)]
    pub log: Option<PathBuf>,

    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Draw progress lines on stderr.
    #[serde(default = "default_true")]
    pub progress: bool,

    /// Colored console output; defaults to whether stdout is a terminal.
    #[serde(default)]
    pub colors: Option<bool>,

    /// Share one local scan between sections deploying the same tree.
    #[serde(default = "default_true")]
    pub cache_scan: bool,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionConfig {
    pub remote: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Local directory, relative to the config file.
    #[serde(default = "default_local")]
    pub local: PathBuf,

    #[serde(default = "default_true")]
    pub passive_mode: bool,

    #[serde(default)]
    pub include: StringList,

    /// Added to the built-in ignore masks.
    #[serde(default)]
    pub ignore: StringList,

    #[serde(default = "default_true")]
    pub allow_delete: bool,

    #[serde(default)]
    pub purge: StringList,

    #[serde(default)]
    pub before: JobList,

    #[serde(default)]
    pub after_upload: JobList,

    #[serde(default)]
    pub after: JobList,

    #[serde(default)]
    pub preprocess: Preprocess,

    /// File extension to filter command.
    #[serde(default)]
    pub filters: BTreeMap<String, String>,

    #[serde(default = "default_deployment_file")]
    pub deployment_file: String,

    /// Octal, e.g. `"0644"`.
    #[serde(default)]
    pub file_permissions: Option<String>,

    #[serde(default)]
    pub dir_permissions: Option<String>,

    #[serde(default)]
    pub test: bool,

    #[serde(default)]
    pub public_key: Option<PathBuf>,

    #[serde(default)]
    pub private_key: Option<PathBuf>,

    #[serde(default)]
    pub passphrase: Option<String>,

    #[serde(default)]
    pub compression: Compression,
}

/// A list given either as an array or as a whitespace separated string.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawStringList")]
pub struct StringList(pub Vec<String>);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawStringList {
    One(String),
    Many(Vec<String>),
}

impl From<RawStringList> for StringList {
    fn from(raw: RawStringList) -> Self {
        let items = match raw {
            RawStringList::One(text) => text.split_whitespace().map(str::to_string).collect(),
            RawStringList::Many(items) => items,
        };
        StringList(items)
    }
}

/// Jobs given as an array, or as one string with a job per line.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(from = "RawJobList")]
pub struct JobList(pub Vec<JobSpec>);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum JobSpec {
    Line(String),
    Post {
        url: String,
        #[serde(default)]
        post: BTreeMap<String, String>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawJobList {
    One(String),
    Many(Vec<JobSpec>),
}

impl From<RawJobList> for JobList {
    fn from(raw: RawJobList) -> Self {
        let jobs = match raw {
            RawJobList::One(text) => text
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(|line| JobSpec::Line(line.to_string()))
                .collect(),
            RawJobList::Many(jobs) => jobs,
        };
        JobList(jobs)
    }
}

impl JobList {
    pub fn parse(&self) -> Result<Vec<Job>> {
        self.0
            .iter()
            .map(|spec| match spec {
                JobSpec::Line(line) => Ok(Job::parse(line)?),
                JobSpec::Post { url, post } => Ok(Job::http_post(url.clone(), post.clone())),
            })
            .collect()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Preprocess {
    Enabled(bool),
    Masks(StringList),
}

impl Default for Preprocess {
    fn default() -> Self {
        Preprocess::Enabled(false)
    }
}

impl Preprocess {
    pub fn masks(&self) -> Vec<String> {
        match self {
            Preprocess::Enabled(false) => Vec::new(),
            Preprocess::Enabled(true) => DEFAULT_PREPROCESS_MASKS.iter().map(|m| m.to_string()).collect(),
            Preprocess::Masks(masks) => masks.0.clone(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_local() -> PathBuf {
    PathBuf::from(".")
}

fn default_deployment_file() -> String {
    DEFAULT_DEPLOYMENT_FILE.to_string()
}

fn parse_permissions(value: Option<&str>, key: &str) -> Result<Option<u32>> {
    value
        .map(|v| u32::from_str_radix(v.trim(), 8).with_context(|| format!("{key} must be an octal number, got '{v}'")))
        .transpose()
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Missing config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;

        if table.contains_key("remote") {
            let global = toml::Value::Table(table.clone()).try_into()?;
            let section = toml::Value::Table(table).try_into()?;
            return Ok(Self {
                global,
                sections: vec![(String::new(), section)],
            });
        }

        let mut globals = toml::Table::new();
        let mut sections = Vec::new();
        for (name, value) in table {
            match value {
                toml::Value::Table(section) => {
                    let section = toml::Value::Table(section)
                        .try_into()
                        .with_context(|| format!("Invalid section [{name}]"))?;
                    sections.push((name, section));
                }
                value => {
                    globals.insert(name, value);
                }
            }
        }
        if sections.is_empty() {
            bail!("No deployment section found");
        }

        Ok(Self {
            global: toml::Value::Table(globals).try_into()?,
            sections,
        })
    }

    /// Sections to deploy: all of them, or only `name`.
    pub fn select(&self, name: Option<&str>) -> Result<Vec<&(String, SectionConfig)>> {
        match name {
            None => Ok(self.sections.iter().collect()),
            Some(name) => {
                let section = self
                    .sections
                    .iter()
                    .find(|(section, _)| section == name)
                    .with_context(|| format!("Section [{name}] not found"))?;
                Ok(vec![section])
            }
        }
    }
}

impl GlobalConfig {
    pub fn log_file(&self, config_path: &Path) -> PathBuf {
        self.log.clone().unwrap_or_else(|| config_path.with_extension("log"))
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("deployment"))
    }

    pub fn colors(&self) -> bool {
        self.colors.unwrap_or_else(|| std::io::stdout().is_terminal())
    }
}

impl SectionConfig {
    /// Local directory, resolved against the directory holding the config file.
    pub fn local_dir(&self, config_dir: &Path) -> PathBuf {
        config_dir.join(&self.local)
    }

    pub fn transport_options(&self) -> Result<TransportOptions> {
        Ok(TransportOptions {
            user: self.user.clone(),
            password: self.password.clone(),
            passive_mode: self.passive_mode,
            file_permissions: parse_permissions(self.file_permissions.as_deref(), "file_permissions")?,
            dir_permissions: parse_permissions(self.dir_permissions.as_deref(), "dir_permissions")?,
            public_key: self.public_key.clone(),
            private_key: self.private_key.clone(),
            passphrase: self.passphrase.clone(),
        })
    }

    pub fn deploy_options(&self, global: &GlobalConfig, test_mode: bool) -> Result<DeployOptions> {
        let mut ignore_masks: Vec<String> = DEFAULT_IGNORE_MASKS.iter().map(|m| m.to_string()).collect();
        ignore_masks.extend(self.ignore.0.iter().cloned());

        Ok(DeployOptions {
            deployment_file: self.deployment_file.clone(),
            ignore_masks,
            include_masks: self.include.0.clone(),
            preprocess_masks: self.preprocess.masks(),
            allow_delete: self.allow_delete,
            test_mode: test_mode || self.test,
            to_purge: self.purge.0.clone(),
            temp_dir: global.temp_dir(),
            compression: self.compression,
            run_before: self.before.parse()?,
            run_after_upload: self.after_upload.parse()?,
            run_after: self.after.parse()?,
        })
    }
}
