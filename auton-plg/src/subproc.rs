//  SUBPROC.rs
//    by Lut99
//
//  Created:
//    14 Nov 2024, 11:20:46
//  Last edited:
//    05 Mar 2025, 10:12:33
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the `subproc` plugin, which launches a child process per
//!   Job: argv/env composition, uploaded argument files, privilege
//!   escalation, streaming of the child's pipes into the Job and timeout
//!   enforcement.
//

use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt as _;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, warn};
use serde::Deserialize;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::compose::{self, ComposeEntry, FormatArgs};
use crate::errors::{ComposeError, EndpointError, TargetError};
use crate::spec::{AutonTarget, Job, JobVars, Plugin, DEFAULT_TARGET_TIMEOUT};


/***** CONSTANTS *****/
/// The default method for privilege escalation.
pub const DEFAULT_BECOME_METHOD: &str = "sudo";
/// The default user to escalate to.
pub const DEFAULT_BECOME_USER: &str = "root";
/// The options `sudo` is always given.
pub const DEFAULT_SUDO_OPTS: [&str; 2] = ["-H", "-E"];

/// The prefix of the temporary directories uploaded argfiles land in.
const TMPDIR_PREFIX: &str = ".auton.";
/// How long we wait for the pipe pumps to drain after the child is gone.
const PUMP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);





/***** HELPER FUNCTIONS *****/
/// Appends one argfile pair to an argv.
///
/// An `arg` with a trailing `@` moves the `@` onto the path instead (curl's `--data @file`
/// idiom): `[arg-without-@, "@"+path]`. A lone `@` is invalid.
fn push_argfile(args: &mut Vec<String>, arg: &str, filepath: &str) -> Result<(), String> {
    if let Some(stripped) = arg.strip_suffix('@') {
        if stripped.is_empty() {
            return Err(arg.into());
        }
        args.push(stripped.into());
        args.push(format!("@{filepath}"));
    } else {
        args.push(arg.into());
        args.push(filepath.into());
    }
    Ok(())
}

/// Loads `.env`-style files as ordered key/value pairs.
///
/// Unreadable files are logged and skipped, they never fail the Job.
fn load_envfiles(target: &str, paths: impl IntoIterator<Item = PathBuf>) -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = vec![];
    for path in paths {
        let iter = match dotenvy::from_path_iter(&path) {
            Ok(iter) => iter,
            Err(err) => {
                warn!("unable to load envfile '{}' for target '{}', error: {}", path.display(), target, err);
                continue;
            },
        };
        for item in iter {
            match item {
                Ok((key, value)) => pairs.push((key, value)),
                Err(err) => {
                    warn!("unable to load envfile '{}' for target '{}', error: {}", path.display(), target, err);
                    break;
                },
            }
        }
    }
    pairs
}

/// Sets the environment variables every child process gets.
fn set_default_env(env: &mut HashMap<String, String>, vars: &JobVars) {
    env.insert("AUTON".into(), "true".into());
    env.insert("AUTON_JOB_TIME".into(), vars.time_str());
    env.insert("AUTON_JOB_GMTIME".into(), vars.gmtime_str());
    env.insert("AUTON_JOB_UID".into(), vars.uid.clone());
    env.insert("AUTON_JOB_UUID".into(), vars.uuid.clone());
}

/// Where a pipe pump sends its lines.
#[derive(Clone, Copy, Debug)]
enum PumpSink {
    /// The child's stdout, into the Job result.
    Result,
    /// The child's stderr, into the Job errors.
    Error,
}

/// Reads lines from one of the child's pipes into the Job until EOF or until told to stop.
async fn pump_lines(reader: impl AsyncRead + Unpin, job: Arc<Job>, killed: Arc<AtomicBool>, sink: PumpSink) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        if killed.load(Ordering::Relaxed) {
            break;
        }
        match lines.next_line().await {
            Ok(Some(line)) => {
                if !line.is_empty() {
                    match sink {
                        PumpSink::Result => job.add_result(line),
                        PumpSink::Error => job.add_error(line),
                    }
                }
            },
            Ok(None) => break,
            Err(err) => {
                job.add_error(err.to_string());
                break;
            },
        }
    }
}

/// Waits for the pumps to drain what's left in the pipes, bounded so a held-open pipe from a
/// grandchild cannot wedge the worker.
async fn drain_pumps(pumps: Vec<JoinHandle<()>>) {
    for pump in pumps {
        let _ = tokio::time::timeout(PUMP_DRAIN_TIMEOUT, pump).await;
    }
}





/***** AUXILLARY *****/
/// Defines the privilege-escalation block of a target config.
#[derive(Clone, Debug, Deserialize)]
pub struct BecomeConfig {
    /// Whether escalation is on at all.
    #[serde(default)]
    pub enabled: bool,
    /// The escalation method; defaults to `sudo`.
    #[serde(default)]
    pub method:  Option<String>,
    /// The user to escalate to; defaults to `root`.
    #[serde(default)]
    pub user:    Option<String>,
}

/// Builds the argv prefix for a `become` block.
///
/// For `sudo` this is `[sudo, -H, -E, -u, <user>]`; other methods are passed bare.
pub fn become_prefix(cfg: Option<&BecomeConfig>) -> Vec<String> {
    let cfg: &BecomeConfig = match cfg {
        Some(cfg) if cfg.enabled => cfg,
        _ => return vec![],
    };

    let method: &str = cfg.method.as_deref().unwrap_or(DEFAULT_BECOME_METHOD);
    let mut argv: Vec<String> = vec![method.into()];
    if method == DEFAULT_BECOME_METHOD {
        argv.extend(DEFAULT_SUDO_OPTS.iter().map(|opt| (*opt).into()));
        argv.push("-u".into());
        argv.push(cfg.user.as_deref().unwrap_or(DEFAULT_BECOME_USER).into());
    }
    argv
}



/// One static argfile in a target config.
#[derive(Clone, Debug, Deserialize)]
pub struct ConfigArgFile {
    /// The argument before the path. A trailing `@` moves onto the path instead.
    pub arg:      String,
    /// The file to pass. Must exist when the Job runs.
    pub filepath: PathBuf,
}

/// The target configuration of a `subproc` endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct SubprocConfig {
    /// The executable to launch.
    pub prog: String,

    /// Static or brace-templated argv entries appended after `prog`.
    #[serde(default)]
    pub args:     Vec<String>,
    /// Static files passed by argument.
    #[serde(default)]
    pub argfiles: Vec<ConfigArgFile>,
    /// Environment entries: a plain mapping or a modifier list.
    #[serde(default)]
    pub env:      Option<serde_yaml::Value>,
    /// `.env` files loaded on the daemon host.
    #[serde(default)]
    pub envfiles: Vec<PathBuf>,
    /// The child's working directory.
    #[serde(default)]
    pub workdir:  Option<PathBuf>,
    /// Seconds before the Job is failed and the child killed.
    #[serde(default)]
    pub timeout:  Option<u64>,
    /// When set, overrides the child's `PATH` with these, joined by the OS path separator.
    #[serde(default)]
    pub search_paths: Vec<PathBuf>,
    /// Privilege escalation.
    #[serde(default)]
    pub r#become: Option<BecomeConfig>,

    /// Drops the payload's `args` contribution.
    #[serde(default, rename = "disallow-args")]
    pub disallow_args:     bool,
    /// Drops the payload's `argfiles` contribution.
    #[serde(default, rename = "disallow-argfiles")]
    pub disallow_argfiles: bool,
    /// Drops the payload's `env` contribution.
    #[serde(default, rename = "disallow-env")]
    pub disallow_env:      bool,
    /// Drops the payload's `envfiles` contribution.
    #[serde(default, rename = "disallow-envfiles")]
    pub disallow_envfiles: bool,
}





/***** LIBRARY *****/
/// The plugin that runs a local subprocess per Job.
pub struct SubprocPlugin {
    target: AutonTarget,
    cfg: SubprocConfig,
    /// The config's env contribution, parsed once at startup.
    env_entries: Vec<ComposeEntry>,
    /// The argv prefix from the `become` block.
    become_argv: Vec<String>,
    timeout: Duration,
    /// Temp dirs holding uploaded argfiles, swept by [`Plugin::terminate`].
    dirs: Mutex<Vec<TempDir>>,
    /// The graceful-shutdown flag the pipe pumps observe.
    killed: Arc<AtomicBool>,
}
impl SubprocPlugin {
    /// Builds the plugin for one endpoint from its target config.
    ///
    /// # Arguments
    /// - `name`: The endpoint name.
    /// - `config`: The endpoint's `config` mapping.
    ///
    /// # Errors
    /// This function errors if the config misses `prog`, carries an invalid argfile or an
    /// invalid env modifier list. Such an endpoint is skipped at startup.
    pub fn new(name: impl Into<String>, config: &serde_yaml::Mapping) -> Result<Self, EndpointError> {
        let name: String = name.into();
        let cfg: SubprocConfig = serde_yaml::from_value(serde_yaml::Value::Mapping(config.clone()))
            .map_err(|err| EndpointError::ConfigDeserialize { endpoint: name.clone(), err })?;

        // Static argfiles with a lone `@` can never produce a valid argv
        for argfile in &cfg.argfiles {
            if argfile.arg == "@" {
                return Err(EndpointError::IllegalArgfileArg { endpoint: name, raw: argfile.arg.clone() });
            }
        }

        // The env contribution may be a plain mapping or a modifier list
        let env_entries: Vec<ComposeEntry> = match &cfg.env {
            None => vec![],
            Some(serde_yaml::Value::Mapping(map)) => {
                compose::parse_mapping_entries(map).map_err(|err| EndpointError::Compose { endpoint: name.clone(), err })?
            },
            Some(value) => compose::parse_entries(value).map_err(|err| EndpointError::Compose { endpoint: name.clone(), err })?,
        };

        let become_argv: Vec<String> = become_prefix(cfg.r#become.as_ref());
        let timeout: Duration = Duration::from_secs(cfg.timeout.unwrap_or(DEFAULT_TARGET_TIMEOUT));
        Ok(Self {
            target: AutonTarget { name, credentials: None },
            cfg,
            env_entries,
            become_argv,
            timeout,
            dirs: Mutex::new(vec![]),
            killed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Locks the temp-dir list, recovering from a poisoned lock.
    #[inline]
    fn dirs(&self) -> MutexGuard<'_, Vec<TempDir>> { self.dirs.lock().unwrap_or_else(|err| err.into_inner()) }

    /// Shorthand for a [`TargetError::Failed`] on this target.
    #[inline]
    fn failed(&self, msg: impl Into<String>, code: Option<i32>) -> TargetError {
        TargetError::Failed { target: self.target.name.clone(), msg: msg.into(), code }
    }

    /// Composes the full argv: become prefix, `prog`, templated config and payload args, then
    /// the argfile pairs (config first, payload argfiles materialized into a fresh temp dir).
    async fn mk_argv(&self, job: &Arc<Job>, fmt: &FormatArgs) -> Result<Vec<String>, TargetError> {
        let cfg: &SubprocConfig = &self.cfg;
        let payload = &job.request.payload;
        let template = |raw: &str| -> Result<String, TargetError> {
            compose::format_if_templated(raw, fmt).map_err(|err: ComposeError| self.failed(format!("invalid args for command: {err}"), None))
        };

        let mut args: Vec<String> = self.become_argv.clone();
        args.push(cfg.prog.clone());
        for raw in &cfg.args {
            args.push(template(raw)?);
        }
        if !payload.args.is_empty() {
            if cfg.disallow_args {
                warn!("args from payload isn't allowed for target '{}'", self.target.name);
            } else {
                for raw in &payload.args {
                    args.push(template(raw)?);
                }
            }
        }

        // Static argfiles must point at existing files
        for argfile in &cfg.argfiles {
            if !argfile.filepath.is_file() {
                return Err(self.failed(format!("invalid filepath '{}' in configuration argfiles", argfile.filepath.display()), None));
            }
            if let Err(raw) = push_argfile(&mut args, &argfile.arg, &argfile.filepath.display().to_string()) {
                return Err(self.failed(format!("invalid arg '{raw}' in configuration argfiles"), None));
            }
        }

        // Uploaded argfiles are decoded into a fresh temp dir, recorded for the terminate sweep
        if !payload.argfiles.is_empty() {
            if cfg.disallow_argfiles {
                warn!("argfiles from payload isn't allowed for target '{}'", self.target.name);
            } else {
                let tmpdir: TempDir = tempfile::Builder::new()
                    .prefix(TMPDIR_PREFIX)
                    .tempdir()
                    .map_err(|err| self.failed(format!("failed to create temporary directory: {err}"), None))?;
                for argfile in &payload.argfiles {
                    let filepath: PathBuf = if argfile.filename.is_empty() {
                        let tmpfile = tempfile::NamedTempFile::new_in(tmpdir.path())
                            .map_err(|err| self.failed(format!("failed to create temporary file: {err}"), None))?;
                        let (_, path) = tmpfile.keep().map_err(|err| self.failed(format!("failed to keep temporary file: {err}"), None))?;
                        path
                    } else {
                        tmpdir.path().join(&argfile.filename)
                    };

                    let cleaned: String = argfile.content.chars().filter(|c| !c.is_ascii_whitespace()).collect();
                    let content: Vec<u8> =
                        STANDARD.decode(cleaned).map_err(|err| self.failed(format!("invalid argfiles for command: {err}"), None))?;
                    tokio::fs::write(&filepath, content)
                        .await
                        .map_err(|err| self.failed(format!("failed to write '{}': {}", filepath.display(), err), None))?;

                    if let Err(raw) = push_argfile(&mut args, &argfile.arg, &filepath.display().to_string()) {
                        return Err(self.failed(format!("invalid arg '{raw}' in payload argfiles"), None));
                    }
                }
                self.dirs().push(tmpdir);
            }
        }

        Ok(args)
    }

    /// Composes the child's environment: payload envfiles, config envfiles, the config env
    /// entries (in that order, later layers override) over the payload env as base, then the
    /// `search_paths` PATH override and the `AUTON_*` defaults.
    fn mk_env(&self, job: &Arc<Job>, fmt: &FormatArgs) -> Result<HashMap<String, String>, TargetError> {
        let cfg: &SubprocConfig = &self.cfg;
        let payload = &job.request.payload;

        let mut entries: Vec<ComposeEntry> = vec![];
        if !payload.envfiles.is_empty() {
            if cfg.disallow_envfiles {
                warn!("envfiles from payload isn't allowed for target '{}'", self.target.name);
            } else {
                for (key, value) in load_envfiles(&self.target.name, payload.envfiles.iter().map(PathBuf::from)) {
                    entries.push(ComposeEntry::assign(key, value));
                }
            }
        }
        for (key, value) in load_envfiles(&self.target.name, cfg.envfiles.iter().cloned()) {
            entries.push(ComposeEntry::assign(key, value));
        }
        entries.extend(self.env_entries.iter().cloned());

        let mut env: HashMap<String, String> = HashMap::new();
        let mut input: HashMap<String, String> = HashMap::new();
        if !payload.env.is_empty() {
            if cfg.disallow_env {
                warn!("env from payload isn't allowed for target '{}'", self.target.name);
            } else {
                env = payload.env.clone();
                input = payload.env.clone();
            }
        }
        compose::compose_dict(&entries, "env", &input, fmt, &mut env).map_err(|err| self.failed(format!("invalid env for command: {err}"), None))?;

        if !cfg.search_paths.is_empty() {
            match std::env::join_paths(&cfg.search_paths) {
                Ok(path) => {
                    env.insert("PATH".into(), path.to_string_lossy().into_owned());
                },
                Err(err) => warn!("invalid search_paths for target '{}': {}", self.target.name, err),
            }
        }

        set_default_env(&mut env, job.vars());
        Ok(env)
    }

    /// Runs one Job: spawn the child, pump its pipes into the Job, enforce the timeout.
    async fn run_job(&self, job: &Arc<Job>) -> Result<(), TargetError> {
        let fmt: FormatArgs = job.vars().format_args();
        let argv: Vec<String> = self.mk_argv(job, &fmt).await?;
        let env: HashMap<String, String> = self.mk_env(job, &fmt)?;
        debug!("cmd line: {argv:?}");

        // Spawn with an explicit environment
        let mut cmd: Command = Command::new(&argv[0]);
        cmd.args(&argv[1..]).env_clear().envs(&env).stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
        if let Some(workdir) = &self.cfg.workdir {
            cmd.current_dir(workdir);
        }
        let mut child: Child = cmd.spawn().map_err(|err| self.failed(format!("failed to spawn '{}': {}", argv[0], err), None))?;

        // Pump both pipes into the Job as lines arrive
        let mut pumps: Vec<JoinHandle<()>> = vec![];
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_lines(stdout, job.clone(), self.killed.clone(), PumpSink::Result)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_lines(stderr, job.clone(), self.killed.clone(), PumpSink::Error)));
        }

        // Wait for the child, bounded by the target's deadline
        let deadline: Instant = Instant::now() + self.timeout;
        let status = tokio::select! {
            res = child.wait() => res.map_err(|err| self.failed(format!("failed to wait for '{}': {}", argv[0], err), None))?,
            _ = tokio::time::sleep_until(deadline) => {
                if let Err(err) = child.kill().await {
                    warn!("failed to kill timed-out child of target '{}': {}", self.target.name, err);
                }
                drain_pumps(pumps).await;
                return Err(TargetError::Timeout { target: self.target.name.clone() });
            },
        };
        drain_pumps(pumps).await;

        match status.code() {
            Some(0) => Ok(()),
            Some(code) => Err(self.failed(format!("command '{}' returned non-zero exit status {code}", self.cfg.prog), Some(code))),
            None => {
                // A signal-killed child reports the signal as a negative code
                let signal: Option<i32> = status.signal();
                Err(self.failed(
                    match signal {
                        Some(signal) => format!("command '{}' was terminated by signal {signal}", self.cfg.prog),
                        None => format!("command '{}' was terminated by a signal", self.cfg.prog),
                    },
                    signal.map(|signal| -signal),
                ))
            },
        }
    }
}

#[async_trait]
impl Plugin for SubprocPlugin {
    #[inline]
    fn kind(&self) -> &'static str { "subproc" }

    #[inline]
    fn target_name(&self) -> &str { &self.target.name }

    #[inline]
    fn methods(&self) -> &'static [&'static str] { &["run"] }

    async fn call(&self, method: &str, job: &Arc<Job>) -> Result<(), TargetError> {
        match method {
            "run" => self.run_job(job).await,
            method => Err(TargetError::UnknownMethod { endpoint: self.target.name.clone(), method: method.into() }),
        }
    }

    async fn terminate(&self) {
        let dirs: Vec<TempDir> = self.dirs().drain(..).collect();
        for dir in dirs {
            if let Err(err) = dir.close() {
                debug!("failed to remove temporary directory: {err}");
            }
        }
    }

    #[inline]
    fn stop(&self) { self.killed.store(true, Ordering::Relaxed); }
}





/***** TESTS *****/
