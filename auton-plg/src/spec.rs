//  SPEC.rs
//    by Lut99
//
//  Created:
//    13 Nov 2024, 09:14:55
//  Last edited:
//    04 Mar 2025, 13:28:09
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the core types of the dispatch engine: the [`Job`] and its
//!   state machine, the inbound-request snapshot it carries, the
//!   [`Plugin`]-trait at the seam between the worker and the target and
//!   the [`Endpoint`] that binds them together.
//

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use auton_cfg::credentials::Credentials;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use uuid::Uuid;

use crate::compose::{FormatArgs, FormatValue};
use crate::errors::TargetError;
use crate::queue::EndpointQueue;


/***** CONSTANTS *****/
/// The default number of seconds before a target gives up on a Job.
pub const DEFAULT_TARGET_TIMEOUT: u64 = 60;

/// How timestamps are rendered into template variables and the child environment.
pub const VAR_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";





/***** HELPER FUNCTIONS *****/
/// Returns the current wall-clock time as fractional seconds since the epoch.
#[inline]
fn unix_now() -> f64 { SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs_f64()).unwrap_or(0.0) }





/***** AUXILLARY *****/
/// Defines the states a [`Job`] moves through.
///
/// Transitions are strictly `New -> Processing -> Complete`; [`Job::set_status`] refuses to move backwards.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Submitted, not yet picked up by the endpoint worker.
    New,
    /// The worker is executing it against the target.
    Processing,
    /// Terminal; the result and errors are frozen.
    Complete,
}
impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use JobStatus::*;
        match self {
            New => write!(f, "new"),
            Processing => write!(f, "processing"),
            Complete => write!(f, "complete"),
        }
    }
}



/// Defines the payload of a `run` request.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RunPayload {
    /// Extra environment entries for the child process.
    #[serde(default)]
    pub env:      HashMap<String, String>,
    /// Paths of `.env` files to load on the daemon host.
    #[serde(default)]
    pub envfiles: Vec<String>,
    /// Extra argv entries.
    #[serde(default)]
    pub args:     Vec<String>,
    /// Files to materialize on the daemon host and pass by argument.
    #[serde(default)]
    pub argfiles: Vec<PayloadArgFile>,
}

/// One uploaded argument file in a `run` payload.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PayloadArgFile {
    /// The argument to pass before the materialized path. A trailing `@` moves to the path instead (curl's read-from-file idiom).
    pub arg:      String,
    /// The file contents, base64-encoded.
    pub content:  String,
    /// The filename to materialize under; empty means an anonymous temp file.
    pub filename: String,
}



/// An opaque snapshot of the inbound HTTP request a [`Job`] was created from.
#[derive(Clone, Debug)]
pub struct JobRequest {
    /// The request method, lowercased.
    pub method:  String,
    /// The request path.
    pub path:    String,
    /// The request headers, keys lowercased.
    pub headers: HashMap<String, String>,
    /// The query parameters.
    pub params:  HashMap<String, String>,
    /// The parsed job payload.
    pub payload: RunPayload,
    /// The raw request body, for plugins that forward it.
    pub body:    Option<String>,
    /// Server-side variables (e.g. `HTTP_AUTH_USER`, `REMOTE_ADDR`).
    pub server_vars: HashMap<String, String>,
}
impl Default for JobRequest {
    fn default() -> Self {
        Self {
            method: "post".into(),
            path: "/job/run".into(),
            headers: HashMap::new(),
            params: HashMap::new(),
            payload: RunPayload::default(),
            body: None,
            server_vars: HashMap::new(),
        }
    }
}



/// The template variables captured once at Job creation.
#[derive(Clone, Debug)]
pub struct JobVars {
    /// A snapshot of the daemon's environment. Later mutations of the process env do not leak in.
    pub env:    HashMap<String, String>,
    /// Local time at creation.
    pub time:   DateTime<Local>,
    /// UTC time at creation.
    pub gmtime: DateTime<Utc>,
    /// The Job's uid.
    pub uid:    String,
    /// A freshly generated v4 UUID.
    pub uuid:   String,
    /// Endpoint-level template variables from the config.
    pub extra:  HashMap<String, String>,
}
impl JobVars {
    /// Captures a fresh set of variables for the given uid.
    fn new(uid: &str, extra: HashMap<String, String>) -> Self {
        Self {
            env: std::env::vars().collect(),
            time: Local::now(),
            gmtime: Utc::now(),
            uid: uid.into(),
            uuid: Uuid::new_v4().to_string(),
            extra,
        }
    }

    /// Renders the local creation time the way the template variables carry it.
    #[inline]
    pub fn time_str(&self) -> String { self.time.format(VAR_TIME_FORMAT).to_string() }

    /// Renders the UTC creation time the way the template variables carry it.
    #[inline]
    pub fn gmtime_str(&self) -> String { self.gmtime.format(VAR_TIME_FORMAT).to_string() }

    /// Builds the format kwargs for argv/env templating (`{_uid_}`, `{_env_[HOME]}`, endpoint vars, ...).
    pub fn format_args(&self) -> FormatArgs {
        let mut args: FormatArgs = HashMap::with_capacity(5 + self.extra.len());
        args.insert("_env_".into(), FormatValue::Map(self.env.clone()));
        args.insert("_time_".into(), FormatValue::Str(self.time_str()));
        args.insert("_gmtime_".into(), FormatValue::Str(self.gmtime_str()));
        args.insert("_uid_".into(), FormatValue::Str(self.uid.clone()));
        args.insert("_uuid_".into(), FormatValue::Str(self.uuid.clone()));
        for (key, value) in &self.extra {
            args.insert(key.clone(), FormatValue::Str(value.clone()));
        }
        args
    }
}



/// The mutable half of a [`Job`], kept behind its mutex.
#[derive(Debug)]
struct JobState {
    status: JobStatus,
    result: Vec<String>,
    errors: Vec<String>,
    prv_pos: usize,
    cur_pos: usize,
    return_code: Option<i32>,
    started_at: Option<f64>,
    ended_at: Option<f64>,
}

/// A consistent copy of a [`Job`]'s mutable fields, for building responses.
#[derive(Clone, Debug)]
pub struct JobSnapshot {
    /// The status at snapshot time.
    pub status: JobStatus,
    /// The result lines appended since the previous snapshot.
    pub stream: Vec<String>,
    /// All error lines so far.
    pub errors: Vec<String>,
    /// The return code, if terminal.
    pub return_code: Option<i32>,
    /// When the worker picked the Job up.
    pub started_at: Option<f64>,
    /// When the Job terminated.
    pub ended_at: Option<f64>,
}





/***** LIBRARY *****/
/// One submitted unit of work.
///
/// Identity fields are immutable after construction; the mutable state lives behind a per-Job
/// mutex and is written only by the endpoint's worker once the Job is enqueued. Completion is
/// signalled through [`Job::wait_complete`].
#[derive(Debug)]
pub struct Job {
    /// The endpoint this Job targets.
    pub name: String,
    /// The registry key, `<endpoint>:<id>`.
    pub uid: String,
    /// Same as `name`; kept separate for callers that hold the Job without its endpoint.
    pub endpoint: String,
    /// The plugin method to invoke.
    pub method: String,
    /// The inbound request snapshot.
    pub request: JobRequest,

    vars:  JobVars,
    state: Mutex<JobState>,
    done:  Notify,
}
impl Job {
    /// Creates a new Job in status `new`, capturing its template variables.
    ///
    /// # Arguments
    /// - `name`: The endpoint name.
    /// - `uid`: The registry key (`<endpoint>:<id>`).
    /// - `method`: The plugin method to invoke.
    /// - `request`: The inbound request snapshot.
    /// - `extra_vars`: Endpoint-level template variables.
    pub fn new(name: impl Into<String>, uid: impl Into<String>, method: impl Into<String>, request: JobRequest, extra_vars: HashMap<String, String>) -> Self {
        let name: String = name.into();
        let uid: String = uid.into();
        let vars: JobVars = JobVars::new(&uid, extra_vars);
        Self {
            endpoint: name.clone(),
            name,
            uid,
            method: method.into(),
            request,
            vars,
            state: Mutex::new(JobState {
                status: JobStatus::New,
                result: vec![],
                errors: vec![],
                prv_pos: 0,
                cur_pos: 0,
                return_code: None,
                started_at: None,
                ended_at: None,
            }),
            done: Notify::new(),
        }
    }

    /// Locks the mutable state, recovering from a poisoned lock.
    #[inline]
    fn state(&self) -> MutexGuard<'_, JobState> { self.state.lock().unwrap_or_else(|err| err.into_inner()) }

    /// The template variables captured at creation.
    #[inline]
    pub fn vars(&self) -> &JobVars { &self.vars }

    /// Appends one line of captured output.
    pub fn add_result(&self, line: impl Into<String>) {
        let mut state = self.state();
        if state.status < JobStatus::Complete {
            state.result.push(line.into());
        }
    }

    /// Appends one error line.
    pub fn add_error(&self, error: impl Into<String>) {
        let mut state = self.state();
        if state.status < JobStatus::Complete {
            state.errors.push(error.into());
        }
    }

    /// Whether any errors were recorded.
    #[inline]
    pub fn has_error(&self) -> bool { !self.state().errors.is_empty() }

    /// The current status.
    #[inline]
    pub fn status(&self) -> JobStatus { self.state().status }

    /// Advances the status. Backwards transitions are ignored: the machine only moves
    /// `new -> processing -> complete`.
    pub fn set_status(&self, status: JobStatus) {
        let mut state = self.state();
        if status > state.status {
            state.status = status;
        }
    }

    /// Sets the return code.
    #[inline]
    pub fn set_return_code(&self, code: Option<i32>) { self.state().return_code = code; }

    /// Stamps the start timestamp with the current wall-clock time.
    #[inline]
    pub fn set_started_at(&self) { self.state().started_at = Some(unix_now()); }

    /// Stamps the end timestamp with the current wall-clock time.
    #[inline]
    pub fn set_ended_at(&self) { self.state().ended_at = Some(unix_now()); }

    /// Wakes everything waiting on [`Job::wait_complete`]. Called by the worker after the
    /// terminal transition.
    #[inline]
    pub fn notify_complete(&self) { self.done.notify_waiters(); }

    /// Waits until the Job reaches `complete`. Returns immediately if it already has.
    pub async fn wait_complete(&self) {
        loop {
            let notified = self.done.notified();
            if self.status() == JobStatus::Complete {
                return;
            }
            notified.await;
        }
    }

    /// Takes a consistent snapshot for a poll response, advancing the stream cursor: the
    /// returned `stream` holds exactly the result lines appended since the previous snapshot.
    pub fn poll_snapshot(&self) -> JobSnapshot {
        let mut state = self.state();
        state.prv_pos = state.cur_pos;
        state.cur_pos = state.result.len();
        JobSnapshot {
            status: state.status,
            stream: state.result[state.prv_pos..state.cur_pos].to_vec(),
            errors: state.errors.clone(),
            return_code: state.return_code,
            started_at: state.started_at,
            ended_at: state.ended_at,
        }
    }

    /// All result lines so far, without touching the stream cursor.
    #[inline]
    pub fn result(&self) -> Vec<String> { self.state().result.clone() }

    /// All error lines so far.
    #[inline]
    pub fn errors(&self) -> Vec<String> { self.state().errors.clone() }

    /// The return code, if set.
    #[inline]
    pub fn return_code(&self) -> Option<i32> { self.state().return_code }
}



/// The target an endpoint acts on: its name plus any credentials.
#[derive(Clone, Debug)]
pub struct AutonTarget {
    /// The endpoint name, used in error reporting.
    pub name: String,
    /// Credentials the target presents to its backend, if any.
    pub credentials: Option<Credentials>,
}



/// The seam between the endpoint worker and a class of targets.
///
/// A plugin declares its method table up front; the worker consults it before dispatching and
/// fails the Job on a miss instead of looping.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// The plugin kind, as named in the config (`subproc`, `http`).
    fn kind(&self) -> &'static str;

    /// The name of the target this instance is bound to.
    fn target_name(&self) -> &str;

    /// The methods this plugin implements.
    fn methods(&self) -> &'static [&'static str];

    /// Executes one Job.
    ///
    /// # Arguments
    /// - `method`: One of [`Plugin::methods`].
    /// - `job`: The Job to execute; output and errors are appended as they arrive.
    ///
    /// # Errors
    /// Any [`TargetError`] is recorded on the Job by the worker; it never crashes the worker.
    async fn call(&self, method: &str, job: &Arc<Job>) -> Result<(), TargetError>;

    /// Post-Job cleanup hook, invoked by the worker after every Job.
    async fn terminate(&self) {}

    /// Signals the plugin that the daemon is shutting down; long-running loops should wind down.
    fn stop(&self) {}
}



/// A named, configured instance of a plugin, with its queue and allowlist.
#[derive(Clone)]
pub struct Endpoint {
    /// The endpoint name.
    pub name: String,
    /// Whether the endpoint exists at all.
    pub enabled: bool,
    /// Whether its worker is spawned at daemon startup.
    pub autostart: bool,
    /// Endpoint-level template variables, copied into every Job.
    pub vars: HashMap<String, String>,
    /// The user allowlist. Empty means any caller is accepted.
    pub users: HashMap<String, bool>,
    /// The plugin instance bound to this endpoint's target.
    pub plugin: Arc<dyn Plugin>,
    /// The producer half of this endpoint's work queue.
    pub queue: EndpointQueue,
}
impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("enabled", &self.enabled)
            .field("autostart", &self.autostart)
            .field("plugin", &self.plugin.kind())
            .finish()
    }
}





/***** TESTS *****/
