//  WORKER.rs
//    by Lut99
//
//  Created:
//    15 Nov 2024, 09:31:02
//  Last edited:
//    05 Mar 2025, 13:19:44
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the per-endpoint worker: the single consumer of an
//!   endpoint's queue that authenticates the caller, dispatches the Job to
//!   the plugin and finalizes it. Also builds endpoints (plugin, queue,
//!   worker) from their configuration.
//

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use auton_cfg::daemon::{EndpointConfig, ResolvedEndpoint};
use log::{debug, error, info, warn};

use crate::errors::{EndpointError, TargetError};
use crate::http::HttpPlugin;
use crate::queue::{endpoint_queue, QueueReceiver};
use crate::spec::{Endpoint, Job, JobStatus, Plugin};
use crate::subproc::SubprocPlugin;


/***** LIBRARY FUNCTIONS *****/
/// Builds one endpoint from its configuration: the plugin bound to its target, the queue, and
/// the worker that will consume it.
///
/// # Arguments
/// - `name`: The endpoint name.
/// - `config`: The endpoint's section of the daemon config.
/// - `config_dir`: The daemon config's directory, against which relative imports resolve.
///
/// # Errors
/// This function errors if the endpoint's imports, plugin name or target config are invalid.
/// Such an endpoint is skipped at startup; the daemon lives on.
pub fn build_endpoint(name: impl Into<String>, config: &EndpointConfig, config_dir: Option<&Path>) -> Result<(Endpoint, EndpointWorker), EndpointError> {
    let name: String = name.into();
    let resolved: ResolvedEndpoint = config.resolve(config_dir).map_err(|err| EndpointError::Resolve { endpoint: name.clone(), err })?;

    let plugin: Arc<dyn Plugin> = match config.plugin.as_str() {
        "subproc" => Arc::new(SubprocPlugin::new(name.clone(), &resolved.config)?),
        "http" => Arc::new(HttpPlugin::new(name.clone(), &resolved.config, resolved.credentials.clone())?),
        raw => return Err(EndpointError::UnknownPlugin { endpoint: name, raw: raw.into() }),
    };

    let (queue, receiver) = endpoint_queue(name.clone());
    let endpoint: Endpoint = Endpoint {
        name: name.clone(),
        enabled: config.enabled,
        autostart: config.autostart,
        vars: resolved.vars,
        users: resolved.users,
        plugin: plugin.clone(),
        queue,
    };
    let worker: EndpointWorker = EndpointWorker { name, users: endpoint.users.clone(), plugin, queue: receiver };
    Ok((endpoint, worker))
}





/***** LIBRARY *****/
/// The single consumer of one endpoint's queue.
pub struct EndpointWorker {
    name: String,
    users: HashMap<String, bool>,
    plugin: Arc<dyn Plugin>,
    queue: QueueReceiver,
}
impl EndpointWorker {
    /// Runs the worker loop. It only returns once every producer of the queue is gone.
    pub async fn run(mut self) {
        info!("endpoint worker started: '{}'", self.name);
        while let Some(job) = self.queue.qget().await {
            debug!("endpoint '{}' picked up job '{}'", self.name, job.uid);
            self.process(&job).await;
        }
        info!("endpoint worker stopped: '{}'", self.name);
    }

    /// Processes one Job through to its terminal state. Errors are recorded on the Job; they
    /// never crash the worker.
    async fn process(&self, job: &Arc<Job>) {
        let checked: Result<(), TargetError> = self.check(job);

        // The Job starts processing even when a check failed, so the terminal transition
        // always carries timestamps
        job.set_started_at();
        job.set_status(JobStatus::Processing);

        let res: Result<(), TargetError> = match checked {
            Ok(()) => self.plugin.call(&job.method, job).await,
            Err(err) => Err(err),
        };
        match res {
            Ok(()) => job.set_return_code(Some(0)),
            Err(err) => {
                error!("job '{}' failed: {}", job.uid, err);
                job.add_error(format!("ERROR: {err}\n"));
                job.set_return_code(err.code());
            },
        }

        job.set_status(JobStatus::Complete);
        job.set_ended_at();
        job.notify_complete();
        self.plugin.terminate().await;
    }

    /// Authenticates the caller against the allowlist and checks the plugin's method table.
    fn check(&self, job: &Arc<Job>) -> Result<(), TargetError> {
        if !self.users.is_empty() {
            let user: Option<&String> = job.request.server_vars.get("HTTP_AUTH_USER");
            match user {
                Some(user) if self.users.get(user).copied().unwrap_or(false) => {},
                user => return Err(TargetError::Unauthorized { user: user.cloned() }),
            }
        }

        if !self.plugin.methods().contains(&job.method.as_str()) {
            warn!("unknown method '{}' for endpoint '{}'", job.method, self.name);
            return Err(TargetError::UnknownMethod { endpoint: self.name.clone(), method: job.method.clone() });
        }
        Ok(())
    }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::JobRequest;


    /// Builds an endpoint + spawned worker for the given endpoint YAML.
    fn endpoint(config: &str) -> Endpoint {
        let config: EndpointConfig = serde_yaml::from_str(config).unwrap();
        let (endpoint, worker) = build_endpoint("test", &config, None).unwrap();
        tokio::spawn(worker.run());
        endpoint
    }

    /// Submits a Job to the endpoint and waits for it to terminate.
    async fn run_job(endpoint: &Endpoint, job: Job) -> Arc<Job> {
        let job: Arc<Job> = Arc::new(job);
        endpoint.queue.qput(job.clone()).unwrap();
        job.wait_complete().await;
        job
    }


    #[tokio::test]
    async fn test_jobs_run_in_submission_order() {
        let ep = endpoint("plugin: subproc\nconfig:\n  prog: /bin/echo\n  args: ['{_uid_}']\n");

        let jobs: Vec<Arc<Job>> = (0..4)
            .map(|i| Arc::new(Job::new("test", format!("test:{i}"), "run", JobRequest::default(), HashMap::new())))
            .collect();
        for job in &jobs {
            ep.queue.qput(job.clone()).unwrap();
        }
        for job in &jobs {
            job.wait_complete().await;
        }

        // FIFO per endpoint: started_at must be non-decreasing in submission order
        let starts: Vec<f64> = jobs.iter().map(|job| job.poll_snapshot().started_at.unwrap()).collect();
        assert!(starts.windows(2).all(|w| w[0] <= w[1]), "starts not monotone: {starts:?}");
        for (i, job) in jobs.iter().enumerate() {
            assert_eq!(job.result(), vec![format!("test:{i}")]);
            assert_eq!(job.return_code(), Some(0));
        }
    }

    #[tokio::test]
    async fn test_failure_is_recorded_not_fatal() {
        let ep = endpoint("plugin: subproc\nconfig:\n  prog: /bin/sh\n  args: ['-c', 'exit 7']\n");

        let job = run_job(&ep, Job::new("test", "test:f1", "run", JobRequest::default(), HashMap::new())).await;
        assert_eq!(job.status(), JobStatus::Complete);
        assert_eq!(job.return_code(), Some(7));
        assert!(job.errors().iter().any(|line| line.starts_with("ERROR: ")));

        // The worker survived: a next job still runs
        let job = run_job(&ep, Job::new("test", "test:f2", "run", JobRequest::default(), HashMap::new())).await;
        assert_eq!(job.status(), JobStatus::Complete);
    }

    #[tokio::test]
    async fn test_unknown_method_terminates_job() {
        let ep = endpoint("plugin: subproc\nconfig:\n  prog: /bin/echo\n");

        let job = run_job(&ep, Job::new("test", "test:m1", "bogus", JobRequest::default(), HashMap::new())).await;
        assert_eq!(job.status(), JobStatus::Complete);
        assert_eq!(job.return_code(), None);
        assert!(job.errors().iter().any(|line| line.contains("unknown method 'bogus'")));
        // Timestamps are stamped even on the check-failure path
        let snap = job.poll_snapshot();
        assert!(snap.started_at.is_some() && snap.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_allowlist_rejects_unknown_user() {
        let ep = endpoint("plugin: subproc\nusers:\n  alice: true\n  mallory: false\nconfig:\n  prog: /bin/echo\n");

        // No user at all
        let job = run_job(&ep, Job::new("test", "test:u1", "run", JobRequest::default(), HashMap::new())).await;
        assert_eq!(job.return_code(), Some(401));

        // A user that is listed but disabled
        let mut request: JobRequest = JobRequest::default();
        request.server_vars.insert("HTTP_AUTH_USER".into(), "mallory".into());
        let job = run_job(&ep, Job::new("test", "test:u2", "run", request, HashMap::new())).await;
        assert_eq!(job.return_code(), Some(401));

        // An allowed user
        let mut request: JobRequest = JobRequest::default();
        request.server_vars.insert("HTTP_AUTH_USER".into(), "alice".into());
        let job = run_job(&ep, Job::new("test", "test:u3", "run", request, HashMap::new())).await;
        assert_eq!(job.return_code(), Some(0));
    }
}
