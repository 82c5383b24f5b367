//  SPEC.rs
//    by Lut99
//
//  Created:
//    18 Nov 2024, 14:32:47
//  Last edited:
//    05 Mar 2025, 16:40:12
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the daemon's shared [`Context`]: the endpoint table and the
//!   job registry, built once at startup and passed to every handler.
//

use std::collections::HashMap;
use std::path::Path;

use auton_cfg::daemon::DaemonConfig;
use auton_plg::spec::Endpoint;
use auton_plg::worker::{build_endpoint, EndpointWorker};
use error_trace::trace;
use log::{error, info};

use crate::registry::JobRegistry;


/***** LIBRARY *****/
/// The state shared by all control handlers.
#[derive(Debug)]
pub struct Context {
    /// The process-wide job registry.
    pub registry:  JobRegistry,
    /// The endpoint table, keyed by name. Initialized at startup, read-only thereafter.
    pub endpoints: HashMap<String, Endpoint>,
}
impl Context {
    /// Builds the daemon's context from its configuration.
    ///
    /// Endpoints that fail their initialization are logged and skipped; they never take the
    /// daemon down with them.
    ///
    /// # Arguments
    /// - `config`: The parsed daemon config.
    /// - `config_dir`: The config file's directory, against which relative imports resolve.
    ///
    /// # Returns
    /// The context plus the workers to spawn (one per endpoint that is enabled and set to
    /// autostart).
    pub fn from_config(config: &DaemonConfig, config_dir: Option<&Path>) -> (Self, Vec<EndpointWorker>) {
        let mut endpoints: HashMap<String, Endpoint> = HashMap::with_capacity(config.endpoints.len());
        let mut workers: Vec<EndpointWorker> = vec![];
        for (name, ept_config) in &config.endpoints {
            match build_endpoint(name.clone(), ept_config, config_dir) {
                Ok((endpoint, worker)) => {
                    info!("endpoint init: '{name}' (plugin '{}')", endpoint.plugin.kind());
                    if endpoint.enabled && endpoint.autostart {
                        workers.push(worker);
                    }
                    endpoints.insert(name.clone(), endpoint);
                },
                Err(err) => {
                    error!("{}", trace!(("Failed to initialize endpoint '{name}'; skipping it"), err));
                },
            }
        }

        (Self { registry: JobRegistry::new(config.general.lock_timeout), endpoints }, workers)
    }

    /// Raises the stop flag on every plugin, as part of graceful shutdown.
    pub fn stop_plugins(&self) {
        for endpoint in self.endpoints.values() {
            endpoint.plugin.stop();
        }
    }
}
