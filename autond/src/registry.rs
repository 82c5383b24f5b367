//  REGISTRY.rs
//    by Lut99
//
//  Created:
//    18 Nov 2024, 14:20:11
//  Last edited:
//    05 Mar 2025, 16:04:40
//  Auto updated?
//    Yes
//
//  Description:
//!   Implements the process-wide job registry: a uid-keyed map behind a
//!   readers/writer lock whose acquisitions are bounded by the configured
//!   `lock_timeout`.
//

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use auton_plg::spec::{Job, JobStatus};
use tokio::sync::RwLock;

use crate::errors::RegistryError;


/***** LIBRARY *****/
/// The process-wide mapping from uid to Job.
///
/// Uids are unique at all times: inserting a present uid is refused. A Job leaves the registry
/// through [`JobRegistry::take_terminal`], the atomic read-and-conditionally-remove a terminal
/// status poll performs.
#[derive(Debug)]
pub struct JobRegistry {
    lock_timeout: u64,
    jobs: RwLock<HashMap<String, Arc<Job>>>,
}
impl JobRegistry {
    /// Creates an empty registry whose lock acquisitions are bounded by `lock_timeout` seconds.
    pub fn new(lock_timeout: u64) -> Self { Self { lock_timeout, jobs: RwLock::new(HashMap::new()) } }

    /// The configured lock bound, in seconds.
    #[inline]
    pub fn lock_timeout(&self) -> u64 { self.lock_timeout }

    /// Inserts a new Job under its uid.
    ///
    /// # Errors
    /// This function errors if the write lock could not be taken in time, or the uid is
    /// already present.
    pub async fn insert(&self, job: Arc<Job>) -> Result<(), RegistryError> {
        let mut jobs = tokio::time::timeout(Duration::from_secs(self.lock_timeout), self.jobs.write())
            .await
            .map_err(|_| RegistryError::LockTimeout { mode: "writing", timeout: self.lock_timeout })?;
        match jobs.entry(job.uid.clone()) {
            Entry::Occupied(entry) => Err(RegistryError::UidExists { uid: entry.key().clone() }),
            Entry::Vacant(entry) => {
                entry.insert(job);
                Ok(())
            },
        }
    }

    /// Fetches the Job under the given uid, if any.
    ///
    /// # Errors
    /// This function errors if the read lock could not be taken in time.
    pub async fn get(&self, uid: &str) -> Result<Option<Arc<Job>>, RegistryError> {
        let jobs = tokio::time::timeout(Duration::from_secs(self.lock_timeout), self.jobs.read())
            .await
            .map_err(|_| RegistryError::LockTimeout { mode: "reading", timeout: self.lock_timeout })?;
        Ok(jobs.get(uid).cloned())
    }

    /// Removes the Job under the given uid iff it has terminated, returning it.
    ///
    /// The status check and the removal happen under the same write lock, so two pollers
    /// cannot both take the entry.
    ///
    /// # Errors
    /// This function errors if the write lock could not be taken in time.
    pub async fn take_terminal(&self, uid: &str) -> Result<Option<Arc<Job>>, RegistryError> {
        let mut jobs = tokio::time::timeout(Duration::from_secs(self.lock_timeout), self.jobs.write())
            .await
            .map_err(|_| RegistryError::LockTimeout { mode: "writing", timeout: self.lock_timeout })?;
        if jobs.get(uid).map(|job| job.status()) == Some(JobStatus::Complete) { Ok(jobs.remove(uid)) } else { Ok(None) }
    }

    /// Removes the Job under the given uid unconditionally. Used to back out an insert whose
    /// enqueue failed.
    ///
    /// # Errors
    /// This function errors if the write lock could not be taken in time.
    pub async fn discard(&self, uid: &str) -> Result<Option<Arc<Job>>, RegistryError> {
        let mut jobs = tokio::time::timeout(Duration::from_secs(self.lock_timeout), self.jobs.write())
            .await
            .map_err(|_| RegistryError::LockTimeout { mode: "writing", timeout: self.lock_timeout })?;
        Ok(jobs.remove(uid))
    }
}





/***** TESTS *****/
