//  QUEUE.rs
//    by Lut99
//
//  Created:
//    13 Nov 2024, 09:44:31
//  Last edited:
//    04 Mar 2025, 13:30:57
//  Auto updated?
//    Yes
//
//  Description:
//!   Defines the per-endpoint work queue: an unbounded FIFO with exactly
//!   one consumer (the endpoint's worker) and the control handlers as
//!   producers.
//

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::errors::QueueError;
use crate::spec::Job;


/***** LIBRARY *****/
/// Creates the queue for one endpoint, returning the producer and consumer halves.
pub fn endpoint_queue(name: impl Into<String>) -> (EndpointQueue, QueueReceiver) {
    let name: String = name.into();
    let (tx, rx): (UnboundedSender<Arc<Job>>, UnboundedReceiver<Arc<Job>>) = mpsc::unbounded_channel();
    (EndpointQueue { name: name.clone(), tx }, QueueReceiver { name, rx })
}



/// The producer half of an endpoint's queue. Cheap to clone.
#[derive(Clone, Debug)]
pub struct EndpointQueue {
    name: String,
    tx:   UnboundedSender<Arc<Job>>,
}
impl EndpointQueue {
    /// Enqueues a Job for this endpoint's worker.
    ///
    /// # Errors
    /// This function errors if the consuming worker has gone away.
    pub fn qput(&self, job: Arc<Job>) -> Result<(), QueueError> {
        self.tx.send(job).map_err(|_| QueueError::Closed { endpoint: self.name.clone() })
    }
}



/// The consumer half of an endpoint's queue. There is exactly one.
#[derive(Debug)]
pub struct QueueReceiver {
    name: String,
    rx:   UnboundedReceiver<Arc<Job>>,
}
impl QueueReceiver {
    /// The endpoint this queue belongs to.
    #[inline]
    pub fn name(&self) -> &str { &self.name }

    /// Dequeues the next Job, waiting for one to arrive. Returns [`None`] once all producers
    /// are gone.
    #[inline]
    pub async fn qget(&mut self) -> Option<Arc<Job>> { self.rx.recv().await }
}





/***** TESTS *****/
#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::spec::JobRequest;


    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = endpoint_queue("echo");
        for i in 0..8 {
            let job = Arc::new(Job::new("echo", format!("echo:{i}"), "run", JobRequest::default(), HashMap::new()));
            tx.qput(job).unwrap();
        }
        for i in 0..8 {
            let job = rx.qget().await.unwrap();
            assert_eq!(job.uid, format!("echo:{i}"));
        }
    }

    #[tokio::test]
    async fn test_qput_after_consumer_drop() {
        let (tx, rx) = endpoint_queue("echo");
        drop(rx);
        let job = Arc::new(Job::new("echo", "echo:x", "run", JobRequest::default(), HashMap::new()));
        assert!(tx.qput(job).is_err());
    }
}
