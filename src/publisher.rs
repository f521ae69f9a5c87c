//! Broker publishing.
//!
//! The broker client is a trait seam; the node hands each payload to a
//! small bounded pool of publish workers and waits a bounded time for the
//! broker to acknowledge it. A publish that does not complete in time is a
//! failure for that event only. It is never retried here.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{NodeError, NodeResult, TransportError};

const PUBLISHER_TAG: &str = "Publisher:";

/// Default number of queued publishes per pool.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// MQTT delivery guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Qos {
    /// QoS 0.
    AtMostOnce,
    /// QoS 1; used for every notification.
    #[default]
    AtLeastOnce,
    /// QoS 2.
    ExactlyOnce,
}

impl Qos {
    /// Numeric MQTT level.
    #[must_use]
    pub const fn level(self) -> u8 {
        match self {
            Self::AtMostOnce => 0,
            Self::AtLeastOnce => 1,
            Self::ExactlyOnce => 2,
        }
    }
}

/// A connected message broker.
///
/// # Safety Considerations
/// - `publish` is called concurrently from every publish worker
/// - Returning `Ok` means the broker acknowledged the message at `qos`
pub trait Broker: Send + Sync {
    /// Publishes `payload` on `topic`.
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError>;
}

/// One message accepted by an `InMemoryBroker`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Topic published on.
    pub topic: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// Requested QoS.
    pub qos: Qos,
}

impl Delivery {
    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns the decoder error if the payload is not JSON.
    pub fn json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[derive(Debug, Default)]
struct Script {
    reject: Option<String>,
    stall: Option<Duration>,
}

/// Broker that keeps deliveries in memory.
///
/// It can be told to reject every publish or to stall before accepting,
/// which is how broker outages and slow acknowledgements are reproduced.
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    deliveries: Mutex<Vec<Delivery>>,
    script: Mutex<Script>,
}

fn lock_err(context: &'static str) -> TransportError {
    TransportError::ConnectionFailed {
        message: format!("poisoned lock: {context}"),
    }
}

impl InMemoryBroker {
    /// Creates a broker that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every following publish with `reason`, or accepts again on `None`.
    pub fn reject_with(&self, reason: Option<&str>) -> Result<(), TransportError> {
        let mut script = self.script.lock().map_err(|_| lock_err("broker.reject_with"))?;
        script.reject = reason.map(str::to_string);
        Ok(())
    }

    /// Delays every following publish by `delay`, or stops delaying on `None`.
    pub fn stall_for(&self, delay: Option<Duration>) -> Result<(), TransportError> {
        let mut script = self.script.lock().map_err(|_| lock_err("broker.stall_for"))?;
        script.stall = delay;
        Ok(())
    }

    /// Snapshot of accepted deliveries, oldest first.
    pub fn deliveries(&self) -> Result<Vec<Delivery>, TransportError> {
        let deliveries = self.deliveries.lock().map_err(|_| lock_err("broker.deliveries"))?;
        Ok(deliveries.clone())
    }

    /// Number of accepted deliveries.
    pub fn len(&self) -> Result<usize, TransportError> {
        let deliveries = self.deliveries.lock().map_err(|_| lock_err("broker.len"))?;
        Ok(deliveries.len())
    }

    /// Returns true if nothing was accepted yet.
    pub fn is_empty(&self) -> Result<bool, TransportError> {
        Ok(self.len()? == 0)
    }
}

impl Broker for InMemoryBroker {
    fn publish(&self, topic: &str, payload: &[u8], qos: Qos) -> Result<(), TransportError> {
        let (reject, stall) = {
            let script = self.script.lock().map_err(|_| lock_err("broker.publish"))?;
            (script.reject.clone(), script.stall)
        };
        if let Some(delay) = stall {
            thread::sleep(delay);
        }
        if let Some(reason) = reject {
            return Err(TransportError::Rejected {
                topic: topic.to_string(),
                reason,
            });
        }

        let mut deliveries = self.deliveries.lock().map_err(|_| lock_err("broker.publish"))?;
        deliveries.push(Delivery {
            topic: topic.to_string(),
            payload: payload.to_vec(),
            qos,
        });
        Ok(())
    }
}

struct Job {
    topic: String,
    payload: Vec<u8>,
    qos: Qos,
    reply: Sender<Result<(), TransportError>>,
}

/// Handle returned by `Publisher::submit`.
#[derive(Debug)]
pub struct PublishHandle {
    rx: Receiver<Result<(), TransportError>>,
}

impl PublishHandle {
    /// Waits for the broker acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns the broker's error, or `Disconnected` if the worker went away.
    pub fn join(self) -> Result<(), TransportError> {
        self.rx.recv().map_err(|_| TransportError::Disconnected)?
    }

    /// Waits for the broker acknowledgement for at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no acknowledgement arrived in time.
    pub fn join_timeout(self, timeout: Duration) -> Result<(), TransportError> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            RecvTimeoutError::Timeout => TransportError::Timeout {
                duration_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RecvTimeoutError::Disconnected => TransportError::Disconnected,
        })?
    }
}

/// Bounded pool of publish workers in front of a `Broker`.
pub struct Publisher {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
    queue_capacity: usize,
    timeout: Duration,
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("workers", &self.workers.len())
            .field("queue_capacity", &self.queue_capacity)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Publisher {
    /// Starts `workers` publish threads over `broker`.
    ///
    /// # Errors
    ///
    /// Returns `NodeError::Internal` if a worker thread cannot be spawned.
    pub fn start(
        broker: Arc<dyn Broker>,
        workers: usize,
        queue_capacity: usize,
        timeout: Duration,
    ) -> NodeResult<Self> {
        let workers = workers.max(1);
        let queue_capacity = queue_capacity.max(1);
        let (tx, rx) = bounded::<Job>(queue_capacity);

        let mut handles = Vec::with_capacity(workers);
        for idx in 0..workers {
            let rx: Receiver<Job> = rx.clone();
            let broker = Arc::clone(&broker);
            let handle = thread::Builder::new()
                .name(format!("wis2node-publish-{idx}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        trace!("{PUBLISHER_TAG} worker {idx} publishing on {}", job.topic);
                        let result = broker.publish(&job.topic, &job.payload, job.qos);
                        let _ = job.reply.send(result);
                    }
                })
                .map_err(|e| NodeError::internal(format!("failed to spawn publish worker: {e}")))?;
            handles.push(handle);
        }
        debug!("{PUBLISHER_TAG} started {workers} workers (queue {queue_capacity}, timeout {timeout:?})");

        Ok(Self {
            tx: Some(tx),
            workers: handles,
            queue_capacity,
            timeout,
        })
    }

    /// Per-publish acknowledgement timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Queues a publish without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns `QueueFull` if the queue is at capacity, or `Disconnected`
    /// after shutdown.
    pub fn submit(&self, topic: &str, payload: Vec<u8>, qos: Qos) -> Result<PublishHandle, TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Disconnected)?;
        let (reply, rx) = bounded(1);
        let job = Job {
            topic: topic.to_string(),
            payload,
            qos,
            reply,
        };
        match tx.try_send(job) {
            Ok(()) => Ok(PublishHandle { rx }),
            Err(TrySendError::Full(_)) => Err(TransportError::QueueFull {
                capacity: self.queue_capacity,
            }),
            Err(TrySendError::Disconnected(_)) => Err(TransportError::Disconnected),
        }
    }

    /// Publishes at `AtLeastOnce` and waits up to the configured timeout.
    ///
    /// # Errors
    ///
    /// Propagates queueing, broker and timeout failures.
    pub fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        self.submit(topic, payload, Qos::AtLeastOnce)?
            .join_timeout(self.timeout)
    }

    /// Closes the queue, lets workers drain it and joins them.
    pub fn shutdown(mut self) {
        drop(self.tx.take());
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        // Workers exit once the queue drains; stalled ones are not waited for.
        drop(self.tx.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn broker() -> Arc<InMemoryBroker> {
        Arc::new(InMemoryBroker::new())
    }

    #[test]
    fn publish_reaches_broker() {
        let broker = broker();
        let publisher = Publisher::start(broker.clone(), 2, 8, Duration::from_secs(5)).unwrap();
        publisher.publish("origin/a/wis2/c/data", b"{}".to_vec()).unwrap();
        publisher.shutdown();

        let deliveries = broker.deliveries().unwrap();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].topic, "origin/a/wis2/c/data");
        assert_eq!(deliveries[0].qos, Qos::AtLeastOnce);
        assert_eq!(deliveries[0].qos.level(), 1);
    }

    #[test]
    fn rejection_is_reported() {
        let broker = broker();
        broker.reject_with(Some("not authorized")).unwrap();
        let publisher = Publisher::start(broker.clone(), 1, 8, Duration::from_secs(5)).unwrap();
        let err = publisher.publish("t", Vec::new()).unwrap_err();
        assert!(matches!(err, TransportError::Rejected { ref reason, .. } if reason == "not authorized"));
        assert!(broker.is_empty().unwrap());
    }

    #[test]
    fn stalled_broker_times_out() {
        let broker = broker();
        broker.stall_for(Some(Duration::from_millis(500))).unwrap();
        let publisher = Publisher::start(broker, 1, 8, Duration::from_millis(20)).unwrap();

        let started = Instant::now();
        let err = publisher.publish("t", Vec::new()).unwrap_err();
        assert!(matches!(err, TransportError::Timeout { duration_ms: 20 }));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[test]
    fn full_queue_is_reported() {
        let broker = broker();
        broker.stall_for(Some(Duration::from_millis(200))).unwrap();
        let publisher = Publisher::start(broker, 1, 1, Duration::from_secs(5)).unwrap();

        let mut results = Vec::new();
        for _ in 0..4 {
            results.push(publisher.submit("t", Vec::new(), Qos::AtLeastOnce));
        }
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(TransportError::QueueFull { capacity: 1 }))));
    }

    #[test]
    fn shutdown_drains_queue() {
        let broker = broker();
        let publisher = Publisher::start(broker.clone(), 2, 16, Duration::from_secs(5)).unwrap();
        let handles: Vec<_> = (0..10)
            .map(|i| publisher.submit(&format!("t/{i}"), Vec::new(), Qos::AtLeastOnce).unwrap())
            .collect();
        publisher.shutdown();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(broker.len().unwrap(), 10);
    }
}
