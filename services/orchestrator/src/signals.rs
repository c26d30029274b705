//! Asynchronous readiness and utilization signals.
//!
//! The substrate pushes signals through a bounded channel with `try_send`;
//! controllers pump the inbox with `try_recv` at the start of each pass.
//! Neither side ever waits on the other, so late or missing data degrades
//! a decision instead of stalling a loop.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use ork_id::InstanceId;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignalError {
    /// The inbox is full; the sample is dropped and the next one wins.
    #[error("signal queue full")]
    Backpressure,

    #[error("signal inbox closed")]
    Closed,
}

/// Readiness report for one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadinessSignal {
    pub instance_id: InstanceId,
    pub ready: bool,
    pub reason: Option<String>,
    pub at: Instant,
}

/// One CPU utilization observation, as a ratio of the instance's request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationSample {
    pub instance_id: InstanceId,
    pub cpu_utilization_ratio: f64,
    pub at: Instant,
}

impl UtilizationSample {
    pub fn new(instance_id: InstanceId, cpu_utilization_ratio: f64) -> Self {
        Self::at(instance_id, cpu_utilization_ratio, Instant::now())
    }

    pub fn at(instance_id: InstanceId, cpu_utilization_ratio: f64, at: Instant) -> Self {
        Self {
            instance_id,
            cpu_utilization_ratio,
            at,
        }
    }

    fn is_valid(&self) -> bool {
        self.cpu_utilization_ratio.is_finite() && self.cpu_utilization_ratio >= 0.0
    }
}

#[derive(Debug, Clone)]
pub enum Signal {
    Readiness(ReadinessSignal),
    Utilization(UtilizationSample),
}

/// Producer side, handed to the substrate.
#[derive(Debug, Clone)]
pub struct SignalSender {
    tx: mpsc::Sender<Signal>,
}

impl SignalSender {
    pub fn send(&self, signal: Signal) -> Result<(), SignalError> {
        self.tx.try_send(signal).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SignalError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => SignalError::Closed,
        })
    }

    pub fn ready(&self, instance_id: InstanceId) -> Result<(), SignalError> {
        self.send(Signal::Readiness(ReadinessSignal {
            instance_id,
            ready: true,
            reason: None,
            at: Instant::now(),
        }))
    }

    pub fn not_ready(&self, instance_id: InstanceId, reason: impl Into<String>) -> Result<(), SignalError> {
        self.send(Signal::Readiness(ReadinessSignal {
            instance_id,
            ready: false,
            reason: Some(reason.into()),
            at: Instant::now(),
        }))
    }

    pub fn utilization(&self, sample: UtilizationSample) -> Result<(), SignalError> {
        self.send(Signal::Utilization(sample))
    }
}

/// Result of averaging utilization over a set of instances.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationObservation {
    /// Mean utilization over contributing instances; `None` if none had data.
    pub mean: Option<f64>,
    pub contributing: usize,
    /// Instances skipped for missing or stale samples.
    pub excluded: usize,
}

/// Consumer side, shared by all controllers.
#[derive(Debug)]
pub struct SignalInbox {
    rx: Mutex<mpsc::Receiver<Signal>>,
    readiness: Mutex<HashMap<InstanceId, ReadinessSignal>>,
    samples: Mutex<HashMap<InstanceId, VecDeque<UtilizationSample>>>,
    retention: Duration,
}

/// Create a signal channel. `retention` bounds how long samples are kept.
pub fn channel(capacity: usize, retention: Duration) -> (SignalSender, SignalInbox) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        SignalSender { tx },
        SignalInbox {
            rx: Mutex::new(rx),
            readiness: Mutex::new(HashMap::new()),
            samples: Mutex::new(HashMap::new()),
            retention,
        },
    )
}

impl SignalInbox {
    /// Move everything queued so far into the per-instance stores.
    ///
    /// Never waits for new signals. Returns the number of signals moved.
    /// Readiness reports and samples older than the retention period are
    /// dropped, which also bounds reports for instances nobody tracks.
    pub async fn pump(&self) -> usize {
        let mut drained = Vec::new();
        {
            let mut rx = self.rx.lock().await;
            while let Ok(signal) = rx.try_recv() {
                drained.push(signal);
            }
        }
        let count = drained.len();

        let mut readiness = self.readiness.lock().await;
        let mut samples = self.samples.lock().await;
        for signal in drained {
            match signal {
                Signal::Readiness(r) => {
                    trace!(instance_id = %r.instance_id, ready = r.ready, "Readiness signal");
                    // Latest report wins.
                    readiness.insert(r.instance_id, r);
                }
                Signal::Utilization(s) => {
                    samples.entry(s.instance_id).or_default().push_back(s);
                }
            }
        }

        let now = Instant::now();
        readiness.retain(|_, r| now.saturating_duration_since(r.at) <= self.retention);
        for window in samples.values_mut() {
            while window
                .front()
                .is_some_and(|s| now.saturating_duration_since(s.at) > self.retention)
            {
                window.pop_front();
            }
        }
        samples.retain(|_, w| !w.is_empty());

        if count > 0 {
            debug!(count, "Pumped signals");
        }
        count
    }

    /// Take the latest readiness report for an instance, if any.
    pub async fn take_readiness(&self, instance_id: &InstanceId) -> Option<ReadinessSignal> {
        self.readiness.lock().await.remove(instance_id)
    }

    /// Drop all state for an instance that no longer exists.
    pub async fn forget(&self, instance_id: &InstanceId) {
        self.readiness.lock().await.remove(instance_id);
        self.samples.lock().await.remove(instance_id);
    }

    /// Mean utilization across `instances` over the trailing `window`.
    ///
    /// Each instance contributes the mean of its valid samples inside the
    /// window. An instance whose newest sample is older than `stale_after`,
    /// or that has no valid sample, is excluded rather than counted as zero.
    pub async fn utilization(
        &self,
        instances: &[InstanceId],
        now: Instant,
        window: Duration,
        stale_after: Duration,
    ) -> UtilizationObservation {
        let samples = self.samples.lock().await;

        let mut total = 0.0;
        let mut contributing = 0;
        for id in instances {
            let Some(series) = samples.get(id) else {
                continue;
            };

            let fresh = series
                .back()
                .is_some_and(|s| now.saturating_duration_since(s.at) <= stale_after);
            if !fresh {
                continue;
            }

            let (sum, n) = series
                .iter()
                .filter(|s| s.is_valid() && now.saturating_duration_since(s.at) <= window)
                .fold((0.0, 0usize), |(sum, n), s| (sum + s.cpu_utilization_ratio, n + 1));
            if n == 0 {
                continue;
            }

            total += sum / n as f64;
            contributing += 1;
        }

        UtilizationObservation {
            mean: (contributing > 0).then(|| total / contributing as f64),
            contributing,
            excluded: instances.len() - contributing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_readiness_wins() {
        let (tx, inbox) = channel(16, Duration::from_secs(60));
        let id = InstanceId::new();

        tx.not_ready(id, "booting").unwrap();
        tx.ready(id).unwrap();
        assert_eq!(inbox.pump().await, 2);

        let signal = inbox.take_readiness(&id).await.unwrap();
        assert!(signal.ready);
        assert!(inbox.take_readiness(&id).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_readiness_for_forgotten_instance_expires() {
        let (tx, inbox) = channel(16, Duration::from_secs(60));
        let evicted = InstanceId::new();
        let live = InstanceId::new();

        inbox.forget(&evicted).await;
        tx.ready(evicted).unwrap();
        assert_eq!(inbox.pump().await, 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        tx.ready(live).unwrap();
        inbox.pump().await;
        assert!(inbox.take_readiness(&evicted).await.is_none());
        assert!(inbox.take_readiness(&live).await.is_some());

        // An idle pump still prunes.
        tx.ready(evicted).unwrap();
        inbox.pump().await;
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(inbox.pump().await, 0);
        assert!(inbox.readiness.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_full_queue_reports_backpressure() {
        let (tx, inbox) = channel(1, Duration::from_secs(60));
        let id = InstanceId::new();

        tx.ready(id).unwrap();
        assert_eq!(tx.ready(id), Err(SignalError::Backpressure));

        drop(inbox);
        assert_eq!(tx.ready(id), Err(SignalError::Closed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_instances_are_excluded() {
        let (tx, inbox) = channel(64, Duration::from_secs(120));
        let fresh = InstanceId::new();
        let stale = InstanceId::new();
        let silent = InstanceId::new();

        tx.utilization(UtilizationSample::new(stale, 5.0)).unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;
        tx.utilization(UtilizationSample::new(fresh, 0.5)).unwrap();
        tx.utilization(UtilizationSample::new(fresh, 0.7)).unwrap();
        inbox.pump().await;

        let obs = inbox
            .utilization(
                &[fresh, stale, silent],
                Instant::now(),
                Duration::from_secs(60),
                Duration::from_secs(30),
            )
            .await;

        assert_eq!(obs.contributing, 1);
        assert_eq!(obs.excluded, 2);
        assert!((obs.mean.unwrap() - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_invalid_samples_never_contribute() {
        let (tx, inbox) = channel(8, Duration::from_secs(60));
        let id = InstanceId::new();

        tx.utilization(UtilizationSample::new(id, f64::NAN)).unwrap();
        inbox.pump().await;

        let obs = inbox
            .utilization(&[id], Instant::now(), Duration::from_secs(60), Duration::from_secs(30))
            .await;
        assert_eq!(obs.mean, None);
        assert_eq!(obs.excluded, 1);
    }
}
