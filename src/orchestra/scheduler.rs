use std::{error::Error, fmt, sync::Arc};

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// Resolution of every resource dimension, in thousandths of a unit.
const MILLIS: f64 = 1000.0;

/// An amount of compute per resource dimension.
///
/// Fractions are allowed, e.g. `num_gpus: 0.2` lets five tasks share one accelerator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    pub num_cpus: f64,
    #[serde(default)]
    pub num_gpus: f64,
}

impl Resources {
    pub fn new(num_cpus: f64, num_gpus: f64) -> Self {
        Self { num_cpus, num_gpus }
    }

    /// CPU-only resources.
    pub fn cpus(num_cpus: f64) -> Self {
        Self::new(num_cpus, 0.0)
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{cpus: {}, gpus: {}}}", self.num_cpus, self.num_gpus)
    }
}

/// Fixed point amounts, so repeated leases never drift.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Units {
    cpus: u64,
    gpus: u64,
}

impl Units {
    fn from_resources(res: Resources) -> Result<Self, SchedulerError> {
        let convert = |what: &'static str, amount: f64| {
            if !amount.is_finite() || amount < 0.0 {
                return Err(SchedulerError::InvalidAmount { what, amount });
            }
            Ok((amount * MILLIS).round() as u64)
        };

        Ok(Self {
            cpus: convert("num_cpus", res.num_cpus)?,
            gpus: convert("num_gpus", res.num_gpus)?,
        })
    }

    fn to_resources(self) -> Resources {
        Resources::new(self.cpus as f64 / MILLIS, self.gpus as f64 / MILLIS)
    }

    fn fits_within(self, other: Units) -> bool {
        self.cpus <= other.cpus && self.gpus <= other.gpus
    }

    fn plus(self, other: Units) -> Units {
        Units {
            cpus: self.cpus.saturating_add(other.cpus),
            gpus: self.gpus.saturating_add(other.gpus),
        }
    }

    fn minus(self, other: Units) -> Units {
        Units {
            cpus: self.cpus.saturating_sub(other.cpus),
            gpus: self.gpus.saturating_sub(other.gpus),
        }
    }
}

/// Reasons the scheduler refuses a request.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// Negative or non-finite amount.
    InvalidAmount { what: &'static str, amount: f64 },
    /// The request is larger than the whole pool and would wait forever.
    ExceedsCapacity {
        requested: Resources,
        capacity: Resources,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::InvalidAmount { what, amount } => {
                write!(f, "invalid resource amount {what}={amount}")
            }
            SchedulerError::ExceedsCapacity {
                requested,
                capacity,
            } => write!(f, "request {requested} exceeds the pool capacity {capacity}"),
        }
    }
}

impl Error for SchedulerError {}

/// Admits tasks against a finite pool of compute.
///
/// `admit` suspends the caller until the request fits next to everything currently
/// leased, in every dimension, then reserves it atomically.
#[derive(Debug)]
pub struct ResourceScheduler {
    capacity: Units,
    leased: Mutex<Units>,
    released: Notify,
}

impl ResourceScheduler {
    /// Creates a new `ResourceScheduler`.
    ///
    /// # Arguments
    /// * `capacity` - The total pool, per dimension.
    ///
    /// # Errors
    /// `InvalidAmount` if some dimension is negative or not finite.
    pub fn new(capacity: Resources) -> Result<Arc<Self>, SchedulerError> {
        Ok(Arc::new(Self {
            capacity: Units::from_resources(capacity)?,
            leased: Mutex::new(Units::default()),
            released: Notify::new(),
        }))
    }

    pub fn capacity(&self) -> Resources {
        self.capacity.to_resources()
    }

    /// The sum of every outstanding lease.
    pub fn leased(&self) -> Resources {
        self.leased.lock().to_resources()
    }

    /// Validates that `requested` can ever be admitted.
    pub fn check(&self, requested: Resources) -> Result<(), SchedulerError> {
        self.units_for(requested).map(|_| ())
    }

    fn units_for(&self, requested: Resources) -> Result<Units, SchedulerError> {
        let units = Units::from_resources(requested)?;
        if !units.fits_within(self.capacity) {
            return Err(SchedulerError::ExceedsCapacity {
                requested,
                capacity: self.capacity(),
            });
        }
        Ok(units)
    }

    /// Reserves `requested` if it currently fits, without waiting.
    ///
    /// # Errors
    /// Same as `admit`.
    pub fn try_admit(
        self: &Arc<Self>,
        requested: Resources,
    ) -> Result<Option<Lease>, SchedulerError> {
        let units = self.units_for(requested)?;
        Ok(self.reserve(units))
    }

    /// Waits until `requested` fits in the pool and reserves it.
    ///
    /// # Returns
    /// A `Lease` that gives the units back when released or dropped.
    ///
    /// # Errors
    /// `InvalidAmount` or `ExceedsCapacity`, immediately, for requests that could
    /// never be admitted.
    pub async fn admit(self: &Arc<Self>, requested: Resources) -> Result<Lease, SchedulerError> {
        let units = self.units_for(requested)?;

        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(lease) = self.reserve(units) {
                return Ok(lease);
            }

            debug!("admission of {requested} waiting for a release");
            released.await;
        }
    }

    /// Gives a lease's units back to the pool.
    pub fn release(&self, lease: Lease) {
        drop(lease);
    }

    fn reserve(self: &Arc<Self>, units: Units) -> Option<Lease> {
        let mut leased = self.leased.lock();
        let next = leased.plus(units);
        if !next.fits_within(self.capacity) {
            return None;
        }

        *leased = next;
        Some(Lease {
            scheduler: Arc::clone(self),
            units,
        })
    }

    fn give_back(&self, units: Units) {
        {
            let mut leased = self.leased.lock();
            *leased = leased.minus(units);
        }
        self.released.notify_waiters();
    }
}

/// Units reserved from a `ResourceScheduler`, returned on drop.
#[derive(Debug)]
pub struct Lease {
    scheduler: Arc<ResourceScheduler>,
    units: Units,
}

impl Lease {
    pub fn resources(&self) -> Resources {
        self.units.to_resources()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.scheduler.give_back(self.units);
    }
}

#[cfg(test)]
mod tests {
    use tokio_test::{assert_pending, assert_ready_ok, task};

    use super::*;

    #[test]
    fn rejects_requests_larger_than_the_pool() {
        let scheduler = ResourceScheduler::new(Resources::new(4.0, 1.0)).unwrap();

        let err = scheduler.try_admit(Resources::new(1.0, 1.5)).unwrap_err();
        assert!(matches!(err, SchedulerError::ExceedsCapacity { .. }));

        let err = scheduler.check(Resources::cpus(-1.0)).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidAmount { what: "num_cpus", .. }));
    }

    #[test]
    fn fractional_gpus_share_one_device() {
        let scheduler = ResourceScheduler::new(Resources::new(100.0, 1.0)).unwrap();
        let request = Resources::new(1.0, 0.2);

        let leases: Vec<_> = (0..5)
            .map(|_| scheduler.try_admit(request).unwrap().unwrap())
            .collect();

        assert!(scheduler.try_admit(request).unwrap().is_none());
        assert_eq!(scheduler.leased(), Resources::new(5.0, 1.0));

        drop(leases);
        assert_eq!(scheduler.leased(), Resources::default());
    }

    #[test]
    fn huge_pools_saturate_instead_of_overflowing() {
        let scheduler = ResourceScheduler::new(Resources::cpus(1e30)).unwrap();

        let first = scheduler.try_admit(Resources::cpus(1e30)).unwrap();
        assert!(first.is_some());

        assert!(scheduler.try_admit(Resources::cpus(1.0)).is_ok());
    }

    #[test]
    fn admit_waits_for_a_release() {
        let scheduler = ResourceScheduler::new(Resources::cpus(4.0)).unwrap();
        let first = scheduler.try_admit(Resources::cpus(2.0)).unwrap().unwrap();
        let _second = scheduler.try_admit(Resources::cpus(2.0)).unwrap().unwrap();

        let mut waiting = task::spawn(scheduler.admit(Resources::cpus(2.0)));
        assert_pending!(waiting.poll());

        scheduler.release(first);
        assert!(waiting.is_woken());

        let lease = assert_ready_ok!(waiting.poll());
        assert_eq!(lease.resources(), Resources::cpus(2.0));
        assert_eq!(scheduler.leased(), Resources::cpus(4.0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrency_never_exceeds_capacity() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::time::Duration;

        let scheduler = ResourceScheduler::new(Resources::cpus(6.0)).unwrap();
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let scheduler = Arc::clone(&scheduler);
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _lease = scheduler.admit(Resources::cpus(2.0)).await.unwrap();
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for t in futures::future::join_all(tasks).await {
            t.unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(scheduler.leased(), Resources::default());
    }
}
