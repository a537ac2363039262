//! Wait-for-all-of-N join barrier for batched writes.

use std::future::Future;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Collects exactly one outcome per slot.
///
/// The first failure to arrive becomes the batch result; later outcomes are
/// still counted but otherwise discarded. A second arrival for the same slot,
/// or a slot that never arrives, is a [`StoreError::Barrier`].
pub struct WriteBarrier<T> {
    expected: usize,
    arrived: usize,
    slots: Vec<Option<T>>,
    seen: Vec<bool>,
    first_error: Option<StoreError>,
}

impl<T> WriteBarrier<T> {
    pub fn new(expected: usize) -> Self {
        Self {
            expected,
            arrived: 0,
            slots: (0..expected).map(|_| None).collect(),
            seen: vec![false; expected],
            first_error: None,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn arrived(&self) -> usize {
        self.arrived
    }

    pub fn is_complete(&self) -> bool {
        self.arrived == self.expected
    }

    /// Record the outcome of slot `slot`.
    pub fn arrive(&mut self, slot: usize, outcome: Result<T>) -> Result<()> {
        match self.seen.get_mut(slot) {
            None => {
                return Err(StoreError::Barrier(format!(
                    "completion for slot {slot} outside a batch of {}",
                    self.expected
                )));
            }
            Some(seen) if *seen => {
                return Err(StoreError::Barrier(format!(
                    "slot {slot} completed more than once"
                )));
            }
            Some(seen) => *seen = true,
        }
        self.arrived += 1;

        match outcome {
            Ok(value) => self.slots[slot] = Some(value),
            Err(e) if self.first_error.is_none() => {
                warn!(slot, error = %e, "Batch write failed; remaining writes continue unreported");
                self.first_error = Some(e);
            }
            Err(e) => debug!(slot, error = %e, "Discarding failure after the first"),
        }
        Ok(())
    }

    /// Resolve the batch. Slot order is preserved in the success value.
    pub fn finish(self) -> Result<Vec<T>> {
        if !self.is_complete() {
            return Err(StoreError::Barrier(format!(
                "{} of {} completions never arrived",
                self.expected - self.arrived,
                self.expected
            )));
        }
        if let Some(e) = self.first_error {
            return Err(e);
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}

/// Detaches its tasks instead of aborting them when dropped, so writes already
/// handed to CouchDB finish even if the caller stops waiting.
struct Detached<T: 'static>(JoinSet<T>);

impl<T: 'static> Drop for Detached<T> {
    fn drop(&mut self) {
        if !self.0.is_empty() {
            debug!(in_flight = self.0.len(), "Detaching unfinished batch writes");
        }
        self.0.detach_all();
    }
}

/// Run every future as its own task and resolve once all of them have finished.
///
/// Nothing is cancelled when one fails: the barrier waits the rest out. If the
/// returned future is dropped early, the writes keep running unobserved.
pub(crate) async fn join_all<T, F>(futures: Vec<F>) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Future<Output = Result<T>> + Send + 'static,
{
    let mut barrier = WriteBarrier::new(futures.len());
    let mut set = Detached(JoinSet::new());

    for (slot, fut) in futures.into_iter().enumerate() {
        set.0.spawn(async move { (slot, fut.await) });
    }

    while let Some(joined) = set.0.join_next().await {
        match joined {
            Ok((slot, outcome)) => barrier.arrive(slot, outcome)?,
            Err(e) => warn!(error = %e, "Batch write task did not complete"),
        }
    }

    barrier.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn resolves_in_slot_order() {
        let mut barrier = WriteBarrier::new(3);
        barrier.arrive(2, Ok("c")).unwrap();
        barrier.arrive(0, Ok("a")).unwrap();
        assert!(!barrier.is_complete());
        barrier.arrive(1, Ok("b")).unwrap();
        assert!(barrier.is_complete());
        assert_eq!(barrier.finish().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn first_error_wins() {
        let mut barrier: WriteBarrier<()> = WriteBarrier::new(3);
        barrier.arrive(1, Err(StoreError::Query("first".into()))).unwrap();
        barrier.arrive(0, Err(StoreError::Query("second".into()))).unwrap();
        barrier.arrive(2, Ok(())).unwrap();

        match barrier.finish() {
            Err(StoreError::Query(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn duplicate_completion_fails() {
        let mut barrier = WriteBarrier::new(2);
        barrier.arrive(0, Ok(1)).unwrap();
        let err = barrier.arrive(0, Ok(1)).unwrap_err();
        assert!(matches!(err, StoreError::Barrier(_)));
    }

    #[test]
    fn out_of_range_slot_fails() {
        let mut barrier = WriteBarrier::new(1);
        assert!(matches!(barrier.arrive(1, Ok(())), Err(StoreError::Barrier(_))));
    }

    #[test]
    fn missing_completion_fails() {
        let mut barrier = WriteBarrier::new(2);
        barrier.arrive(0, Ok(())).unwrap();
        assert_eq!(barrier.arrived(), 1);
        assert!(matches!(barrier.finish(), Err(StoreError::Barrier(_))));
    }

    #[test]
    fn empty_batch_is_complete() {
        let barrier: WriteBarrier<()> = WriteBarrier::new(0);
        assert!(barrier.is_complete());
        assert!(barrier.finish().unwrap().is_empty());
    }

    #[tokio::test]
    async fn join_all_waits_for_slow_siblings_after_failure() {
        let finished = Arc::new(AtomicUsize::new(0));

        let mut futures = Vec::new();
        for i in 0..4u64 {
            let finished = finished.clone();
            futures.push(async move {
                if i == 0 {
                    return Err(StoreError::Validation("boom".into()));
                }
                tokio::time::sleep(Duration::from_millis(10 * i)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok(i)
            });
        }

        let result = join_all(futures).await;
        assert!(matches!(result, Err(StoreError::Validation(_))));
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn join_all_writes_outlive_a_cancelled_caller() {
        let finished = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..3)
            .map(|_| {
                let finished = finished.clone();
                async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StoreError>(())
                }
            })
            .collect();

        let waited = tokio::time::timeout(Duration::from_millis(5), join_all(futures)).await;
        assert!(waited.is_err());
        assert_eq!(finished.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 3);
    }

    async fn write_ok() -> Result<u8> {
        Ok(1)
    }

    async fn write_panics() -> Result<u8> {
        panic!("write task blew up")
    }

    #[tokio::test]
    async fn join_all_reports_panicked_task_as_missing() {
        let futures: Vec<std::pin::Pin<Box<dyn Future<Output = Result<u8>> + Send>>> =
            vec![Box::pin(write_ok()), Box::pin(write_panics())];
        let result = join_all(futures).await;
        assert!(matches!(result, Err(StoreError::Barrier(_))));
    }
}
