//! Timeout and cancellation plumbing shared by every create and close
//! operation

use std::{
    future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    engine::{EventName, RawEndpoint, RawEventContext},
    error::{CancellationError, Error, OperationTimeoutError},
};

/// Cancellation signal accepted by every awaitable operation.
///
/// The operation observes the signal until it settles. Cancelling a create
/// operation only guarantees local settlement and a best effort close; the
/// remote peer may still have observed the open, begin or attach.
pub type AbortSignal = CancellationToken;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);

/// Generates a process wide unique identifier such as `sender-3`
pub(crate) fn generate_id(prefix: &str) -> String {
    format!("{}-{}", prefix, NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

/* -------------------------------------------------------------------------- */
/*                             Pending operations                             */
/* -------------------------------------------------------------------------- */

/// Number of create and close operations in flight on one entity
#[derive(Debug, Clone)]
pub(crate) struct PendingOperations {
    count: Arc<watch::Sender<usize>>,
}

impl Default for PendingOperations {
    fn default() -> Self {
        let (count, _) = watch::channel(0);
        Self {
            count: Arc::new(count),
        }
    }
}

impl PendingOperations {
    pub fn count(&self) -> usize {
        *self.count.borrow()
    }

    /// Identifies the entity the counter belongs to
    pub fn key(&self) -> usize {
        Arc::as_ptr(&self.count) as usize
    }

    /// Increments the counter until the returned guard is dropped
    pub fn begin(&self) -> PendingGuard {
        self.count.send_modify(|count| *count += 1);
        PendingGuard {
            pending: self.clone(),
        }
    }

    /// Completes once the counter is back to zero
    pub async fn settled(&self) {
        let mut rx = self.count.subscribe();
        // The sender is alive as long as `self` is
        let _ = rx.wait_for(|count| *count == 0).await;
    }
}

#[derive(Debug)]
pub(crate) struct PendingGuard {
    pending: PendingOperations,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending
            .count
            .send_modify(|count| *count = count.saturating_sub(1));
    }
}

/* -------------------------------------------------------------------------- */
/*                                 Settlement                                 */
/* -------------------------------------------------------------------------- */

/// The settling half of a one-shot outcome that can be shared by several
/// listeners. Only the first call to `settle` has any effect.
#[derive(Debug)]
pub(crate) struct Settlement<T> {
    slot: Arc<Mutex<Option<oneshot::Sender<T>>>>,
}

impl<T> Clone for Settlement<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Settlement<T> {
    pub fn new() -> (Self, oneshot::Receiver<T>) {
        let (tx, rx) = oneshot::channel();
        let settlement = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (settlement, rx)
    }

    /// Returns `false` if the outcome was already settled
    pub fn settle(&self, value: T) -> bool {
        match self.slot.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => false,
        }
    }
}

/* -------------------------------------------------------------------------- */
/*                             Transient listeners                            */
/* -------------------------------------------------------------------------- */

type Remover = Box<dyn FnOnce() + Send>;

/// Listeners registered on engine objects for the lifetime of one operation.
///
/// They are removed on [`clear`](TransientListeners::clear) or on drop, so a
/// dropped operation future never leaves a listener behind.
#[derive(Default)]
pub(crate) struct TransientListeners {
    removers: Vec<Remover>,
}

impl std::fmt::Debug for TransientListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransientListeners")
            .field("len", &self.removers.len())
            .finish()
    }
}

impl TransientListeners {
    pub fn on<O, F>(&mut self, owner: &Arc<O>, name: EventName, listener: F)
    where
        O: RawEndpoint + ?Sized + 'static,
        F: Fn(&RawEventContext) + Send + Sync + 'static,
    {
        let id = owner.events().on(name, listener);
        let owner = Arc::clone(owner);
        self.removers.push(Box::new(move || {
            owner.events().remove_listener(id);
        }));
    }

    pub fn once<O, F>(&mut self, owner: &Arc<O>, name: EventName, listener: F)
    where
        O: RawEndpoint + ?Sized + 'static,
        F: Fn(&RawEventContext) + Send + Sync + 'static,
    {
        let id = owner.events().once(name, listener);
        let owner = Arc::clone(owner);
        self.removers.push(Box::new(move || {
            owner.events().remove_listener(id);
        }));
    }

    pub fn clear(&mut self) {
        for remove in self.removers.drain(..) {
            remove();
        }
    }
}

impl Drop for TransientListeners {
    fn drop(&mut self) {
        self.clear()
    }
}

/* -------------------------------------------------------------------------- */
/*                                  Waiting                                   */
/* -------------------------------------------------------------------------- */

/// Why an operation stopped waiting without being settled by an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interrupted {
    Timeout,
    Cancelled,
    /// Every settling listener was dropped
    Abandoned,
}

pub(crate) async fn cancelled(abort: Option<&AbortSignal>) {
    match abort {
        Some(signal) => signal.cancelled().await,
        None => future::pending::<()>().await,
    }
}

/// Waits for `outcome`, racing it against the timeout and the abort signal.
/// A settled outcome wins over a timer or signal that fires in the same poll.
pub(crate) async fn wait_for_settlement<T>(
    outcome: oneshot::Receiver<T>,
    timeout: Duration,
    abort: Option<&AbortSignal>,
) -> Result<T, Interrupted> {
    tokio::select! {
        biased;
        result = outcome => result.map_err(|_| Interrupted::Abandoned),
        _ = cancelled(abort) => Err(Interrupted::Cancelled),
        _ = tokio::time::sleep(timeout) => Err(Interrupted::Timeout),
    }
}

/// Fails with a [`CancellationError`] if `abort` has already fired
pub(crate) fn check_aborted(abort: Option<&AbortSignal>, action: &str) -> Result<(), Error> {
    match abort {
        Some(signal) if signal.is_cancelled() => Err(CancellationError {
            action: action.to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

/// The error a close event carries, or [`Error::Closed`] if the peer closed
/// without one
pub(crate) fn rejection(context: &RawEventContext, what: &str) -> Error {
    match &context.error {
        Some(error) => error.clone().into(),
        None => Error::Closed(format!("The {} was closed by the peer", what)),
    }
}

pub(crate) fn disconnected(context: &RawEventContext) -> Error {
    match &context.error {
        Some(error) => error.clone().into(),
        None => Error::Disconnected("The transport was lost".to_string()),
    }
}

/* -------------------------------------------------------------------------- */
/*                                 Operation                                  */
/* -------------------------------------------------------------------------- */

/// One awaited transition: the transient listeners that settle it, bounded
/// by a timeout and an optional abort signal. Create and close operations
/// are counted on the entity's pending operations while they run.
#[derive(Debug)]
pub(crate) struct Operation {
    action: String,
    timeout: Duration,
    abort: Option<AbortSignal>,
    pending: Option<PendingOperations>,
    listeners: TransientListeners,
    settlement: Settlement<Result<(), Error>>,
    outcome: oneshot::Receiver<Result<(), Error>>,
}

impl Operation {
    pub fn new(
        action: String,
        timeout: Duration,
        abort: Option<&AbortSignal>,
        pending: &PendingOperations,
    ) -> Self {
        let mut op = Self::uncounted(action, timeout, abort);
        op.pending = Some(pending.clone());
        op
    }

    /// An operation that does not hold back the entity's error events, such
    /// as a drain
    pub fn uncounted(action: String, timeout: Duration, abort: Option<&AbortSignal>) -> Self {
        let (settlement, outcome) = Settlement::new();
        Self {
            action,
            timeout,
            abort: abort.cloned(),
            pending: None,
            listeners: TransientListeners::default(),
            settlement,
            outcome,
        }
    }

    pub fn resolve_on<O>(&mut self, owner: &Arc<O>, name: EventName)
    where
        O: RawEndpoint + ?Sized + 'static,
    {
        let settlement = self.settlement.clone();
        self.listeners.once(owner, name, move |_| {
            settlement.settle(Ok(()));
        });
    }

    pub fn reject_on<O, F>(&mut self, owner: &Arc<O>, name: EventName, to_error: F)
    where
        O: RawEndpoint + ?Sized + 'static,
        F: Fn(&RawEventContext) -> Error + Send + Sync + 'static,
    {
        let settlement = self.settlement.clone();
        self.listeners.once(owner, name, move |context| {
            settlement.settle(Err(to_error(context)));
        });
    }

    /// Issues the protocol call and waits for the first outcome.
    ///
    /// The transient listeners are removed before the pending counter goes
    /// back down, whichever outcome fires.
    pub async fn run(self, issue: impl FnOnce()) -> Result<(), Error> {
        let Self {
            action,
            timeout,
            abort,
            pending,
            mut listeners,
            settlement,
            outcome,
        } = self;
        check_aborted(abort.as_ref(), &action)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(action = %action, "starting");
        #[cfg(feature = "log")]
        log::debug!("starting to {}", action);

        let guard = pending.as_ref().map(PendingOperations::begin);
        issue();
        let result = wait_for_settlement(outcome, timeout, abort.as_ref()).await;
        listeners.clear();
        drop(settlement);
        drop(guard);

        match result {
            Ok(result) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(action = %action, ok = result.is_ok(), "settled");
                #[cfg(feature = "log")]
                log::debug!("settled the operation to {}: {:?}", action, result);
                result
            }
            Err(Interrupted::Timeout) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(action = %action, ?timeout, "operation timed out");
                #[cfg(feature = "log")]
                log::warn!("unable to {} within {:?}", action, timeout);
                Err(OperationTimeoutError { action, timeout }.into())
            }
            Err(Interrupted::Cancelled) => {
                #[cfg(feature = "tracing")]
                tracing::debug!(action = %action, "operation cancelled");
                #[cfg(feature = "log")]
                log::debug!("the operation to {} was cancelled", action);
                Err(CancellationError { action }.into())
            }
            Err(Interrupted::Abandoned) => Err(Error::Closed(format!(
                "Unable to {}: the operation was abandoned",
                action
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::{
        check_aborted, wait_for_settlement, AbortSignal, Interrupted, PendingOperations,
        Settlement,
    };

    #[test]
    fn guard_decrements_exactly_once() {
        let pending = PendingOperations::default();
        let first = pending.begin();
        let second = pending.begin();
        assert_eq!(pending.count(), 2);
        drop(first);
        assert_eq!(pending.count(), 1);
        drop(second);
        assert_eq!(pending.count(), 0);
    }

    #[test]
    fn only_first_settlement_counts() {
        let (settlement, mut rx) = Settlement::new();
        let other = settlement.clone();
        assert!(settlement.settle(1));
        assert!(!other.settle(2));
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn aborted_signal_is_checked_up_front() {
        let signal = AbortSignal::new();
        assert_ok!(check_aborted(Some(&signal), "open the connection 'c'"));
        signal.cancel();
        let err = assert_err!(check_aborted(Some(&signal), "open the connection 'c'"));
        assert!(err.is_cancelled());
        assert_ok!(check_aborted(None, "open the connection 'c'"));
    }

    #[tokio::test]
    async fn settled_waits_for_zero() {
        let pending = PendingOperations::default();
        let guard = pending.begin();
        let waiter = tokio::spawn({
            let pending = pending.clone();
            async move { pending.settled().await }
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(guard);
        assert_ok!(waiter.await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out() {
        let (_settlement, rx) = Settlement::<()>::new();
        let result = wait_for_settlement(rx, Duration::from_secs(5), None).await;
        assert_eq!(result, Err(Interrupted::Timeout));
    }

    #[tokio::test]
    async fn wait_is_cancelled() {
        let (_settlement, rx) = Settlement::<()>::new();
        let signal = AbortSignal::new();
        signal.cancel();
        let result = wait_for_settlement(rx, Duration::from_secs(5), Some(&signal)).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn settled_outcome_wins_over_cancelled_signal() {
        let (settlement, rx) = Settlement::new();
        let signal = AbortSignal::new();
        settlement.settle(7);
        signal.cancel();
        let result = wait_for_settlement(rx, Duration::from_secs(5), Some(&signal)).await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn dropped_settlement_abandons() {
        let (settlement, rx) = Settlement::<()>::new();
        drop(settlement);
        let result = wait_for_settlement(rx, Duration::from_secs(5), None).await;
        assert_eq!(result, Err(Interrupted::Abandoned));
    }
}
