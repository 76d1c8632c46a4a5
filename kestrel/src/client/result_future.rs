//! The handle a caller gets back from [`Session::execute`](super::Session::execute).
//!
//! A [`ResultFuture`] can be awaited, or waited on from a thread that is not running
//! an async runtime, with or without a deadline. Its result is handed out exactly once:
//! every way of obtaining it consumes the future, except a timed wait that expires,
//! which gives the future back.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::task::AtomicWaker;

use crate::errors::ExecutionError;
use crate::observability::history::RequestHistory;
use crate::response::QueryResult;

type RequestResult = Result<QueryResult, ExecutionError>;

enum Slot {
    Pending,
    Ready(RequestResult),
    Taken,
}

struct Shared {
    slot: Mutex<Slot>,
    history: Mutex<Option<RequestHistory>>,
    ready: Condvar,
    waker: AtomicWaker,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, result: RequestResult, history: Option<RequestHistory>) {
        // History first, so that it is visible as soon as the result is.
        *self.history.lock().unwrap_or_else(PoisonError::into_inner) = history;
        {
            let mut slot = self.slot();
            if !matches!(*slot, Slot::Pending) {
                return;
            }
            *slot = Slot::Ready(result);
        }
        self.ready.notify_all();
        self.waker.wake();
    }
}

fn take(slot: &mut Slot) -> RequestResult {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Ready(result) => result,
        Slot::Pending | Slot::Taken => panic!("ResultFuture result taken before it was ready"),
    }
}

/// The eventual result of a request.
///
/// ```
/// # use kestrel::client::Session;
/// # use std::error::Error;
/// # use std::time::Duration;
/// # fn check_only_compiles(session: &Session) -> Result<(), Box<dyn Error>> {
/// let future = session.execute("SELECT * FROM ks.tab");
/// match future.wait_timeout(Duration::from_secs(1)) {
///     Ok(result) => println!("{} rows", result?.rows().map_or(0, |rows| rows.len())),
///     Err(still_pending) => println!("not yet, ready: {}", still_pending.is_ready()),
/// }
/// # Ok(())
/// # }
/// ```
pub struct ResultFuture {
    shared: Arc<Shared>,
}

/// The completing side of a [`ResultFuture`]. Dropping it uncompleted fails the
/// request with [`ExecutionError::SessionClosed`].
pub(crate) struct ResultPromise {
    shared: Option<Arc<Shared>>,
}

impl ResultFuture {
    pub(crate) fn new() -> (ResultPromise, ResultFuture) {
        let shared = Arc::new(Shared {
            slot: Mutex::new(Slot::Pending),
            history: Mutex::new(None),
            ready: Condvar::new(),
            waker: AtomicWaker::new(),
        });
        (
            ResultPromise {
                shared: Some(shared.clone()),
            },
            ResultFuture { shared },
        )
    }

    /// A future that is already complete.
    pub(crate) fn ready(result: RequestResult) -> ResultFuture {
        let (promise, future) = ResultFuture::new();
        promise.complete(result, None);
        future
    }

    /// Whether the result is available, so that waiting for it would not block.
    pub fn is_ready(&self) -> bool {
        !matches!(*self.shared.slot(), Slot::Pending)
    }

    /// Blocks the current thread until the request completes.
    ///
    /// Must not be called from within an async runtime; `.await` the future there instead.
    pub fn wait(self) -> RequestResult {
        let mut slot = self.shared.slot();
        while matches!(*slot, Slot::Pending) {
            slot = self
                .shared
                .ready
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
        take(&mut slot)
    }

    /// Blocks the current thread until the request completes or `timeout` passes.
    /// On timeout the future is handed back, still pending.
    pub fn wait_timeout(self, timeout: Duration) -> Result<RequestResult, ResultFuture> {
        let ready = {
            let slot = self.shared.slot();
            let (mut slot, _) = self
                .shared
                .ready
                .wait_timeout_while(slot, timeout, |slot| matches!(slot, Slot::Pending))
                .unwrap_or_else(PoisonError::into_inner);
            match *slot {
                Slot::Pending => None,
                _ => Some(take(&mut slot)),
            }
        };
        ready.ok_or(self)
    }

    /// The history of the request: every attempt, the host it went to and its outcome.
    ///
    /// Available once the request completed, whether it succeeded or not. To read it after
    /// awaiting, await a mutable reference: `(&mut future).await`.
    pub fn history(&self) -> Option<RequestHistory> {
        self.shared
            .history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl std::fmt::Debug for ResultFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultFuture")
            .field("ready", &self.is_ready())
            .finish()
    }
}

impl Future for ResultFuture {
    type Output = RequestResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.shared.waker.register(cx.waker());
        let mut slot = self.shared.slot();
        match *slot {
            Slot::Pending => Poll::Pending,
            Slot::Ready(_) => Poll::Ready(take(&mut slot)),
            Slot::Taken => panic!("ResultFuture polled after completion"),
        }
    }
}

impl ResultPromise {
    pub(crate) fn complete(mut self, result: RequestResult, history: Option<RequestHistory>) {
        if let Some(shared) = self.shared.take() {
            shared.complete(result, history);
        }
    }
}

impl Drop for ResultPromise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(Err(ExecutionError::SessionClosed), None);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::ResultFuture;
    use crate::errors::ExecutionError;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn timed_wait_hands_the_future_back() {
        setup_tracing();
        let (promise, future) = ResultFuture::new();
        let future = future
            .wait_timeout(Duration::from_millis(10))
            .expect_err("nothing completed the future");
        assert!(!future.is_ready());

        let waiter = std::thread::spawn(move || future.wait());
        promise.complete(Err(ExecutionError::NoHostsAvailable), None);
        assert_matches!(waiter.join().unwrap(), Err(ExecutionError::NoHostsAvailable));
    }

    #[test]
    fn dropped_promise_fails_the_request() {
        setup_tracing();
        let (promise, future) = ResultFuture::new();
        drop(promise);
        assert!(future.is_ready());
        assert_matches!(future.wait(), Err(ExecutionError::SessionClosed));
    }

    #[tokio::test]
    async fn awaiting_by_reference_keeps_the_history_reachable() {
        setup_tracing();
        let (promise, mut future) = ResultFuture::new();
        let completer = tokio::spawn(async move {
            promise.complete(Err(ExecutionError::NoHostsAvailable), None);
        });
        assert_matches!((&mut future).await, Err(ExecutionError::NoHostsAvailable));
        assert!(future.history().is_none());
        completer.await.unwrap();
    }

    #[test]
    fn ready_future_completes_at_once() {
        setup_tracing();
        let future = ResultFuture::ready(Err(ExecutionError::SessionClosed));
        assert_matches!(
            future.wait_timeout(Duration::ZERO),
            Ok(Err(ExecutionError::SessionClosed))
        );
    }
}
