//! Reactors are single-threaded event loops. Every socket, timer and
//! connection router of the driver lives on one of them.
//!
//! A [`Reactor`] owns a dedicated OS thread running a current-thread tokio
//! runtime. Other threads hand work to it with [`Reactor::add`], which is
//! the only cross-thread entry point. A [`ReactorGroup`] is a fixed ring of
//! reactors that hands out work round-robin; a connection stays on the
//! reactor it was opened on for its whole life.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, trace, warn};

use crate::errors::ReactorError;

type ReactorTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

// How long `close_handles` lets live tasks wind down before calling them leaked.
const CLOSE_DRAIN_ITERATIONS: usize = 100;
const CLOSE_DRAIN_STEP: Duration = Duration::from_millis(10);

enum ReactorMessage {
    Task(ReactorTask),
    Close,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub(crate) struct Reactor {
    index: usize,
    sender: mpsc::UnboundedSender<ReactorMessage>,
    // Taken by `run()`.
    receiver: Mutex<Option<mpsc::UnboundedReceiver<ReactorMessage>>>,
    live_tasks: Arc<AtomicUsize>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub(crate) fn new(index: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Reactor {
            index,
            sender,
            receiver: Mutex::new(Some(receiver)),
            live_tasks: Arc::new(AtomicUsize::new(0)),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    /// Starts the event loop on a new thread. Returns once the thread is spawned.
    pub(crate) fn run(&self) -> Result<(), ReactorError> {
        let receiver = lock(&self.receiver)
            .take()
            .ok_or(ReactorError::Closed(self.index))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| ReactorError::Spawn(Arc::new(err)))?;

        let index = self.index;
        let live_tasks = self.live_tasks.clone();
        let handle = std::thread::Builder::new()
            .name(format!("kestrel-reactor-{}", index))
            .spawn(move || runtime.block_on(event_loop(index, receiver, live_tasks)))
            .map_err(|err| ReactorError::Spawn(Arc::new(err)))?;

        *lock(&self.thread) = Some(handle);
        debug!("Reactor {} started", index);
        Ok(())
    }

    /// Enqueues a task to run on this reactor's thread.
    ///
    /// Tasks added from one thread start in the order they were added.
    /// Tasks added before [`run`](Self::run) wait in the queue.
    pub(crate) fn add<F>(&self, task: F) -> Result<(), ReactorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.sender
            .send(ReactorMessage::Task(Box::pin(task)))
            .map_err(|_| ReactorError::Closed(self.index))
    }

    /// Runs `fut` on this reactor and hands its output back to the caller.
    pub(crate) fn spawn<F, T>(
        &self,
        fut: F,
    ) -> impl Future<Output = Result<T, ReactorError>> + Send + 'static
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let index = self.index;
        let (result_sender, result_receiver) = oneshot::channel();
        let added = self.add(async move {
            let _ = result_sender.send(fut.await);
        });

        async move {
            added?;
            result_receiver
                .await
                .map_err(|_| ReactorError::Closed(index))
        }
    }

    /// Asks the event loop to stop. Tasks queued before this call still get started,
    /// then the loop waits a bounded time for live tasks to finish.
    pub(crate) fn close_handles(&self) {
        trace!("Closing reactor {}", self.index);
        let _ = self.sender.send(ReactorMessage::Close);
    }

    /// Blocks until the reactor thread exits. Must not be called from the reactor itself.
    pub(crate) fn join(&self) -> Result<(), ReactorError> {
        let handle = match lock(&self.thread).take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        if handle.thread().id() == std::thread::current().id() {
            warn!(
                "Reactor {} asked to join itself; leaving the thread detached",
                self.index
            );
            return Ok(());
        }

        handle
            .join()
            .map_err(|_| ReactorError::Panicked(self.index))?;
        debug!("Reactor {} joined", self.index);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn live_tasks(&self) -> usize {
        self.live_tasks.load(Ordering::Acquire)
    }
}

// Decrements the live task counter when the task completes or is dropped.
struct LiveTaskGuard(Arc<AtomicUsize>);

impl Drop for LiveTaskGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

fn spawn_tracked(task: ReactorTask, live_tasks: &Arc<AtomicUsize>) {
    live_tasks.fetch_add(1, Ordering::AcqRel);
    let guard = LiveTaskGuard(live_tasks.clone());
    tokio::task::spawn(async move {
        let _guard = guard;
        task.await
    });
}

async fn event_loop(
    index: usize,
    mut receiver: mpsc::UnboundedReceiver<ReactorMessage>,
    live_tasks: Arc<AtomicUsize>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            ReactorMessage::Task(task) => spawn_tracked(task, &live_tasks),
            ReactorMessage::Close => break,
        }
    }

    // One more pass over whatever got queued in the meantime.
    while let Ok(message) = receiver.try_recv() {
        if let ReactorMessage::Task(task) = message {
            spawn_tracked(task, &live_tasks);
        }
    }
    receiver.close();

    for _ in 0..CLOSE_DRAIN_ITERATIONS {
        if live_tasks.load(Ordering::Acquire) == 0 {
            break;
        }
        tokio::time::sleep(CLOSE_DRAIN_STEP).await;
    }

    let leaked = live_tasks.load(Ordering::Acquire);
    if leaked > 0 {
        error!(
            "Reactor {} is shutting down with {} handles still open",
            index, leaked
        );
        debug_assert!(
            leaked == 0,
            "reactor {} closed with {} live handles",
            index,
            leaked
        );
    }
}

/// A fixed-size ring of reactors.
pub(crate) struct ReactorGroup {
    reactors: Vec<Reactor>,
    next: AtomicUsize,
}

impl ReactorGroup {
    /// Creates `size` reactors (at least one). They do not run until [`run`](Self::run).
    pub(crate) fn new(size: usize) -> Self {
        ReactorGroup {
            reactors: (0..size.max(1)).map(Reactor::new).collect(),
            next: AtomicUsize::new(0),
        }
    }

    pub(crate) fn run(&self) -> Result<(), ReactorError> {
        self.reactors.iter().try_for_each(Reactor::run)
    }

    pub(crate) fn len(&self) -> usize {
        self.reactors.len()
    }

    pub(crate) fn get(&self, index: usize) -> Option<&Reactor> {
        self.reactors.get(index)
    }

    /// Picks the next reactor of the ring.
    pub(crate) fn next_reactor(&self) -> &Reactor {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.reactors.len();
        &self.reactors[index]
    }

    /// Enqueues `task` on the next reactor of the ring and returns that reactor's index.
    pub(crate) fn add<F>(&self, task: F) -> Result<usize, ReactorError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let reactor = self.next_reactor();
        reactor.add(task)?;
        Ok(reactor.index())
    }

    pub(crate) fn close_handles(&self) {
        self.reactors.iter().for_each(Reactor::close_handles);
    }

    /// Joins every reactor thread. Reports the first failure, but joins all of them.
    pub(crate) fn join(&self) -> Result<(), ReactorError> {
        let mut first_error = None;
        for reactor in &self.reactors {
            if let Err(err) = reactor.join() {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Drop for ReactorGroup {
    fn drop(&mut self) {
        self.close_handles();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use super::{Reactor, ReactorGroup};
    use crate::errors::ReactorError;
    use crate::utils::test_utils::setup_tracing;

    #[test]
    fn tasks_from_one_thread_run_in_order() {
        setup_tracing();
        let reactor = Reactor::new(0);
        let (tx, rx) = std_mpsc::channel();

        // Queued before the loop runs.
        for i in 0..10 {
            let tx = tx.clone();
            reactor.add(async move { tx.send(i).unwrap() }).unwrap();
        }
        reactor.run().unwrap();
        for i in 10..20 {
            let tx = tx.clone();
            reactor.add(async move { tx.send(i).unwrap() }).unwrap();
        }

        let received: Vec<i32> = (0..20)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, (0..20).collect::<Vec<_>>());

        reactor.close_handles();
        reactor.join().unwrap();
    }

    #[test]
    fn tasks_run_on_the_reactor_thread() {
        setup_tracing();
        let reactor = Reactor::new(3);
        reactor.run().unwrap();

        let fut = reactor.spawn(async { std::thread::current().name().map(str::to_owned) });
        let name = futures::executor::block_on(fut).unwrap();
        assert_eq!(name.as_deref(), Some("kestrel-reactor-3"));

        reactor.close_handles();
        reactor.join().unwrap();
    }

    #[test]
    fn group_hands_out_reactors_round_robin() {
        setup_tracing();
        let group = ReactorGroup::new(3);
        group.run().unwrap();

        let indices: Vec<usize> = (0..7).map(|_| group.add(async {}).unwrap()).collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1, 2, 0]);

        group.close_handles();
        group.join().unwrap();
    }

    #[test]
    fn closed_reactor_rejects_tasks() {
        setup_tracing();
        let reactor = Reactor::new(0);
        reactor.run().unwrap();
        reactor.close_handles();
        reactor.join().unwrap();

        assert_matches!(reactor.add(async {}), Err(ReactorError::Closed(0)));
        assert_matches!(
            futures::executor::block_on(reactor.spawn(async { 1 })),
            Err(ReactorError::Closed(0))
        );
    }

    #[test]
    fn close_waits_for_finishing_tasks() {
        setup_tracing();
        let reactor = Reactor::new(0);
        reactor.run().unwrap();
        let (tx, rx) = std_mpsc::channel();
        reactor
            .add(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                tx.send(()).unwrap();
            })
            .unwrap();

        reactor.close_handles();
        reactor.join().unwrap();
        rx.try_recv().unwrap();
        assert_eq!(reactor.live_tasks(), 0);
    }

    #[cfg(debug_assertions)]
    #[test]
    fn leaked_handle_is_fatal_in_debug_builds() {
        setup_tracing();
        let reactor = Reactor::new(0);
        reactor.run().unwrap();
        reactor.add(futures::future::pending()).unwrap();

        reactor.close_handles();
        assert_matches!(reactor.join(), Err(ReactorError::Panicked(0)));
    }
}
