//! The shared state behind one dispatch cycle: the per-key result slots,
//! the batch job that resolves them, and the future callers await.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Formatter};
use std::future::Future;
use std::mem;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::environment::Environment;
use crate::reply::{BatchFn, BatchReply, LoadError};
use crate::wakerset::{Token, WakerSet};

/// Something that can advance a shared batch of work. Implemented by the
/// batch job for each dispatch cycle; handles and dispatch futures only
/// know the job through this trait, which keeps their types independent of
/// the batch function's type.
pub(crate) trait Drive: Send + Sync {
    /// Poll the batch forward on behalf of the calling task, registering
    /// or refreshing that task's waker. Returns `Ready` once every key of
    /// the batch has been settled.
    fn drive(&self, token: &mut Option<Token>, cx: &mut Context<'_>) -> Poll<()>;

    /// The calling task has lost interest (its future completed or was
    /// dropped). If it was the one driving the batch, another interested
    /// task is woken to take over.
    fn abandon(&self, token: Token);
}

/// One key's single-assignment result slot. A slot starts out pending,
/// optionally learns which batch job will resolve it, and is settled
/// exactly once. Once settled it never changes again; the cache keeps
/// settled slots around so later loads for the same key observe the same
/// outcome.
enum Slot<V, E> {
    Pending {
        /// The job that will settle this slot, attached at dispatch time.
        /// `None` while the key is still queued.
        job: Option<Arc<dyn Drive>>,
        wakers: WakerSet,
    },
    Settled(Result<V, LoadError<E>>),
}

/// Shared handle to one key's eventual outcome. This is what the loader's
/// cache stores, what the dispatch queue references, and what
/// [`LoadFuture`]s resolve from. Cloning a handle shares the underlying
/// slot; it never duplicates work.
///
/// The type is opaque: cache backends treat it as an ordinary cloneable
/// value.
pub struct LoadHandle<V, E> {
    slot: Arc<Mutex<Slot<V, E>>>,
}

impl<V, E> LoadHandle<V, E> {
    /// A fresh, unresolved slot, ready to be enqueued.
    pub(crate) fn pending() -> Self {
        LoadHandle {
            slot: Arc::new(Mutex::new(Slot::Pending {
                job: None,
                wakers: WakerSet::default(),
            })),
        }
    }

    /// A slot that was born settled. Used to seed the cache with
    /// precomputed outcomes; never enqueued.
    pub(crate) fn settled(outcome: Result<V, LoadError<E>>) -> Self {
        LoadHandle {
            slot: Arc::new(Mutex::new(Slot::Settled(outcome))),
        }
    }

    /// A future resolving to this slot's outcome.
    pub(crate) fn future(&self) -> LoadFuture<V, E> {
        LoadFuture {
            handle: self.clone(),
            job: None,
            wait_token: None,
            drive_token: None,
        }
    }

    /// Point this slot at the job that will settle it, and wake every task
    /// already waiting on it so that one of them starts driving the job.
    pub(crate) fn attach(&self, job: &Arc<dyn Drive>) {
        let mut slot = self.slot.lock().unwrap();
        if let Slot::Pending { job: slot_job, wakers } = &mut *slot {
            *slot_job = Some(Arc::clone(job));
            wakers.rouse();
        }
    }

    /// Record this slot's final outcome and wake every waiting task. A
    /// slot is settled at most once: each queued slot sits at exactly one
    /// position of one batch, and born-settled slots are never enqueued.
    pub(crate) fn settle(&self, outcome: Result<V, LoadError<E>>) {
        let mut slot = self.slot.lock().unwrap();
        match &mut *slot {
            Slot::Pending { .. } => {
                let previous = mem::replace(&mut *slot, Slot::Settled(outcome));
                if let Slot::Pending { mut wakers, .. } = previous {
                    wakers.complete(None);
                }
            }
            Slot::Settled(..) => {
                debug_assert!(false, "attempted to settle an already-settled load");
            }
        }
    }

    /// The settled outcome, if there is one yet.
    pub(crate) fn outcome(&self) -> Option<Result<V, LoadError<E>>>
    where
        V: Clone,
        E: Clone,
    {
        match &*self.slot.lock().unwrap() {
            Slot::Settled(outcome) => Some(outcome.clone()),
            Slot::Pending { .. } => None,
        }
    }
}

impl<V, E> Clone for LoadHandle<V, E> {
    fn clone(&self) -> Self {
        LoadHandle {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<V, E> Debug for LoadHandle<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let state = match self.slot.try_lock() {
            Ok(slot) => match &*slot {
                Slot::Pending { .. } => "<pending>",
                Slot::Settled(..) => "<settled>",
            },
            Err(..) => "<locked>",
        };
        f.debug_tuple("LoadHandle").field(&state).finish()
    }
}

/// One batch function invocation's worth of work: the keys submitted to
/// it, in order, and the slots to settle positionally from its reply.
pub(crate) struct Chunk<K, V, E> {
    pub(crate) keys: Vec<K>,
    pub(crate) handles: Vec<LoadHandle<V, E>>,
}

struct Running<K, V, E, Fut> {
    fut: Fut,
    chunk: Chunk<K, V, E>,
}

/// The work of one dispatch cycle: every chunk drained from the queue,
/// invoked against the batch function one chunk at a time, in order.
///
/// The job is not scheduled anywhere. It is driven cooperatively, through
/// [`Drive`], by whichever task polls it: the [`Dispatch`] future or any
/// [`LoadFuture`] belonging to the cycle. Only one task drives at a time
/// (tracked by the waker set); the others sleep until their slot settles.
///
/// [`Dispatch`]: crate::Dispatch
pub(crate) struct BatchJob<K, V, E, C, B: BatchFn<K, V, E, C>> {
    batch_fn: B,
    environment: Environment<K, C>,
    pending: VecDeque<Chunk<K, V, E>>,
    current: Option<Running<K, V, E, B::Fut>>,
    wakers: WakerSet,
    done: bool,
}

impl<K, V, E, C, B: BatchFn<K, V, E, C>> BatchJob<K, V, E, C, B> {
    pub(crate) fn new(
        batch_fn: B,
        environment: Environment<K, C>,
        chunks: VecDeque<Chunk<K, V, E>>,
    ) -> Self {
        BatchJob {
            batch_fn,
            environment,
            pending: chunks,
            current: None,
            wakers: WakerSet::default(),
            done: false,
        }
    }
}

impl<K, V, E, C, B> Drive for Mutex<BatchJob<K, V, E, C, B>>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + 'static,
    E: Clone + Send + 'static,
    C: Send + Sync + 'static,
    B: BatchFn<K, V, E, C> + Send + 'static,
    B::Fut: Send + 'static,
{
    fn drive(&self, token: &mut Option<Token>, cx: &mut Context<'_>) -> Poll<()> {
        // Note about this mutex: it is safe to use in an async context
        // because the lock is released when drive returns; it is never
        // held across a suspension. If a poll of the batch function
        // panicked in another task, the mutex is poisoned and the unwrap
        // propagates the panic here as well.
        let mut guard = self.lock().unwrap();
        let job = &mut *guard;

        if job.done {
            return Poll::Ready(());
        }

        loop {
            if job.current.is_none() {
                match job.pending.pop_front() {
                    Some(chunk) => {
                        // The keys stay with the chunk so the reply can be
                        // lined up with them after the future completes.
                        // This is one of the two places we worry about a
                        // panic (the other is fut.poll below); both are
                        // handled by mutex poisoning.
                        let fut = job
                            .batch_fn
                            .invoke(chunk.keys.clone(), job.environment.clone());
                        job.current = Some(Running { fut, chunk });
                    }
                    None => {
                        job.done = true;
                        job.wakers.complete(token.take());
                        return Poll::Ready(());
                    }
                }
            }

            let running = job.current.as_mut().unwrap();

            // Safety: the future lives inside the job, which sits behind
            // an Arc<Mutex<..>> and is never moved out. It is polled in
            // place here and destructed in place below when `current` is
            // cleared, so the pin contract is upheld.
            let fut = unsafe { Pin::new_unchecked(&mut running.fut) };

            match fut.poll(cx) {
                Poll::Pending => {
                    // This task is now the driving waker for the batch.
                    job.wakers.register(token, cx.waker());
                    return Poll::Pending;
                }
                Poll::Ready(result) => {
                    let outcomes = match result {
                        Ok(reply) => reply.into_outcomes(&running.chunk.keys),
                        Err(error) => Err(LoadError::Loader(error)),
                    };

                    match outcomes {
                        Ok(outcomes) => {
                            for (handle, outcome) in
                                running.chunk.handles.iter().zip(outcomes)
                            {
                                handle.settle(outcome);
                            }
                        }
                        Err(error) => {
                            // A structurally broken reply (or an outright
                            // failed invocation) cannot be attributed to
                            // individual keys; the whole chunk fails.
                            tracing::debug!(
                                keys = running.chunk.handles.len(),
                                "batch invocation failed; failing every key in the batch"
                            );
                            for handle in &running.chunk.handles {
                                handle.settle(Err(error.clone()));
                            }
                        }
                    }

                    // Safety note: this is where the future is destructed
                    // in place, upholding the pin contract.
                    job.current = None;
                }
            }
        }
    }

    fn abandon(&self, token: Token) {
        // No cleanup if the mutex is poisoned: every waiting task will
        // observe the poison and propagate the panic on its next poll, so
        // there is no driver left to hand over to. panic=abort makes this
        // mostly theoretical.
        if let Ok(mut guard) = self.lock() {
            guard.wakers.abandon(token);
        }
    }
}

/// A future for the outcome of a single requested key. Created by
/// [`Loader::load`]; resolves once the key's batch has been dispatched and
/// the batch function's reply (or failure) has been distributed.
///
/// Awaiting a `LoadFuture` participates in driving its batch: after
/// [`Loader::dispatch`] has been called, any one of the cycle's futures is
/// enough to bring the whole batch to completion, whether or not the
/// `Dispatch` future itself is awaited.
///
/// [`Loader::load`]: crate::Loader::load
/// [`Loader::dispatch`]: crate::Loader::dispatch
pub struct LoadFuture<V, E> {
    handle: LoadHandle<V, E>,
    /// Kept from the first poll that saw the job attached, so that drop
    /// can hand driving over even after the slot has settled.
    job: Option<Arc<dyn Drive>>,
    wait_token: Option<Token>,
    drive_token: Option<Token>,
}

impl<V, E> LoadFuture<V, E> {
    /// Yield the settled outcome, first releasing any claim this task had
    /// on driving the batch.
    fn finish(&mut self, outcome: Result<V, LoadError<E>>) -> Poll<Result<V, LoadError<E>>> {
        if let (Some(job), Some(token)) = (&self.job, self.drive_token.take()) {
            job.abandon(token);
        }
        Poll::Ready(outcome)
    }
}

impl<V: Clone, E: Clone> Future for LoadFuture<V, E> {
    type Output = Result<V, LoadError<E>>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = Pin::into_inner(self);

        let job = {
            let mut slot = this.handle.slot.lock().unwrap();
            match &mut *slot {
                Slot::Settled(outcome) => {
                    let outcome = outcome.clone();
                    drop(slot);
                    return this.finish(outcome);
                }
                Slot::Pending { job, wakers } => {
                    // Register for the settlement wake before looking at
                    // the job, so a completion racing with us can't be
                    // missed.
                    wakers.register(&mut this.wait_token, cx.waker());
                    job.clone()
                }
            }
        };

        let job = match job {
            Some(job) => {
                this.job.get_or_insert_with(|| Arc::clone(&job));
                job
            }
            // Not dispatched yet; the attach will rouse us.
            None => return Poll::Pending,
        };

        match job.drive(&mut this.drive_token, cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(()) => {
                let outcome = this
                    .handle
                    .outcome()
                    .expect("batch completed without settling its keys");
                this.finish(outcome)
            }
        }
    }
}

impl<V, E> Drop for LoadFuture<V, E> {
    fn drop(&mut self) {
        // The batch behind a collection of LoadFutures is only ever driven
        // by one task, so a dropped future must make sure another task is
        // woken to take over in case it was the driver. Skip all cleanup
        // on a poisoned slot; the panic is already propagating.
        if let Ok(mut slot) = self.handle.slot.lock() {
            if let Slot::Pending { wakers, .. } = &mut *slot {
                if let Some(token) = self.wait_token.take() {
                    wakers.discard(token);
                }
            }
        }

        if let (Some(job), Some(token)) = (&self.job, self.drive_token.take()) {
            job.abandon(token);
        }
    }
}

impl<V, E> Debug for LoadFuture<V, E> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadFuture")
            .field("handle", &self.handle)
            .finish()
    }
}
