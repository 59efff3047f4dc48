//! The repeater: a cancellable, buffered async iterator.
//!
//! A [`Repeater`] wraps a producer routine. The producer receives a [`Push`]
//! handle to emit values and a [`Stop`] handle to end the sequence; a single
//! consumer pulls values with [`Repeater::next`], ends the sequence early with
//! [`Repeater::close`], or injects an error with [`Repeater::throw`].
//!
//! Values are delivered in push order even when pushed as futures that
//! settle out of order. Each push joins a settlement chain and a value is
//! only handed to its consumer once every earlier push has settled.

use crate::buffer::{Buffer, BufferPolicy};
use futures::future::{self, BoxFuture, FutureExt, Shared};
use futures::{ready, Stream, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tracing::{debug, trace, warn};

/// Maximum number of queued pushes or queued pulls on a single repeater.
pub const MAX_QUEUE_LENGTH: usize = 1024;

/// Result of pulling from a repeater.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Iteration<T, R = ()> {
    /// The next value.
    Next(T),
    /// The sequence is over. Carries the producer's return value on the
    /// first terminal result, `None` afterwards.
    Done(Option<R>),
}

impl<T, R> Iteration<T, R> {
    /// Returns true for [`Iteration::Done`].
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done(_))
    }

    /// Returns the yielded value, if any.
    pub fn into_next(self) -> Option<T> {
        match self {
            Self::Next(value) => Some(value),
            Self::Done(_) => None,
        }
    }
}

/// A queue bound was exceeded.
///
/// Reported synchronously by the offending call. The repeater is finished
/// once this happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RepeaterOverflowError {
    /// Too many pushes waiting for a consumer.
    #[error(
        "no more than {} pending calls to push are allowed on a single repeater",
        MAX_QUEUE_LENGTH
    )]
    Push,

    /// Too many pulls waiting for a producer.
    #[error(
        "no more than {} pending calls to next are allowed on a single repeater",
        MAX_QUEUE_LENGTH
    )]
    Next,
}

/// Lifecycle of a repeater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RepeaterState {
    /// Created, producer not started.
    Initial,
    /// Producer running.
    Running,
    /// Stop requested; queued values may still be delivered.
    Stopped,
    /// No more values.
    Done,
    /// Terminated by an error.
    Rejected,
}

/// Future returned by pulling from a repeater.
pub type Pull<T, R, E> = BoxFuture<'static, Result<Iteration<T, R>, E>>;

/// Future returned by a push. Resolves with the value the consumer passes to
/// its following pull, or with the error passed to [`Repeater::throw`].
pub type Pushed<N, E> = BoxFuture<'static, Result<Option<N>, E>>;

type Link = Shared<BoxFuture<'static, ()>>;
type Execution<R, E> = BoxFuture<'static, Result<Option<R>, E>>;
type Core<T, E, R, N> = Arc<Mutex<Inner<T, E, R, N>>>;
type Producer<T, E, R, N> =
    Box<dyn FnOnce(Push<T, E, R, N>, Stop<T, E, R, N>) -> BoxFuture<'static, Result<R, E>> + Send>;

/// A value on its way to a consumer.
enum Settlement<T, R, E> {
    Ready(Result<Iteration<T, R>, E>),
    Linked {
        link: Link,
        rx: oneshot::Receiver<Result<Iteration<T, R>, E>>,
    },
}

impl<T, R, E> Settlement<T, R, E> {
    async fn resolve(self) -> Result<Iteration<T, R>, E> {
        match self {
            Self::Ready(result) => result,
            Self::Linked { link, rx } => {
                link.await;
                rx.await.unwrap_or(Ok(Iteration::Done(None)))
            }
        }
    }
}

enum Settled<T, R, E> {
    Value(T),
    Terminal(Execution<R, E>),
}

struct PendingPush<T, E, R, N> {
    settlement: Settlement<T, R, E>,
    resolve: Option<oneshot::Sender<Result<Option<N>, E>>>,
}

struct PendingNext<T, E, R, N> {
    resolve: oneshot::Sender<Settlement<T, R, E>>,
    value: Result<Option<N>, E>,
}

struct Inner<T, E, R, N> {
    state: RepeaterState,
    producer: Option<Producer<T, E, R, N>>,
    buffer: Option<Box<dyn Buffer<Settlement<T, R, E>>>>,
    err: Option<E>,
    pushes: VecDeque<PendingPush<T, E, R, N>>,
    nexts: VecDeque<PendingNext<T, E, R, N>>,
    tail: Option<Link>,
    execution: Option<Execution<R, E>>,
    onnext: Option<oneshot::Sender<Result<Option<N>, E>>>,
    stopped: watch::Sender<bool>,
}

impl<T, E, R, N> Inner<T, E, R, N>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    fn buffer_is_empty(&self) -> bool {
        self.buffer.as_ref().map_or(true, |buffer| buffer.is_empty())
    }

    fn execute(&mut self, this: &Core<T, E, R, N>) {
        let Some(producer) = self.producer.take() else {
            return;
        };
        self.state = RepeaterState::Running;
        debug!("starting repeater producer");

        let push = Push {
            core: Arc::clone(this),
        };
        let stop = Stop {
            core: Arc::clone(this),
            signal: self.stopped.subscribe(),
        };
        let weak = Arc::downgrade(this);
        let task = tokio::spawn(async move {
            let result = producer(push, stop).await;
            if let Some(core) = weak.upgrade() {
                let mut inner = core.lock();
                inner.stop(&core, None);
            }
            result
        });

        self.execution = Some(
            async move {
                match task.await {
                    Ok(result) => result.map(Some),
                    Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                    Err(_) => Ok(None),
                }
            }
            .boxed(),
        );
    }

    fn stop(&mut self, this: &Core<T, E, R, N>, err: Option<E>) {
        if self.state >= RepeaterState::Stopped {
            return;
        }
        debug!("repeater stopped");
        self.state = RepeaterState::Stopped;
        if let Some(onnext) = self.onnext.take() {
            let _ = onnext.send(Ok(None));
        }
        self.stopped.send_replace(true);
        if self.err.is_none() {
            self.err = err;
        }

        if self.pushes.is_empty() && self.buffer_is_empty() {
            self.finish(this);
        } else {
            for push in &mut self.pushes {
                if let Some(resolve) = push.resolve.take() {
                    let _ = resolve.send(Ok(None));
                }
            }
        }
    }

    fn finish(&mut self, this: &Core<T, E, R, N>) {
        if self.state >= RepeaterState::Done {
            return;
        }
        if self.state < RepeaterState::Stopped {
            self.stop(this, None);
            if self.state >= RepeaterState::Done {
                return;
            }
        }

        self.state = RepeaterState::Done;
        self.buffer = None;
        let mut first = true;
        for next in std::mem::take(&mut self.nexts) {
            if next.resolve.is_closed() {
                continue;
            }
            // Only the first waiting pull sees the producer's result.
            let settlement = if first {
                first = false;
                self.consume_later(this)
            } else {
                self.after_tail(Ok(Iteration::Done(None)))
            };
            let _ = next.resolve.send(settlement);
        }
        self.pushes.clear();
    }

    /// A fixed result delivered once the current chain has settled.
    fn after_tail(&mut self, result: Result<Iteration<T, R>, E>) -> Settlement<T, R, E> {
        match self.live_tail() {
            Some(link) => {
                let (tx, rx) = oneshot::channel();
                let _ = tx.send(result);
                Settlement::Linked { link, rx }
            }
            None => Settlement::Ready(result),
        }
    }

    fn reject(&mut self, this: &Core<T, E, R, N>) {
        if self.state >= RepeaterState::Rejected {
            return;
        }
        if self.state < RepeaterState::Done {
            self.finish(this);
        }
        self.state = RepeaterState::Rejected;
    }

    fn record_rejection(&mut self, this: &Core<T, E, R, N>, err: E) {
        if self.err.is_none() {
            self.err = Some(err);
        }
        self.reject(this);
    }

    /// The chain tail, if it has not settled yet.
    fn live_tail(&mut self) -> Option<Link> {
        match &self.tail {
            Some(link) if link.peek().is_none() => Some(link.clone()),
            _ => {
                self.tail = None;
                None
            }
        }
    }

    fn append_link<F>(&mut self, body: F) -> Link
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let previous = self.live_tail();
        let link = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            body.await;
        }
        .boxed()
        .shared();
        self.tail = Some(link.clone());
        link
    }

    /// Takes the execution result and recorded error. Later consumers see
    /// `Done(None)`.
    fn capture_execution(&mut self) -> Execution<R, E> {
        let execution = self.execution.take();
        let err = self.err.take();
        async move {
            let value = match execution {
                Some(execution) => execution.await?,
                None => None,
            };
            err.map_or(Ok(value), Err)
        }
        .boxed()
    }

    /// Terminal result captured now, delivered after every earlier value.
    fn consume_now(&mut self) -> Settlement<T, R, E> {
        if self.execution.is_none() && self.live_tail().is_none() {
            return Settlement::Ready(self.err.take().map_or(Ok(Iteration::Done(None)), Err));
        }
        let execution = self.capture_execution();
        let (tx, rx) = oneshot::channel();
        let link = self.append_link(async move {
            let _ = tx.send(execution.await.map(Iteration::Done));
        });
        Settlement::Linked { link, rx }
    }

    /// Terminal result captured once every earlier value has settled.
    fn consume_later(&mut self, this: &Core<T, E, R, N>) -> Settlement<T, R, E> {
        if self.live_tail().is_none() {
            return self.consume_now();
        }
        let weak = Arc::downgrade(this);
        let (tx, rx) = oneshot::channel();
        let link = self.append_link(async move {
            let execution = weak.upgrade().map(|core| core.lock().capture_execution());
            let result = match execution {
                Some(execution) => execution.await,
                None => Ok(None),
            };
            let _ = tx.send(result.map(Iteration::Done));
        });
        Settlement::Linked { link, rx }
    }

    /// Joins a pushed future to the settlement chain.
    fn settle<F>(&mut self, this: &Core<T, E, R, N>, value: F) -> Settlement<T, R, E>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        let weak = Arc::downgrade(this);
        let (tx, rx) = oneshot::channel();
        let link = self.append_link(async move {
            let outcome = value.await;
            let Some(core) = weak.upgrade() else {
                return;
            };

            let settled = {
                let mut inner = core.lock();
                if tx.is_closed() {
                    trace!("discarding a settlement no pull is waiting for");
                    return;
                }
                let value = match outcome {
                    Ok(value) => Some(value),
                    Err(err) => {
                        inner.record_rejection(&core, err);
                        None
                    }
                };
                // Finishing drops settlements that were still queued.
                if tx.is_closed() {
                    return;
                }
                match value {
                    Some(value) if inner.state < RepeaterState::Rejected => Settled::Value(value),
                    _ => Settled::Terminal(inner.capture_execution()),
                }
            };

            let result = match settled {
                Settled::Value(value) => Ok(Iteration::Next(value)),
                Settled::Terminal(execution) => execution.await.map(Iteration::Done),
            };
            let _ = tx.send(result);
        });
        Settlement::Linked { link, rx }
    }
}

fn deliver<T, R, E>(settlement: Settlement<T, R, E>) -> Pull<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    settlement.resolve().boxed()
}

fn receive<N, E>(rx: oneshot::Receiver<Result<Option<N>, E>>) -> Pushed<N, E>
where
    N: Send + 'static,
    E: Send + 'static,
{
    async move { rx.await.unwrap_or(Ok(None)) }.boxed()
}

/// An error thrown into a push. Terminates the repeater if the producer
/// drops the push without awaiting it.
struct Thrown<T, E, R, N>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    core: Weak<Mutex<Inner<T, E, R, N>>>,
    err: Option<E>,
}

impl<T, E, R, N> Drop for Thrown<T, E, R, N>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    fn drop(&mut self) {
        let (Some(err), Some(core)) = (self.err.take(), self.core.upgrade()) else {
            return;
        };
        let mut inner = core.lock();
        if inner.state < RepeaterState::Done {
            debug!("producer dropped a push carrying a thrown error");
            inner.record_rejection(&core, err);
        }
    }
}

fn thrown<T, E, R, N>(this: &Core<T, E, R, N>, err: E) -> Pushed<N, E>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    let mut thrown = Thrown {
        core: Arc::downgrade(this),
        err: Some(err),
    };
    async move { thrown.err.take().map_or(Ok(None), Err) }.boxed()
}

enum Source<T, E> {
    Value(T),
    Future(BoxFuture<'static, Result<T, E>>),
}

fn push_source<T, E, R, N>(
    this: &Core<T, E, R, N>,
    source: Source<T, E>,
) -> Result<Pushed<N, E>, RepeaterOverflowError>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    let mut guard = this.lock();
    let inner = &mut *guard;

    if inner.pushes.len() >= MAX_QUEUE_LENGTH {
        warn!("repeater push queue overflowed");
        inner.finish(this);
        return Err(RepeaterOverflowError::Push);
    }
    if inner.state >= RepeaterState::Stopped {
        return Ok(future::ready(Ok(None)).boxed());
    }

    let mut settlement = match source {
        Source::Value(value) if inner.live_tail().is_none() => {
            Settlement::Ready(Ok(Iteration::Next(value)))
        }
        Source::Value(value) => inner.settle(this, future::ready(Ok(value))),
        Source::Future(value) => inner.settle(this, value),
    };

    while let Some(next) = inner.nexts.pop_front() {
        match next.resolve.send(settlement) {
            Ok(()) => {
                let pushed = match inner.nexts.front_mut() {
                    Some(following) => match std::mem::replace(&mut following.value, Ok(None)) {
                        Ok(value) => future::ready(Ok(value)).boxed(),
                        Err(err) => thrown(this, err),
                    },
                    None => {
                        let (tx, rx) = oneshot::channel();
                        inner.onnext = Some(tx);
                        receive(rx)
                    }
                };
                return Ok(pushed);
            }
            Err(returned) => settlement = returned,
        }
    }

    if let Some(buffer) = inner.buffer.as_mut() {
        if !buffer.is_full() {
            let _ = buffer.add(settlement);
            return Ok(future::ready(Ok(None)).boxed());
        }
    }

    let (tx, rx) = oneshot::channel();
    inner.pushes.push_back(PendingPush {
        settlement,
        resolve: Some(tx),
    });
    Ok(receive(rx))
}

/// Producer-side handle for emitting values.
pub struct Push<T, E, R = (), N = ()> {
    core: Core<T, E, R, N>,
}

impl<T, E, R, N> Clone for Push<T, E, R, N> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T, E, R, N> Push<T, E, R, N>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    /// Pushes a value.
    ///
    /// After the repeater stopped, the push is ignored and resolves with
    /// `None`.
    pub fn push(&self, value: T) -> Result<Pushed<N, E>, RepeaterOverflowError> {
        push_source(&self.core, Source::Value(value))
    }

    /// Pushes a value that is still being computed.
    ///
    /// An `Err` outcome terminates the repeater once every earlier value has
    /// been delivered.
    pub fn push_future<F>(&self, value: F) -> Result<Pushed<N, E>, RepeaterOverflowError>
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
    {
        push_source(&self.core, Source::Future(value.boxed()))
    }

    /// Pushes a value and waits until the consumer asks for the next one.
    pub async fn send(&self, value: T) -> Result<Option<N>, E> {
        match self.push(value) {
            Ok(pushed) => pushed.await,
            Err(err) => {
                warn!(%err, "value dropped");
                Ok(None)
            }
        }
    }

    /// Returns true once the repeater stopped accepting values.
    pub fn is_stopped(&self) -> bool {
        self.core.lock().state >= RepeaterState::Stopped
    }
}

/// Producer-side handle for ending the sequence.
pub struct Stop<T, E, R = (), N = ()> {
    core: Core<T, E, R, N>,
    signal: watch::Receiver<bool>,
}

impl<T, E, R, N> Clone for Stop<T, E, R, N> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            signal: self.signal.clone(),
        }
    }
}

impl<T, E, R, N> Stop<T, E, R, N>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    /// Stops the repeater. Already queued values are still delivered.
    pub fn stop(&self) {
        let mut inner = self.core.lock();
        inner.stop(&self.core, None);
    }

    /// Stops the repeater with an error, surfaced after the queued values.
    ///
    /// Ignored if the repeater is already stopped.
    pub fn stop_with(&self, error: E) {
        let mut inner = self.core.lock();
        inner.stop(&self.core, Some(error));
    }

    /// Returns true once the repeater started terminating.
    pub fn is_stopped(&self) -> bool {
        *self.signal.borrow()
    }

    /// Waits until the repeater starts terminating, either through
    /// [`Stop::stop`] or because the consumer closed it.
    pub async fn stopped(&self) {
        let mut signal = self.signal.clone();
        let _ = signal.wait_for(|stopped| *stopped).await;
    }
}

/// A cancellable async iterator fed by a producer routine.
///
/// Dropping the repeater finishes it, which stops the producer. A panic in
/// the producer resumes in whichever task awaits the terminal result.
pub struct Repeater<T, E, R = (), N = ()> {
    core: Core<T, E, R, N>,
    pending: Mutex<Option<Pull<T, R, E>>>,
}

impl<T, E, R, N> Repeater<T, E, R, N>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    /// Creates a repeater without buffering.
    pub fn new<F, Fut>(producer: F) -> Self
    where
        F: FnOnce(Push<T, E, R, N>, Stop<T, E, R, N>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        Self::with_buffer(BufferPolicy::default(), producer)
    }

    /// Creates a repeater with the given buffer policy.
    pub fn with_buffer<F, Fut>(policy: BufferPolicy, producer: F) -> Self
    where
        F: FnOnce(Push<T, E, R, N>, Stop<T, E, R, N>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let (stopped, _) = watch::channel(false);
        let inner = Inner {
            state: RepeaterState::Initial,
            producer: Some(Box::new(move |push, stop| producer(push, stop).boxed())),
            buffer: Some(policy.build()),
            err: None,
            pushes: VecDeque::new(),
            nexts: VecDeque::new(),
            tail: None,
            execution: None,
            onnext: None,
            stopped,
        };
        Self {
            core: Arc::new(Mutex::new(inner)),
            pending: Mutex::new(None),
        }
    }

    /// Returns the current lifecycle state.
    pub fn state(&self) -> RepeaterState {
        self.core.lock().state
    }

    /// Pulls the next value. Starts the producer on first use.
    pub fn next(&self) -> Result<Pull<T, R, E>, RepeaterOverflowError> {
        self.pull(Ok(None))
    }

    /// Pulls the next value, resolving the previous push with `value`.
    pub fn next_with(&self, value: N) -> Result<Pull<T, R, E>, RepeaterOverflowError> {
        self.pull(Ok(Some(value)))
    }

    /// Finishes the repeater and waits for the producer to wind down.
    ///
    /// Resolves with an error recorded before closing, otherwise `Done(None)`.
    pub fn close(&self) -> Pull<T, R, E> {
        self.close_inner(None)
    }

    /// Like [`Repeater::close`], resolving with `Done(Some(value))`.
    pub fn close_with(&self, value: R) -> Pull<T, R, E> {
        self.close_inner(Some(future::ready(value).boxed()))
    }

    /// Like [`Repeater::close_with`] with a value that is still being computed.
    pub fn close_with_future<F>(&self, value: F) -> Pull<T, R, E>
    where
        F: Future<Output = R> + Send + 'static,
    {
        self.close_inner(Some(value.boxed()))
    }

    /// Injects an error.
    ///
    /// If the producer is waiting on the push of the last delivered value,
    /// that push resolves with `Err(error)` and this behaves like
    /// [`Repeater::next`]. Otherwise the repeater finishes and the returned
    /// pull resolves with the error.
    pub fn throw(&self, error: E) -> Result<Pull<T, R, E>, RepeaterOverflowError> {
        {
            let this = &self.core;
            let mut inner = this.lock();
            let buffered = !inner.buffer_is_empty();
            if inner.state == RepeaterState::Initial
                || inner.state >= RepeaterState::Stopped
                || buffered
            {
                inner.finish(this);
                if inner.err.is_none() {
                    inner.err = Some(error);
                }
                return Ok(deliver(inner.consume_now()));
            }
        }
        self.pull(Err(error))
    }

    fn pull(&self, value: Result<Option<N>, E>) -> Result<Pull<T, R, E>, RepeaterOverflowError> {
        let this = &self.core;
        let mut guard = this.lock();
        let inner = &mut *guard;

        if inner.nexts.len() >= MAX_QUEUE_LENGTH {
            warn!("repeater pull queue overflowed");
            inner.finish(this);
            return Err(RepeaterOverflowError::Next);
        }
        if inner.state == RepeaterState::Initial {
            inner.execute(this);
        }

        let value = match inner.onnext.take() {
            Some(onnext) => {
                if let Err(Err(err)) = onnext.send(value) {
                    // The producer dropped the push this error was meant for.
                    inner.record_rejection(this, err);
                }
                Ok(None)
            }
            None => value,
        };

        if let Some(buffer) = inner.buffer.as_mut() {
            if let Ok(settlement) = buffer.remove() {
                if let Some(mut push) = inner.pushes.pop_front() {
                    let _ = buffer.add(push.settlement);
                    inner.onnext = push.resolve.take();
                }
                return Ok(deliver(settlement));
            }
        }

        if let Some(mut push) = inner.pushes.pop_front() {
            inner.onnext = push.resolve.take();
            return Ok(deliver(push.settlement));
        }

        if inner.state >= RepeaterState::Stopped {
            inner.finish(this);
            return Ok(deliver(inner.consume_now()));
        }

        let (tx, rx) = oneshot::channel();
        inner.nexts.push_back(PendingNext { resolve: tx, value });
        Ok(async move {
            match rx.await {
                Ok(settlement) => settlement.resolve().await,
                Err(_) => Ok(Iteration::Done(None)),
            }
        }
        .boxed())
    }

    fn close_inner(&self, value: Option<BoxFuture<'static, R>>) -> Pull<T, R, E> {
        let this = &self.core;
        let mut inner = this.lock();
        inner.finish(this);

        let previous = inner.execution.take();
        inner.execution = Some(
            async move {
                if let Some(previous) = previous {
                    previous.await?;
                }
                Ok(match value {
                    Some(value) => Some(value.await),
                    None => None,
                })
            }
            .boxed(),
        );
        deliver(inner.consume_now())
    }
}

impl<T, E> Repeater<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Adapts a stream. Stopping the repeater drops the stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T, E>> + Send + 'static,
    {
        Self::new(move |push, stop| async move {
            let mut stream = Box::pin(stream);
            loop {
                let item = tokio::select! {
                    biased;
                    () = stop.stopped() => break,
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(value)) => {
                        push.send(value).await?;
                    }
                    Some(Err(err)) => return Err(err),
                    None => break,
                }
            }
            Ok(())
        })
    }
}

impl<T, E, R, N> Drop for Repeater<T, E, R, N> {
    fn drop(&mut self) {
        let this = &self.core;
        let mut inner = this.lock();
        if inner.state < RepeaterState::Done {
            trace!("repeater dropped before finishing");
            inner.state = RepeaterState::Done;
            inner.buffer = None;
            inner.pushes.clear();
            inner.nexts.clear();
            if let Some(onnext) = inner.onnext.take() {
                let _ = onnext.send(Ok(None));
            }
            inner.stopped.send_replace(true);
        }
    }
}

impl<T, E, R, N> Stream for Repeater<T, E, R, N>
where
    T: Send + 'static,
    E: Send + 'static,
    R: Send + 'static,
    N: Send + 'static,
{
    type Item = Result<T, E>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.pending.get_mut().is_none() {
            match this.pull(Ok(None)) {
                Ok(pull) => *this.pending.get_mut() = Some(pull),
                Err(err) => {
                    warn!(%err, "repeater stream ended");
                    return Poll::Ready(None);
                }
            }
        }

        let Some(pull) = this.pending.get_mut().as_mut() else {
            return Poll::Ready(None);
        };
        let step = ready!(pull.as_mut().poll(cx));
        *this.pending.get_mut() = None;

        Poll::Ready(match step {
            Ok(Iteration::Next(value)) => Some(Ok(value)),
            Ok(Iteration::Done(_)) => None,
            Err(err) => Some(Err(err)),
        })
    }
}

impl<T, E, R, N> fmt::Debug for Repeater<T, E, R, N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.core.lock();
        f.debug_struct("Repeater")
            .field("state", &inner.state)
            .field("pushes", &inner.pushes.len())
            .field("nexts", &inner.nexts.len())
            .finish()
    }
}
