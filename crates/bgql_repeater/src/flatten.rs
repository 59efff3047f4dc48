//! Flattening a stream of streams into one ordered stream.

use crate::repeater::{Iteration, Push, Repeater, Stop};
use tracing::trace;

/// An item of a nested source: either a value or a whole stream of values.
pub enum Nested<T, E> {
    /// A value passed through as is.
    Item(T),
    /// A stream drained completely before the source is pulled again.
    Stream(Repeater<T, E>),
}

impl<T, E> From<Repeater<T, E>> for Nested<T, E> {
    fn from(stream: Repeater<T, E>) -> Self {
        Self::Stream(stream)
    }
}

/// Flattens one level of nesting.
///
/// Values of a nested stream are yielded in place of the stream, before
/// anything the source yields after it. Closing the returned repeater closes
/// the nested stream being drained and the source concurrently, and waits
/// for both.
pub fn flatten<T, E>(source: Repeater<Nested<T, E>, E>) -> Repeater<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Repeater::new(move |push, stop| async move {
        let mut child = None;
        let outcome = drain(&source, &mut child, &push, &stop).await;

        trace!("closing flattened sources");
        let child_closed = child.as_ref().map(Repeater::close);
        let source_closed = source.close();
        let (child_closed, source_closed) = futures::join!(
            async move {
                match child_closed {
                    Some(closed) => closed.await.map(|_| ()),
                    None => Ok(()),
                }
            },
            source_closed,
        );

        outcome?;
        child_closed?;
        source_closed?;
        Ok(())
    })
}

async fn drain<T, E>(
    source: &Repeater<Nested<T, E>, E>,
    child: &mut Option<Repeater<T, E>>,
    push: &Push<T, E>,
    stop: &Stop<T, E>,
) -> Result<(), E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    loop {
        if let Some(active) = child.as_ref() {
            let Ok(pull) = active.next() else {
                *child = None;
                continue;
            };
            let step = tokio::select! {
                biased;
                () = stop.stopped() => return Ok(()),
                step = pull => step?,
            };
            match step {
                Iteration::Next(value) => {
                    push.send(value).await?;
                }
                Iteration::Done(_) => *child = None,
            }
            continue;
        }

        let Ok(pull) = source.next() else {
            return Ok(());
        };
        let step = tokio::select! {
            biased;
            () = stop.stopped() => return Ok(()),
            step = pull => step?,
        };
        match step {
            Iteration::Next(Nested::Item(value)) => {
                push.send(value).await?;
            }
            Iteration::Next(Nested::Stream(stream)) => *child = Some(stream),
            Iteration::Done(_) => return Ok(()),
        }
    }
}
