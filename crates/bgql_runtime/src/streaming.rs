//! Streaming support for Better GraphQL (@defer/@stream).
//!
//! Deferred fragments and streamed list items run as tokio tasks from the
//! moment the executor reaches them. The [`IncrementalPublisher`] delivers the
//! initial result first, then one payload per finished unit of work in
//! completion order, recomputing `hasNext` each time.

use crate::response::{FieldError, PathSegment, Response};
use bgql_repeater::{BufferPolicy, Repeater};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// An incremental response: the initial payload followed by every deferred
/// and streamed payload.
pub type ResponseStream = Repeater<Response, FieldError>;

/// A finished unit of incremental work.
#[derive(Debug)]
pub(crate) enum Completion {
    /// A deferred fragment.
    Deferred {
        path: Vec<PathSegment>,
        label: Option<String>,
        data: Value,
        errors: Vec<FieldError>,
    },
    /// Items of a streamed list.
    Items {
        path: Vec<PathSegment>,
        label: Option<String>,
        items: Vec<Value>,
        errors: Vec<FieldError>,
    },
    /// The source of a streamed list failed. No further items follow.
    StreamFailed {
        path: Vec<PathSegment>,
        label: Option<String>,
        errors: Vec<FieldError>,
    },
    /// The source of a streamed list ran out of items.
    StreamEnded {
        path: Vec<PathSegment>,
        label: Option<String>,
    },
}

impl Completion {
    fn into_payload(self, has_next: bool) -> Option<Response> {
        let payload = match self {
            Self::Deferred {
                path,
                label,
                data,
                errors,
            } => Response::data(data)
                .with_errors(errors)
                .with_path(path)
                .with_label(label),
            Self::Items {
                path,
                label,
                items,
                errors,
            } => Response::items(items)
                .with_errors(errors)
                .with_path(path)
                .with_label(label),
            Self::StreamFailed {
                path,
                label,
                errors,
            } => Response::errors(errors).with_path(path).with_label(label),
            // Only needed to close the sequence.
            Self::StreamEnded { .. } if has_next => return None,
            Self::StreamEnded { path, label } => {
                Response::default().with_path(path).with_label(label)
            }
        };
        Some(payload.with_has_next(has_next))
    }
}

#[derive(Default)]
struct RegistryState {
    pending: Vec<JoinHandle<Completion>>,
    closed: bool,
}

/// Incremental work registered during one execution.
#[derive(Clone, Default)]
pub(crate) struct IncrementalRegistry {
    state: Arc<Mutex<RegistryState>>,
}

impl IncrementalRegistry {
    /// Starts a unit of work.
    pub(crate) fn spawn<F>(&self, work: F)
    where
        F: Future<Output = Completion> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        let mut state = self.state.lock();
        if state.closed {
            trace!("incremental delivery closed, aborting new work");
            handle.abort();
        } else {
            state.pending.push(handle);
        }
    }

    /// Returns true if no work was registered since the last `take`.
    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().pending.is_empty()
    }

    fn take(&self) -> Vec<JoinHandle<Completion>> {
        std::mem::take(&mut self.state.lock().pending)
    }

    fn close(&self) -> Vec<JoinHandle<Completion>> {
        let mut state = self.state.lock();
        state.closed = true;
        std::mem::take(&mut state.pending)
    }
}

impl std::fmt::Debug for IncrementalRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("IncrementalRegistry")
            .field("pending", &state.pending.len())
            .field("closed", &state.closed)
            .finish()
    }
}

/// Turns the result of one execution into an ordered payload sequence.
#[derive(Debug)]
pub struct IncrementalPublisher {
    registry: IncrementalRegistry,
}

impl IncrementalPublisher {
    pub(crate) fn new(registry: IncrementalRegistry) -> Self {
        Self { registry }
    }

    /// Publishes `initial` followed by a payload per finished unit of work.
    ///
    /// Closing the returned stream aborts all outstanding work.
    pub fn publish(self, initial: Response, policy: BufferPolicy) -> ResponseStream {
        let registry = self.registry;
        Repeater::with_buffer(policy, move |push, stop| async move {
            let mut running: FuturesUnordered<_> = registry.take().into_iter().collect();
            debug!(pending = running.len(), "publishing initial payload");
            push.send(initial.with_has_next(!running.is_empty())).await?;

            while !running.is_empty() {
                let joined = tokio::select! {
                    biased;
                    () = stop.stopped() => break,
                    Some(joined) = running.next() => joined,
                };
                running.extend(registry.take());
                let has_next = !running.is_empty();

                let payload = match joined {
                    Ok(completion) => completion.into_payload(has_next),
                    Err(err) if err.is_cancelled() => None,
                    Err(err) => {
                        warn!(%err, "incremental work failed");
                        Some(
                            Response::error(FieldError::new(format!(
                                "Incremental execution failed: {err}"
                            )))
                            .with_has_next(has_next),
                        )
                    }
                };
                if let Some(payload) = payload {
                    trace!(has_next, "publishing incremental payload");
                    push.send(payload).await?;
                }
            }

            let outstanding = registry.close();
            if !running.is_empty() || !outstanding.is_empty() {
                debug!(
                    aborted = running.len() + outstanding.len(),
                    "aborting outstanding incremental work"
                );
            }
            for handle in running.iter().chain(outstanding.iter()) {
                handle.abort();
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bgql_repeater::Iteration;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    fn deferred(path: &str, data: Value, delay_ms: u64) -> impl Future<Output = Completion> {
        let path = vec![PathSegment::from(path)];
        async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            Completion::Deferred {
                path,
                label: None,
                data,
                errors: Vec::new(),
            }
        }
    }

    async fn payloads(stream: ResponseStream) -> Vec<Value> {
        stream
            .map(|payload| serde_json::to_value(payload.unwrap()).unwrap())
            .collect()
            .await
    }

    #[tokio::test]
    async fn test_publish_in_completion_order() {
        let registry = IncrementalRegistry::default();
        registry.spawn(deferred("slow", json!({"a": 1}), 40));
        registry.spawn(deferred("fast", json!({"b": 2}), 5));

        let stream = IncrementalPublisher::new(registry)
            .publish(Response::data(json!({})), BufferPolicy::default());

        assert_eq!(
            payloads(stream).await,
            vec![
                json!({"data": {}, "hasNext": true}),
                json!({"data": {"b": 2}, "path": ["fast"], "hasNext": true}),
                json!({"data": {"a": 1}, "path": ["slow"], "hasNext": false}),
            ]
        );
    }

    #[tokio::test]
    async fn test_work_registered_by_work() {
        let registry = IncrementalRegistry::default();
        let nested = registry.clone();
        registry.spawn(async move {
            nested.spawn(deferred("inner", json!(2), 5));
            Completion::Deferred {
                path: vec!["outer".into()],
                label: Some("outer".to_string()),
                data: json!(1),
                errors: Vec::new(),
            }
        });

        let stream = IncrementalPublisher::new(registry)
            .publish(Response::data(json!({})), BufferPolicy::default());

        assert_eq!(
            payloads(stream).await,
            vec![
                json!({"data": {}, "hasNext": true}),
                json!({"data": 1, "path": ["outer"], "label": "outer", "hasNext": true}),
                json!({"data": 2, "path": ["inner"], "hasNext": false}),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_end_closes_sequence() {
        let registry = IncrementalRegistry::default();
        registry.spawn(async {
            Completion::StreamEnded {
                path: vec!["list".into()],
                label: None,
            }
        });

        let stream = IncrementalPublisher::new(registry)
            .publish(Response::data(json!({"list": []})), BufferPolicy::default());

        assert_eq!(
            payloads(stream).await,
            vec![
                json!({"data": {"list": []}, "hasNext": true}),
                json!({"path": ["list"], "hasNext": false}),
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_end_is_silent_while_work_remains() {
        let registry = IncrementalRegistry::default();
        registry.spawn(async {
            Completion::StreamEnded {
                path: vec!["list".into()],
                label: None,
            }
        });
        registry.spawn(deferred("later", json!(null), 30));

        let stream = IncrementalPublisher::new(registry)
            .publish(Response::data(json!({})), BufferPolicy::default());

        assert_eq!(
            payloads(stream).await,
            vec![
                json!({"data": {}, "hasNext": true}),
                json!({"data": null, "path": ["later"], "hasNext": false}),
            ]
        );
    }

    #[tokio::test]
    async fn test_errors_stay_with_their_payload() {
        let registry = IncrementalRegistry::default();
        registry.spawn(async {
            Completion::Deferred {
                path: vec!["broken".into()],
                label: None,
                data: json!({"x": null}),
                errors: vec![FieldError::new("boom").with_path(vec!["broken".into(), "x".into()])],
            }
        });
        registry.spawn(deferred("fine", json!({"y": 1}), 20));

        let stream = IncrementalPublisher::new(registry)
            .publish(Response::data(json!({})), BufferPolicy::default());
        let payloads = payloads(stream).await;

        assert_eq!(payloads.len(), 3);
        assert!(payloads[0].get("errors").is_none());
        assert_eq!(payloads[1]["errors"][0]["message"], "boom");
        assert_eq!(payloads[1]["errors"][0]["path"], json!(["broken", "x"]));
        assert!(payloads[2].get("errors").is_none());
        assert_eq!(payloads[2]["hasNext"], json!(false));
    }

    #[tokio::test]
    async fn test_close_aborts_outstanding_work() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&finished);
        let registry = IncrementalRegistry::default();
        registry.spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
            Completion::StreamEnded {
                path: Vec::new(),
                label: None,
            }
        });

        let stream = IncrementalPublisher::new(registry.clone())
            .publish(Response::data(json!({})), BufferPolicy::default());

        let first = stream.next().unwrap().await.unwrap();
        assert!(matches!(first, Iteration::Next(ref r) if r.has_next == Some(true)));
        assert_eq!(stream.close().await, Ok(Iteration::Done(None)));

        // Work registered after closing never runs to completion either.
        registry.spawn(deferred("late", json!(null), 0));
        assert!(registry.is_empty());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }
}
