//! Push-based broadcast of values, completion and errors.
//!
//! An [`EventStream`] has no lock of its own: emitting takes `&mut self`, so
//! the single owner of the stream is the only producer. Consumers hold
//! [`Subscription`]s, which are plain `futures::Stream`s.
//!
//! Two variants exist:
//! - **buffering** keeps every emitted value and the terminal signal, so a
//!   late subscriber still observes the whole sequence;
//! - **forward-only** keeps nothing, used for file chunks so a download never
//!   has to sit in memory.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::mpsc;
use futures::Stream;

use crate::error::StreamAbandoned;

#[derive(Debug, Clone)]
enum Signal<T, E> {
    Next(T),
    Complete,
    Error(E),
}

#[derive(Debug)]
pub struct EventStream<T, E> {
    subscribers: Vec<mpsc::UnboundedSender<Signal<T, E>>>,
    history: Option<Vec<Signal<T, E>>>,
    finished: bool,
}

impl<T: Clone, E: Clone> EventStream<T, E> {
    pub fn buffering() -> Self {
        Self {
            subscribers: Vec::new(),
            history: Some(Vec::new()),
            finished: false,
        }
    }

    pub fn forward_only() -> Self {
        Self {
            subscribers: Vec::new(),
            history: None,
            finished: false,
        }
    }

    pub fn subscribe(&mut self) -> Subscription<T, E> {
        let (tx, rx) = mpsc::unbounded();

        if let Some(history) = &self.history {
            for signal in history {
                let _ = tx.unbounded_send(signal.clone());
            }
        } else if self.finished {
            // Nothing to replay; a late subscriber just sees the end.
            let _ = tx.unbounded_send(Signal::Complete);
        }

        if !self.finished {
            self.subscribers.push(tx);
        }

        Subscription { rx, done: false }
    }

    pub fn next(&mut self, value: T) {
        self.emit(Signal::Next(value));
    }

    pub fn complete(&mut self) {
        self.emit(Signal::Complete);
        self.finished = true;
        self.subscribers.clear();
    }

    pub fn error(&mut self, error: E) {
        self.emit(Signal::Error(error));
        self.finished = true;
        self.subscribers.clear();
    }

    /// Whether any subscriber is still listening.
    pub fn has_subscribers(&self) -> bool {
        self.subscribers.iter().any(|tx| !tx.is_closed())
    }

    fn emit(&mut self, signal: Signal<T, E>) {
        if self.finished {
            return;
        }
        self.subscribers
            .retain(|tx| tx.unbounded_send(signal.clone()).is_ok());
        if let Some(history) = &mut self.history {
            history.push(signal);
        }
    }
}

/// Receiving end of an [`EventStream`].
///
/// Yields `Ok` for each value, then ends after completion. An error is
/// yielded once as `Err` and ends the subscription. A producer dropped
/// without a terminal signal yields [`StreamAbandoned`] as the final error,
/// so an aborted task is never mistaken for a complete sequence.
#[derive(Debug)]
pub struct Subscription<T, E> {
    rx: mpsc::UnboundedReceiver<Signal<T, E>>,
    done: bool,
}

impl<T, E: From<StreamAbandoned>> Stream for Subscription<T, E> {
    type Item = Result<T, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut self.rx).poll_next(cx) {
            Poll::Ready(Some(Signal::Next(value))) => Poll::Ready(Some(Ok(value))),
            Poll::Ready(Some(Signal::Error(error))) => {
                self.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(Signal::Complete)) => {
                self.done = true;
                Poll::Ready(None)
            }
            Poll::Ready(None) => {
                self.done = true;
                Poll::Ready(Some(Err(StreamAbandoned.into())))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    impl From<StreamAbandoned> for String {
        fn from(error: StreamAbandoned) -> Self {
            error.to_string()
        }
    }

    async fn drain(sub: Subscription<u32, String>) -> Vec<Result<u32, String>> {
        sub.collect().await
    }

    #[tokio::test]
    async fn test_buffering_replays_to_late_subscribers() {
        let mut stream = EventStream::<u32, String>::buffering();
        let early = stream.subscribe();

        stream.next(1);
        stream.next(2);
        let middle = stream.subscribe();
        stream.next(3);
        stream.complete();
        let late = stream.subscribe();

        let expected = vec![Ok(1), Ok(2), Ok(3)];
        assert_eq!(drain(early).await, expected);
        assert_eq!(drain(middle).await, expected);
        assert_eq!(drain(late).await, expected);
    }

    #[tokio::test]
    async fn test_forward_only_skips_past_values() {
        let mut stream = EventStream::<u32, String>::forward_only();
        let early = stream.subscribe();

        stream.next(1);
        let late = stream.subscribe();
        stream.next(2);
        stream.complete();

        assert_eq!(drain(early).await, vec![Ok(1), Ok(2)]);
        assert_eq!(drain(late).await, vec![Ok(2)]);
    }

    #[tokio::test]
    async fn test_error_ends_subscription() {
        let mut stream = EventStream::<u32, String>::buffering();
        let sub = stream.subscribe();

        stream.next(7);
        stream.error("disk on fire".to_string());
        stream.next(8);
        stream.complete();

        assert_eq!(
            drain(sub).await,
            vec![Ok(7), Err("disk on fire".to_string())]
        );
    }

    #[tokio::test]
    async fn test_dropped_producer_ends_with_error() {
        let mut stream = EventStream::<u32, String>::forward_only();
        let sub = stream.subscribe();
        stream.next(1);
        drop(stream);

        assert_eq!(
            drain(sub).await,
            vec![Ok(1), Err(StreamAbandoned.to_string())]
        );
    }

    #[tokio::test]
    async fn test_completed_then_dropped_producer_ends_cleanly() {
        let mut stream = EventStream::<u32, String>::buffering();
        let sub = stream.subscribe();
        stream.next(1);
        stream.complete();
        drop(stream);

        assert_eq!(drain(sub).await, vec![Ok(1)]);
    }

    #[test]
    fn test_has_subscribers_tracks_drops() {
        let mut stream = EventStream::<u32, String>::forward_only();
        assert!(!stream.has_subscribers());

        let sub = stream.subscribe();
        assert!(stream.has_subscribers());

        drop(sub);
        assert!(!stream.has_subscribers());
    }
}
