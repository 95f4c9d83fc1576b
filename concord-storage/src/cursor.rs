//! Lazy, forward-only result cursor.
//!
//! A [`CursorPopulator`] pushes items as a background load discovers them
//! and a [`ForwardCursor`] yields them as they arrive. The pair is backed by
//! a tokio mpsc channel carrying explicit completion and failure events, so
//! the consumer can tell a finished load from one whose producer vanished.

use std::future::{poll_fn, Future};
use std::pin::Pin;
use std::task::{Context, Poll};

use concord_core::{CursorError, PersistError, PersistResult};
use tokio::sync::mpsc;
use tokio_stream::Stream;
use tracing::{trace, warn};

enum CursorEvent<T> {
    Item(T),
    Failed(PersistError),
    Done,
}

enum EventSender<T> {
    Bounded(mpsc::Sender<CursorEvent<T>>),
    Unbounded(mpsc::UnboundedSender<CursorEvent<T>>),
}

impl<T> EventSender<T> {
    async fn send(&self, event: CursorEvent<T>) -> bool {
        match self {
            EventSender::Bounded(tx) => tx.send(event).await.is_ok(),
            EventSender::Unbounded(tx) => tx.send(event).is_ok(),
        }
    }
}

enum EventReceiver<T> {
    Bounded(mpsc::Receiver<CursorEvent<T>>),
    Unbounded(mpsc::UnboundedReceiver<CursorEvent<T>>),
}

impl<T> EventReceiver<T> {
    fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<CursorEvent<T>>> {
        match self {
            EventReceiver::Bounded(rx) => rx.poll_recv(cx),
            EventReceiver::Unbounded(rx) => rx.poll_recv(cx),
        }
    }

    fn blocking_recv(&mut self) -> Option<CursorEvent<T>> {
        match self {
            EventReceiver::Bounded(rx) => rx.blocking_recv(),
            EventReceiver::Unbounded(rx) => rx.blocking_recv(),
        }
    }

    fn close(&mut self) {
        match self {
            EventReceiver::Bounded(rx) => rx.close(),
            EventReceiver::Unbounded(rx) => rx.close(),
        }
    }
}

/// Create a connected populator and cursor.
///
/// With `buffer` set, `push` waits once that many items are pending;
/// otherwise the producer never waits on the consumer.
pub fn cursor_pair<T>(name: impl Into<String>, buffer: Option<usize>) -> (CursorPopulator<T>, ForwardCursor<T>) {
    let name = name.into();
    let (tx, rx) = match buffer {
        Some(capacity) => {
            let (tx, rx) = mpsc::channel(capacity.max(1));
            (EventSender::Bounded(tx), EventReceiver::Bounded(rx))
        }
        None => {
            let (tx, rx) = mpsc::unbounded_channel();
            (EventSender::Unbounded(tx), EventReceiver::Unbounded(rx))
        }
    };
    (
        CursorPopulator {
            name: name.clone(),
            tx,
            pushed: 0,
        },
        ForwardCursor {
            name,
            rx,
            finished: false,
        },
    )
}

/// Run `populate` on a background task and return its cursor.
pub fn spawn_cursor<T, F, Fut>(name: impl Into<String>, buffer: Option<usize>, populate: F) -> ForwardCursor<T>
where
    T: Send + 'static,
    F: FnOnce(CursorPopulator<T>) -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
{
    let (populator, cursor) = cursor_pair(name, buffer);
    tokio::spawn(populate(populator));
    cursor
}

/// Producer side of a cursor.
///
/// Dropping it without [`complete`](Self::complete) or
/// [`set_load_error`](Self::set_load_error) ends the cursor with
/// [`CursorError::ProducerDropped`].
pub struct CursorPopulator<T> {
    name: String,
    tx: EventSender<T>,
    pushed: usize,
}

impl<T> CursorPopulator<T> {
    /// Append an item. Returns `false` once the consumer has gone away, in
    /// which case the item is dropped.
    pub async fn push(&mut self, item: T) -> bool {
        if self.tx.send(CursorEvent::Item(item)).await {
            self.pushed += 1;
            true
        } else {
            warn!(cursor = %self.name, pushed = self.pushed, "Cursor consumer gone, dropping pushed item");
            false
        }
    }

    /// No more items will arrive.
    pub async fn complete(self) {
        trace!(cursor = %self.name, pushed = self.pushed, "Cursor complete");
        self.tx.send(CursorEvent::Done).await;
    }

    /// Production failed. The consumer sees the items pushed so far, then
    /// this error once, then the end.
    pub async fn set_load_error(self, err: PersistError) {
        warn!(cursor = %self.name, pushed = self.pushed, error = %err, "Cursor load failed");
        self.tx.send(CursorEvent::Failed(err)).await;
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Consumer side of a cursor. Forward-only and not restartable.
pub struct ForwardCursor<T> {
    name: String,
    rx: EventReceiver<T>,
    finished: bool,
}

impl<T> ForwardCursor<T> {
    /// Next item, waiting for the producer if needed. `None` is the end.
    pub async fn next(&mut self) -> Option<PersistResult<T>> {
        poll_fn(|cx| self.poll_item(cx)).await
    }

    /// Blocking variant of [`next`](Self::next) for callers outside the
    /// runtime. Panics if called from within an async context.
    pub fn blocking_next(&mut self) -> Option<PersistResult<T>> {
        if self.finished {
            return None;
        }
        let event = self.rx.blocking_recv();
        self.settle(event)
    }

    /// Drain the cursor, stopping at the first error.
    pub async fn collect(mut self) -> PersistResult<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn poll_item(&mut self, cx: &mut Context<'_>) -> Poll<Option<PersistResult<T>>> {
        if self.finished {
            return Poll::Ready(None);
        }
        match self.rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(self.settle(event)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn settle(&mut self, event: Option<CursorEvent<T>>) -> Option<PersistResult<T>> {
        match event {
            Some(CursorEvent::Item(item)) => Some(Ok(item)),
            Some(CursorEvent::Failed(err)) => {
                self.finish();
                Some(Err(err))
            }
            Some(CursorEvent::Done) => {
                self.finish();
                None
            }
            None => {
                self.finish();
                Some(Err(CursorError::ProducerDropped {
                    name: self.name.clone(),
                }
                .into()))
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.rx.close();
    }
}

impl<T> Unpin for ForwardCursor<T> {}

impl<T> Stream for ForwardCursor<T> {
    type Item = PersistResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_item(cx)
    }
}

impl<T> std::fmt::Debug for ForwardCursor<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForwardCursor")
            .field("name", &self.name)
            .field("finished", &self.finished)
            .finish()
    }
}
