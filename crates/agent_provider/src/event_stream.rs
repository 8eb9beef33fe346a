//! Single-consumer push/pull event channel that ends at the first terminal event.

use std::pin::Pin;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::event::AssistantMessageEvent;
use crate::message::AssistantMessage;

/// Producer half. Pushing never blocks; events after the terminal one are dropped.
#[derive(Debug)]
pub struct EventSink<E> {
    sender: mpsc::UnboundedSender<E>,
    is_terminal: fn(&E) -> bool,
    ended: Arc<AtomicBool>,
}

impl<E> Clone for EventSink<E> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            is_terminal: self.is_terminal,
            ended: Arc::clone(&self.ended),
        }
    }
}

impl<E> EventSink<E> {
    /// Pushes one event. Returns false when the stream already ended or the consumer is gone.
    pub fn push(&self, event: E) -> bool {
        if self.ended.load(Ordering::Acquire) {
            return false;
        }
        if (self.is_terminal)(&event) {
            self.ended.store(true, Ordering::Release);
        }
        self.sender.send(event).is_ok()
    }

    /// True once a terminal event was pushed or the consumer dropped its half.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ended.load(Ordering::Acquire) || self.sender.is_closed()
    }
}

/// Consumer half. Yields events in push order up to and including the first terminal event.
#[derive(Debug)]
pub struct EventStream<E, R> {
    receiver: mpsc::UnboundedReceiver<E>,
    is_terminal: fn(&E) -> bool,
    extract: fn(&E) -> Option<R>,
    result: Option<R>,
    finished: bool,
}

/// Creates a connected sink/stream pair.
#[must_use]
pub fn event_stream<E, R>(
    is_terminal: fn(&E) -> bool,
    extract: fn(&E) -> Option<R>,
) -> (EventSink<E>, EventStream<E, R>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        EventSink {
            sender,
            is_terminal,
            ended: Arc::new(AtomicBool::new(false)),
        },
        EventStream {
            receiver,
            is_terminal,
            extract,
            result: None,
            finished: false,
        },
    )
}

impl<E, R> EventStream<E, R> {
    /// Next event, or `None` after the terminal event or once the producer disappears.
    pub async fn next(&mut self) -> Option<E> {
        if self.finished {
            return None;
        }
        let event = self.receiver.recv().await;
        self.observe(event)
    }

    /// Drains remaining events and returns the extracted result.
    ///
    /// `None` means the producer went away without a terminal event.
    pub async fn result(mut self) -> Option<R> {
        while self.next().await.is_some() {}
        self.result
    }

    /// Result extracted so far, available once the terminal event was yielded.
    #[must_use]
    pub fn take_result(&mut self) -> Option<R> {
        self.result.take()
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn observe(&mut self, event: Option<E>) -> Option<E> {
        match event {
            Some(event) => {
                if (self.is_terminal)(&event) {
                    self.result = (self.extract)(&event);
                    self.finished = true;
                    self.receiver.close();
                }
                Some(event)
            }
            None => {
                self.finished = true;
                None
            }
        }
    }
}

impl<E, R> Stream for EventStream<E, R>
where
    E: Unpin,
    R: Unpin,
{
    type Item = E;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<E>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }
        match this.receiver.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(this.observe(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub type AssistantMessageEventSink = EventSink<AssistantMessageEvent>;
pub type AssistantMessageEventStream = EventStream<AssistantMessageEvent, AssistantMessage>;

/// Sink/stream pair for one assistant response.
#[must_use]
pub fn assistant_message_stream() -> (AssistantMessageEventSink, AssistantMessageEventStream) {
    event_stream(
        AssistantMessageEvent::is_terminal,
        AssistantMessageEvent::final_message,
    )
}
