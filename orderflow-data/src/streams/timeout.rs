//! Read-timeout wrapper for WebSocket streams.
//!
//! A server that stops sending without closing the socket never produces an error on its own.
//! [`TimeoutStream`] yields [`DataError::ReadTimeout`] once nothing has arrived for the
//! configured period, which the connection manager treats as an unclean close.

use crate::error::DataError;
use futures::Stream;
use std::{
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

/// Default read timeout for the streaming connection.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
pub struct TimeoutStream<S> {
    inner: S,
    timeout_duration: Duration,
    deadline: Pin<Box<tokio::time::Sleep>>,
}

impl<S> TimeoutStream<S> {
    pub fn new(inner: S, timeout_duration: Duration) -> Self {
        Self {
            inner,
            timeout_duration,
            deadline: Box::pin(tokio::time::sleep(timeout_duration)),
        }
    }

    pub fn with_default_timeout(inner: S) -> Self {
        Self::new(inner, DEFAULT_READ_TIMEOUT)
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S> Stream for TimeoutStream<S>
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    type Item = Result<Message, DataError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let timeout_duration = self.timeout_duration;

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(item)) => {
                self.deadline.as_mut().reset(Instant::now() + timeout_duration);
                Poll::Ready(Some(item.map_err(DataError::from)))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => match self.deadline.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::warn!(
                        timeout_secs = timeout_duration.as_secs(),
                        "WebSocket read timeout, no data received"
                    );

                    // Avoid timing out again immediately if polled after the error
                    self.deadline.as_mut().reset(Instant::now() + timeout_duration);

                    Poll::Ready(Some(Err(DataError::ReadTimeout {
                        secs: timeout_duration.as_secs(),
                    })))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}
