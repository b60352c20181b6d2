// This file is part of TRINCI.
//
// Copyright (C) 2021 Affidaty Spa.
//
// TRINCI is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the
// Free Software Foundation, either version 3 of the License, or (at your
// option) any later version.
//
// TRINCI is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License
// for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with TRINCI. If not, see <https://www.gnu.org/licenses/>.

//! Bounded multi-producer multi-consumer channel built on top of async-std
//! channel.
//!
//! Both ends are cloneable. Besides the blocking (async) operations, the
//! non-blocking `try_send`/`try_recv` pair is exposed since the hot paths of
//! the relayer never wait on a full queue.

use async_std::{
    channel::{
        self as async_channel, Receiver as AsyncReceiver, Sender as AsyncSender,
        TryRecvError as AsyncTryRecvError, TrySendError as AsyncTrySendError,
    },
    task,
};
use std::{fmt::Display, pin::Pin, time::Duration};

/// Default upper bound to outstanding channel elements.
pub const CHANNEL_BOUND: usize = 1000;

/// Errors which can be triggered by a channel.
#[derive(Debug, PartialEq, Eq)]
pub enum ChannelError {
    /// Error during send. Broken channel.
    SendError,
    /// Error during receive. Broken channel.
    RecvError,
    /// Timeout during receive.
    RecvTimeout,
    /// Nothing to receive right now.
    RecvEmpty,
}

impl std::error::Error for ChannelError {}

impl Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            ChannelError::SendError => "channel send error",
            ChannelError::RecvError => "channel recv error",
            ChannelError::RecvTimeout => "channel recv timeout",
            ChannelError::RecvEmpty => "channel empty",
        };
        write!(f, "{}", msg)
    }
}

/// Non blocking send failure. The rejected message is handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// Channel is at capacity.
    Full(T),
    /// Channel has been closed.
    Closed(T),
}

impl<T> TrySendError<T> {
    /// Get back the message that was not sent.
    pub fn into_inner(self) -> T {
        match self {
            TrySendError::Full(msg) | TrySendError::Closed(msg) => msg,
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, TrySendError::Full(_))
    }
}

/// Creates a mpmc channel with the default bound.
pub fn simple_channel<T>() -> (Sender<T>, Receiver<T>) {
    bounded_channel(CHANNEL_BOUND)
}

/// Creates a mpmc channel with an explicit bound.
/// A zero capacity is bumped to one.
pub fn bounded_channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (sender, receiver) = async_channel::bounded::<T>(capacity.max(1));
    (Sender(sender), Receiver(receiver))
}

/// Channel sender side.
pub struct Sender<T>(AsyncSender<T>);

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender(self.0.clone())
    }
}

impl<T> Sender<T> {
    /// Send a message, waiting for free space if the channel is full.
    pub async fn send(&self, msg: T) -> Result<(), ChannelError> {
        self.0.send(msg).await.map_err(|_| ChannelError::SendError)
    }

    /// Send a message, synchronous wrapper.
    pub fn send_sync(&self, msg: T) -> Result<(), ChannelError> {
        task::block_on(self.send(msg))
    }

    /// Send a message only if there is room for it.
    pub fn try_send(&self, msg: T) -> Result<(), TrySendError<T>> {
        self.0.try_send(msg).map_err(|err| match err {
            AsyncTrySendError::Full(msg) => TrySendError::Full(msg),
            AsyncTrySendError::Closed(msg) => TrySendError::Closed(msg),
        })
    }

    /// Number of messages waiting in the channel.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Channel capacity.
    pub fn capacity(&self) -> usize {
        self.0.capacity().unwrap_or(usize::MAX)
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed already.
    /// The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Channel receiver side.
pub struct Receiver<T>(AsyncReceiver<T>);

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver(self.0.clone())
    }
}

impl<T> Receiver<T> {
    /// Receive a message.
    ///
    /// This call is blocking.
    pub async fn recv(&self) -> Result<T, ChannelError> {
        self.0.recv().await.map_err(|_| ChannelError::RecvError)
    }

    /// Receive a message waiting at most `timeout`.
    pub async fn recv_timeout(&self, timeout: Duration) -> Result<T, ChannelError> {
        let mut timeout = timeout;
        let sleep_time = Duration::from_millis(10);
        loop {
            match self.0.try_recv() {
                Ok(res) => return Ok(res),
                Err(AsyncTryRecvError::Empty) if timeout > Duration::from_millis(0) => {
                    task::sleep(sleep_time).await;
                    timeout = timeout
                        .checked_sub(sleep_time)
                        .unwrap_or_else(|| Duration::from_millis(0));
                }
                Err(AsyncTryRecvError::Empty) => return Err(ChannelError::RecvTimeout),
                _ => return Err(ChannelError::RecvError),
            }
        }
    }

    /// Receive a message if one is immediately available.
    pub fn try_recv(&self) -> Result<T, ChannelError> {
        self.0.try_recv().map_err(|err| match err {
            AsyncTryRecvError::Empty => ChannelError::RecvEmpty,
            AsyncTryRecvError::Closed => ChannelError::RecvError,
        })
    }

    /// Receive a message, synchronous wrapper.
    pub fn recv_sync(&self) -> Result<T, ChannelError> {
        task::block_on(self.recv())
    }

    /// Receive a message with timeout, synchronous wrapper.
    pub fn recv_timeout_sync(&self, timeout: Duration) -> Result<T, ChannelError> {
        task::block_on(self.recv_timeout(timeout))
    }

    /// Number of messages waiting in the channel.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Closes the channel.
    /// Returns true if this call has closed the channel and it was not closed already.
    /// The remaining messages can still be received.
    pub fn close(&self) -> bool {
        self.0.close()
    }

    /// Returns true if the channel is closed.
    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }
}

/// Stream implementation for [Receiver].
impl<T> futures::Stream for Receiver<T> {
    type Item = T;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let pin = Pin::new(&mut self.0);
        pin.poll_next(cx)
    }
}
