//! Bounded FIFO of frames held while no transport is open.

use std::collections::VecDeque;

use protocol::Unit;

use crate::error::SockError;

/// One outbound message: a header unit and, when the message carries one,
/// its payload unit. The pair is queued and flushed together so a payload
/// never gets separated from its header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Frame {
    pub(crate) header: Unit,
    pub(crate) payload: Option<Unit>,
    /// Carries a correlation ID. Such a frame is meaningless once its
    /// connection is reset and the ID handed out again.
    pub(crate) correlated: bool,
}

#[derive(Debug)]
pub(crate) struct SendQueue {
    frames: VecDeque<Frame>,
    limit: usize,
}

impl SendQueue {
    pub(crate) fn new(limit: usize) -> Self {
        Self { frames: VecDeque::new(), limit }
    }

    /// Append a frame.
    ///
    /// # Errors
    ///
    /// Returns [`SockError::SocketClosed`] when the queue already holds
    /// `limit` frames. A zero limit rejects every frame.
    pub(crate) fn push(&mut self, frame: Frame) -> Result<(), SockError> {
        if self.frames.len() >= self.limit {
            return Err(SockError::SocketClosed);
        }
        self.frames.push_back(frame);
        Ok(())
    }

    /// Put a frame back at the head, ahead of everything queued after it.
    pub(crate) fn push_front(&mut self, frame: Frame) -> Result<(), SockError> {
        if self.frames.len() >= self.limit {
            return Err(SockError::SocketClosed);
        }
        self.frames.push_front(frame);
        Ok(())
    }

    pub(crate) fn pop(&mut self) -> Option<Frame> {
        self.frames.pop_front()
    }

    /// Drop every correlated frame, keeping notifications in order.
    /// Returns how many were dropped.
    pub(crate) fn drop_correlated(&mut self) -> usize {
        let before = self.frames.len();
        self.frames.retain(|frame| !frame.correlated);
        before - self.frames.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.frames.len()
    }

    pub(crate) fn set_limit(&mut self, limit: usize) {
        self.limit = limit;
    }
}

#[cfg(test)]
#[path = "sendq_test.rs"]
mod tests;
