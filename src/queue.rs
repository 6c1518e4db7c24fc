// SPDX-FileCopyrightText: © 2025 Phala Network <dstack@phala.network>
//
// SPDX-License-Identifier: Apache-2.0

//! Message passing between the pipeline stages

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::command::Tpm2Command;
use crate::connection::Connection;
use crate::response::Tpm2Response;

/// Control messages delivered in-band with commands
#[derive(Debug, Clone)]
pub enum ControlMessage {
    /// Stop the worker; forwarded downstream before it exits
    CheckCancel,
    /// A client connection closed; its sessions must be flushed or abandoned
    ConnectionRemoved(Arc<Connection>),
}

/// Work items flowing through the resource manager
#[derive(Debug)]
pub enum Message {
    Command(Tpm2Command),
    Response(Tpm2Response),
    Control(ControlMessage),
}

/// Downstream delivery endpoint
pub trait Sink: Send + Sync {
    fn enqueue(&self, msg: Message);
}

#[derive(Debug, Default)]
struct QueueInner {
    items: VecDeque<Message>,
    closed: bool,
}

/// Blocking FIFO connecting pipeline stages.
///
/// `dequeue` blocks until an item arrives or the queue is closed; after
/// `close`, remaining items are still drained and then `None` is returned.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<QueueInner>,
    cond: Condvar,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn enqueue(&self, msg: Message) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.items.push_back(msg);
        self.cond.notify_one();
    }

    /// Blocking dequeue. `None` once the queue is closed and drained.
    pub fn dequeue(&self) -> Option<Message> {
        let mut inner = self.lock();
        loop {
            if let Some(msg) = inner.items.pop_front() {
                return Some(msg);
            }
            if inner.closed {
                return None;
            }
            inner = self
                .cond
                .wait(inner)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Close the queue, waking all blocked consumers
    pub fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }
}

impl Sink for MessageQueue {
    fn enqueue(&self, msg: Message) {
        MessageQueue::enqueue(self, msg);
    }
}
