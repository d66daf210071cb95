//! Two-tier FIFO used by both topics and channels.
//!
//! Messages live in a bounded memory ring until it fills, then spill to a
//! `DiskQueue`. Once the overflow holds anything, every new write goes to the
//! overflow too, and memory-only writes resume only after it fully drains.
//! Reads take memory first, then overflow. Together these keep one publish
//! order across both tiers: anything in memory was written before anything
//! still on disk.
//!
//! Requeued messages are the exception: `put_front` places them ahead of
//! everything, in memory, even past the bound.

use std::collections::VecDeque;

use tracing::error;

use crate::broker::message::Message;
use crate::persistence::DiskQueue;
use crate::utils::Result;

#[derive(Debug)]
pub struct BackedQueue {
    memory: VecDeque<Message>,
    mem_limit: usize,
    overflow: DiskQueue,
}

impl BackedQueue {
    pub fn new(mem_limit: usize, overflow: DiskQueue) -> Self {
        Self {
            memory: VecDeque::new(),
            mem_limit,
            overflow,
        }
    }

    pub fn put(&mut self, msg: Message) -> Result<()> {
        if self.overflow.is_empty() && self.memory.len() < self.mem_limit {
            self.memory.push_back(msg);
            return Ok(());
        }
        self.overflow.append(&msg.encode())?;
        Ok(())
    }

    pub fn put_front(&mut self, msg: Message) {
        self.memory.push_front(msg);
    }

    /// Next message in publish order. Undecodable overflow records are
    /// logged and skipped.
    pub fn pop(&mut self) -> Result<Option<Message>> {
        if let Some(msg) = self.memory.pop_front() {
            return Ok(Some(msg));
        }
        while let Some(bytes) = self.overflow.read_next()? {
            match Message::decode(&bytes) {
                Ok(msg) => return Ok(Some(msg)),
                Err(e) => error!(queue = self.overflow.name(), "skipping overflow record: {e}"),
            }
        }
        Ok(None)
    }

    pub fn depth(&self) -> u64 {
        self.memory.len() as u64 + self.overflow.depth()
    }

    pub fn memory_depth(&self) -> usize {
        self.memory.len()
    }

    pub fn backend_depth(&self) -> u64 {
        self.overflow.depth()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.is_empty() && self.overflow.is_empty()
    }

    /// Move every memory-resident message to the front of the overflow,
    /// keeping order, then sync.
    pub fn persist(&mut self) -> Result<()> {
        while let Some(msg) = self.memory.pop_back() {
            if let Err(e) = self.overflow.prepend(&msg.encode()) {
                self.memory.push_back(msg);
                return Err(e);
            }
        }
        self.overflow.sync()
    }

    pub fn sync(&self) -> Result<()> {
        self.overflow.sync()
    }

    /// Drop everything, memory and disk.
    pub fn clear(&mut self) -> Result<()> {
        self.memory.clear();
        self.overflow.clear()
    }
}
