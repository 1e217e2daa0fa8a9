//! The interface for the backing packet store, and the stock drop-tail FIFO.

use std::collections::VecDeque;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Queue is at capacity")]
    Full,

    #[error(transparent)]
    Other(anyhow::Error),
}

/// An ordered packet store, bounded by a capacity ceiling.
///
/// A discipline owns exactly one of these. Packets are opaque to the queue;
/// they come back out of [PacketQueue::pop] in the order [PacketQueue::push]
/// accepted them.
///
/// Implementations backed by a secondary store may fail a push for reasons
/// of their own; the discipline reports such failures through its forced-drop
/// accounting rather than interpreting them.
pub trait PacketQueue<T>: Send {
    /// Appends a packet at the tail.
    fn push(&mut self, packet: T) -> Result<(), Error>;

    /// Removes and returns the head packet, or `None` if the queue is empty.
    fn pop(&mut self) -> Option<T>;

    /// The number of packets currently held.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The hard ceiling on [PacketQueue::len].
    fn capacity(&self) -> usize;
}

/// The default backing queue: an in-memory FIFO that refuses pushes at
/// capacity.
#[derive(Debug)]
pub struct DropTailQueue<T> {
    packets: VecDeque<T>,
    capacity: usize,
}

impl<T> DropTailQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
}

impl<T: Send> PacketQueue<T> for DropTailQueue<T> {
    fn push(&mut self, packet: T) -> Result<(), Error> {
        if self.packets.len() >= self.capacity {
            return Err(Error::Full);
        }
        self.packets.push_back(packet);
        Ok(())
    }

    fn pop(&mut self) -> Option<T> {
        self.packets.pop_front()
    }

    fn len(&self) -> usize {
        self.packets.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
