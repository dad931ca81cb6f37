//! Unbounded blocking MPMC queue with shutdown sentinels.

use crate::error::{Result, SutError};
use flume::{Receiver, Sender};

#[derive(Debug, PartialEq, Eq)]
pub enum QueueItem<T> {
    Work(T),
    Sentinel,
}

pub struct WorkQueue<T> {
    tx: Sender<QueueItem<T>>,
    rx: Receiver<QueueItem<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WorkQueue<T> {
    pub fn new() -> Self {
        let (tx, rx) = flume::unbounded();
        Self { tx, rx }
    }

    pub fn push(&self, item: T) -> Result<()> {
        self.tx
            .send(QueueItem::Work(item))
            .map_err(|_| SutError::Disconnected)
    }

    /// One sentinel per consumer, so each consumer observes exactly one.
    pub fn push_sentinels(&self, count: usize) -> Result<()> {
        for _ in 0..count {
            self.tx
                .send(QueueItem::Sentinel)
                .map_err(|_| SutError::Disconnected)?;
        }
        Ok(())
    }

    /// Blocks until an item is available.
    pub fn pop(&self) -> Result<QueueItem<T>> {
        self.rx.recv().map_err(|_| SutError::Disconnected)
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    /// Removes whatever is left, returning only real work.
    pub fn drain(&self) -> Vec<T> {
        self.rx
            .try_iter()
            .filter_map(|item| match item {
                QueueItem::Work(work) => Some(work),
                QueueItem::Sentinel => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn fifo_then_sentinel() {
        let queue = WorkQueue::new();
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        queue.push_sentinels(1).unwrap();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().unwrap(), QueueItem::Work(1));
        assert_eq!(queue.pop().unwrap(), QueueItem::Work(2));
        assert_eq!(queue.pop().unwrap(), QueueItem::Sentinel);
        assert!(queue.is_empty());
    }

    #[test]
    fn each_consumer_sees_one_sentinel() {
        let queue = WorkQueue::<usize>::new();
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                thread::spawn(move || {
                    let mut seen = 0;
                    loop {
                        match queue.pop().unwrap() {
                            QueueItem::Work(_) => seen += 1,
                            QueueItem::Sentinel => break,
                        }
                    }
                    seen
                })
            })
            .collect();
        for i in 0..100 {
            queue.push(i).unwrap();
        }
        queue.push_sentinels(4).unwrap();
        let total: usize = consumers.into_iter().map(|c| c.join().unwrap()).sum();
        assert_eq!(total, 100);
        assert!(queue.is_empty());
    }

    #[test]
    fn drain_skips_sentinels() {
        let queue = WorkQueue::new();
        queue.push("a").unwrap();
        queue.push_sentinels(2).unwrap();
        queue.push("b").unwrap();
        assert_eq!(queue.drain(), vec!["a", "b"]);
        assert!(queue.is_empty());
    }
}
