//! Bounded FIFO queue feeding the worker pool

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum PushError<T> {
    Full(T),
    Closed(T),
}

#[derive(Debug)]
struct State<T> {
    jobs: VecDeque<T>,
    closed: bool,
}

/// Pending jobs. Pushing never waits: a full queue rejects the job.
#[derive(Debug)]
pub(crate) struct JobQueue<T> {
    state: Mutex<State<T>>,
    capacity: usize,
    available: Notify,
}

impl<T> JobQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                jobs: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            available: Notify::new(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, job: T) -> Result<(), PushError<T>> {
        {
            let mut state = self.state();
            if state.closed {
                return Err(PushError::Closed(job));
            }
            if state.jobs.len() >= self.capacity {
                return Err(PushError::Full(job));
            }
            state.jobs.push_back(job);
        }
        self.available.notify_one();
        Ok(())
    }

    /// Take the oldest job without waiting
    #[cfg(test)]
    pub fn pop(&self) -> Option<T> {
        self.state().jobs.pop_front()
    }

    /// Wait for the next job. Returns `None` once the queue is closed and empty.
    pub async fn next(&self) -> Option<T> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(job) = state.jobs.pop_front() {
                    // Pass the wakeup on in case more jobs are waiting.
                    if !state.jobs.is_empty() {
                        self.available.notify_one();
                    }
                    return Some(job);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Remove the first job matching `predicate`
    pub fn remove(&self, predicate: impl Fn(&T) -> bool) -> Option<T> {
        let mut state = self.state();
        let index = state.jobs.iter().position(predicate)?;
        state.jobs.remove(index)
    }

    /// Stop accepting jobs; queued jobs are still handed out
    pub fn close(&self) {
        self.state().closed = true;
        self.available.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state().jobs.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn fifo_order() {
        let queue = JobQueue::new(4);
        for job in 1..=3 {
            queue.push(job).unwrap();
        }
        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn full_queue_rejects_immediately() {
        let queue = JobQueue::new(1);
        queue.push("a").unwrap();
        assert_eq!(queue.push("b"), Err(PushError::Full("b")));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn closed_queue_rejects_but_drains() {
        let queue = JobQueue::new(2);
        queue.push(1).unwrap();
        queue.close();
        assert_eq!(queue.push(2), Err(PushError::Closed(2)));
        assert_eq!(queue.pop(), Some(1));
    }

    #[test]
    fn remove_by_predicate() {
        let queue = JobQueue::new(4);
        for job in [10, 20, 30] {
            queue.push(job).unwrap();
        }
        assert_eq!(queue.remove(|job| *job == 20), Some(20));
        assert_eq!(queue.remove(|job| *job == 20), None);
        assert_eq!(queue.pop(), Some(10));
        assert_eq!(queue.pop(), Some(30));
    }

    #[tokio::test]
    async fn next_waits_for_push() {
        let queue = Arc::new(JobQueue::new(1));
        let waiter = tokio::spawn({
            let queue = queue.clone();
            async move { queue.next().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(7).unwrap();
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn close_wakes_idle_consumers() {
        let queue: Arc<JobQueue<u32>> = Arc::new(JobQueue::new(1));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.next().await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.close();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }
}
