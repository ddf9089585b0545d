// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferred work, run outside the event channel upcall.
//!
//! Register writes only record what happened. Ready and notify callbacks of
//! the embedding backend are invoked later from a [`WorkQueue`].

use crate::device::DeviceInner;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;

pub type Job = Box<dyn FnOnce() + Send>;

/// Executes jobs in a context that may block.
pub trait WorkQueue: Send + Sync {
    /// Runs `job` once `delay` has passed.
    fn schedule(&self, delay: Duration, job: Job);
}

struct Timed {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for Timed {
    fn eq(&self, other: &Self) -> bool {
        (self.deadline, self.seq) == (other.deadline, other.seq)
    }
}

impl Eq for Timed {}

impl PartialOrd for Timed {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Timed {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

/// A [`WorkQueue`] backed by one dedicated thread.
///
/// Jobs run in deadline order; jobs with equal deadlines run in submission
/// order. Dropping the queue runs nothing further and joins the thread.
pub struct ThreadWorkQueue {
    send: parking_lot::Mutex<Option<mpsc::Sender<(Instant, Job)>>>,
    thread: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl ThreadWorkQueue {
    pub fn new(name: &str) -> std::io::Result<Self> {
        let (send, recv) = mpsc::channel();
        let thread = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || run(recv))?;
        Ok(Self {
            send: parking_lot::Mutex::new(Some(send)),
            thread: parking_lot::Mutex::new(Some(thread)),
        })
    }
}

impl WorkQueue for ThreadWorkQueue {
    fn schedule(&self, delay: Duration, job: Job) {
        if let Some(send) = &*self.send.lock() {
            // The worker only goes away after the sender is dropped.
            let _ = send.send((Instant::now() + delay, job));
        }
    }
}

impl Drop for ThreadWorkQueue {
    fn drop(&mut self) {
        self.send.lock().take();
        if let Some(thread) = self.thread.lock().take() {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl DeviceInner {
    pub(crate) fn schedule_ready(&self) {
        let this = self.this.clone();
        self.work.schedule(
            Duration::ZERO,
            Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.dispatch_ready();
                }
            }),
        );
    }

    pub(crate) fn schedule_notify(&self, queue: u16) {
        let this = self.this.clone();
        self.work.schedule(
            Duration::ZERO,
            Box::new(move || {
                if let Some(this) = this.upgrade() {
                    this.dispatch_notify(queue);
                }
            }),
        );
    }

    /// Reports every queue that became ready since the last report.
    pub(crate) fn dispatch_ready(&self) {
        let Some(callback) = self.ready_cb.lock().clone() else {
            tracing::debug!("no ready callback registered");
            return;
        };
        let ready: Vec<u16> = self
            .queues
            .iter()
            .filter(|slot| {
                let mut ctx = slot.ctx.lock();
                let report = ctx.is_ready() && !ctx.ready_notified;
                if report {
                    ctx.ready_notified = true;
                }
                report
            })
            .map(|slot| slot.index)
            .collect();
        for queue in ready {
            tracing::debug!(queue, "queue ready");
            callback(queue);
        }
    }

    pub(crate) fn dispatch_notify(&self, queue: u16) {
        let Some(slot) = self.queues.get(usize::from(queue)) else {
            return;
        };
        let callback = {
            let ctx = slot.ctx.lock();
            if !ctx.is_ready() {
                tracing::debug!(queue, "notify for a queue that is not ready");
                return;
            }
            ctx.notify.clone()
        };
        match callback {
            Some(callback) => callback(queue),
            None => tracing::debug!(queue, "no notify callback registered"),
        }
    }
}

fn run(recv: mpsc::Receiver<(Instant, Job)>) {
    let mut pending = BinaryHeap::new();
    let mut seq = 0;
    loop {
        let now = Instant::now();
        while pending
            .peek()
            .is_some_and(|next: &Reverse<Timed>| next.0.deadline <= now)
        {
            if let Some(Reverse(timed)) = pending.pop() {
                (timed.job)();
            }
        }

        let next = match pending.peek() {
            Some(Reverse(timed)) => recv.recv_timeout(timed.deadline.saturating_duration_since(now)),
            None => recv.recv().map_err(|_| mpsc::RecvTimeoutError::Disconnected),
        };
        match next {
            Ok((deadline, job)) => {
                pending.push(Reverse(Timed { deadline, seq, job }));
                seq += 1;
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
}
