//! The collector's worker pool.
//!
//! A fixed set of named threads driven over a channel. The collecting
//! thread posts one message per unit of work (a marking drive or a sweep
//! stripe) and waits for the matching completion acks; marking workers
//! additionally post messages themselves to wake more workers when the
//! full list grows. Workers park in `recv` between collections, so an
//! idle pool costs nothing.

use crate::gc::{marker, sweeper};
use crate::heap::Heap;
use crate::util::ptr::Ptr;
use crossbeam_channel::{Receiver, Sender};
use log::trace;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

enum Message {
    Mark(Ptr<Heap>, bool),
    Sweep(Ptr<Heap>, bool),
    Shutdown,
}

pub struct Pool {
    send: Sender<Message>,
    recv: Receiver<Message>,
    done_send: Sender<()>,
    done_recv: Receiver<()>,
    threads: usize,

    /// Work messages posted since the last `wait_idle`.
    sent: AtomicUsize,

    /// Work messages fully processed by workers.
    completed: AtomicUsize,
}

impl Pool {
    pub fn new(threads: usize) -> Arc<Pool> {
        let (send, recv) = crossbeam_channel::unbounded();
        let (done_send, done_recv) = crossbeam_channel::unbounded();

        let pool = Arc::new(Pool {
            send,
            recv,
            done_send,
            done_recv,
            threads,
            sent: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });

        for index in 0..threads {
            let pool = pool.clone();

            std::thread::Builder::new()
                .name(format!("greyline marker-{}", index))
                .spawn(move || loop {
                    match pool.recv.recv() {
                        Ok(Message::Mark(heap, collecting_old)) => {
                            trace!(
                                "{}: marking",
                                std::thread::current().name().unwrap_or("marker")
                            );
                            marker::mark_and_scale(heap.get(), collecting_old, &pool);
                            pool.completed.fetch_add(1, Ordering::Relaxed);
                            let _ = pool.done_send.send(());
                        }
                        Ok(Message::Sweep(heap, collecting_old)) => {
                            trace!(
                                "{}: sweeping",
                                std::thread::current().name().unwrap_or("marker")
                            );
                            sweeper::sweep(heap.get(), collecting_old);
                            pool.completed.fetch_add(1, Ordering::Relaxed);
                            let _ = pool.done_send.send(());
                        }
                        Ok(Message::Shutdown) | Err(_) => {
                            trace!(
                                "{}: shutdown",
                                std::thread::current().name().unwrap_or("marker")
                            );
                            break;
                        }
                    }
                })
                .unwrap();
        }

        pool
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Wakes workers until the number currently busy matches the amount
    /// of queued work. The target is clamped to the pool size so surplus
    /// workers do not spin on an empty full list; a worker woken after
    /// the work dried up finds no packet and goes straight back to sleep.
    pub fn scale_markers(&self, heap: Ptr<Heap>, collecting_old: bool, available: usize) {
        let target = available.min(self.threads);

        // Bounded to `target` sends per call: workers that finish while
        // this loop runs would otherwise keep `outstanding` low forever.
        for _ in 0..target {
            let outstanding = self
                .sent
                .load(Ordering::Relaxed)
                .saturating_sub(self.completed.load(Ordering::Relaxed));

            if outstanding >= target {
                return;
            }

            self.sent.fetch_add(1, Ordering::Relaxed);
            let _ = self.send.send(Message::Mark(heap, collecting_old));
        }
    }

    /// Posts one sweep stripe claim per worker.
    pub fn start_sweep(&self, heap: Ptr<Heap>, collecting_old: bool) {
        for _ in 0..self.threads {
            self.sent.fetch_add(1, Ordering::Relaxed);
            let _ = self.send.send(Message::Sweep(heap, collecting_old));
        }
    }

    /// Blocks until every posted work message has been acked. Only
    /// called after the work itself is known to be finished, so no new
    /// messages can appear while draining.
    pub fn wait_idle(&self) {
        let mut acked = 0;

        while acked < self.sent.load(Ordering::Relaxed) {
            let _ = self.done_recv.recv();
            acked += 1;
        }

        self.sent.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
    }

    /// Stops every worker. Called by the heap on teardown; the workers
    /// hold their own references to the pool, so relying on `Drop` alone
    /// would never run this.
    pub fn shutdown(&self) {
        for _ in 0..self.threads {
            let _ = self.send.send(Message::Shutdown);
        }
    }
}
