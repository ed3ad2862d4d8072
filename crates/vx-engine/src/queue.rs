//! Multi-producer command queue
//!
//! The fast path is a bounded `rtrb` ring whose producer sits behind a
//! `parking_lot::Mutex`, so any thread may post. When the ring is full,
//! commands spill into an unbounded crossbeam channel instead of being
//! dropped.
//!
//! FIFO holds across the spill: while anything is waiting in the overflow
//! channel, new commands go there too, so the ring only ever holds commands
//! older than everything in the overflow.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, unbounded};
use parking_lot::Mutex;
use rtrb::{Consumer, Producer, PushError, RingBuffer};

struct Shared<T> {
    producer: Mutex<Producer<T>>,
    overflow_tx: Sender<T>,
    /// Commands sent to the overflow channel and not yet received
    overflow_pending: AtomicUsize,
    /// Total commands that ever spilled (diagnostics)
    overflow_total: AtomicUsize,
}

/// Sending half; cheap to clone
pub struct CommandSender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for CommandSender<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Receiving half; single consumer
pub struct CommandReceiver<T> {
    consumer: Consumer<T>,
    overflow_rx: Receiver<T>,
    shared: Arc<Shared<T>>,
}

/// Create a queue whose lock-free ring holds `capacity` commands
pub fn command_queue<T>(capacity: usize) -> (CommandSender<T>, CommandReceiver<T>) {
    let (producer, consumer) = RingBuffer::new(capacity.max(1));
    let (overflow_tx, overflow_rx) = unbounded();

    let shared = Arc::new(Shared {
        producer: Mutex::new(producer),
        overflow_tx,
        overflow_pending: AtomicUsize::new(0),
        overflow_total: AtomicUsize::new(0),
    });

    (
        CommandSender {
            shared: Arc::clone(&shared),
        },
        CommandReceiver {
            consumer,
            overflow_rx,
            shared,
        },
    )
}

impl<T> CommandSender<T> {
    /// Post a command; never blocks on the consumer
    pub fn send(&self, command: T) {
        let mut producer = self.shared.producer.lock();

        let command = if self.shared.overflow_pending.load(Ordering::Acquire) == 0 {
            match producer.push(command) {
                Ok(()) => return,
                Err(PushError::Full(command)) => command,
            }
        } else {
            command
        };

        // Still under the producer lock so concurrent senders keep their order
        self.shared.overflow_pending.fetch_add(1, Ordering::AcqRel);
        let total = self.shared.overflow_total.fetch_add(1, Ordering::Relaxed);
        if total == 0 {
            log::warn!("Command ring full, spilling to overflow queue");
        }
        // The receiver owns the other end for as long as `shared` lives
        let _ = self.shared.overflow_tx.send(command);
    }

    /// Number of commands that have ever gone through the overflow path
    pub fn overflow_count(&self) -> usize {
        self.shared.overflow_total.load(Ordering::Relaxed)
    }
}

impl<T> CommandReceiver<T> {
    /// Take the oldest command, if any
    pub fn pop(&mut self) -> Option<T> {
        if let Ok(command) = self.consumer.pop() {
            return Some(command);
        }

        if self.shared.overflow_pending.load(Ordering::Acquire) > 0 {
            if let Ok(command) = self.overflow_rx.try_recv() {
                self.shared.overflow_pending.fetch_sub(1, Ordering::AcqRel);
                return Some(command);
            }
        }
        None
    }

    /// Iterate over everything currently queued
    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        std::iter::from_fn(move || self.pop())
    }

    /// Commands currently queued (approximate while producers are active)
    pub fn len(&self) -> usize {
        self.consumer.slots() + self.shared.overflow_pending.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
