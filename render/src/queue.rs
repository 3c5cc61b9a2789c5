//! Render command queue.
//!
//! Producers on any thread enqueue closures that capture their data by
//! value; the render thread drains them in FIFO order inside the active
//! frame. The queue mutex is held only to swap the vector out — commands
//! run unlocked. `flush` executes inline when called from the consumer
//! thread (or before one is bound) and otherwise blocks on a condition
//! variable until the consumer has drained everything.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, ThreadId};

use granite_rhi::CommandList;

/// Context handed to every command during execution on the render thread.
pub struct RenderCommandContext {
    /// The active frame's command list, absent when flushing outside a
    /// frame.
    pub command_list: Option<Arc<Mutex<CommandList>>>,
    pub frame_number: u64,
}

impl RenderCommandContext {
    pub fn new(command_list: Option<Arc<Mutex<CommandList>>>, frame_number: u64) -> Self {
        RenderCommandContext {
            command_list,
            frame_number,
        }
    }

    pub fn empty() -> Self {
        RenderCommandContext {
            command_list: None,
            frame_number: 0,
        }
    }
}

type CommandFn = Box<dyn FnOnce(&mut RenderCommandContext) + Send>;

struct NamedCommand {
    debug_name: &'static str,
    run: CommandFn,
}

struct QueueInner {
    commands: Vec<NamedCommand>,
    consumer: Option<ThreadId>,
}

pub struct RenderCommandQueue {
    inner: Mutex<QueueInner>,
    drained: Condvar,
    executing: AtomicBool,
    total_enqueued: AtomicU64,
    total_executed: AtomicU64,
}

impl Default for RenderCommandQueue {
    fn default() -> Self {
        RenderCommandQueue::new()
    }
}

impl RenderCommandQueue {
    pub fn new() -> RenderCommandQueue {
        RenderCommandQueue {
            inner: Mutex::new(QueueInner {
                commands: Vec::new(),
                consumer: None,
            }),
            drained: Condvar::new(),
            executing: AtomicBool::new(false),
            total_enqueued: AtomicU64::new(0),
            total_executed: AtomicU64::new(0),
        }
    }

    /// Enqueues a command from any thread. Captures must be owned values —
    /// the closure runs later, on the render thread.
    pub fn enqueue<F>(&self, debug_name: &'static str, command: F)
    where
        F: FnOnce(&mut RenderCommandContext) + Send + 'static,
    {
        let mut inner = self.inner.lock().unwrap();
        inner.commands.push(NamedCommand {
            debug_name,
            run: Box::new(command),
        });
        self.total_enqueued.fetch_add(1, Ordering::Release);
    }

    /// Pins the calling thread as the consumer. Implied by the first
    /// `execute_commands` call.
    pub fn bind_consumer_thread(&self) {
        self.inner.lock().unwrap().consumer = Some(thread::current().id());
    }

    /// Drains the queue in FIFO order. Render thread only.
    pub fn execute_commands(&self, ctx: &mut RenderCommandContext) -> usize {
        let batch = {
            let mut inner = self.inner.lock().unwrap();
            if inner.consumer.is_none() {
                inner.consumer = Some(thread::current().id());
            }
            std::mem::take(&mut inner.commands)
        };

        self.executing.store(true, Ordering::Release);
        let mut executed = 0usize;
        for command in batch {
            log::trace!(target: "gfx-queue", "executing {}", command.debug_name);
            (command.run)(ctx);
            executed += 1;
            self.total_executed.fetch_add(1, Ordering::Release);
        }
        self.executing.store(false, Ordering::Release);

        if executed > 0 {
            self.drained.notify_all();
        }
        executed
    }

    /// Blocks until every enqueued command has executed. Runs the backlog
    /// inline when called from the consumer thread or before one exists;
    /// otherwise waits for the consumer to drain.
    pub fn flush(&self) {
        let on_consumer = {
            let inner = self.inner.lock().unwrap();
            match inner.consumer {
                Some(id) => id == thread::current().id(),
                None => true,
            }
        };

        if on_consumer {
            let mut ctx = RenderCommandContext::empty();
            while self.has_pending() {
                self.execute_commands(&mut ctx);
            }
            return;
        }

        let mut inner = self.inner.lock().unwrap();
        while self.total_executed.load(Ordering::Acquire)
            < self.total_enqueued.load(Ordering::Acquire)
        {
            inner = self.drained.wait(inner).unwrap();
        }
        drop(inner);
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_count(&self) -> u64 {
        self.total_enqueued
            .load(Ordering::Acquire)
            .saturating_sub(self.total_executed.load(Ordering::Acquire))
    }

    pub fn total_enqueued(&self) -> u64 {
        self.total_enqueued.load(Ordering::Acquire)
    }

    pub fn total_executed(&self) -> u64 {
        self.total_executed.load(Ordering::Acquire)
    }

    pub fn is_executing(&self) -> bool {
        self.executing.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order_single_producer() {
        let queue = RenderCommandQueue::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..100 {
            let seen = Arc::clone(&seen);
            queue.enqueue("push_index", move |_ctx| {
                seen.lock().unwrap().push(i);
            });
        }
        let mut ctx = RenderCommandContext::empty();
        queue.execute_commands(&mut ctx);
        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..100).collect::<Vec<_>>());
        assert_eq!(queue.total_executed(), 100);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn counters_balance_at_observation_points() {
        let queue = RenderCommandQueue::new();
        queue.enqueue("noop", |_| {});
        queue.enqueue("noop", |_| {});
        assert_eq!(
            queue.total_executed() + queue.pending_count(),
            queue.total_enqueued()
        );
        queue.execute_commands(&mut RenderCommandContext::empty());
        assert_eq!(
            queue.total_executed() + queue.pending_count(),
            queue.total_enqueued()
        );
    }

    #[test]
    fn flush_without_consumer_runs_inline() {
        let queue = RenderCommandQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        queue.enqueue("set_flag", move |_| flag.store(true, Ordering::Release));
        queue.flush();
        assert!(ran.load(Ordering::Acquire));
        assert!(!queue.has_pending());
    }

    #[test]
    fn flush_from_producer_waits_for_consumer() {
        let queue = Arc::new(RenderCommandQueue::new());
        queue.bind_consumer_thread();

        let producer_queue = Arc::clone(&queue);
        let producer = thread::spawn(move || {
            for _ in 0..10 {
                producer_queue.enqueue("noop", |_| {});
            }
            producer_queue.flush();
        });

        // Consumer loop on this thread until the producer's flush returns.
        let mut ctx = RenderCommandContext::empty();
        while !producer.is_finished() {
            queue.execute_commands(&mut ctx);
            thread::yield_now();
        }
        producer.join().unwrap();
        assert_eq!(queue.total_executed(), 10);
    }
}
