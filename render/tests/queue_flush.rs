//! Cross-thread command queue behavior at volume.

use std::sync::{Arc, Mutex};
use std::thread;

use granite_render::{RenderCommandContext, RenderCommandQueue};

#[test]
fn ten_thousand_commands_flush_in_fifo_order() {
    let queue = Arc::new(RenderCommandQueue::new());
    let seen = Arc::new(Mutex::new(Vec::with_capacity(10_000)));

    let producer_queue = Arc::clone(&queue);
    let producer_seen = Arc::clone(&seen);
    let producer = thread::spawn(move || {
        for i in 1..=10_000u32 {
            let seen = Arc::clone(&producer_seen);
            producer_queue.enqueue("append_index", move |_ctx| {
                seen.lock().unwrap().push(i);
            });
        }
    });
    producer.join().unwrap();

    // This thread becomes the consumer; flush drains inline.
    queue.flush();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 10_000);
    assert!(seen.iter().copied().eq(1..=10_000));
    assert_eq!(queue.total_enqueued(), 10_000);
    assert_eq!(queue.total_executed(), 10_000);
    assert_eq!(queue.pending_count(), 0);
}

#[test]
fn interleaved_producers_preserve_per_producer_order() {
    let queue = Arc::new(RenderCommandQueue::new());
    let seen = Arc::new(Mutex::new(Vec::new()));

    let mut producers = Vec::new();
    for producer_id in 0..4u32 {
        let queue = Arc::clone(&queue);
        let seen = Arc::clone(&seen);
        producers.push(thread::spawn(move || {
            for i in 0..500u32 {
                let seen = Arc::clone(&seen);
                queue.enqueue("tagged_append", move |_ctx| {
                    seen.lock().unwrap().push((producer_id, i));
                });
            }
        }));
    }
    for p in producers {
        p.join().unwrap();
    }
    queue.flush();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 2000);
    // Each producer's own commands appear in its submission order.
    for producer_id in 0..4u32 {
        let indices: Vec<u32> = seen
            .iter()
            .filter(|(p, _)| *p == producer_id)
            .map(|(_, i)| *i)
            .collect();
        assert!(indices.iter().copied().eq(0..500));
    }
}

#[test]
fn commands_observe_frame_context() {
    let queue = RenderCommandQueue::new();
    let observed = Arc::new(Mutex::new(0u64));
    let slot = Arc::clone(&observed);
    queue.enqueue("record_frame", move |ctx| {
        *slot.lock().unwrap() = ctx.frame_number;
    });
    let mut ctx = RenderCommandContext::new(None, 42);
    queue.execute_commands(&mut ctx);
    assert_eq!(*observed.lock().unwrap(), 42);
}
