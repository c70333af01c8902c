use molt_queue::Queue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

#[test]
fn fifo_across_interleaved_ops() {
    let q = Queue::new();
    q.push("a".to_owned());
    q.push("b".to_owned());
    q.push("c".to_owned());
    assert_eq!(q.pop().as_deref(), Some("a"));
    assert_eq!(q.pop().as_deref(), Some("b"));
    q.push("d".to_owned());
    assert_eq!(q.pop().as_deref(), Some("c"));
    assert_eq!(q.pop().as_deref(), Some("d"));
    assert_eq!(q.pop(), None);
}

#[test]
fn growth_preserves_order() {
    let q = Queue::with_capacity(2);
    assert_eq!(q.capacity(), 2);

    let words = ["one", "two", "three", "four", "five"];
    for w in words {
        q.push(w.to_owned());
    }

    // Five pushes into a two-slot frame force at least two rearms.
    assert!(q.capacity() >= 8);
    for w in words {
        assert_eq!(q.pop().as_deref(), Some(w));
    }
    assert_eq!(q.pop(), None);
}

#[test]
fn empty_queue_edges() {
    let q: Queue<u32> = Queue::new();
    assert_eq!(q.pop(), None);
    assert_eq!(q.front(), None);
    assert_eq!(q.back(), None);
    assert_eq!(q.len(), 0);
    assert!(q.is_empty());
    assert_eq!(q.iter().count(), 0);
    q.clear();
    assert!(q.is_empty());
}

#[test]
fn double_swap_is_identity() {
    let a: Queue<i32> = [1, 2, 3].into_iter().collect();
    let b: Queue<i32> = [9].into_iter().collect();
    let a_snapshot: Vec<i32> = a.iter().collect();
    let b_snapshot: Vec<i32> = b.iter().collect();

    a.swap(&b);
    a.swap(&b);
    assert_eq!(a.iter().collect::<Vec<_>>(), a_snapshot);
    assert_eq!(b.iter().collect::<Vec<_>>(), b_snapshot);
}

#[test]
fn assign_and_clear() {
    let q: Queue<i32> = Queue::new();
    q.push(1);
    q.assign([5, 6, 7]);
    assert_eq!(q.iter().collect::<Vec<_>>(), [5, 6, 7]);
    assert_eq!(q.pop(), Some(5));
    q.clear();
    q.clear();
    assert!(q.is_empty());
}

#[test]
fn wrappers_reclaimed_after_pop() {
    let token = Arc::new(());
    {
        let q = Queue::new();
        for _ in 0..64 {
            q.push(Arc::clone(&token));
        }
        for _ in 0..64 {
            assert!(q.pop().is_some());
        }
        molt::flush_finalizers();
    }
    molt::flush_finalizers();
    assert_eq!(Arc::strong_count(&token), 1);
}

#[test]
fn concurrent_producers_consumers() {
    const PRODUCERS: usize = 4;
    const CONSUMERS: usize = 4;
    const PER_PRODUCER: usize = 10_000;

    let q: Arc<Queue<usize>> = Arc::new(Queue::with_capacity(4));
    let consumed = Arc::new(AtomicUsize::new(0));
    let mut handles = vec![];

    for p in 0..PRODUCERS {
        let q = Arc::clone(&q);
        handles.push(thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                q.push(p * PER_PRODUCER + i);
            }
        }));
    }

    let mut consumers = vec![];
    for _ in 0..CONSUMERS {
        let q = Arc::clone(&q);
        let consumed = Arc::clone(&consumed);
        consumers.push(thread::spawn(move || {
            let mut seen = Vec::new();
            while consumed.load(Ordering::SeqCst) < PRODUCERS * PER_PRODUCER {
                if let Some(v) = q.pop() {
                    consumed.fetch_add(1, Ordering::SeqCst);
                    seen.push(v);
                }
            }
            seen
        }));
    }

    for h in handles {
        h.join().unwrap();
    }

    let mut all: HashSet<usize> = HashSet::new();
    for c in consumers {
        for v in c.join().unwrap() {
            assert!(all.insert(v), "value {v} popped twice");
        }
    }
    assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
    assert!(q.is_empty());
}

#[test]
fn per_producer_order_is_kept() {
    const PER_PRODUCER: usize = 5_000;

    let q: Arc<Queue<usize>> = Arc::new(Queue::with_capacity(2));
    let producer = {
        let q = Arc::clone(&q);
        thread::spawn(move || {
            for i in 0..PER_PRODUCER {
                q.push(i);
            }
        })
    };

    let mut last_seen = None;
    let mut popped = 0;
    while popped < PER_PRODUCER {
        if let Some(v) = q.pop() {
            if let Some(prev) = last_seen {
                assert!(v > prev, "FIFO violated: {v} after {prev}");
            }
            last_seen = Some(v);
            popped += 1;
        }
    }
    producer.join().unwrap();
}
