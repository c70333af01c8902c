use molt_map::HashSet;
use std::sync::Arc;
use std::thread;

#[test]
fn insert_contains_remove() {
    let s: HashSet<String> = HashSet::new();
    assert!(s.insert("alpha".into()));
    assert!(s.insert("beta".into()));
    assert!(!s.insert("alpha".into()));
    assert_eq!(s.len(), 2);

    assert_eq!(s.find(&"alpha".to_owned()).as_deref(), Some("alpha"));
    assert_eq!(s.remove(&"alpha".to_owned()).as_deref(), Some("alpha"));
    assert!(!s.contains(&"alpha".to_owned()));
    assert_eq!(s.len(), 1);
}

#[test]
fn growth_keeps_members() {
    let s: HashSet<i32> = HashSet::with_capacity(8);
    for i in -2000..2000 {
        assert!(s.insert(i));
    }
    assert_eq!(s.len(), 4000);
    for i in -2000..2000 {
        assert!(s.contains(&i), "missing {i}");
    }
    assert_eq!(s.iter().count(), 4000);
}

#[test]
fn clear_in_place() {
    let s: HashSet<i32> = (0..100).collect();
    s.clear();
    s.clear();
    assert!(s.is_empty());
    assert!(s.insert(1));
    assert_eq!(s.len(), 1);
}

#[test]
fn swap_and_assign() {
    let a: HashSet<i32> = (0..10).collect();
    let b: HashSet<i32> = (100..120).collect();

    a.swap(&b);
    assert_eq!(a.len(), 20);
    assert_eq!(b.len(), 10);
    assert!(a.contains(&100));
    assert!(b.contains(&0));

    a.assign(0..5);
    assert_eq!(a.len(), 5);
    assert!(!a.contains(&100));
}

#[test]
fn set_equality_ignores_order() {
    let a: HashSet<i32> = (0..50).collect();
    let b: HashSet<i32> = (0..50).rev().collect();
    assert_eq!(a, b);
}

#[test]
fn concurrent_insert_same_universe() {
    const THREADS: usize = 8;
    const UNIVERSE: usize = 4096;

    let s: Arc<HashSet<usize>> = Arc::new(HashSet::new());
    let mut handles = vec![];
    for t in 0..THREADS {
        let s = Arc::clone(&s);
        handles.push(thread::spawn(move || {
            let mut mine = 0usize;
            for i in 0..UNIVERSE {
                // Stripe the starting point so threads collide.
                let k = (i + t * 37) % UNIVERSE;
                if s.insert(k) {
                    mine += 1;
                }
            }
            mine
        }));
    }

    let mut total = 0;
    for h in handles {
        total += h.join().unwrap();
    }

    // Every key was inserted by exactly one thread.
    assert_eq!(total, UNIVERSE);
    assert_eq!(s.len(), UNIVERSE);
    assert_eq!(s.iter().count(), UNIVERSE);
}

#[test]
fn wrappers_reclaimed_after_erase() {
    let token = Arc::new(());
    {
        let s: HashSet<Arc<()>> = HashSet::new();
        s.insert(Arc::clone(&token));
        assert!(s.erase(&Arc::clone(&token)));
        molt::flush_finalizers();
    }
    molt::flush_finalizers();
    assert_eq!(Arc::strong_count(&token), 1);
}
