use molt_list::SkipList;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::thread;

#[test]
fn ordered_iteration_after_random_inserts() {
    let l = SkipList::new();
    let mut keys: Vec<i32> = (0..500).collect();
    keys.shuffle(&mut rand::thread_rng());
    for k in &keys {
        assert!(l.insert(*k));
    }

    assert_eq!(l.len(), 500);
    let seen: Vec<i32> = l.iter().collect();
    let expected: Vec<i32> = (0..500).collect();
    assert_eq!(seen, expected);
}

#[test]
fn bounds_behave_like_neighbors() {
    let l: SkipList<i32> = [10, 20, 30, 40].into_iter().collect();

    assert_eq!(l.lower_bound(&25), Some(20));
    assert_eq!(l.lower_bound(&20), Some(10));
    assert_eq!(l.lower_bound(&10), None);
    assert_eq!(l.lower_bound(&100), Some(40));

    assert_eq!(l.upper_bound(&25), Some(30));
    assert_eq!(l.upper_bound(&20), Some(30));
    assert_eq!(l.upper_bound(&40), None);
    assert_eq!(l.upper_bound(&5), Some(10));
}

#[test]
fn erase_and_remove_semantics() {
    let l = SkipList::new();
    l.insert("x".to_owned());
    l.insert("y".to_owned());

    assert!(l.erase(&"x".to_owned()));
    assert!(!l.erase(&"x".to_owned()));
    assert_eq!(l.remove(&"y".to_owned()).as_deref(), Some("y"));
    assert_eq!(l.remove(&"y".to_owned()), None);
    assert!(l.is_empty());
}

#[test]
fn clear_and_assign() {
    let l: SkipList<i32> = (0..100).collect();
    l.clear();
    l.clear();
    assert!(l.is_empty());
    assert_eq!(l.iter().count(), 0);

    l.assign([3, 1, 2]);
    assert_eq!(l.iter().collect::<Vec<_>>(), [1, 2, 3]);
}

#[test]
fn double_swap_is_identity() {
    let a: SkipList<i32> = (0..10).collect();
    let b: SkipList<i32> = (100..105).collect();

    a.swap(&b);
    assert_eq!(a.len(), 5);
    assert!(a.contains(&100));
    a.swap(&b);
    assert_eq!(a.len(), 10);
    assert!(a.contains(&0));
    assert!(b.contains(&100));
}

#[test]
fn sixteen_thread_randomized_insert() {
    const THREADS: usize = 16;
    const KEYS: usize = 1000;

    let l: Arc<SkipList<String>> = Arc::new(SkipList::new());
    let mut handles = vec![];
    for _ in 0..THREADS {
        let l = Arc::clone(&l);
        handles.push(thread::spawn(move || {
            let mut keys: Vec<usize> = (1..=KEYS).collect();
            keys.shuffle(&mut rand::thread_rng());
            let mut won = 0usize;
            for k in keys {
                if l.insert(format!("{k:04}")) {
                    won += 1;
                }
            }
            won
        }));
    }

    let mut total = 0;
    for h in handles {
        total += h.join().unwrap();
    }

    // Each key admitted exactly once across all threads.
    assert_eq!(total, KEYS);
    assert_eq!(l.len(), KEYS);

    let seen: Vec<String> = l.iter().collect();
    let expected: Vec<String> = (1..=KEYS).map(|k| format!("{k:04}")).collect();
    assert_eq!(seen, expected);

    assert_eq!(l.lower_bound(&"0500".to_owned()).as_deref(), Some("0499"));
    assert_eq!(l.upper_bound(&"0500".to_owned()).as_deref(), Some("0501"));
}

#[test]
fn concurrent_insert_erase_churn() {
    const THREADS: usize = 8;
    const OPS: usize = 4000;

    let l: Arc<SkipList<usize>> = Arc::new(SkipList::new());
    let mut handles = vec![];
    for t in 0..THREADS {
        let l = Arc::clone(&l);
        handles.push(thread::spawn(move || {
            for i in 0..OPS {
                let k = (i * 7 + t) % 256;
                if i % 2 == 0 {
                    l.insert(k);
                } else {
                    l.erase(&k);
                }
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Whatever survived must still be strictly ordered and counted right.
    let seen: Vec<usize> = l.iter().collect();
    let mut sorted = seen.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(seen, sorted);
    assert_eq!(l.len(), seen.len());
}

#[test]
fn nodes_reclaimed_after_erase() {
    let token = Arc::new(());
    {
        let l: SkipList<(usize, Arc<()>)> = SkipList::new();
        for i in 0..64 {
            l.insert((i, Arc::clone(&token)));
        }
        for i in 0..64 {
            assert!(l.erase(&(i, Arc::clone(&token))));
        }
        molt::flush_finalizers();
    }
    molt::flush_finalizers();
    assert_eq!(Arc::strong_count(&token), 1);
}
