#![cfg(loom)]

use reclaim_stack::{HazardStack, RefCountStack, Registry, SplitCountStack};

use loom::sync::Arc;
use loom::thread;

#[test]
fn split_concurrent_pops() {
    loom::model(|| {
        let stack = Arc::new(SplitCountStack::new());
        stack.push(1);
        stack.push(2);

        let s1 = Arc::clone(&stack);
        let t1 = thread::spawn(move || s1.pop());
        let mine = stack.pop();
        let theirs = t1.join().unwrap();

        let mut got = [mine.unwrap(), theirs.unwrap()];
        got.sort_unstable();
        assert_eq!(got, [1, 2]);
        assert!(stack.is_empty());

        // Every node was freed by whoever held its last reference.
        let counts = stack.node_counts();
        assert_eq!(counts.freed, 2);
    })
}

#[test]
fn split_push_races_pop() {
    loom::model(|| {
        let stack = Arc::new(SplitCountStack::new());
        stack.push(1);

        let s1 = Arc::clone(&stack);
        let t1 = thread::spawn(move || s1.push(2));
        let first = stack.pop();
        t1.join().unwrap();
        let second = stack.pop();

        let mut got = [first.unwrap(), second.unwrap()];
        got.sort_unstable();
        assert_eq!(got, [1, 2]);
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.node_counts().live(), 0);
    })
}

#[test]
fn split_push_races_two_pops() {
    loom::model(|| {
        let stack = Arc::new(SplitCountStack::new());
        stack.push(1);

        // A popper that loses to the push re-counts the bottom node once it is exposed again.
        let poppers: Vec<_> = (0..2)
            .map(|_| {
                let stack = Arc::clone(&stack);
                thread::spawn(move || stack.pop())
            })
            .collect();
        stack.push(2);

        let mut got: Vec<_> = poppers
            .into_iter()
            .filter_map(|t| t.join().unwrap())
            .collect();
        while let Some(v) = stack.pop() {
            got.push(v);
        }
        got.sort_unstable();
        assert_eq!(got, [1, 2]);

        let counts = stack.node_counts();
        assert_eq!(counts.allocated, 2);
        assert_eq!(counts.freed, 2);
    })
}

#[test]
fn refcount_concurrent_pops() {
    loom::model(|| {
        let stack = Arc::new(RefCountStack::new());
        stack.push(1);
        stack.push(2);

        let s1 = Arc::clone(&stack);
        let t1 = thread::spawn(move || s1.pop());
        let mine = stack.pop();
        let theirs = t1.join().unwrap();

        let mut got = [mine.unwrap(), theirs.unwrap()];
        got.sort_unstable();
        assert_eq!(got, [1, 2]);

        // Alone now, so this pop reclaims whatever the race left pending.
        assert_eq!(stack.pop(), None);
        assert_eq!(stack.pending_len(), 0);
        assert_eq!(stack.node_counts().live(), 0);
    })
}

#[test]
fn hazard_concurrent_pops() {
    loom::model(|| {
        let registry = Registry::global();
        let stack = Arc::new(HazardStack::in_registry(registry));
        stack.push(1);
        stack.push(2);

        let s1 = Arc::clone(&stack);
        let t1 = thread::spawn(move || {
            let mut slot = Registry::global().register().unwrap();
            s1.pop_with(&mut slot)
        });
        let mut slot = registry.register().unwrap();
        let mine = stack.pop_with(&mut slot);
        let theirs = t1.join().unwrap();

        let mut got = [mine.unwrap(), theirs.unwrap()];
        got.sort_unstable();
        assert_eq!(got, [1, 2]);

        drop(slot);
        registry.cleanup();
        assert_eq!(registry.retired_len(), 0);
        assert_eq!(stack.node_counts().live(), 0);
    })
}

#[test]
fn hazard_single_value_popped_once() {
    loom::model(|| {
        let registry = Registry::global();
        let stack = Arc::new(HazardStack::in_registry(registry));
        stack.push(String::from("only"));

        let s1 = Arc::clone(&stack);
        let t1 = thread::spawn(move || {
            let mut slot = Registry::global().register().unwrap();
            s1.pop_with(&mut slot)
        });
        let mut slot = registry.register().unwrap();
        let mine = stack.pop_with(&mut slot);
        let theirs = t1.join().unwrap();

        // Exactly one of the two got the value; the other saw an empty stack.
        match (mine, theirs) {
            (Some(v), None) | (None, Some(v)) => assert_eq!(v, "only"),
            other => panic!("value popped {other:?}"),
        }

        drop(slot);
        registry.cleanup();
        let counts = stack.node_counts();
        assert_eq!(counts.allocated, 1);
        assert_eq!(counts.live(), 0);
    })
}
