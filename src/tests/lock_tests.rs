//! Cross-layer locking scenarios: the flat manager's queue discipline
//! observed through the hierarchy, and multi-threaded acquisition through
//! `ensure_sufficient`.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::concurrency::{
    ensure_sufficient, LockHierarchy, LockManager, LockType, ResourceName,
};
use crate::transaction::{Transaction, TransactionId};

fn setup() -> Arc<LockHierarchy> {
    LockHierarchy::new(Arc::new(LockManager::new()))
}

fn txn(id: TransactionId) -> Arc<Transaction> {
    Arc::new(Transaction::new(id))
}

#[test]
fn queued_readers_drain_together_after_writer_releases() {
    // T1 holds X(A); T2 then T3 queue S(A); when T1 releases, both shared
    // requests are granted in arrival order.
    let manager = Arc::new(LockManager::new());
    let a = ResourceName::new_root("database").child("a");
    let t1 = txn(1);
    let t2 = txn(2);
    let t3 = txn(3);

    manager.acquire(&t1, &a, LockType::X).unwrap();

    let readers: Vec<_> = [t2.clone(), t3.clone()]
        .into_iter()
        .map(|t| {
            let handle = {
                let manager = manager.clone();
                let a = a.clone();
                thread::spawn(move || manager.acquire(&t, &a, LockType::S).unwrap())
            };
            // Ensure arrival order T2 before T3.
            while manager.queue_len(&a) < 1 {
                thread::sleep(Duration::from_millis(1));
            }
            handle
        })
        .collect();
    while manager.queue_len(&a) < 2 {
        thread::sleep(Duration::from_millis(1));
    }

    manager.release(&t1, &a).unwrap();
    for handle in readers {
        handle.join().unwrap();
    }
    let grants = manager.locks_on(&a);
    assert_eq!(grants.len(), 2);
    assert_eq!(grants[0].txn_id, 2);
    assert_eq!(grants[1].txn_id, 3);
}

#[test]
fn blocked_reader_waits_for_writer_through_contexts() {
    let hierarchy = setup();
    let db = hierarchy.database_context();
    let table = db.child_context("table1");

    let writer = txn(1);
    let reader = txn(2);

    ensure_sufficient(&table, &writer, LockType::X).unwrap();

    let done = {
        let table = table.clone();
        let reader = reader.clone();
        thread::spawn(move || {
            ensure_sufficient(&table, &reader, LockType::S).unwrap();
        })
    };
    thread::sleep(Duration::from_millis(20));
    assert!(reader.is_blocked());

    table.release(&writer).unwrap();
    db.release(&writer).unwrap();
    done.join().unwrap();
    assert_eq!(table.explicit_lock_type(&reader), LockType::S);
}

#[test]
fn intent_locks_let_disjoint_writers_proceed() {
    // Two writers on different pages of the same table never block each
    // other: IX is compatible with IX.
    let hierarchy = setup();
    let db = hierarchy.database_context();
    let table = db.child_context("table1");
    let p1 = table.child_context("1");
    let p2 = table.child_context("2");

    let t1 = txn(1);
    let t2 = txn(2);
    ensure_sufficient(&p1, &t1, LockType::X).unwrap();
    ensure_sufficient(&p2, &t2, LockType::X).unwrap();

    assert_eq!(table.explicit_lock_type(&t1), LockType::IX);
    assert_eq!(table.explicit_lock_type(&t2), LockType::IX);
    assert_eq!(p1.explicit_lock_type(&t1), LockType::X);
    assert_eq!(p2.explicit_lock_type(&t2), LockType::X);
    assert!(!t1.is_blocked());
    assert!(!t2.is_blocked());
}

#[test]
fn table_reader_blocks_page_writer_until_release() {
    let hierarchy = setup();
    let db = hierarchy.database_context();
    let table = db.child_context("table1");
    let page = table.child_context("7");

    let reader = txn(1);
    let writer = txn(2);
    ensure_sufficient(&table, &reader, LockType::S).unwrap();

    let done = {
        let page = page.clone();
        let writer = writer.clone();
        thread::spawn(move || ensure_sufficient(&page, &writer, LockType::X).unwrap())
    };
    thread::sleep(Duration::from_millis(20));
    // The writer parks on the table's IX (S vs IX conflict).
    assert!(writer.is_blocked());

    table.release(&reader).unwrap();
    db.release(&reader).unwrap();
    done.join().unwrap();
    assert_eq!(page.explicit_lock_type(&writer), LockType::X);
}

#[test]
fn escalate_after_many_page_locks_collapses_footprint() {
    let hierarchy = setup();
    let db = hierarchy.database_context();
    let table = db.child_context("table1");
    let t1 = txn(1);

    for i in 0..16 {
        let page = table.child_context(format!("{i}"));
        ensure_sufficient(&page, &t1, LockType::S).unwrap();
    }
    assert_eq!(table.num_children(1), 16);

    table.escalate(&t1).unwrap();
    assert_eq!(table.explicit_lock_type(&t1), LockType::S);
    assert_eq!(table.num_children(1), 0);
    assert_eq!(
        hierarchy
            .manager()
            .locks_of(1)
            .iter()
            .filter(|l| l.name.is_descendant_of(&table.resource_name()))
            .count(),
        0
    );
}

#[test]
fn release_order_constraints_force_bottom_up_release() {
    let hierarchy = setup();
    let db = hierarchy.database_context();
    let table = db.child_context("table1");
    let page = table.child_context("3");
    let t1 = txn(1);

    ensure_sufficient(&page, &t1, LockType::X).unwrap();

    // Cannot drop the table intent while the page X is held.
    assert!(table.release(&t1).is_err());
    page.release(&t1).unwrap();
    table.release(&t1).unwrap();
    db.release(&t1).unwrap();
    assert!(hierarchy.manager().locks_of(1).is_empty());
}
