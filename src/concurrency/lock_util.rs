//! Declarative lock acquisition: make the least-permissive set of changes so
//! that a transaction may perform reads (S) or writes (X) at a context,
//! acquiring or promoting intent locks on every ancestor along the way.

use std::sync::Arc;

use crate::concurrency::{LockContext, LockError, LockType};
use crate::transaction::Transaction;

/// Ensure `txn` can perform actions requiring `need` at `ctx`.
///
/// `need` must be one of S, X, or NL. Parent intents are always settled
/// before the grant at the target, so no intermediate state violates
/// parent-permits-child.
pub fn ensure_sufficient(
    ctx: &LockContext,
    txn: &Arc<Transaction>,
    need: LockType,
) -> Result<(), LockError> {
    debug_assert!(matches!(need, LockType::S | LockType::X | LockType::NL));
    if need == LockType::NL {
        return Ok(());
    }
    if LockType::substitutable(ctx.effective_lock_type(txn), need) {
        return Ok(());
    }

    // Root-to-target path.
    let mut path = vec![ctx.clone()];
    let mut parent = ctx.parent_context();
    while let Some(p) = parent {
        parent = p.parent_context();
        path.push(p);
    }
    path.reverse();
    let (ancestors, target) = path.split_at(path.len() - 1);
    let target = &target[0];

    match need {
        LockType::S => {
            let s_on_path = path
                .iter()
                .any(|c| c.explicit_lock_type(txn) == LockType::S);
            for ancestor in ancestors {
                match ancestor.explicit_lock_type(txn) {
                    LockType::NL => ancestor.acquire(txn, LockType::IS)?,
                    LockType::IX if s_on_path => ancestor.promote(txn, LockType::SIX)?,
                    _ => {}
                }
            }
            match target.explicit_lock_type(txn) {
                LockType::NL => target.acquire(txn, LockType::S)?,
                LockType::IX => target.promote(txn, LockType::SIX)?,
                _ => target.escalate(txn)?,
            }
        }
        LockType::X => {
            for ancestor in ancestors {
                match ancestor.explicit_lock_type(txn) {
                    LockType::NL => ancestor.acquire(txn, LockType::IX)?,
                    LockType::IS => ancestor.promote(txn, LockType::IX)?,
                    LockType::S => ancestor.promote(txn, LockType::SIX)?,
                    _ => {}
                }
            }
            match target.explicit_lock_type(txn) {
                LockType::NL => target.acquire(txn, LockType::X)?,
                LockType::S => target.promote(txn, LockType::X)?,
                _ => {
                    // Collapse descendants first; an IS-only subtree settles
                    // on S, which still needs the final promotion.
                    target.escalate(txn)?;
                    if target.explicit_lock_type(txn) == LockType::S {
                        target.promote(txn, LockType::X)?;
                    }
                }
            }
        }
        _ => unreachable!("need is S or X here"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{LockHierarchy, LockManager};
    use crate::transaction::TransactionId;

    fn setup() -> (Arc<LockHierarchy>, LockContext) {
        let hierarchy = LockHierarchy::new(Arc::new(LockManager::new()));
        let db = hierarchy.database_context();
        (hierarchy, db)
    }

    fn txn(id: TransactionId) -> Arc<Transaction> {
        Arc::new(Transaction::new(id))
    }

    #[test]
    fn simple_read_acquires_intents_down_the_path() {
        let (_h, db) = setup();
        let page = db.child_context("table1").child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&page, &t1, LockType::S).unwrap();

        assert_eq!(db.explicit_lock_type(&t1), LockType::IS);
        assert_eq!(
            db.child_context("table1").explicit_lock_type(&t1),
            LockType::IS
        );
        assert_eq!(page.explicit_lock_type(&t1), LockType::S);
    }

    #[test]
    fn simple_write_acquires_intents_down_the_path() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&page, &t1, LockType::X).unwrap();

        assert_eq!(db.explicit_lock_type(&t1), LockType::IX);
        assert_eq!(table.explicit_lock_type(&t1), LockType::IX);
        assert_eq!(page.explicit_lock_type(&t1), LockType::X);
    }

    #[test]
    fn nl_and_already_sufficient_are_no_ops() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&page, &t1, LockType::NL).unwrap();
        assert_eq!(db.explicit_lock_type(&t1), LockType::NL);

        ensure_sufficient(&table, &t1, LockType::X).unwrap();
        // Writes at the table imply reads and writes below it.
        ensure_sufficient(&page, &t1, LockType::S).unwrap();
        ensure_sufficient(&page, &t1, LockType::X).unwrap();
        assert_eq!(page.explicit_lock_type(&t1), LockType::NL);
    }

    #[test]
    fn read_upgrade_to_write_promotes() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&page, &t1, LockType::S).unwrap();
        ensure_sufficient(&page, &t1, LockType::X).unwrap();

        assert_eq!(db.explicit_lock_type(&t1), LockType::IX);
        assert_eq!(table.explicit_lock_type(&t1), LockType::IX);
        assert_eq!(page.explicit_lock_type(&t1), LockType::X);
    }

    #[test]
    fn write_under_table_scan_promotes_to_six() {
        // Read the whole table, then write one page: the table lock becomes
        // SIX rather than losing the read capability.
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&table, &t1, LockType::S).unwrap();
        assert_eq!(table.explicit_lock_type(&t1), LockType::S);

        ensure_sufficient(&page, &t1, LockType::X).unwrap();
        assert_eq!(table.explicit_lock_type(&t1), LockType::SIX);
        assert_eq!(page.explicit_lock_type(&t1), LockType::X);
        assert_eq!(db.explicit_lock_type(&t1), LockType::IX);
    }

    #[test]
    fn read_at_table_with_ix_promotes_to_six() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&page, &t1, LockType::X).unwrap();
        // Now scan the table: IX(table) must become SIX(table).
        ensure_sufficient(&table, &t1, LockType::S).unwrap();

        assert_eq!(table.explicit_lock_type(&t1), LockType::SIX);
        // The X page lock survives under SIX.
        assert_eq!(page.explicit_lock_type(&t1), LockType::X);
    }

    #[test]
    fn read_at_table_with_is_escalates() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&page, &t1, LockType::S).unwrap();
        ensure_sufficient(&table, &t1, LockType::S).unwrap();

        assert_eq!(table.explicit_lock_type(&t1), LockType::S);
        assert_eq!(page.explicit_lock_type(&t1), LockType::NL);
    }

    #[test]
    fn write_at_table_with_is_escalates_then_promotes() {
        let (_h, db) = setup();
        let table = db.child_context("table1");
        let page = table.child_context("3");
        let t1 = txn(1);

        ensure_sufficient(&page, &t1, LockType::S).unwrap();
        ensure_sufficient(&table, &t1, LockType::X).unwrap();

        assert_eq!(table.explicit_lock_type(&t1), LockType::X);
        assert_eq!(page.explicit_lock_type(&t1), LockType::NL);
        assert_eq!(db.explicit_lock_type(&t1), LockType::IX);
    }
}
