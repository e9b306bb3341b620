/// Lock types for multigranularity locking, plus the relations between them
/// that drive every admission decision in the lock manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockType {
    /// Shared.
    S,
    /// Exclusive.
    X,
    /// Intention shared.
    IS,
    /// Intention exclusive.
    IX,
    /// Shared + intention exclusive: read everything, write some descendants.
    SIX,
    /// No lock held.
    NL,
}

impl LockType {
    /// Whether two transactions may simultaneously hold `a` and `b` on the
    /// same resource. Symmetric.
    pub fn compatible(a: LockType, b: LockType) -> bool {
        use LockType::*;
        match (a, b) {
            (NL, _) | (_, NL) => true,
            (IS, X) | (X, IS) => false,
            (IS, _) | (_, IS) => true,
            (IX, IX) => true,
            (S, S) => true,
            _ => false,
        }
    }

    /// The lock that should be requested on the parent resource so that a
    /// lock of type `a` may be granted on the child.
    pub fn parent_lock(a: LockType) -> LockType {
        use LockType::*;
        match a {
            S => IS,
            X => IX,
            IS => IS,
            IX => IX,
            SIX => IX,
            NL => NL,
        }
    }

    /// Whether holding `parent` on a resource permits acquiring `child` on
    /// one of its children.
    pub fn can_be_parent(parent: LockType, child: LockType) -> bool {
        use LockType::*;
        match child {
            NL => true,
            S => matches!(parent, IS | IX | S),
            X => matches!(parent, IX | SIX),
            IS => matches!(parent, IS | IX),
            IX => matches!(parent, IX | SIX),
            SIX => matches!(parent, IX),
        }
    }

    /// Whether `substitute` covers everything `required` allows, i.e. a
    /// promotion from `required` to `substitute` is never a loss of
    /// capability. Reflexive.
    pub fn substitutable(substitute: LockType, required: LockType) -> bool {
        use LockType::*;
        if substitute == required {
            return true;
        }
        match required {
            NL => false,
            IS => matches!(substitute, IX | SIX | S | X),
            IX => matches!(substitute, SIX | X),
            S => matches!(substitute, SIX | X),
            SIX => matches!(substitute, X),
            X => false,
        }
    }

    pub fn is_intent(self) -> bool {
        matches!(self, LockType::IS | LockType::IX | LockType::SIX)
    }
}

impl std::fmt::Display for LockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LockType::S => "S",
            LockType::X => "X",
            LockType::IS => "IS",
            LockType::IX => "IX",
            LockType::SIX => "SIX",
            LockType::NL => "NL",
        };
        write!(f, "{s}")
    }
}
