//! Constants, including ones whose value is settled late.
//!
//! Prologues reference the size of the spill region before register
//! allocation has computed it. [`ConstantPlaceholder`] defers the value:
//! instruction trees embed the placeholder, allocation settles it once, and
//! the final textual rendering reads it.

use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

#[derive(Clone)]
pub enum Constant {
    Fixed(i64),
    Placeholder(ConstantPlaceholder),
    Sum(Box<Constant>, Box<Constant>),
    /// Smallest value `>= base` with the given remainder modulo `modulo`.
    Aligned {
        base: Box<Constant>,
        modulo: i64,
        remainder: i64,
    },
}

impl Constant {
    pub fn sum(first: Constant, second: Constant) -> Constant {
        Constant::Sum(Box::new(first), Box::new(second))
    }

    pub fn aligned(base: Constant, modulo: i64, remainder: i64) -> Constant {
        Constant::Aligned {
            base: Box::new(base),
            modulo,
            remainder,
        }
    }

    /// The concrete value. Panics on an unsettled placeholder.
    pub fn value(&self) -> i64 {
        match self {
            Constant::Fixed(value) => *value,
            Constant::Placeholder(placeholder) => placeholder.value(),
            Constant::Sum(first, second) => first.value() + second.value(),
            Constant::Aligned {
                base,
                modulo,
                remainder,
            } => {
                let raw = base.value();
                let to_add = remainder.rem_euclid(*modulo) - raw % modulo;
                if to_add < 0 {
                    raw + to_add + modulo
                } else {
                    raw + to_add
                }
            }
        }
    }
}

impl From<i64> for Constant {
    fn from(value: i64) -> Self {
        Constant::Fixed(value)
    }
}

impl PartialEq for Constant {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Constant::Fixed(a), Constant::Fixed(b)) => a == b,
            (Constant::Placeholder(a), Constant::Placeholder(b)) => a.is(b),
            (Constant::Sum(a0, a1), Constant::Sum(b0, b1)) => a0 == b0 && a1 == b1,
            (
                Constant::Aligned {
                    base: a,
                    modulo: am,
                    remainder: ar,
                },
                Constant::Aligned {
                    base: b,
                    modulo: bm,
                    remainder: br,
                },
            ) => a == b && am == bm && ar == br,
            _ => false,
        }
    }
}

impl fmt::Debug for Constant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Constant::Fixed(value) => write!(f, "{}", value),
            Constant::Placeholder(placeholder) => match placeholder.settled() {
                Some(value) => write!(f, "{}", value),
                None => write!(f, "<unsettled>"),
            },
            Constant::Sum(first, second) => write!(f, "({:?} + {:?})", first, second),
            Constant::Aligned {
                base,
                modulo,
                remainder,
            } => write!(f, "align({:?}, {} mod {})", base, remainder, modulo),
        }
    }
}

/// A constant settled exactly once, after allocation.
#[derive(Clone, Debug, Default)]
pub struct ConstantPlaceholder(Rc<Cell<Option<i64>>>);

impl ConstantPlaceholder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn settle(&self, value: i64) {
        self.0.set(Some(value));
    }

    pub fn settled(&self) -> Option<i64> {
        self.0.get()
    }

    pub fn value(&self) -> i64 {
        self.0.get().expect("constant placeholder read before being settled")
    }

    /// Identity check: clones of one placeholder settle together.
    pub fn is(&self, other: &ConstantPlaceholder) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_and_sum() {
        let sum = Constant::sum(Constant::Fixed(40), Constant::Fixed(2));
        assert_eq!(sum.value(), 42);
    }

    #[test]
    fn test_placeholder_settles_through_clones() {
        let placeholder = ConstantPlaceholder::new();
        let constant = Constant::sum(
            Constant::Fixed(8),
            Constant::Placeholder(placeholder.clone()),
        );
        placeholder.settle(24);
        assert_eq!(constant.value(), 32);
    }

    #[test]
    #[should_panic(expected = "before being settled")]
    fn test_unsettled_placeholder_panics() {
        Constant::Placeholder(ConstantPlaceholder::new()).value();
    }

    #[test]
    fn test_aligned() {
        // Smallest value >= 24 that is 0 mod 16 is 32.
        assert_eq!(Constant::aligned(Constant::Fixed(24), 16, 0).value(), 32);
        // Already aligned stays put.
        assert_eq!(Constant::aligned(Constant::Fixed(32), 16, 0).value(), 32);
        // Remainder accounts for slots already on the stack.
        assert_eq!(Constant::aligned(Constant::Fixed(20), 16, 8).value(), 24);
    }
}
