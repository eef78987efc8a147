//! Reduction operators.
//!
//! Every process owns an operator table. The four built-in operators occupy
//! fixed, permanent slots; user operators are created with
//! [`Mpi::op_create`](crate::Mpi::op_create) and released with
//! [`Mpi::op_free`](crate::Mpi::op_free). Entries are shared through `Rc`, so a
//! reduction that looked up an operator keeps using it even if the handle is
//! freed while the reduction runs.

use crate::datatype::{DatatypeTag, MpiDatatype};
use crate::error::{Error, Result};
use crate::ReduceOp;
use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;

/// Handle to a reduction operator in the calling process's operator table.
///
/// Built-in operators are available as associated constants and convert from
/// [`ReduceOp`]:
///
/// ```
/// use mpirt::{Op, ReduceOp};
///
/// assert_eq!(Op::from(ReduceOp::Sum), Op::SUM);
/// assert!(Op::MAX.is_builtin());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Op {
    handle: i32,
    commutative: bool,
}

impl Op {
    /// Element-wise sum.
    pub const SUM: Op = Op::builtin(ReduceOp::Sum);
    /// Element-wise maximum.
    pub const MAX: Op = Op::builtin(ReduceOp::Max);
    /// Element-wise minimum.
    pub const MIN: Op = Op::builtin(ReduceOp::Min);
    /// Element-wise product.
    pub const PROD: Op = Op::builtin(ReduceOp::Prod);

    const fn builtin(op: ReduceOp) -> Op {
        Op {
            handle: op as i32,
            commutative: true,
        }
    }

    /// Get the raw operator handle (for advanced use).
    pub fn raw_handle(&self) -> i32 {
        self.handle
    }

    /// Whether this is one of the permanent built-in operators.
    pub fn is_builtin(&self) -> bool {
        self.handle < BUILTIN_COUNT
    }

    /// Whether the operator was declared commutative.
    pub fn is_commutative(&self) -> bool {
        self.commutative
    }
}

impl From<ReduceOp> for Op {
    fn from(op: ReduceOp) -> Self {
        Op::builtin(op)
    }
}

const BUILTIN_COUNT: i32 = 4;

/// Type-erased user combining function for element type `T`.
struct UserFunction<T>(Box<dyn Fn(&[T], &mut [T])>);

enum OpFunction {
    Builtin(ReduceOp),
    User {
        element: DatatypeTag,
        function: Box<dyn Any>,
    },
}

pub(crate) struct OpEntry {
    function: OpFunction,
    pub(crate) commutative: bool,
    permanent: bool,
}

impl OpEntry {
    /// Fails unless the operator can combine `T` elements.
    pub(crate) fn check_element<T: MpiDatatype>(&self) -> Result<()> {
        match &self.function {
            OpFunction::User { element, .. } if *element != T::TAG => Err(Error::InvalidType(
                format!("operator was created for {element:?} elements, not {:?}", T::TAG),
            )),
            _ => Ok(()),
        }
    }

    /// Fold `input` into `inout` element-wise: `inout[i] = input[i] ∘ inout[i]`.
    pub(crate) fn apply<T: MpiDatatype>(&self, input: &[T], inout: &mut [T]) -> Result<()> {
        match &self.function {
            OpFunction::Builtin(op) => {
                for (acc, value) in inout.iter_mut().zip(input) {
                    *acc = T::combine(*op, *value, *acc);
                }
                Ok(())
            }
            OpFunction::User { function, .. } => {
                self.check_element::<T>()?;
                let function = function.downcast_ref::<UserFunction<T>>().ok_or_else(|| {
                    Error::InvalidType(format!(
                        "operator was not created for {:?} elements",
                        T::TAG
                    ))
                })?;
                let len = input.len().min(inout.len());
                (function.0)(&input[..len], &mut inout[..len]);
                Ok(())
            }
        }
    }
}

impl std::fmt::Debug for OpEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.function {
            OpFunction::Builtin(op) => format!("{op:?}"),
            OpFunction::User { element, .. } => format!("user({element:?})"),
        };
        f.debug_struct("OpEntry")
            .field("function", &kind)
            .field("commutative", &self.commutative)
            .field("permanent", &self.permanent)
            .finish()
    }
}

/// Per-process operator table.
#[derive(Debug)]
pub(crate) struct OpTable {
    entries: HashMap<i32, Rc<OpEntry>>,
    next: i32,
}

impl OpTable {
    pub(crate) fn new() -> Self {
        let entries = [ReduceOp::Sum, ReduceOp::Max, ReduceOp::Min, ReduceOp::Prod]
            .into_iter()
            .map(|op| {
                (
                    op as i32,
                    Rc::new(OpEntry {
                        function: OpFunction::Builtin(op),
                        commutative: true,
                        permanent: true,
                    }),
                )
            })
            .collect();
        OpTable {
            entries,
            next: BUILTIN_COUNT,
        }
    }

    pub(crate) fn create<T, F>(&mut self, commute: bool, function: F) -> Op
    where
        T: MpiDatatype,
        F: Fn(&[T], &mut [T]) + 'static,
    {
        let handle = self.next;
        self.next += 1;
        self.entries.insert(
            handle,
            Rc::new(OpEntry {
                function: OpFunction::User {
                    element: T::TAG,
                    function: Box::new(UserFunction::<T>(Box::new(function))),
                },
                commutative: commute,
                permanent: false,
            }),
        );
        tracing::debug!(handle, commute, "created user operator");
        Op {
            handle,
            commutative: commute,
        }
    }

    pub(crate) fn get(&self, op: Op) -> Result<Rc<OpEntry>> {
        self.entries
            .get(&op.handle)
            .cloned()
            .ok_or_else(|| Error::InvalidOp(format!("operator handle {} is not live", op.handle)))
    }

    pub(crate) fn free(&mut self, op: Op) -> Result<()> {
        match self.entries.get(&op.handle) {
            None => Err(Error::InvalidOp(format!(
                "operator handle {} is not live",
                op.handle
            ))),
            Some(entry) if entry.permanent => Err(Error::InvalidOp(format!(
                "built-in operator {} cannot be freed",
                op.handle
            ))),
            Some(_) => {
                self.entries.remove(&op.handle);
                tracing::debug!(handle = op.handle, "freed user operator");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_permanent() {
        let mut table = OpTable::new();
        for op in [Op::SUM, Op::MAX, Op::MIN, Op::PROD] {
            assert!(op.is_builtin());
            assert!(matches!(table.free(op).unwrap_err(), Error::InvalidOp(_)));
            assert!(table.get(op).is_ok());
        }
    }

    #[test]
    fn builtin_apply() {
        let table = OpTable::new();
        let mut acc = [1i32, 5, -3];
        table.get(Op::MAX).unwrap().apply(&[4, 2, -7], &mut acc).unwrap();
        assert_eq!(acc, [4, 5, -3]);
        table.get(Op::SUM).unwrap().apply(&[1, 1, 1], &mut acc).unwrap();
        assert_eq!(acc, [5, 6, -2]);
    }

    #[test]
    fn user_op_lifecycle() {
        let mut table = OpTable::new();
        let addem = table.create::<i32, _>(true, |input, inout| {
            for (acc, v) in inout.iter_mut().zip(input) {
                *acc += *v;
            }
        });
        assert!(!addem.is_builtin());
        assert!(addem.is_commutative());

        let entry = table.get(addem).unwrap();
        let mut acc = [10, 20];
        entry.apply(&[1, 2], &mut acc).unwrap();
        assert_eq!(acc, [11, 22]);

        table.free(addem).unwrap();
        assert!(matches!(table.get(addem).unwrap_err(), Error::InvalidOp(_)));
        assert!(matches!(table.free(addem).unwrap_err(), Error::InvalidOp(_)));

        // A reference obtained before the free stays usable.
        entry.apply(&[1, 1], &mut acc).unwrap();
        assert_eq!(acc, [12, 23]);
    }

    #[test]
    fn user_op_rejects_other_element_type() {
        let mut table = OpTable::new();
        let op = table.create::<f64, _>(false, |_, _| {});
        assert!(!op.is_commutative());
        let mut acc = [0i32];
        let entry = table.get(op).unwrap();
        assert!(entry.check_element::<f64>().is_ok());
        assert!(matches!(entry.check_element::<i32>(), Err(Error::InvalidType(_))));
        let err = entry.apply(&[1], &mut acc).unwrap_err();
        assert!(matches!(err, Error::InvalidType(_)));
        assert!(table.get(Op::SUM).unwrap().check_element::<u8>().is_ok());
    }
}
