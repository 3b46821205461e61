//! Resolved type model
//!
//! The slice of the collaborator's type system this backend consumes.
//! Types matter to the backend only through stack width, conversion
//! pairing, and function signatures.

use primitive_types::U256;
use std::fmt;

/// A resolved type attached to expressions and declarations
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    /// Boolean, one stack slot
    Bool,
    /// Unsigned integer of the given bit width (8..=256, multiple of 8)
    UInt(u16),
    /// Compile-time rational with its folded value
    Rational(U256),
    /// Function value (called indirectly through a numeric id)
    Function(FunctionType),
    /// Aggregate occupying one slot per member (multi-slot staging boundary)
    Tuple(Vec<Type>),
}

/// Signature of a function-typed value
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionType {
    pub params: Vec<Type>,
    pub returns: Vec<Type>,
    /// Accepts any parameter list; arguments are forwarded unconverted
    pub arbitrary_params: bool,
}

impl FunctionType {
    pub fn new(params: Vec<Type>, returns: Vec<Type>) -> Self {
        Self {
            params,
            returns,
            arbitrary_params: false,
        }
    }
}

impl Type {
    /// Number of stack slots a value of this type occupies
    pub fn size_on_stack(&self) -> usize {
        match self {
            Type::Bool | Type::UInt(_) | Type::Rational(_) | Type::Function(_) => 1,
            Type::Tuple(members) => members.iter().map(Type::size_on_stack).sum(),
        }
    }

    /// Shorthand for the common 8-bit unsigned type
    pub fn uint8() -> Type {
        Type::UInt(8)
    }

    /// Shorthand for the full-word unsigned type
    pub fn uint256() -> Type {
        Type::UInt(256)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Bool => write!(f, "bool"),
            Type::UInt(bits) => write!(f, "uint{}", bits),
            Type::Rational(value) => write!(f, "rational({})", value),
            Type::Function(ty) => {
                write!(f, "function({})", ty.params.len())?;
                if !ty.returns.is_empty() {
                    write!(f, "->{}", ty.returns.len())?;
                }
                Ok(())
            }
            Type::Tuple(members) => write!(f, "tuple[{}]", members.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_width() {
        assert_eq!(Type::Bool.size_on_stack(), 1);
        assert_eq!(Type::UInt(256).size_on_stack(), 1);
        assert_eq!(
            Type::Tuple(vec![Type::uint8(), Type::Bool]).size_on_stack(),
            2
        );
    }
}
