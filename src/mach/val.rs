use super::memory::Address;
use super::ty::Ty;
use super::var::Variable;
use crate::lang::ErrorCode;
use std::convert::TryFrom;
use std::rc::Rc;

/// ## Runtime values
///
/// Arithmetic and comparison dispatch on the pair of tags and promote
/// to the widest operand type. An operation whose preconditions fail
/// (divide by zero, overflow, domain error) yields a `Val::Error`
/// sentinel instead of raising; sentinels propagate first-error-wins
/// through expression evaluation until a statement casts the result
/// to a concrete type and surfaces the error at its own token.

#[derive(Clone, Debug)]
pub enum Val {
    Integer(i16),
    Long(i32),
    Single(f32),
    Double(f64),
    String(Rc<str>),
    /// Denotes another variable's storage rather than holding data.
    Ref(Reference),
    /// Array descriptor held in an array variable's slot; elements
    /// live in the dynamic frame the descriptor points at.
    Array(ArrayDesc),
    Error(ErrorCode),
}

/// An address plus the variable it denotes. Written into parameter
/// slots for by-reference arguments and into synthetic variables for
/// array-element access.
#[derive(Clone, Debug)]
pub struct Reference {
    pub address: Address,
    pub var: Rc<Variable>,
}

/// Resolved bounds and element storage of a dimensioned array.
#[derive(Clone, Debug, PartialEq)]
pub struct ArrayDesc {
    /// Inclusive (lower, upper) per dimension.
    pub bounds: Vec<(i32, i32)>,
    pub base: Address,
    /// Slots per element; more than one for record arrays.
    pub span: usize,
}

impl ArrayDesc {
    pub fn element_count(&self) -> usize {
        self.bounds
            .iter()
            .map(|(lower, upper)| (upper - lower + 1).max(0) as usize)
            .product::<usize>()
            * self.span
    }
}

impl PartialEq for Val {
    fn eq(&self, other: &Val) -> bool {
        use Val::*;
        match (self, other) {
            (Integer(a), Integer(b)) => a == b,
            (Long(a), Long(b)) => a == b,
            (Single(a), Single(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Ref(a), Ref(b)) => a.address == b.address,
            (Array(a), Array(b)) => a == b,
            (Error(a), Error(b)) => a == b,
            _ => false,
        }
    }
}

const TRUE: i16 = -1;
const FALSE: i16 = 0;

/// Round half to even, as the legacy runtime does for every
/// float-to-integer conversion.
fn round_half_even(n: f64) -> f64 {
    let rounded = n.round();
    if (n - n.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
        rounded - n.signum()
    } else {
        rounded
    }
}

fn to_i16(n: f64) -> Result<i16, ErrorCode> {
    let n = round_half_even(n);
    if n < i16::MIN as f64 || n > i16::MAX as f64 {
        Err(ErrorCode::Overflow)
    } else {
        Ok(n as i16)
    }
}

fn to_i32(n: f64) -> Result<i32, ErrorCode> {
    let n = round_half_even(n);
    if n < i32::MIN as f64 || n > i32::MAX as f64 {
        Err(ErrorCode::Overflow)
    } else {
        Ok(n as i32)
    }
}

impl Val {
    pub fn default_of(ty: &Ty) -> Val {
        match ty {
            Ty::Integer => Val::Integer(0),
            Ty::Long => Val::Long(0),
            Ty::Single => Val::Single(0.0),
            Ty::Double => Val::Double(0.0),
            Ty::String => Val::String("".into()),
            Ty::FixedString(n) => Val::String(" ".repeat(*n).into()),
            Ty::Record(_) => Val::Error(ErrorCode::InternalError),
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Val::Integer(_) | Val::Long(_) | Val::Single(_) | Val::Double(_)
        )
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Val::Error(_))
    }

    pub fn error(&self) -> Option<ErrorCode> {
        match self {
            Val::Error(code) => Some(*code),
            _ => None,
        }
    }

    /// Numeric magnitude, losing fixed-width information.
    pub fn number(&self) -> Option<f64> {
        match self {
            Val::Integer(n) => Some(*n as f64),
            Val::Long(n) => Some(*n as f64),
            Val::Single(n) => Some(*n as f64),
            Val::Double(n) => Some(*n),
            _ => None,
        }
    }

    /// Convert to the requested type, range-checking integers and
    /// sizing fixed strings. The legacy rule for fixed strings is
    /// truncate or pad with spaces on the right.
    pub fn cast(self, ty: &Ty) -> Result<Val, ErrorCode> {
        use Val::*;
        if let Error(code) = self {
            return Err(code);
        }
        match ty {
            Ty::Integer => match self {
                Integer(n) => Ok(Integer(n)),
                Long(n) => to_i16(n as f64).map(Integer),
                Single(n) => to_i16(n as f64).map(Integer),
                Double(n) => to_i16(n).map(Integer),
                _ => Err(ErrorCode::TypeMismatch),
            },
            Ty::Long => match self {
                Integer(n) => Ok(Long(n as i32)),
                Long(n) => Ok(Long(n)),
                Single(n) => to_i32(n as f64).map(Long),
                Double(n) => to_i32(n).map(Long),
                _ => Err(ErrorCode::TypeMismatch),
            },
            Ty::Single => match self {
                Integer(n) => Ok(Single(n as f32)),
                Long(n) => Ok(Single(n as f32)),
                Single(n) => Ok(Single(n)),
                Double(n) => {
                    if n.is_finite() && n.abs() > f32::MAX as f64 {
                        Err(ErrorCode::Overflow)
                    } else {
                        Ok(Single(n as f32))
                    }
                }
                _ => Err(ErrorCode::TypeMismatch),
            },
            Ty::Double => match self {
                Integer(n) => Ok(Double(n as f64)),
                Long(n) => Ok(Double(n as f64)),
                Single(n) => Ok(Double(n as f64)),
                Double(n) => Ok(Double(n)),
                _ => Err(ErrorCode::TypeMismatch),
            },
            Ty::String => match self {
                String(s) => Ok(String(s)),
                _ => Err(ErrorCode::TypeMismatch),
            },
            Ty::FixedString(len) => match self {
                String(s) => {
                    let mut s = s.to_string();
                    s.truncate(*len);
                    while s.len() < *len {
                        s.push(' ');
                    }
                    Ok(String(s.into()))
                }
                _ => Err(ErrorCode::TypeMismatch),
            },
            Ty::Record(_) => Err(ErrorCode::TypeMismatch),
        }
    }

    pub fn negate(self) -> Val {
        use Val::*;
        match self {
            Integer(n) => match n.checked_neg() {
                Some(n) => Integer(n),
                None => Error(ErrorCode::Overflow),
            },
            Long(n) => match n.checked_neg() {
                Some(n) => Long(n),
                None => Error(ErrorCode::Overflow),
            },
            Single(n) => Single(-n),
            Double(n) => Double(-n),
            Error(code) => Error(code),
            _ => Error(ErrorCode::TypeMismatch),
        }
    }

    pub fn add(self, rhs: Val) -> Val {
        if let Val::String(l) = &self {
            return match rhs {
                Val::String(r) => {
                    let mut s = l.to_string();
                    s.push_str(&r);
                    Val::String(s.into())
                }
                Val::Error(code) => Val::Error(code),
                _ => Val::Error(ErrorCode::TypeMismatch),
            };
        }
        numeric_op(
            self,
            rhs,
            |l, r| l.checked_add(r),
            |l, r| l.checked_add(r),
            |l, r| l + r,
            |l, r| l + r,
        )
    }

    pub fn subtract(self, rhs: Val) -> Val {
        numeric_op(
            self,
            rhs,
            |l, r| l.checked_sub(r),
            |l, r| l.checked_sub(r),
            |l, r| l - r,
            |l, r| l - r,
        )
    }

    pub fn multiply(self, rhs: Val) -> Val {
        numeric_op(
            self,
            rhs,
            |l, r| l.checked_mul(r),
            |l, r| l.checked_mul(r),
            |l, r| l * r,
            |l, r| l * r,
        )
    }

    /// `/` always divides in floating point; integer operands widen
    /// to single precision first.
    pub fn divide(self, rhs: Val) -> Val {
        use Val::*;
        let (lhs, rhs) = match widen_numeric(self, rhs) {
            Ok(pair) => pair,
            Err(code) => return Error(code),
        };
        match (lhs, rhs) {
            (Double(l), Double(r)) => {
                if r == 0.0 {
                    Error(ErrorCode::DivisionByZero)
                } else {
                    Double(l / r)
                }
            }
            (l, r) => {
                let (l, r) = (l.number().unwrap() as f32, r.number().unwrap() as f32);
                if r == 0.0 {
                    Error(ErrorCode::DivisionByZero)
                } else {
                    Single(l / r)
                }
            }
        }
    }

    /// `\` truncates both operands to integers and divides.
    pub fn divide_int(self, rhs: Val) -> Val {
        integer_pair_op(self, rhs, |l, r| {
            if r == 0 {
                Err(ErrorCode::DivisionByZero)
            } else {
                l.checked_div(r).ok_or(ErrorCode::Overflow)
            }
        })
    }

    pub fn modulo(self, rhs: Val) -> Val {
        integer_pair_op(self, rhs, |l, r| {
            if r == 0 {
                Err(ErrorCode::DivisionByZero)
            } else {
                l.checked_rem(r).ok_or(ErrorCode::Overflow)
            }
        })
    }

    pub fn power(self, rhs: Val) -> Val {
        use Val::*;
        let (lhs, rhs) = match widen_numeric(self, rhs) {
            Ok(pair) => pair,
            Err(code) => return Error(code),
        };
        let l = lhs.number().unwrap();
        let r = rhs.number().unwrap();
        if l == 0.0 && r < 0.0 {
            return Error(ErrorCode::DivisionByZero);
        }
        if l < 0.0 && r.fract() != 0.0 {
            return Error(ErrorCode::IllegalFunctionCall);
        }
        let result = l.powf(r);
        match (lhs, rhs) {
            (Double(_), _) | (_, Double(_)) => Double(result),
            _ => {
                if result.is_finite() && result.abs() > f32::MAX as f64 {
                    Error(ErrorCode::Overflow)
                } else {
                    Single(result as f32)
                }
            }
        }
    }

    pub fn compare_eq(self, rhs: Val) -> Val {
        comparison(self, rhs, |o| o == std::cmp::Ordering::Equal)
    }

    pub fn compare_ne(self, rhs: Val) -> Val {
        comparison(self, rhs, |o| o != std::cmp::Ordering::Equal)
    }

    pub fn compare_lt(self, rhs: Val) -> Val {
        comparison(self, rhs, |o| o == std::cmp::Ordering::Less)
    }

    pub fn compare_le(self, rhs: Val) -> Val {
        comparison(self, rhs, |o| o != std::cmp::Ordering::Greater)
    }

    pub fn compare_gt(self, rhs: Val) -> Val {
        comparison(self, rhs, |o| o == std::cmp::Ordering::Greater)
    }

    pub fn compare_ge(self, rhs: Val) -> Val {
        comparison(self, rhs, |o| o != std::cmp::Ordering::Less)
    }

    pub fn not(self) -> Val {
        logical_unary(self, |n| !n)
    }

    pub fn and(self, rhs: Val) -> Val {
        logical_op(self, rhs, |l, r| l & r)
    }

    pub fn or(self, rhs: Val) -> Val {
        logical_op(self, rhs, |l, r| l | r)
    }

    pub fn xor(self, rhs: Val) -> Val {
        logical_op(self, rhs, |l, r| l ^ r)
    }

    pub fn imp(self, rhs: Val) -> Val {
        logical_op(self, rhs, |l, r| !l | r)
    }

    pub fn eqv(self, rhs: Val) -> Val {
        logical_op(self, rhs, |l, r| !(l ^ r))
    }
}

/// Promote two numeric operands to their common type: both integer16
/// stays integer16, integer widths promote to the wider width, and a
/// floating operand promotes both to floating.
fn widen_numeric(lhs: Val, rhs: Val) -> Result<(Val, Val), ErrorCode> {
    use Val::*;
    if let Error(code) = lhs {
        return Err(code);
    }
    if let Error(code) = rhs {
        return Err(code);
    }
    if !lhs.is_numeric() || !rhs.is_numeric() {
        return Err(ErrorCode::TypeMismatch);
    }
    Ok(match (&lhs, &rhs) {
        (Integer(_), Integer(_))
        | (Long(_), Long(_))
        | (Single(_), Single(_))
        | (Double(_), Double(_)) => (lhs, rhs),
        (Double(_), _) => {
            let r = rhs.number().unwrap();
            (lhs, Double(r))
        }
        (_, Double(_)) => {
            let l = lhs.number().unwrap();
            (Double(l), rhs)
        }
        (Single(_), _) => {
            let r = rhs.number().unwrap();
            (lhs, Single(r as f32))
        }
        (_, Single(_)) => {
            let l = lhs.number().unwrap();
            (Single(l as f32), rhs)
        }
        (Long(_), Integer(n)) => {
            let n = *n;
            (lhs, Long(n as i32))
        }
        (Integer(n), Long(_)) => {
            let n = *n;
            (Long(n as i32), rhs)
        }
        _ => unreachable!(),
    })
}

fn numeric_op(
    lhs: Val,
    rhs: Val,
    int_op: fn(i16, i16) -> Option<i16>,
    long_op: fn(i32, i32) -> Option<i32>,
    single_op: fn(f32, f32) -> f32,
    double_op: fn(f64, f64) -> f64,
) -> Val {
    use Val::*;
    match widen_numeric(lhs, rhs) {
        Err(code) => Error(code),
        Ok((Integer(l), Integer(r))) => match int_op(l, r) {
            Some(n) => Integer(n),
            None => Error(ErrorCode::Overflow),
        },
        Ok((Long(l), Long(r))) => match long_op(l, r) {
            Some(n) => Long(n),
            None => Error(ErrorCode::Overflow),
        },
        Ok((Single(l), Single(r))) => {
            let n = single_op(l, r);
            if n.is_infinite() {
                Error(ErrorCode::Overflow)
            } else {
                Single(n)
            }
        }
        Ok((Double(l), Double(r))) => {
            let n = double_op(l, r);
            if n.is_infinite() {
                Error(ErrorCode::Overflow)
            } else {
                Double(n)
            }
        }
        Ok(_) => Error(ErrorCode::InternalError),
    }
}

/// `\` and MOD round both operands to integer width first. The result
/// is integer16 when both operands fit, integer32 otherwise.
fn integer_pair_op(lhs: Val, rhs: Val, op: fn(i32, i32) -> Result<i32, ErrorCode>) -> Val {
    use Val::*;
    let narrow = matches!((&lhs, &rhs), (Integer(_), Integer(_)));
    let (l, r) = match (long_of(lhs), long_of(rhs)) {
        (Ok(l), Ok(r)) => (l, r),
        (Err(code), _) | (_, Err(code)) => return Error(code),
    };
    match op(l, r) {
        Err(code) => Error(code),
        Ok(n) => {
            if narrow {
                match i16::try_from(n) {
                    Ok(n) => Integer(n),
                    Err(_) => Error(ErrorCode::Overflow),
                }
            } else {
                Long(n)
            }
        }
    }
}

fn long_of(val: Val) -> Result<i32, ErrorCode> {
    match val {
        Val::Integer(n) => Ok(n as i32),
        Val::Long(n) => Ok(n),
        Val::Single(n) => to_i32(n as f64),
        Val::Double(n) => to_i32(n),
        Val::Error(code) => Err(code),
        _ => Err(ErrorCode::TypeMismatch),
    }
}

fn comparison(lhs: Val, rhs: Val, test: fn(std::cmp::Ordering) -> bool) -> Val {
    use std::cmp::Ordering;
    use Val::*;
    let truth = |b: bool| Integer(if b { TRUE } else { FALSE });
    match (&lhs, &rhs) {
        (Error(code), _) => return Error(*code),
        (_, Error(code)) => return Error(*code),
        (String(l), String(r)) => return truth(test(l.cmp(r))),
        _ => {}
    }
    match (lhs.number(), rhs.number()) {
        (Some(l), Some(r)) => match l.partial_cmp(&r) {
            Some(ordering) => truth(test(ordering)),
            None => truth(test(Ordering::Equal) && l.is_nan() && r.is_nan()),
        },
        _ => Error(ErrorCode::TypeMismatch),
    }
}

fn logical_unary(val: Val, op: fn(i32) -> i32) -> Val {
    use Val::*;
    let narrow = matches!(val, Integer(_));
    match long_of(val) {
        Err(code) => Error(code),
        Ok(n) => {
            let n = op(n);
            if narrow {
                Integer(n as i16)
            } else {
                Long(n)
            }
        }
    }
}

/// Bitwise logic over rounded integer operands, as wide as the wider
/// operand.
fn logical_op(lhs: Val, rhs: Val, op: fn(i32, i32) -> i32) -> Val {
    use Val::*;
    let narrow = matches!((&lhs, &rhs), (Integer(_), Integer(_)));
    let (l, r) = match (long_of(lhs), long_of(rhs)) {
        (Ok(l), Ok(r)) => (l, r),
        (Err(code), _) | (_, Err(code)) => return Error(code),
    };
    let n = op(l, r);
    if narrow {
        Integer(n as i16)
    } else {
        Long(n)
    }
}

impl std::fmt::Display for Val {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Val::Integer(n) => write!(f, "{}", n),
            Val::Long(n) => write!(f, "{}", n),
            Val::Single(n) => {
                if n.fract() == 0.0 && n.abs() < 1e7 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Val::Double(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Val::String(s) => write!(f, "{}", s),
            Val::Ref(r) => write!(f, "REF({})", r.var.name),
            Val::Array(_) => write!(f, "ARRAY"),
            Val::Error(code) => write!(f, "?{}", code.text()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotion() {
        assert_eq!(
            Val::Integer(2).add(Val::Integer(3)),
            Val::Integer(5)
        );
        assert_eq!(Val::Integer(2).add(Val::Long(3)), Val::Long(5));
        assert_eq!(Val::Integer(2).add(Val::Single(0.5)), Val::Single(2.5));
        assert_eq!(Val::Single(2.0).add(Val::Double(0.25)), Val::Double(2.25));
    }

    #[test]
    fn test_integer_overflow_is_sentinel() {
        assert_eq!(
            Val::Integer(i16::MAX).add(Val::Integer(1)),
            Val::Error(ErrorCode::Overflow)
        );
        assert_eq!(
            Val::Integer(i16::MIN).negate(),
            Val::Error(ErrorCode::Overflow)
        );
    }

    #[test]
    fn test_divide_promotes_to_float() {
        assert_eq!(Val::Integer(1).divide(Val::Integer(2)), Val::Single(0.5));
        assert_eq!(
            Val::Integer(1).divide(Val::Integer(0)),
            Val::Error(ErrorCode::DivisionByZero)
        );
        assert_eq!(Val::Integer(7).divide_int(Val::Integer(2)), Val::Integer(3));
        assert_eq!(Val::Integer(7).modulo(Val::Integer(4)), Val::Integer(3));
    }

    #[test]
    fn test_first_error_wins() {
        let err = Val::Integer(1).divide(Val::Integer(0));
        assert_eq!(
            err.add(Val::Integer(i16::MAX).add(Val::Integer(1))),
            Val::Error(ErrorCode::DivisionByZero)
        );
    }

    #[test]
    fn test_round_half_even_on_cast() {
        assert_eq!(Val::Single(2.5).cast(&Ty::Integer), Ok(Val::Integer(2)));
        assert_eq!(Val::Single(3.5).cast(&Ty::Integer), Ok(Val::Integer(4)));
        assert_eq!(Val::Single(-2.5).cast(&Ty::Integer), Ok(Val::Integer(-2)));
        assert_eq!(
            Val::Single(40000.0).cast(&Ty::Integer),
            Err(ErrorCode::Overflow)
        );
    }

    #[test]
    fn test_fixed_string_cast_pads_and_truncates() {
        assert_eq!(
            Val::String("abcdef".into()).cast(&Ty::FixedString(4)),
            Ok(Val::String("abcd".into()))
        );
        assert_eq!(
            Val::String("ab".into()).cast(&Ty::FixedString(4)),
            Ok(Val::String("ab  ".into()))
        );
    }

    #[test]
    fn test_string_compare_and_concat() {
        assert_eq!(
            Val::String("ab".into()).add(Val::String("cd".into())),
            Val::String("abcd".into())
        );
        assert_eq!(
            Val::String("a".into()).compare_lt(Val::String("b".into())),
            Val::Integer(TRUE)
        );
    }

    #[test]
    fn test_logic_width() {
        assert_eq!(Val::Integer(6).and(Val::Integer(3)), Val::Integer(2));
        assert_eq!(Val::Long(6).or(Val::Integer(1)), Val::Long(7));
        assert_eq!(Val::Integer(0).not(), Val::Integer(TRUE));
        assert_eq!(Val::Integer(TRUE).eqv(Val::Integer(TRUE)), Val::Integer(TRUE));
    }
}
