use super::memory::Memory;
use super::val::Val;
use super::var::Variable;
use crate::error;
use crate::lang::Token;
use std::rc::Rc;

type Result<T> = std::result::Result<T, crate::lang::Error>;

/// ## Compiled expressions
///
/// By the time code generation finishes, every expression is free of
/// side effects: function calls and array subscripts have been
/// hoisted into separate statements that fill synthetic variables, so
/// evaluation here is a pure tree walk over literals and variable
/// reads. Failed operations travel as `Val::Error` sentinels; only
/// internal faults (a dead frame, a missing address) return `Err`.

#[derive(Clone, Debug)]
pub enum Expr {
    Literal(Val),
    /// Dereferences the variable at evaluation time; an unset slot
    /// reads as the type's default value.
    Read(Rc<Variable>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BinaryOp {
    Power,
    Multiply,
    Divide,
    DivideInt,
    Modulo,
    Add,
    Subtract,
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    And,
    Or,
    Xor,
    Imp,
    Eqv,
}

impl Expr {
    pub fn literal(val: Val) -> Expr {
        Expr::Literal(val)
    }

    pub fn read(var: Rc<Variable>) -> Expr {
        Expr::Read(var)
    }

    pub fn eval(&self, memory: &Memory) -> Result<Val> {
        match self {
            Expr::Literal(val) => Ok(val.clone()),
            Expr::Read(var) => match memory.read(var)? {
                Some(val) => Ok(val),
                None => Ok(Val::default_of(&var.ty)),
            },
            Expr::Unary(op, expr) => {
                let val = expr.eval(memory)?;
                Ok(match op {
                    UnaryOp::Negate => val.negate(),
                    UnaryOp::Not => val.not(),
                })
            }
            Expr::Binary(op, lhs, rhs) => {
                let lhs = lhs.eval(memory)?;
                let rhs = rhs.eval(memory)?;
                Ok(apply(*op, lhs, rhs))
            }
        }
    }

    /// Evaluate as a condition. Any numeric result counts; nonzero is
    /// true.
    pub fn eval_bool(&self, memory: &Memory, token: &Token) -> Result<bool> {
        let val = self.eval(memory)?;
        if let Some(code) = val.error() {
            return Err(crate::lang::Error::new(code).at(token).runtime());
        }
        match val.number() {
            Some(n) => Ok(n != 0.0),
            None => Err(error!(TypeMismatch, token).runtime()),
        }
    }
}

pub fn apply(op: BinaryOp, lhs: Val, rhs: Val) -> Val {
    use BinaryOp::*;
    match op {
        Power => lhs.power(rhs),
        Multiply => lhs.multiply(rhs),
        Divide => lhs.divide(rhs),
        DivideInt => lhs.divide_int(rhs),
        Modulo => lhs.modulo(rhs),
        Add => lhs.add(rhs),
        Subtract => lhs.subtract(rhs),
        Equal => lhs.compare_eq(rhs),
        NotEqual => lhs.compare_ne(rhs),
        Less => lhs.compare_lt(rhs),
        LessEqual => lhs.compare_le(rhs),
        Greater => lhs.compare_gt(rhs),
        GreaterEqual => lhs.compare_ge(rhs),
        And => lhs.and(rhs),
        Or => lhs.or(rhs),
        Xor => lhs.xor(rhs),
        Imp => lhs.imp(rhs),
        Eqv => lhs.eqv(rhs),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ErrorCode;

    #[test]
    fn test_eval_tree() {
        let memory = Memory::new(0);
        // 2 * (3 + 4)
        let expr = Expr::Binary(
            BinaryOp::Multiply,
            Box::new(Expr::literal(Val::Integer(2))),
            Box::new(Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::literal(Val::Integer(3))),
                Box::new(Expr::literal(Val::Integer(4))),
            )),
        );
        assert_eq!(expr.eval(&memory).unwrap(), Val::Integer(14));
    }

    #[test]
    fn test_error_sentinel_propagates() {
        let memory = Memory::new(0);
        let expr = Expr::Binary(
            BinaryOp::Add,
            Box::new(Expr::Binary(
                BinaryOp::Divide,
                Box::new(Expr::literal(Val::Integer(1))),
                Box::new(Expr::literal(Val::Integer(0))),
            )),
            Box::new(Expr::literal(Val::Integer(5))),
        );
        assert_eq!(
            expr.eval(&memory).unwrap(),
            Val::Error(ErrorCode::DivisionByZero)
        );
    }
}
