use super::ty::Ty;
use super::val::Val;
use crate::lang::ErrorCode;
use std::rc::Rc;

/// ## Builtin registry
///
/// The single seam between the code generator and the standard
/// library: a lowercase name maps to an argument specification plus
/// an operation kind. The generator checks counts and types against
/// that entry and emits a generic builtin statement; it never knows an
/// individual operation's shape. Functions that take a variable
/// rather than a value (LBOUND, VARPTR) resolve here too but lower to
/// dedicated statement kinds.

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum FuncKind {
    Abs,
    Asc,
    Atn,
    Cdbl,
    Chr,
    Cint,
    Clng,
    Cos,
    Csng,
    DateStr,
    Eof,
    Exp,
    Fix,
    Hex,
    Inkey,
    Instr,
    Int,
    Lcase,
    Left,
    Len,
    Lof,
    Log,
    Ltrim,
    Mid,
    Oct,
    Peek,
    Right,
    Rnd,
    Rtrim,
    SeekPos,
    Sgn,
    Sin,
    Space,
    Sqr,
    Str,
    StringRepeat,
    Tan,
    Timer,
    TimeStr,
    Ucase,
    ValOf,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ProcKind {
    Beep,
    Cls,
    DefSeg,
    Files,
    Kill,
    NameFile,
    Poke,
    Randomize,
    SeekSet,
    Sleep,
    Sound,
}

/// Which statement family a name lowers to. Array and pointer
/// builtins need a variable operand, so the generator handles them
/// with dedicated statement kinds.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BuiltinOp {
    Func(FuncKind),
    Proc(ProcKind),
    ArrayBound { upper: bool },
    VarPointer { segment: bool },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ArgTy {
    Num,
    Str,
    Any,
}

/// Result type of a function builtin. `Widest` follows the argument's
/// numeric type.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum RetTy {
    None,
    Integer,
    Long,
    Single,
    Double,
    Str,
    Widest,
}

pub struct Builtin {
    pub op: BuiltinOp,
    pub args: &'static [ArgTy],
    /// Arguments beyond this index may be omitted.
    pub required: usize,
    pub ret: RetTy,
}

macro_rules! builtin {
    ($op:expr, [$($arg:expr),*], $required:expr, $ret:expr) => {
        Builtin {
            op: $op,
            args: &[$($arg),*],
            required: $required,
            ret: $ret,
        }
    };
}

/// Builtins shadow only when no user-defined symbol with a compatible
/// shape exists; the analyzer consults user symbols first.
pub fn lookup(name: &str) -> Option<&'static Builtin> {
    use ArgTy::*;
    use BuiltinOp::*;
    use FuncKind as F;
    use ProcKind as P;
    use RetTy as R;
    let builtin: &'static Builtin = match name {
        "abs" => &builtin!(Func(F::Abs), [Num], 1, R::Widest),
        "asc" => &builtin!(Func(F::Asc), [Str], 1, R::Integer),
        "atn" => &builtin!(Func(F::Atn), [Num], 1, R::Widest),
        "beep" => &builtin!(Proc(P::Beep), [], 0, R::None),
        "cdbl" => &builtin!(Func(F::Cdbl), [Num], 1, R::Double),
        "chr$" => &builtin!(Func(F::Chr), [Num], 1, R::Str),
        "cint" => &builtin!(Func(F::Cint), [Num], 1, R::Integer),
        "clng" => &builtin!(Func(F::Clng), [Num], 1, R::Long),
        "cls" => &builtin!(Proc(P::Cls), [], 0, R::None),
        "cos" => &builtin!(Func(F::Cos), [Num], 1, R::Widest),
        "csng" => &builtin!(Func(F::Csng), [Num], 1, R::Single),
        "date$" => &builtin!(Func(F::DateStr), [], 0, R::Str),
        "eof" => &builtin!(Func(F::Eof), [Num], 1, R::Integer),
        "exp" => &builtin!(Func(F::Exp), [Num], 1, R::Widest),
        "files" => &builtin!(Proc(P::Files), [Str], 0, R::None),
        "fix" => &builtin!(Func(F::Fix), [Num], 1, R::Widest),
        "hex$" => &builtin!(Func(F::Hex), [Num], 1, R::Str),
        "inkey$" => &builtin!(Func(F::Inkey), [], 0, R::Str),
        "instr" => &builtin!(Func(F::Instr), [Any, Any, Str], 2, R::Integer),
        "int" => &builtin!(Func(F::Int), [Num], 1, R::Widest),
        "kill" => &builtin!(Proc(P::Kill), [Str], 1, R::None),
        "lbound" => &builtin!(ArrayBound { upper: false }, [Any, Num], 1, R::Long),
        "lcase$" => &builtin!(Func(F::Lcase), [Str], 1, R::Str),
        "left$" => &builtin!(Func(F::Left), [Str, Num], 2, R::Str),
        "len" => &builtin!(Func(F::Len), [Str], 1, R::Long),
        "lof" => &builtin!(Func(F::Lof), [Num], 1, R::Long),
        "log" => &builtin!(Func(F::Log), [Num], 1, R::Widest),
        "ltrim$" => &builtin!(Func(F::Ltrim), [Str], 1, R::Str),
        "mid$" => &builtin!(Func(F::Mid), [Str, Num, Num], 2, R::Str),
        "name" => &builtin!(Proc(P::NameFile), [Str, Str], 2, R::None),
        "oct$" => &builtin!(Func(F::Oct), [Num], 1, R::Str),
        "peek" => &builtin!(Func(F::Peek), [Num], 1, R::Integer),
        "poke" => &builtin!(Proc(P::Poke), [Num, Num], 2, R::None),
        "randomize" => &builtin!(Proc(P::Randomize), [Num], 0, R::None),
        "right$" => &builtin!(Func(F::Right), [Str, Num], 2, R::Str),
        "rnd" => &builtin!(Func(F::Rnd), [Num], 0, R::Single),
        "rtrim$" => &builtin!(Func(F::Rtrim), [Str], 1, R::Str),
        "seek" => &builtin!(Func(F::SeekPos), [Num], 1, R::Long),
        "sgn" => &builtin!(Func(F::Sgn), [Num], 1, R::Integer),
        "sin" => &builtin!(Func(F::Sin), [Num], 1, R::Widest),
        "sleep" => &builtin!(Proc(P::Sleep), [Num], 0, R::None),
        "sound" => &builtin!(Proc(P::Sound), [Num, Num], 2, R::None),
        "space$" => &builtin!(Func(F::Space), [Num], 1, R::Str),
        "sqr" => &builtin!(Func(F::Sqr), [Num], 1, R::Widest),
        "str$" => &builtin!(Func(F::Str), [Num], 1, R::Str),
        "string$" => &builtin!(Func(F::StringRepeat), [Num, Any], 2, R::Str),
        "tan" => &builtin!(Func(F::Tan), [Num], 1, R::Widest),
        "time$" => &builtin!(Func(F::TimeStr), [], 0, R::Str),
        "timer" => &builtin!(Func(F::Timer), [], 0, R::Single),
        "ubound" => &builtin!(ArrayBound { upper: true }, [Any, Num], 1, R::Long),
        "ucase$" => &builtin!(Func(F::Ucase), [Str], 1, R::Str),
        "val" => &builtin!(Func(F::ValOf), [Str], 1, R::Double),
        "varptr" => &builtin!(VarPointer { segment: false }, [Any], 1, R::Long),
        "varseg" => &builtin!(VarPointer { segment: true }, [Any], 1, R::Long),
        _ => return None,
    };
    Some(builtin)
}

/// Statement-position lookup. A few names have a statement form
/// distinct from their function form (SEEK queries or sets the
/// position depending on where it appears); everything else falls
/// through to the shared table.
pub fn lookup_statement(name: &str) -> Option<&'static Builtin> {
    use ArgTy::*;
    use BuiltinOp::*;
    use ProcKind as P;
    use RetTy as R;
    let builtin: &'static Builtin = match name {
        "defseg" => &builtin!(Proc(P::DefSeg), [Num], 0, R::None),
        "seek" => &builtin!(Proc(P::SeekSet), [Num, Num], 2, R::None),
        _ => return lookup(name),
    };
    Some(builtin)
}

impl Builtin {
    /// The type the analyzer gives a hoisted result variable. `hint`
    /// is the inferred type of the first argument for `Widest`.
    pub fn result_ty(&self, hint: Option<&Ty>) -> Option<Ty> {
        match self.ret {
            RetTy::None => None,
            RetTy::Integer => Some(Ty::Integer),
            RetTy::Long => Some(Ty::Long),
            RetTy::Single => Some(Ty::Single),
            RetTy::Double => Some(Ty::Double),
            RetTy::Str => Some(Ty::String),
            RetTy::Widest => Some(match hint {
                Some(Ty::Double) => Ty::Double,
                Some(Ty::Integer) => Ty::Integer,
                Some(Ty::Long) => Ty::Long,
                _ => Ty::Single,
            }),
        }
    }
}

type Result<T> = std::result::Result<T, ErrorCode>;

fn float_arg(args: &[Val]) -> Result<f64> {
    args[0].number().ok_or(ErrorCode::TypeMismatch)
}

fn string_arg(val: &Val) -> Result<Rc<str>> {
    match val {
        Val::String(s) => Ok(s.clone()),
        _ => Err(ErrorCode::TypeMismatch),
    }
}

fn long_arg(val: &Val) -> Result<i32> {
    val.clone()
        .cast(&Ty::Long)
        .and_then(|v| match v {
            Val::Long(n) => Ok(n),
            _ => Err(ErrorCode::TypeMismatch),
        })
}

/// Same-width float result: double in, double out, everything else
/// single precision.
fn float_result(args: &[Val], n: f64) -> Result<Val> {
    if n.is_infinite() {
        return Err(ErrorCode::Overflow);
    }
    match args[0] {
        Val::Double(_) => Ok(Val::Double(n)),
        _ => {
            if n.is_finite() && n.abs() > f32::MAX as f64 {
                Err(ErrorCode::Overflow)
            } else {
                Ok(Val::Single(n as f32))
            }
        }
    }
}

/// Evaluate a pure function builtin. Kinds that need the execution
/// context (RND, TIMER, INKEY$, the file and pointer probes) are
/// dispatched by the statement layer instead.
pub fn eval(kind: FuncKind, args: &[Val]) -> Result<Val> {
    use FuncKind::*;
    match kind {
        Abs => match args[0].clone() {
            Val::Integer(n) => n
                .checked_abs()
                .map(Val::Integer)
                .ok_or(ErrorCode::Overflow),
            Val::Long(n) => n.checked_abs().map(Val::Long).ok_or(ErrorCode::Overflow),
            Val::Single(n) => Ok(Val::Single(n.abs())),
            Val::Double(n) => Ok(Val::Double(n.abs())),
            _ => Err(ErrorCode::TypeMismatch),
        },
        Asc => {
            let s = string_arg(&args[0])?;
            match s.bytes().next() {
                Some(b) => Ok(Val::Integer(b as i16)),
                None => Err(ErrorCode::IllegalFunctionCall),
            }
        }
        Atn => float_result(args, float_arg(args)?.atan()),
        Cdbl => args[0].clone().cast(&Ty::Double),
        Chr => {
            let code = long_arg(&args[0])?;
            if !(0..=255).contains(&code) {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            Ok(Val::String((code as u8 as char).to_string().into()))
        }
        Cint => args[0].clone().cast(&Ty::Integer),
        Clng => args[0].clone().cast(&Ty::Long),
        Cos => float_result(args, float_arg(args)?.cos()),
        Csng => args[0].clone().cast(&Ty::Single),
        Exp => float_result(args, float_arg(args)?.exp()),
        Fix => match args[0].clone() {
            Val::Integer(n) => Ok(Val::Integer(n)),
            Val::Long(n) => Ok(Val::Long(n)),
            Val::Single(n) => Ok(Val::Single(n.trunc())),
            Val::Double(n) => Ok(Val::Double(n.trunc())),
            _ => Err(ErrorCode::TypeMismatch),
        },
        Hex => Ok(Val::String(
            format!("{:X}", long_arg(&args[0])?).into(),
        )),
        Instr => {
            let (start, haystack, needle) = if args.len() == 3 {
                (
                    long_arg(&args[0])?,
                    string_arg(&args[1])?,
                    string_arg(&args[2])?,
                )
            } else {
                (1, string_arg(&args[0])?, string_arg(&args[1])?)
            };
            if start < 1 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let from = (start - 1) as usize;
            let position = if from > haystack.len() {
                None
            } else {
                haystack[from..].find(&*needle).map(|p| p + from + 1)
            };
            Ok(Val::Long(position.unwrap_or(0) as i32))
        }
        Int => match args[0].clone() {
            Val::Integer(n) => Ok(Val::Integer(n)),
            Val::Long(n) => Ok(Val::Long(n)),
            Val::Single(n) => Ok(Val::Single(n.floor())),
            Val::Double(n) => Ok(Val::Double(n.floor())),
            _ => Err(ErrorCode::TypeMismatch),
        },
        Lcase => Ok(Val::String(
            string_arg(&args[0])?.to_ascii_lowercase().into(),
        )),
        Left => {
            let s = string_arg(&args[0])?;
            let n = long_arg(&args[1])?;
            if n < 0 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let end = (n as usize).min(s.len());
            Ok(Val::String(s[..end].into()))
        }
        Len => Ok(Val::Long(string_arg(&args[0])?.len() as i32)),
        Log => {
            let n = float_arg(args)?;
            if n <= 0.0 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            float_result(args, n.ln())
        }
        Ltrim => Ok(Val::String(
            string_arg(&args[0])?.trim_start().into(),
        )),
        Mid => {
            let s = string_arg(&args[0])?;
            let start = long_arg(&args[1])?;
            if start < 1 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let from = ((start - 1) as usize).min(s.len());
            let len = if args.len() == 3 {
                let len = long_arg(&args[2])?;
                if len < 0 {
                    return Err(ErrorCode::IllegalFunctionCall);
                }
                len as usize
            } else {
                s.len()
            };
            let end = (from + len).min(s.len());
            Ok(Val::String(s[from..end].into()))
        }
        Oct => Ok(Val::String(
            format!("{:o}", long_arg(&args[0])?).into(),
        )),
        Right => {
            let s = string_arg(&args[0])?;
            let n = long_arg(&args[1])?;
            if n < 0 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let start = s.len().saturating_sub(n as usize);
            Ok(Val::String(s[start..].into()))
        }
        Rtrim => Ok(Val::String(string_arg(&args[0])?.trim_end().into())),
        Sgn => {
            let n = float_arg(args)?;
            Ok(Val::Integer(if n > 0.0 {
                1
            } else if n < 0.0 {
                -1
            } else {
                0
            }))
        }
        Sin => float_result(args, float_arg(args)?.sin()),
        Space => {
            let n = long_arg(&args[0])?;
            if n < 0 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            Ok(Val::String(" ".repeat(n as usize).into()))
        }
        Sqr => {
            let n = float_arg(args)?;
            if n < 0.0 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            float_result(args, n.sqrt())
        }
        Str => {
            let n = float_arg(args)?;
            let text = format!("{}", args[0]);
            Ok(Val::String(if n >= 0.0 {
                format!(" {}", text).into()
            } else {
                text.into()
            }))
        }
        StringRepeat => {
            let n = long_arg(&args[0])?;
            if n < 0 {
                return Err(ErrorCode::IllegalFunctionCall);
            }
            let unit = match &args[1] {
                Val::String(s) => match s.bytes().next() {
                    Some(b) => b as char,
                    None => return Err(ErrorCode::IllegalFunctionCall),
                },
                other => {
                    let code = long_arg(other)?;
                    if !(0..=255).contains(&code) {
                        return Err(ErrorCode::IllegalFunctionCall);
                    }
                    code as u8 as char
                }
            };
            Ok(Val::String(unit.to_string().repeat(n as usize).into()))
        }
        Tan => float_result(args, float_arg(args)?.tan()),
        Ucase => Ok(Val::String(
            string_arg(&args[0])?.to_ascii_uppercase().into(),
        )),
        ValOf => {
            let s = string_arg(&args[0])?;
            Ok(Val::Double(parse_leading_number(&s).unwrap_or(0.0)))
        }
        DateStr | Eof | Inkey | Lof | Peek | Rnd | SeekPos | Timer | TimeStr => {
            Err(ErrorCode::InternalError)
        }
    }
}

/// VAL's lenient parse: skip leading spaces, take the longest numeric
/// prefix, ignore the rest.
pub fn parse_leading_number(text: &str) -> Option<f64> {
    let trimmed = text.trim_start();
    let mut end = 0;
    let mut seen_digit = false;
    let mut seen_dot = false;
    let mut seen_exp = false;
    for (index, c) in trimmed.char_indices() {
        match c {
            '0'..='9' => {
                seen_digit = true;
                end = index + 1;
            }
            '+' | '-' if index == 0 || trimmed[..index].ends_with(['e', 'E']) => {}
            '.' if !seen_dot && !seen_exp => seen_dot = true,
            'e' | 'E' if seen_digit && !seen_exp => {
                seen_exp = true;
            }
            _ => break,
        }
    }
    if !seen_digit {
        return None;
    }
    trimmed[..end].parse().ok().or_else(|| {
        // Trailing exponent marker without digits, e.g. "12e".
        trimmed[..end].trim_end_matches(['e', 'E']).parse().ok()
    })
}
