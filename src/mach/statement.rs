use super::builtins::{self, FuncKind, ProcKind};
use super::common::{self, CommonBlock};
use super::context::ExecutionContext;
use super::events::{Channel, TrapState};
use super::expr::Expr;
use super::files::FileMode;
use super::memory::{Address, StorageClass};
use super::ty::Ty;
use super::val::{ArrayDesc, Reference, Val};
use super::var::Variable;
use crate::error;
use crate::lang::{Error, Token};
use std::convert::TryFrom;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## Statements
///
/// The uniform unit of execution: every compiled operation is one
/// variant of a closed enum with a single dispatch function. Operands
/// are fixed at code-generation time; the only runtime input is the
/// shared execution context, and the only way a statement can move
/// the program counter is the control-flow effect it returns. `None`
/// means fall through to the next statement.

/// The effect a statement hands back to the engine.
#[derive(Clone, Debug)]
pub enum ControlFlow {
    Goto(usize),
    Gosub(usize),
    /// Push the chunk's entry; the statement has already pushed the
    /// automatic frame and queued its argument writes.
    Call(usize),
    /// Pop the matching GOSUB location.
    Return,
    /// Leave the current procedure; its automatic frame is already
    /// popped.
    Exit,
    Halt,
    /// Park the engine until the host completes the request, then
    /// resume at the next statement.
    Wait(InputRequest),
}

/// A suspended INPUT or LINE INPUT: the host collects a line (or
/// several comma-separated fields) and hands it back through
/// `Invocation::provide_input`.
#[derive(Clone, Debug)]
pub struct InputRequest {
    pub prompt: Rc<str>,
    pub line: bool,
    pub targets: Vec<Rc<Variable>>,
}

#[derive(Clone, Debug)]
pub enum PrintOp {
    Expr(Expr),
    Comma,
    Semicolon,
}

#[derive(Clone, Debug)]
pub enum CaseCondition {
    Value(Expr),
    Range(Expr, Expr),
    Is(CaseRel, Expr),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CaseRel {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelKind {
    Timer,
    Key,
    Strig,
    Pen,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ChannelControl {
    On,
    Off,
    Stop,
}

/// One deferred write into a freshly pushed automatic frame.
#[derive(Clone, Debug)]
pub struct FrameWrite {
    pub slot: usize,
    pub source: WriteSource,
}

#[derive(Clone, Debug)]
pub enum WriteSource {
    /// By-reference argument: a pinned reference to the caller's
    /// variable.
    Ref(Rc<Variable>),
    /// By-value argument, cast to the parameter type.
    Value(Expr, Ty),
}

#[derive(Debug)]
pub enum Statement {
    Assign {
        token: Token,
        target: Rc<Variable>,
        expr: Expr,
    },
    /// Record assignment copies every field slot element-wise.
    AssignRecord {
        token: Token,
        target: Rc<Variable>,
        source: Rc<Variable>,
    },
    /// Hoisted array subscript: check bounds, then install a
    /// reference to the element in a synthetic variable.
    IndexArray {
        token: Token,
        array: Rc<Variable>,
        indices: Vec<Expr>,
        field_offset: usize,
        result: Rc<Variable>,
    },
    Dim {
        token: Token,
        array: Rc<Variable>,
        bounds: Vec<(Expr, Expr)>,
        redim: bool,
    },
    Erase {
        token: Token,
        array: Rc<Variable>,
    },
    Goto {
        target: usize,
    },
    Gosub {
        target: usize,
    },
    OnIndex {
        token: Token,
        expr: Expr,
        gosub: bool,
        targets: Vec<usize>,
    },
    Return {
        token: Token,
    },
    /// Conditional branch used by IF/ELSEIF and WHILE: branch to
    /// `target` when the test is false.
    IfNot {
        token: Token,
        test: Expr,
        target: usize,
    },
    /// DO WHILE/UNTIL pre-test: branch out when the loop should not
    /// run.
    DoTest {
        token: Token,
        is_while: bool,
        test: Expr,
        target: usize,
    },
    /// LOOP WHILE/UNTIL post-test: branch back to the top when the
    /// loop continues.
    LoopTest {
        token: Token,
        is_while: bool,
        test: Expr,
        target: usize,
    },
    /// FOR's pre-loop check: skip the whole loop when the step sign
    /// contradicts the bounds.
    ForTest {
        token: Token,
        counter: Rc<Variable>,
        end: Rc<Variable>,
        step: Option<Rc<Variable>>,
        target: usize,
    },
    /// NEXT carries the same operand set as FOR so nothing has to be
    /// re-derived: increment, then branch back while in bounds.
    Next {
        token: Token,
        counter: Rc<Variable>,
        end: Rc<Variable>,
        step: Option<Rc<Variable>>,
        target: usize,
    },
    /// One CASE comparison against the evaluated selector variable;
    /// branch to the block on match.
    CaseTest {
        token: Token,
        test: Rc<Variable>,
        condition: CaseCondition,
        target: usize,
    },
    Call {
        token: Token,
        chunk: usize,
        frame_size: usize,
        writes: Vec<FrameWrite>,
    },
    /// END SUB, END FUNCTION, EXIT SUB, EXIT FUNCTION, EXIT DEF: pop
    /// the automatic frame and leave the procedure.
    ExitProcedure {
        token: Token,
    },
    End {
        token: Token,
    },
    Stop {
        token: Token,
    },
    ReadData {
        token: Token,
        target: Rc<Variable>,
    },
    Restore {
        data_index: usize,
    },
    Input {
        token: Token,
        prompt: Rc<str>,
        line: bool,
        targets: Vec<Rc<Variable>>,
    },
    Print {
        token: Token,
        to_printer: bool,
        items: Vec<PrintOp>,
    },
    Swap {
        token: Token,
        left: Rc<Variable>,
        right: Rc<Variable>,
    },
    /// A hoisted builtin function call filling a synthetic result.
    CallBuiltin {
        token: Token,
        kind: FuncKind,
        args: Vec<Expr>,
        result: Rc<Variable>,
    },
    /// A builtin command in statement position.
    SystemProc {
        token: Token,
        kind: ProcKind,
        args: Vec<Expr>,
    },
    ArrayBound {
        token: Token,
        array: Rc<Variable>,
        dimension: Option<Expr>,
        upper: bool,
        result: Rc<Variable>,
    },
    /// VARSEG/VARPTR: install a stable integer handle for the
    /// variable's address.
    VarPointer {
        token: Token,
        variable: Rc<Variable>,
        result: Rc<Variable>,
    },
    OnEvent {
        token: Token,
        channel: ChannelKind,
        param: Option<Expr>,
        target: usize,
    },
    EventControl {
        token: Token,
        channel: ChannelKind,
        param: Option<Expr>,
        control: ChannelControl,
    },
    OpenFile {
        token: Token,
        path: Expr,
        mode: FileMode,
        number: Expr,
        record_len: Option<Expr>,
    },
    CloseFile {
        token: Token,
        numbers: Vec<Expr>,
    },
    Common {
        token: Token,
        vars: Vec<Rc<Variable>>,
    },
    Chain {
        token: Token,
        path: Expr,
    },
    /// ON ERROR and RESUME parse but are not implemented; running one
    /// reports the legacy "Advanced feature unavailable".
    ErrorHook {
        token: Token,
    },
}

impl Statement {
    /// Late-bound branch target, patched by the chunk link pass.
    pub fn set_target(&mut self, index: usize) {
        use Statement::*;
        match self {
            Goto { target }
            | Gosub { target }
            | IfNot { target, .. }
            | DoTest { target, .. }
            | LoopTest { target, .. }
            | ForTest { target, .. }
            | Next { target, .. }
            | CaseTest { target, .. }
            | OnEvent { target, .. } => *target = index,
            OnIndex { targets, .. } => targets.push(index),
            _ => debug_assert!(false, "statement has no target"),
        }
    }

    /// Source token for error attribution; synthesized statements
    /// carry an internal token.
    pub fn token(&self) -> Option<&Token> {
        use Statement::*;
        match self {
            Assign { token, .. }
            | AssignRecord { token, .. }
            | IndexArray { token, .. }
            | Dim { token, .. }
            | Erase { token, .. }
            | OnIndex { token, .. }
            | Return { token }
            | IfNot { token, .. }
            | DoTest { token, .. }
            | LoopTest { token, .. }
            | ForTest { token, .. }
            | Next { token, .. }
            | CaseTest { token, .. }
            | Call { token, .. }
            | ExitProcedure { token }
            | End { token }
            | Stop { token }
            | ReadData { token, .. }
            | Input { token, .. }
            | Print { token, .. }
            | Swap { token, .. }
            | CallBuiltin { token, .. }
            | SystemProc { token, .. }
            | ArrayBound { token, .. }
            | VarPointer { token, .. }
            | OnEvent { token, .. }
            | EventControl { token, .. }
            | OpenFile { token, .. }
            | CloseFile { token, .. }
            | Common { token, .. }
            | Chain { token, .. }
            | ErrorHook { token } => Some(token),
            Goto { .. } | Gosub { .. } | Restore { .. } => None,
        }
    }

    pub fn execute(&self, ctx: &mut ExecutionContext) -> Result<Option<ControlFlow>> {
        use Statement::*;
        match self {
            Assign {
                token,
                target,
                expr,
            } => {
                let value = eval_cast(expr, &target.ty, ctx, token)?;
                ctx.memory.write(target, value)?;
                Ok(None)
            }
            AssignRecord {
                token: _,
                target,
                source,
            } => {
                let span = target.ty.span();
                let (source_base, _) = ctx.memory.dereference(source)?;
                let (target_base, _) = ctx.memory.dereference(target)?;
                for slot in 0..span {
                    let value = ctx.memory.read_address(source_base.offset(slot))?;
                    ctx.memory.write_address(target_base.offset(slot), value)?;
                }
                Ok(None)
            }
            IndexArray {
                token,
                array,
                indices,
                field_offset,
                result,
            } => {
                let descriptor = array_descriptor(ctx, array, token)?;
                if indices.len() != descriptor.bounds.len() {
                    return Err(error!(SubscriptOutOfRange, token).runtime());
                }
                let mut element = 0usize;
                let mut stride = 1usize;
                for (dimension, expr) in indices.iter().enumerate() {
                    let index = eval_i32(expr, ctx, token)?;
                    let (lower, upper) = descriptor.bounds[dimension];
                    if index < lower || index > upper {
                        return Err(error!(SubscriptOutOfRange, token).runtime());
                    }
                    element += stride * (index - lower) as usize;
                    stride *= (upper - lower + 1) as usize;
                }
                let address = descriptor
                    .base
                    .offset(element * descriptor.span + field_offset);
                let result_address = result
                    .address
                    .ok_or_else(|| error!(InternalError; "Synthetic variable has no address"))?;
                ctx.memory.write_address(
                    result_address,
                    Some(Val::Ref(Reference {
                        address,
                        var: array.clone(),
                    })),
                )?;
                Ok(None)
            }
            Dim {
                token,
                array,
                bounds,
                redim,
            } => {
                let mut resolved = Vec::with_capacity(bounds.len());
                for (lower, upper) in bounds {
                    let lower = eval_i32(lower, ctx, token)?;
                    let upper = eval_i32(upper, ctx, token)?;
                    if upper < lower {
                        return Err(error!(SubscriptOutOfRange, token).runtime());
                    }
                    resolved.push((lower, upper));
                }
                let (slot, stored) = ctx.memory.dereference(array)?;
                if let Some(Val::Array(old)) = stored {
                    if !redim {
                        return Err(error!(DuplicateDefinition, token).runtime());
                    }
                    ctx.memory.deallocate(old.base)?;
                }
                let span = array.element_span();
                let count: usize = resolved
                    .iter()
                    .map(|(lower, upper)| (upper - lower + 1) as usize)
                    .product::<usize>()
                    * span;
                let base = ctx.memory.allocate(count);
                ctx.memory.write_address(
                    slot,
                    Some(Val::Array(ArrayDesc {
                        bounds: resolved,
                        base,
                        span,
                    })),
                )?;
                Ok(None)
            }
            Erase { token: _, array } => {
                let (slot, stored) = ctx.memory.dereference(array)?;
                if let Some(Val::Array(descriptor)) = stored {
                    ctx.memory.deallocate(descriptor.base)?;
                    ctx.memory.write_address(slot, None)?;
                }
                Ok(None)
            }
            Goto { target } => Ok(Some(ControlFlow::Goto(*target))),
            Gosub { target } => Ok(Some(ControlFlow::Gosub(*target))),
            OnIndex {
                token,
                expr,
                gosub,
                targets,
            } => {
                let index = eval_i32(expr, ctx, token)?;
                if !(0..=255).contains(&index) {
                    return Err(error!(IllegalFunctionCall, token).runtime());
                }
                let index = index as usize;
                if index >= 1 && index <= targets.len() {
                    let target = targets[index - 1];
                    Ok(Some(if *gosub {
                        ControlFlow::Gosub(target)
                    } else {
                        ControlFlow::Goto(target)
                    }))
                } else {
                    Ok(None)
                }
            }
            Return { token: _ } => Ok(Some(ControlFlow::Return)),
            IfNot {
                token,
                test,
                target,
            } => {
                if !test.eval_bool(&ctx.memory, token)? {
                    Ok(Some(ControlFlow::Goto(*target)))
                } else {
                    Ok(None)
                }
            }
            DoTest {
                token,
                is_while,
                test,
                target,
            } => {
                let test = test.eval_bool(&ctx.memory, token)?;
                if *is_while != test {
                    Ok(Some(ControlFlow::Goto(*target)))
                } else {
                    Ok(None)
                }
            }
            LoopTest {
                token,
                is_while,
                test,
                target,
            } => {
                let test = test.eval_bool(&ctx.memory, token)?;
                if *is_while == test {
                    Ok(Some(ControlFlow::Goto(*target)))
                } else {
                    Ok(None)
                }
            }
            ForTest {
                token,
                counter,
                end,
                step,
                target,
            } => {
                let start = read_number(ctx, counter, token)?;
                let end = read_number(ctx, end, token)?;
                let step = match step {
                    Some(step) => read_number(ctx, step, token)?,
                    None => 1.0,
                };
                if (end > start && step < 0.0) || (end < start && step > 0.0) {
                    Ok(Some(ControlFlow::Goto(*target)))
                } else {
                    Ok(None)
                }
            }
            Next {
                token,
                counter,
                end,
                step,
                target,
            } => {
                let current = read_number(ctx, counter, token)?;
                let step = match step {
                    Some(step) => read_number(ctx, step, token)?,
                    None => 1.0,
                };
                let next = Val::Double(current + step)
                    .cast(&counter.ty)
                    .map_err(|code| Error::new(code).at(token).runtime())?;
                let next_number = next.number().unwrap_or(0.0);
                ctx.memory.write(counter, next)?;
                let end = read_number(ctx, end, token)?;
                let continues = if step >= 0.0 {
                    next_number <= end
                } else {
                    next_number >= end
                };
                if continues {
                    Ok(Some(ControlFlow::Goto(*target)))
                } else {
                    Ok(None)
                }
            }
            CaseTest {
                token,
                test,
                condition,
                target,
            } => {
                let value = ctx
                    .memory
                    .read(test)?
                    .unwrap_or_else(|| Val::default_of(&test.ty));
                if case_matches(ctx, value, condition, token)? {
                    Ok(Some(ControlFlow::Goto(*target)))
                } else {
                    Ok(None)
                }
            }
            Call {
                token,
                chunk,
                frame_size,
                writes,
            } => {
                // Evaluate in the caller's frame, then push and fill
                // the callee's.
                let mut values = Vec::with_capacity(writes.len());
                for write in writes {
                    let value = match &write.source {
                        WriteSource::Ref(variable) => {
                            let (address, _) = ctx.memory.dereference(variable)?;
                            Val::Ref(Reference {
                                address: ctx.memory.pin(address),
                                var: variable.clone(),
                            })
                        }
                        WriteSource::Value(expr, ty) => eval_cast(expr, ty, ctx, token)?,
                    };
                    values.push((write.slot, value));
                }
                ctx.memory.push_stack(*frame_size);
                for (slot, value) in values {
                    ctx.memory
                        .write_address(Address::new(StorageClass::Automatic, slot), Some(value))?;
                }
                Ok(Some(ControlFlow::Call(*chunk)))
            }
            ExitProcedure { token: _ } => {
                ctx.memory.pop_stack()?;
                Ok(Some(ControlFlow::Exit))
            }
            End { token: _ } | Stop { token: _ } => Ok(Some(ControlFlow::Halt)),
            ReadData { token, target } => {
                let item = match ctx.data.read() {
                    Some(item) => item,
                    None => return Err(error!(OutOfData, token).runtime()),
                };
                let value = if target.ty.is_string() {
                    Val::String(item.text.unwrap_or_else(|| "".into()))
                } else {
                    if item.quoted {
                        return Err(error!(SyntaxError, token).runtime());
                    }
                    match &item.text {
                        None => Val::Double(0.0),
                        Some(text) => match builtins::parse_leading_number(text) {
                            Some(n) => Val::Double(n),
                            None => return Err(error!(SyntaxError, token).runtime()),
                        },
                    }
                };
                let value = value
                    .cast(&target.ty)
                    .map_err(|code| Error::new(code).at(token).runtime())?;
                ctx.memory.write(target, value)?;
                Ok(None)
            }
            Restore { data_index } => {
                ctx.data.restore(*data_index);
                Ok(None)
            }
            Input {
                token: _,
                prompt,
                line,
                targets,
            } => Ok(Some(ControlFlow::Wait(InputRequest {
                prompt: prompt.clone(),
                line: *line,
                targets: targets.clone(),
            }))),
            Print {
                token,
                to_printer,
                items,
            } => {
                let mut newline = true;
                for item in items {
                    match item {
                        PrintOp::Expr(expr) => {
                            let value = eval_val(expr, ctx, token)?;
                            let text = format_value(&value);
                            if *to_printer {
                                ctx.devices.printer.print(&text);
                            } else {
                                ctx.devices.screen.print(&text);
                            }
                            newline = true;
                        }
                        PrintOp::Comma => {
                            if *to_printer {
                                ctx.devices.printer.print(" ");
                            } else {
                                let column = ctx.devices.screen.column();
                                let pad = PRINT_ZONE - column % PRINT_ZONE;
                                ctx.devices.screen.print(&" ".repeat(pad));
                            }
                            newline = false;
                        }
                        PrintOp::Semicolon => {
                            newline = false;
                        }
                    }
                }
                if newline {
                    if *to_printer {
                        ctx.devices.printer.print("\n");
                    } else {
                        ctx.devices.screen.print("\n");
                    }
                }
                Ok(None)
            }
            Swap {
                token: _,
                left,
                right,
            } => {
                let left_value = ctx
                    .memory
                    .read(left)?
                    .unwrap_or_else(|| Val::default_of(&left.ty));
                let right_value = ctx
                    .memory
                    .read(right)?
                    .unwrap_or_else(|| Val::default_of(&right.ty));
                ctx.memory.write(left, right_value)?;
                ctx.memory.write(right, left_value)?;
                Ok(None)
            }
            CallBuiltin {
                token,
                kind,
                args,
                result,
            } => {
                let value = eval_builtin(ctx, *kind, args, token)?;
                let value = value
                    .cast(&result.ty)
                    .map_err(|code| Error::new(code).at(token).runtime())?;
                write_synthetic(ctx, result, value)?;
                Ok(None)
            }
            SystemProc { token, kind, args } => {
                run_proc(ctx, *kind, args, token)?;
                Ok(None)
            }
            ArrayBound {
                token,
                array,
                dimension,
                upper,
                result,
            } => {
                let descriptor = array_descriptor(ctx, array, token)?;
                let dimension = match dimension {
                    Some(expr) => eval_i32(expr, ctx, token)?,
                    None => 1,
                };
                if dimension < 1 || dimension as usize > descriptor.bounds.len() {
                    return Err(error!(SubscriptOutOfRange, token).runtime());
                }
                let (lower, upper_bound) = descriptor.bounds[(dimension - 1) as usize];
                let value = Val::Long(if *upper { upper_bound } else { lower });
                write_synthetic(ctx, result, value)?;
                Ok(None)
            }
            VarPointer {
                token: _,
                variable,
                result,
            } => {
                let (address, _) = ctx.memory.dereference(variable)?;
                let pinned = ctx.memory.pin(address);
                let handle = ctx.memory.write_pointer(pinned, variable.clone());
                write_synthetic(ctx, result, Val::Long(handle))?;
                Ok(None)
            }
            OnEvent {
                token,
                channel,
                param,
                target,
            } => {
                match channel {
                    ChannelKind::Timer => {
                        let duration = match param {
                            Some(expr) => eval_number(expr, ctx, token)?,
                            None => 1.0,
                        };
                        if duration <= 0.0 {
                            return Err(error!(IllegalFunctionCall, token).runtime());
                        }
                        let now = ctx.devices.timer.timer();
                        ctx.events.arm_timer(now, duration, *target);
                    }
                    _ => {
                        let channel = event_channel(ctx, *channel, param, token)?;
                        ctx.events.arm(channel, *target);
                    }
                }
                Ok(None)
            }
            EventControl {
                token,
                channel,
                param,
                control,
            } => {
                let channel = event_channel(ctx, *channel, param, token)?;
                let state = match control {
                    ChannelControl::On => TrapState::On,
                    ChannelControl::Off => TrapState::Off,
                    ChannelControl::Stop => TrapState::Stopped,
                };
                ctx.events.set_state(channel, state);
                Ok(None)
            }
            OpenFile {
                token,
                path,
                mode,
                number,
                record_len,
            } => {
                let path = eval_string(path, ctx, token)?;
                let number = eval_file_number(number, ctx, token)?;
                let record_len = match record_len {
                    Some(expr) => {
                        let len = eval_i32(expr, ctx, token)?;
                        if len <= 0 {
                            return Err(error!(IllegalFunctionCall, token).runtime());
                        }
                        len as usize
                    }
                    None => 128,
                };
                let opener = ctx.opener.as_mut();
                ctx.files
                    .open(opener, number, &path, *mode, record_len)
                    .map_err(|e| e.at(token).runtime())?;
                Ok(None)
            }
            CloseFile { token, numbers } => {
                if numbers.is_empty() {
                    ctx.files.close_all();
                } else {
                    for expr in numbers {
                        let number = eval_file_number(expr, ctx, token)?;
                        ctx.files
                            .close(number)
                            .map_err(|e| e.at(token).runtime())?;
                    }
                }
                Ok(None)
            }
            Common { token, vars } => {
                for variable in vars {
                    let incoming = ctx
                        .common
                        .declare(variable.clone())
                        .map_err(|e| e.at(token).runtime())?;
                    if let Some(value) = incoming {
                        restore_common(ctx, variable, &value, token)?;
                    }
                }
                Ok(None)
            }
            Chain { token, path } => {
                let path = eval_string(path, ctx, token)?;
                let envelope = ctx.common.serialize(&ctx.memory)?;
                ctx.chain_envelope = Some(envelope);
                ctx.chained = Some(path.into());
                Ok(Some(ControlFlow::Halt))
            }
            ErrorHook { token } => Err(error!(AdvancedFeature, token).runtime()),
        }
    }
}

const PRINT_ZONE: usize = 14;

/// Legacy PRINT formatting: numbers wear a sign-or-space prefix and a
/// trailing space, strings print verbatim.
fn format_value(value: &Val) -> String {
    if value.is_numeric() {
        let text = value.to_string();
        if text.starts_with('-') {
            format!("{} ", text)
        } else {
            format!(" {} ", text)
        }
    } else {
        value.to_string()
    }
}

fn eval_val(expr: &Expr, ctx: &ExecutionContext, token: &Token) -> Result<Val> {
    let value = expr.eval(&ctx.memory)?;
    match value.error() {
        Some(code) => Err(Error::new(code).at(token).runtime()),
        None => Ok(value),
    }
}

fn eval_cast(expr: &Expr, ty: &Ty, ctx: &ExecutionContext, token: &Token) -> Result<Val> {
    expr.eval(&ctx.memory)?
        .cast(ty)
        .map_err(|code| Error::new(code).at(token).runtime())
}

fn eval_number(expr: &Expr, ctx: &ExecutionContext, token: &Token) -> Result<f64> {
    let value = eval_val(expr, ctx, token)?;
    value
        .number()
        .ok_or_else(|| error!(TypeMismatch, token).runtime())
}

fn eval_i32(expr: &Expr, ctx: &ExecutionContext, token: &Token) -> Result<i32> {
    match eval_cast(expr, &Ty::Long, ctx, token)? {
        Val::Long(n) => Ok(n),
        _ => Err(error!(TypeMismatch, token).runtime()),
    }
}

fn eval_string(expr: &Expr, ctx: &ExecutionContext, token: &Token) -> Result<String> {
    match eval_val(expr, ctx, token)? {
        Val::String(s) => Ok(s.to_string()),
        _ => Err(error!(TypeMismatch, token).runtime()),
    }
}

fn eval_file_number(expr: &Expr, ctx: &ExecutionContext, token: &Token) -> Result<u16> {
    let number = eval_i32(expr, ctx, token)?;
    u16::try_from(number).map_err(|_| error!(BadFileNameOrNumber, token).runtime())
}

fn read_number(ctx: &ExecutionContext, variable: &Variable, token: &Token) -> Result<f64> {
    let value = ctx
        .memory
        .read(variable)?
        .unwrap_or_else(|| Val::default_of(&variable.ty));
    value
        .number()
        .ok_or_else(|| error!(TypeMismatch, token).runtime())
}

/// Synthetic result variables are written in place, never through a
/// reference chain: an index temp may still hold a stale reference
/// from an earlier pass over the same statement.
fn write_synthetic(ctx: &mut ExecutionContext, variable: &Variable, value: Val) -> Result<()> {
    let address = variable
        .address
        .ok_or_else(|| error!(InternalError; "Synthetic variable has no address"))?;
    ctx.memory.write_address(address, Some(value))
}

/// Fetch an array's descriptor, dimensioning it on first use when its
/// bounds were declared constant.
fn array_descriptor(
    ctx: &mut ExecutionContext,
    array: &Rc<Variable>,
    token: &Token,
) -> Result<ArrayDesc> {
    let (slot, stored) = ctx.memory.dereference(array)?;
    match stored {
        Some(Val::Array(descriptor)) => Ok(descriptor),
        Some(_) => Err(error!(InternalError; "Array slot holds a non-descriptor")),
        None => {
            let dims = match &array.dims {
                Some(dims) => dims,
                None => return Err(error!(InternalError; "Not an array variable")),
            };
            let mut bounds = Vec::with_capacity(dims.len());
            for dim in dims {
                match (dim.lower, dim.upper) {
                    (Some(lower), Some(upper)) => bounds.push((lower, upper)),
                    // Dynamic array used before DIM ran.
                    _ => return Err(error!(SubscriptOutOfRange, token).runtime()),
                }
            }
            let span = array.element_span();
            let count: usize = bounds
                .iter()
                .map(|(lower, upper)| (upper - lower + 1) as usize)
                .product::<usize>()
                * span;
            let base = ctx.memory.allocate(count);
            let descriptor = ArrayDesc { bounds, base, span };
            ctx.memory
                .write_address(slot, Some(Val::Array(descriptor.clone())))?;
            Ok(descriptor)
        }
    }
}

fn case_matches(
    ctx: &ExecutionContext,
    value: Val,
    condition: &CaseCondition,
    token: &Token,
) -> Result<bool> {
    let truthy = |val: Val| -> Result<bool> {
        match val {
            Val::Integer(n) => Ok(n != 0),
            Val::Error(code) => Err(Error::new(code).at(token).runtime()),
            _ => Err(error!(TypeMismatch, token).runtime()),
        }
    };
    match condition {
        CaseCondition::Value(expr) => {
            let other = eval_val(expr, ctx, token)?;
            truthy(value.compare_eq(other))
        }
        CaseCondition::Range(lower, upper) => {
            let lower = eval_val(lower, ctx, token)?;
            let upper = eval_val(upper, ctx, token)?;
            Ok(truthy(value.clone().compare_ge(lower))? && truthy(value.compare_le(upper))?)
        }
        CaseCondition::Is(rel, expr) => {
            let other = eval_val(expr, ctx, token)?;
            truthy(match rel {
                CaseRel::Equal => value.compare_eq(other),
                CaseRel::NotEqual => value.compare_ne(other),
                CaseRel::Less => value.compare_lt(other),
                CaseRel::LessEqual => value.compare_le(other),
                CaseRel::Greater => value.compare_gt(other),
                CaseRel::GreaterEqual => value.compare_ge(other),
            })
        }
    }
}

fn event_channel(
    ctx: &ExecutionContext,
    kind: ChannelKind,
    param: &Option<Expr>,
    token: &Token,
) -> Result<Channel> {
    let number = match param {
        Some(expr) => {
            let n = eval_i32(expr, ctx, token)?;
            if !(0..=255).contains(&n) {
                return Err(error!(IllegalFunctionCall, token).runtime());
            }
            n as u8
        }
        None => 0,
    };
    Ok(match kind {
        ChannelKind::Timer => Channel::Timer,
        ChannelKind::Key => Channel::Key(number),
        ChannelKind::Strig => Channel::Strig(number),
        ChannelKind::Pen => Channel::Pen,
    })
}

/// Context-dependent function builtins; the pure remainder defers to
/// the registry's evaluator.
fn eval_builtin(
    ctx: &mut ExecutionContext,
    kind: FuncKind,
    args: &[Expr],
    token: &Token,
) -> Result<Val> {
    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        values.push(eval_val(arg, ctx, token)?);
    }
    match kind {
        FuncKind::Rnd => {
            let value = match values.first().and_then(Val::number) {
                Some(n) if n < 0.0 => {
                    ctx.rng.reseed(n);
                    ctx.rng.next()
                }
                Some(n) if n == 0.0 => ctx.rng.last(),
                _ => ctx.rng.next(),
            };
            Ok(Val::Single(value))
        }
        FuncKind::Inkey => {
            let key = ctx.devices.keyboard.check_key();
            Ok(Val::String(match key {
                Some(c) => c.to_string().into(),
                None => "".into(),
            }))
        }
        FuncKind::Timer => Ok(Val::Single(ctx.devices.timer.timer() as f32)),
        FuncKind::TimeStr => Ok(Val::String(ctx.devices.timer.time().into())),
        FuncKind::DateStr => Ok(Val::String(ctx.devices.timer.date().into())),
        FuncKind::Eof => {
            let number = file_number_of(&values[0], token)?;
            let file = ctx.files.get(number).map_err(|e| e.at(token).runtime())?;
            Ok(Val::Integer(if file.accessor.eof() { -1 } else { 0 }))
        }
        FuncKind::Lof => {
            let number = file_number_of(&values[0], token)?;
            let file = ctx.files.get(number).map_err(|e| e.at(token).runtime())?;
            Ok(Val::Long(file.accessor.len() as i32))
        }
        FuncKind::SeekPos => {
            let number = file_number_of(&values[0], token)?;
            let file = ctx.files.get(number).map_err(|e| e.at(token).runtime())?;
            Ok(Val::Long(file.accessor.position() as i32 + 1))
        }
        FuncKind::Peek => {
            let offset = match values[0].clone().cast(&Ty::Long) {
                Ok(Val::Long(n)) if n >= 0 => n as usize,
                _ => return Err(error!(IllegalFunctionCall, token).runtime()),
            };
            let handle = ctx.memory.segment();
            let (address, variable) = ctx
                .memory
                .read_pointer(handle)
                .map_err(|e| e.at(token).runtime())?
                .clone();
            let value = ctx
                .memory
                .read_address(address)?
                .unwrap_or_else(|| Val::default_of(&variable.ty));
            let mut bytes = Vec::new();
            common::encode_value(&mut bytes, &value)?;
            Ok(Val::Integer(bytes.get(offset).copied().unwrap_or(0) as i16))
        }
        _ => builtins::eval(kind, &values)
            .map_err(|code| Error::new(code).at(token).runtime()),
    }
}

fn file_number_of(value: &Val, token: &Token) -> Result<u16> {
    match value.clone().cast(&Ty::Long) {
        Ok(Val::Long(n)) => {
            u16::try_from(n).map_err(|_| error!(BadFileNameOrNumber, token).runtime())
        }
        _ => Err(error!(BadFileNameOrNumber, token).runtime()),
    }
}

fn run_proc(
    ctx: &mut ExecutionContext,
    kind: ProcKind,
    args: &[Expr],
    token: &Token,
) -> Result<()> {
    match kind {
        ProcKind::Beep => {
            ctx.devices.speaker.beep();
        }
        ProcKind::Cls => {
            ctx.devices.screen.cls();
        }
        ProcKind::DefSeg => {
            let segment = match args.first() {
                Some(expr) => eval_i32(expr, ctx, token)?,
                None => 0,
            };
            ctx.memory.set_segment(segment);
        }
        ProcKind::Files => {
            let pattern = match args.first() {
                Some(expr) => eval_string(expr, ctx, token)?,
                None => "*".to_string(),
            };
            for name in ctx.devices.disk.list_files(&pattern) {
                let line = format!("{}\n", name);
                ctx.devices.screen.print(&line);
            }
        }
        ProcKind::Kill => {
            let path = eval_string(&args[0], ctx, token)?;
            if !ctx.devices.disk.remove(&path) {
                return Err(error!(FileNotFound, token).runtime());
            }
        }
        ProcKind::NameFile => {
            let from = eval_string(&args[0], ctx, token)?;
            let to = eval_string(&args[1], ctx, token)?;
            if !ctx.devices.disk.rename(&from, &to) {
                return Err(error!(FileNotFound, token).runtime());
            }
        }
        ProcKind::Poke => {
            let offset = eval_i32(&args[0], ctx, token)?;
            let byte = eval_i32(&args[1], ctx, token)?;
            if offset < 0 || !(0..=255).contains(&byte) {
                return Err(error!(IllegalFunctionCall, token).runtime());
            }
            let handle = ctx.memory.segment();
            let (address, variable) = ctx
                .memory
                .read_pointer(handle)
                .map_err(|e| e.at(token).runtime())?
                .clone();
            let value = ctx
                .memory
                .read_address(address)?
                .unwrap_or_else(|| Val::default_of(&variable.ty));
            let mut bytes = Vec::new();
            common::encode_value(&mut bytes, &value)?;
            let offset = offset as usize;
            if offset < bytes.len() {
                bytes[offset] = byte as u8;
                let mut cursor = 0;
                let patched = common::decode_value(&variable.ty, &bytes, &mut cursor)?;
                ctx.memory.write_address(address, Some(patched))?;
            }
        }
        ProcKind::Randomize => {
            let seed = match args.first() {
                Some(expr) => eval_number(expr, ctx, token)?,
                None => ctx.devices.timer.timer(),
            };
            ctx.rng.reseed(seed);
        }
        ProcKind::SeekSet => {
            let number = eval_file_number(&args[0], ctx, token)?;
            let position = eval_i32(&args[1], ctx, token)?;
            if position < 1 {
                return Err(error!(BadRecordNumber, token).runtime());
            }
            let file = ctx.files.get(number).map_err(|e| e.at(token).runtime())?;
            file.accessor.seek(position as u64 - 1)?;
        }
        ProcKind::Sleep => {
            let duration = match args.first() {
                Some(expr) => eval_number(expr, ctx, token)?,
                None => 0.0,
            };
            let start = ctx.devices.timer.timer();
            let keys_pending = ctx.devices.keyboard.num_keys_pending();
            ctx.events.start_sleep(start, duration, keys_pending);
        }
        ProcKind::Sound => {
            let frequency = eval_number(&args[0], ctx, token)?;
            let duration = eval_number(&args[1], ctx, token)?;
            ctx.devices.speaker.sound(frequency, duration);
        }
    }
    Ok(())
}

fn restore_common(
    ctx: &mut ExecutionContext,
    variable: &Rc<Variable>,
    value: &common::CommonValue,
    token: &Token,
) -> Result<()> {
    let element_ty = variable.ty.clone();
    let elements = CommonBlock::element_values(value, &element_ty)
        .map_err(|e| e.at(token).runtime())?;
    if let Some(bounds) = CommonBlock::bounds(value) {
        let span = variable.element_span();
        let count: usize = bounds
            .iter()
            .map(|(lower, upper)| (upper - lower + 1).max(0) as usize)
            .product::<usize>()
            * span;
        let base = ctx.memory.allocate(count);
        for (slot, element) in elements.into_iter().enumerate().take(count) {
            ctx.memory.write_address(base.offset(slot), Some(element))?;
        }
        let (slot, stored) = ctx.memory.dereference(variable)?;
        if let Some(Val::Array(old)) = stored {
            ctx.memory.deallocate(old.base)?;
        }
        ctx.memory.write_address(
            slot,
            Some(Val::Array(ArrayDesc {
                bounds: bounds.clone(),
                base,
                span,
            })),
        )?;
    } else if let Some(element) = elements.into_iter().next() {
        let element = element
            .cast(&variable.ty)
            .map_err(|code| Error::new(code).at(token).runtime())?;
        ctx.memory.write(variable, element)?;
    }
    Ok(())
}
