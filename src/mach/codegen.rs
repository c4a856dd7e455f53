use super::expr::{BinaryOp, Expr, UnaryOp};
use super::files::FileMode;
use super::program::{DataItem, Program};
use super::statement::{
    CaseCondition, CaseRel, ChannelControl, ChannelKind, FrameWrite, PrintOp, Statement,
    WriteSource,
};
use super::typer::{BuiltinUse, Notes, PassMode, VarUse};
use super::val::Val;
use super::var::Variable;
use crate::error;
use crate::lang::ast;
use crate::lang::{untyped, Error, Token};
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## Code generator
///
/// The second compile pass. Walks the tree again with the analyzer's
/// annotations in hand and emits one flat statement list per chunk.
/// Structured statements lower to conditional branches against
/// synthesized labels; nested function calls and array subscripts are
/// hoisted into separate statements filling the analyzer's synthetic
/// variables, so compiled expressions evaluate without control flow.
/// Branch targets are recorded against labels and resolved by the
/// link pass once each chunk is complete.

pub fn generate(program: &mut Program, ast: &[ast::Statement], notes: &Notes) -> Result<()> {
    let mut generator = Generator {
        notes,
        dims: 0,
        restores: vec![],
    };
    let mut emit = Emit::new(0);
    for statement in ast {
        generator.statement(program, &mut emit, statement)?;
    }
    generator.patch_restores(program)
}

/// Per-chunk emission state: the synthesized-label counter and the
/// loop-exit stacks EXIT FOR and EXIT DO branch through.
struct Emit {
    chunk: usize,
    labels: usize,
    for_exits: Vec<Rc<str>>,
    do_exits: Vec<Rc<str>>,
}

impl Emit {
    fn new(chunk: usize) -> Emit {
        Emit {
            chunk,
            labels: 0,
            for_exits: vec![],
            do_exits: vec![],
        }
    }

    /// Synthesized labels use a character no identifier may contain,
    /// so they can never collide with user labels.
    fn next_label(&mut self) -> Rc<str> {
        let label: Rc<str> = format!("@{}", self.labels).into();
        self.labels += 1;
        label
    }
}

struct Generator<'a> {
    notes: &'a Notes,
    /// Cursor into the analyzer's DIM list.
    dims: usize,
    /// RESTORE sites to resolve against the DATA label table once the
    /// whole program has been emitted.
    restores: Vec<(usize, usize, Rc<str>, Token)>,
}

impl<'a> Generator<'a> {
    fn statement(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        statement: &ast::Statement,
    ) -> Result<()> {
        use ast::Statement as S;
        match statement {
            S::Assign { token, target, expr } => self.assign(program, emit, token, target, expr),
            S::Builtin {
                token, id, args, ..
            } => {
                let kind = self.notes.proc_kind(*id)?;
                let mut ops = Vec::with_capacity(args.len());
                for arg in args {
                    ops.push(self.expr(program, emit, arg)?);
                }
                program.chunks[emit.chunk].push(Statement::SystemProc {
                    token: token.clone(),
                    kind,
                    args: ops,
                });
                Ok(())
            }
            S::Call { token, id, args, .. } => {
                let note = self.notes.call(*id)?;
                let procedure = note.procedure.clone();
                let modes = note.args.clone();
                let writes = self.frame_writes(program, emit, &procedure, &modes, args, None)?;
                let frame_size = program.chunks[procedure.chunk].frame_size;
                program.chunks[emit.chunk].push(Statement::Call {
                    token: token.clone(),
                    chunk: procedure.chunk,
                    frame_size,
                    writes,
                });
                Ok(())
            }
            S::Chain { token, path } => {
                let path = self.expr(program, emit, path)?;
                program.chunks[emit.chunk].push(Statement::Chain {
                    token: token.clone(),
                    path,
                });
                Ok(())
            }
            S::Close { token, numbers } => {
                let mut ops = Vec::with_capacity(numbers.len());
                for number in numbers {
                    ops.push(self.expr(program, emit, number)?);
                }
                program.chunks[emit.chunk].push(Statement::CloseFile {
                    token: token.clone(),
                    numbers: ops,
                });
                Ok(())
            }
            S::Common { token, vars } => {
                let mut resolved = Vec::with_capacity(vars.len());
                for var in vars {
                    resolved.push(match self.notes.var_use(var.id)? {
                        VarUse::Scalar(v) | VarUse::WholeArray(v) => v.clone(),
                        _ => return Err(error!(InternalError; "COMMON expects a variable")),
                    });
                }
                program.chunks[emit.chunk].push(Statement::Common {
                    token: token.clone(),
                    vars: resolved,
                });
                Ok(())
            }
            S::Const { .. } | S::DefType { .. } | S::TypeDecl { .. } | S::Shared { .. } => Ok(()),
            S::Data { token: _, items } => {
                for item in items {
                    program.data.push(DataItem {
                        text: item.text.clone(),
                        quoted: item.quoted,
                    });
                }
                Ok(())
            }
            S::DefFn {
                token, id, expr, ..
            } => self.def_fn_chunk(program, *id, token, expr),
            S::Dim {
                token,
                redim,
                decls,
            } => {
                for decl in decls {
                    if decl.bounds.is_empty() {
                        continue;
                    }
                    let array = match self.notes.dim_arrays().get(self.dims) {
                        Some(array) => array.clone(),
                        None => return Err(error!(InternalError; "DIM list exhausted")),
                    };
                    self.dims += 1;
                    let mut bounds = Vec::with_capacity(decl.bounds.len());
                    for (lower, upper) in &decl.bounds {
                        let lower = match lower {
                            Some(expr) => self.expr(program, emit, expr)?,
                            None => Expr::literal(Val::Integer(0)),
                        };
                        let upper = self.expr(program, emit, upper)?;
                        bounds.push((lower, upper));
                    }
                    program.chunks[emit.chunk].push(Statement::Dim {
                        token: token.clone(),
                        array,
                        bounds,
                        redim: *redim,
                    });
                }
                Ok(())
            }
            S::DoLoop {
                token,
                pre,
                body,
                post,
            } => self.do_loop(program, emit, token, pre.as_ref(), body, post.as_ref()),
            S::End { token } => {
                program.chunks[emit.chunk].push(Statement::End {
                    token: token.clone(),
                });
                Ok(())
            }
            S::Erase { token, arrays } => {
                for array in arrays {
                    let array = match self.notes.var_use(array.id)? {
                        VarUse::WholeArray(v) => v.clone(),
                        _ => return Err(error!(InternalError; "ERASE expects an array")),
                    };
                    program.chunks[emit.chunk].push(Statement::Erase {
                        token: token.clone(),
                        array,
                    });
                }
                Ok(())
            }
            S::EventControl {
                token,
                event,
                param,
                control,
            } => {
                let param = match param {
                    Some(expr) => Some(self.expr(program, emit, expr)?),
                    None => None,
                };
                program.chunks[emit.chunk].push(Statement::EventControl {
                    token: token.clone(),
                    channel: channel_kind(*event),
                    param,
                    control: match control {
                        ast::EventControlKind::On => ChannelControl::On,
                        ast::EventControlKind::Off => ChannelControl::Off,
                        ast::EventControlKind::Stop => ChannelControl::Stop,
                    },
                });
                Ok(())
            }
            S::Exit { token, kind } => self.exit(program, emit, token, *kind),
            S::For {
                token,
                id,
                counter: _,
                from,
                to,
                step,
                body,
            } => self.for_loop(program, emit, token, *id, from, to, step.as_ref(), body),
            S::Function { id, body, .. } | S::Sub { id, body, .. } => {
                self.procedure_chunk(program, *id, body)
            }
            S::Gosub { token, target } => {
                let label = untyped(target)?;
                program.chunks[emit.chunk].push(Statement::Gosub { target: 0 });
                program.chunks[emit.chunk].set_target(label, token);
                Ok(())
            }
            S::Goto { token, target } => {
                let label = untyped(target)?;
                program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
                program.chunks[emit.chunk].set_target(label, token);
                Ok(())
            }
            S::If {
                token: _,
                arms,
                else_body,
            } => self.if_statement(program, emit, arms, else_body),
            S::Input {
                token,
                prompt,
                line,
                targets,
            } => {
                let mut vars = Vec::with_capacity(targets.len());
                for target in targets {
                    vars.push(self.target_variable(program, emit, target)?);
                }
                // INPUT echoes "? " after its prompt; LINE INPUT
                // prints the prompt verbatim.
                let prompt: Rc<str> = if *line {
                    prompt.clone().unwrap_or_else(|| "".into())
                } else {
                    match prompt {
                        Some(text) => format!("{}? ", text).into(),
                        None => "? ".into(),
                    }
                };
                program.chunks[emit.chunk].push(Statement::Input {
                    token: token.clone(),
                    prompt,
                    line: *line,
                    targets: vars,
                });
                Ok(())
            }
            S::Label { token } => {
                let name = untyped(token)?;
                if !program.chunks[emit.chunk].add_label(name.clone()) {
                    return Err(error!(DuplicateLabel, token));
                }
                if emit.chunk == 0 {
                    program.data_labels.insert(name, program.data.len());
                }
                Ok(())
            }
            S::OnError { token } | S::Resume { token } => {
                // Structurally accepted; running one reports the
                // legacy diagnostic.
                program.chunks[emit.chunk].push(Statement::ErrorHook {
                    token: token.clone(),
                });
                Ok(())
            }
            S::OnEvent {
                token,
                event,
                param,
                target,
            } => {
                let label = untyped(target)?;
                let param = match param {
                    Some(expr) => Some(self.expr(program, emit, expr)?),
                    None => None,
                };
                program.chunks[emit.chunk].push(Statement::OnEvent {
                    token: token.clone(),
                    channel: channel_kind(*event),
                    param,
                    target: 0,
                });
                program.chunks[emit.chunk].set_target(label, token);
                Ok(())
            }
            S::OnIndex {
                token,
                expr,
                targets,
                gosub,
            } => {
                let selector = self.expr(program, emit, expr)?;
                program.chunks[emit.chunk].push(Statement::OnIndex {
                    token: token.clone(),
                    expr: selector,
                    gosub: *gosub,
                    targets: vec![],
                });
                for target in targets {
                    let label = untyped(target)?;
                    program.chunks[emit.chunk].set_target(label, target);
                }
                Ok(())
            }
            S::Open {
                token,
                path,
                mode,
                number,
                len,
            } => {
                let path = self.expr(program, emit, path)?;
                let number = self.expr(program, emit, number)?;
                let record_len = match len {
                    Some(expr) => Some(self.expr(program, emit, expr)?),
                    None => None,
                };
                program.chunks[emit.chunk].push(Statement::OpenFile {
                    token: token.clone(),
                    path,
                    mode: file_mode(*mode),
                    number,
                    record_len,
                });
                Ok(())
            }
            S::Print {
                token,
                to_printer,
                items,
            } => {
                let mut ops = Vec::with_capacity(items.len());
                for item in items {
                    ops.push(match item {
                        ast::PrintItem::Expr(expr) => {
                            PrintOp::Expr(self.expr(program, emit, expr)?)
                        }
                        ast::PrintItem::Comma => PrintOp::Comma,
                        ast::PrintItem::Semicolon => PrintOp::Semicolon,
                    });
                }
                program.chunks[emit.chunk].push(Statement::Print {
                    token: token.clone(),
                    to_printer: *to_printer,
                    items: ops,
                });
                Ok(())
            }
            S::Read { token, targets } => {
                for target in targets {
                    let target = self.target_variable(program, emit, target)?;
                    program.chunks[emit.chunk].push(Statement::ReadData {
                        token: token.clone(),
                        target,
                    });
                }
                Ok(())
            }
            S::Restore { token, target } => {
                match target {
                    None => program.chunks[emit.chunk].push(Statement::Restore { data_index: 0 }),
                    Some(target) => {
                        let label = untyped(target)?;
                        let index = program.chunks[emit.chunk].statements.len();
                        program.chunks[emit.chunk].push(Statement::Restore { data_index: 0 });
                        self.restores.push((emit.chunk, index, label, token.clone()));
                    }
                }
                Ok(())
            }
            S::Return { token } => {
                program.chunks[emit.chunk].push(Statement::Return {
                    token: token.clone(),
                });
                Ok(())
            }
            S::Select {
                token,
                id,
                expr,
                cases,
            } => self.select(program, emit, token, *id, expr, cases),
            S::Stop { token } => {
                program.chunks[emit.chunk].push(Statement::Stop {
                    token: token.clone(),
                });
                Ok(())
            }
            S::Swap { token, left, right } => {
                let left = self.target_variable(program, emit, left)?;
                let right = self.target_variable(program, emit, right)?;
                program.chunks[emit.chunk].push(Statement::Swap {
                    token: token.clone(),
                    left,
                    right,
                });
                Ok(())
            }
            S::While { token, test, body } => self.while_loop(program, emit, token, test, body),
        }
    }

    // === structured statements ===

    fn assign(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        token: &Token,
        target: &ast::Variable,
        expr: &ast::Expression,
    ) -> Result<()> {
        let record = match self.notes.var_use(target.id)? {
            VarUse::Scalar(var) => matches!(var.ty, super::ty::Ty::Record(_)),
            VarUse::Element { result, .. } => matches!(result.ty, super::ty::Ty::Record(_)),
            _ => false,
        };
        if record {
            let source = self.ref_operand(program, emit, expr)?;
            let target = self.target_variable(program, emit, target)?;
            program.chunks[emit.chunk].push(Statement::AssignRecord {
                token: token.clone(),
                target,
                source,
            });
        } else {
            let value = self.expr(program, emit, expr)?;
            let target = self.target_variable(program, emit, target)?;
            program.chunks[emit.chunk].push(Statement::Assign {
                token: token.clone(),
                target,
                expr: value,
            });
        }
        Ok(())
    }

    fn if_statement(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        arms: &[ast::IfArm],
        else_body: &[ast::Statement],
    ) -> Result<()> {
        let exit = emit.next_label();
        for arm in arms {
            let next = emit.next_label();
            let test = self.expr(program, emit, &arm.test)?;
            program.chunks[emit.chunk].push(Statement::IfNot {
                token: arm.token.clone(),
                test,
                target: 0,
            });
            program.chunks[emit.chunk].set_target(next.clone(), &arm.token);
            for statement in &arm.body {
                self.statement(program, emit, statement)?;
            }
            program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
            program.chunks[emit.chunk].set_target(exit.clone(), &arm.token);
            program.chunks[emit.chunk].add_label(next);
        }
        for statement in else_body {
            self.statement(program, emit, statement)?;
        }
        program.chunks[emit.chunk].add_label(exit);
        Ok(())
    }

    fn while_loop(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        token: &Token,
        test: &ast::Expression,
        body: &[ast::Statement],
    ) -> Result<()> {
        let top = emit.next_label();
        let exit = emit.next_label();
        program.chunks[emit.chunk].add_label(top.clone());
        let test = self.expr(program, emit, test)?;
        program.chunks[emit.chunk].push(Statement::IfNot {
            token: token.clone(),
            test,
            target: 0,
        });
        program.chunks[emit.chunk].set_target(exit.clone(), token);
        for statement in body {
            self.statement(program, emit, statement)?;
        }
        program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
        program.chunks[emit.chunk].set_target(top, token);
        program.chunks[emit.chunk].add_label(exit);
        Ok(())
    }

    fn do_loop(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        token: &Token,
        pre: Option<&ast::LoopTest>,
        body: &[ast::Statement],
        post: Option<&ast::LoopTest>,
    ) -> Result<()> {
        let top = emit.next_label();
        let exit = emit.next_label();
        program.chunks[emit.chunk].add_label(top.clone());
        if let Some(pre) = pre {
            let test = self.expr(program, emit, &pre.test)?;
            program.chunks[emit.chunk].push(Statement::DoTest {
                token: token.clone(),
                is_while: pre.is_while,
                test,
                target: 0,
            });
            program.chunks[emit.chunk].set_target(exit.clone(), token);
        }
        emit.do_exits.push(exit.clone());
        for statement in body {
            self.statement(program, emit, statement)?;
        }
        emit.do_exits.pop();
        match post {
            Some(post) => {
                let test = self.expr(program, emit, &post.test)?;
                program.chunks[emit.chunk].push(Statement::LoopTest {
                    token: token.clone(),
                    is_while: post.is_while,
                    test,
                    target: 0,
                });
                program.chunks[emit.chunk].set_target(top, token);
            }
            None => {
                program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
                program.chunks[emit.chunk].set_target(top, token);
            }
        }
        program.chunks[emit.chunk].add_label(exit);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn for_loop(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        token: &Token,
        id: ast::NodeId,
        from: &ast::Expression,
        to: &ast::Expression,
        step: Option<&ast::Expression>,
        body: &[ast::Statement],
    ) -> Result<()> {
        let note = self.notes.for_note(id)?.clone();
        // Priming: the counter, then the synthesized end value, then
        // the synthesized step. NEXT re-reads all three so the loop
        // head never re-evaluates the bound expressions.
        let from = self.expr(program, emit, from)?;
        program.chunks[emit.chunk].push(Statement::Assign {
            token: token.clone(),
            target: note.counter.clone(),
            expr: from,
        });
        let to = self.expr(program, emit, to)?;
        program.chunks[emit.chunk].push(Statement::Assign {
            token: token.clone(),
            target: note.end.clone(),
            expr: to,
        });
        if let (Some(step_var), Some(step)) = (&note.step, step) {
            let step = self.expr(program, emit, step)?;
            program.chunks[emit.chunk].push(Statement::Assign {
                token: token.clone(),
                target: step_var.clone(),
                expr: step,
            });
        }
        let top = emit.next_label();
        let exit = emit.next_label();
        program.chunks[emit.chunk].push(Statement::ForTest {
            token: token.clone(),
            counter: note.counter.clone(),
            end: note.end.clone(),
            step: note.step.clone(),
            target: 0,
        });
        program.chunks[emit.chunk].set_target(exit.clone(), token);
        program.chunks[emit.chunk].add_label(top.clone());
        emit.for_exits.push(exit.clone());
        for statement in body {
            self.statement(program, emit, statement)?;
        }
        emit.for_exits.pop();
        program.chunks[emit.chunk].push(Statement::Next {
            token: token.clone(),
            counter: note.counter,
            end: note.end,
            step: note.step,
            target: 0,
        });
        program.chunks[emit.chunk].set_target(top, token);
        program.chunks[emit.chunk].add_label(exit);
        Ok(())
    }

    fn select(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        token: &Token,
        id: ast::NodeId,
        selector: &ast::Expression,
        cases: &[ast::CaseBlock],
    ) -> Result<()> {
        let test = self.notes.select_test(id)?.clone();
        let selector = self.expr(program, emit, selector)?;
        program.chunks[emit.chunk].push(Statement::Assign {
            token: token.clone(),
            target: test.clone(),
            expr: selector,
        });
        let exit = emit.next_label();
        for (index, case) in cases.iter().enumerate() {
            let last = index + 1 == cases.len();
            if case.items.is_empty() {
                // CASE ELSE
                for statement in &case.body {
                    self.statement(program, emit, statement)?;
                }
                if !last {
                    program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
                    program.chunks[emit.chunk].set_target(exit.clone(), &case.token);
                }
                continue;
            }
            let body_label = emit.next_label();
            let next_case = emit.next_label();
            for item in &case.items {
                let condition = self.case_condition(program, emit, item)?;
                program.chunks[emit.chunk].push(Statement::CaseTest {
                    token: case.token.clone(),
                    test: test.clone(),
                    condition,
                    target: 0,
                });
                program.chunks[emit.chunk].set_target(body_label.clone(), &case.token);
            }
            program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
            program.chunks[emit.chunk]
                .set_target(if last { exit.clone() } else { next_case.clone() }, &case.token);
            program.chunks[emit.chunk].add_label(body_label);
            for statement in &case.body {
                self.statement(program, emit, statement)?;
            }
            if !last {
                program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
                program.chunks[emit.chunk].set_target(exit.clone(), &case.token);
            }
            program.chunks[emit.chunk].add_label(next_case);
        }
        program.chunks[emit.chunk].add_label(exit);
        Ok(())
    }

    fn case_condition(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        item: &ast::CaseItem,
    ) -> Result<CaseCondition> {
        Ok(match item {
            ast::CaseItem::Value(expr) => CaseCondition::Value(self.expr(program, emit, expr)?),
            ast::CaseItem::Range(low, high) => CaseCondition::Range(
                self.expr(program, emit, low)?,
                self.expr(program, emit, high)?,
            ),
            ast::CaseItem::Is(rel, expr) => {
                CaseCondition::Is(case_rel(*rel), self.expr(program, emit, expr)?)
            }
        })
    }

    fn exit(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        token: &Token,
        kind: ast::ExitKind,
    ) -> Result<()> {
        use ast::ExitKind as K;
        match kind {
            K::Sub | K::Function | K::Def => {
                program.chunks[emit.chunk].push(Statement::ExitProcedure {
                    token: token.clone(),
                });
                Ok(())
            }
            K::For => {
                let exit = match emit.for_exits.last() {
                    Some(label) => label.clone(),
                    None => return Err(error!(SyntaxError, token; "EXIT FOR outside FOR...NEXT")),
                };
                program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
                program.chunks[emit.chunk].set_target(exit, token);
                Ok(())
            }
            K::Do => {
                let exit = match emit.do_exits.last() {
                    Some(label) => label.clone(),
                    None => return Err(error!(SyntaxError, token; "EXIT DO outside DO...LOOP")),
                };
                program.chunks[emit.chunk].push(Statement::Goto { target: 0 });
                program.chunks[emit.chunk].set_target(exit, token);
                Ok(())
            }
        }
    }

    // === procedure bodies ===

    fn procedure_chunk(
        &mut self,
        program: &mut Program,
        id: ast::NodeId,
        body: &[ast::Statement],
    ) -> Result<()> {
        let chunk = self.notes.chunk_of(id)?;
        let mut emit = Emit::new(chunk);
        for statement in body {
            self.statement(program, &mut emit, statement)?;
        }
        // Falling off the end is an implicit EXIT; it pops the
        // automatic frame the CALL pushed.
        program.chunks[chunk].push(Statement::ExitProcedure {
            token: Token::internal(),
        });
        Ok(())
    }

    fn def_fn_chunk(
        &mut self,
        program: &mut Program,
        id: ast::NodeId,
        token: &Token,
        expr: &ast::Expression,
    ) -> Result<()> {
        let chunk = self.notes.chunk_of(id)?;
        let result = match &program.chunks[chunk].procedure {
            Some(procedure) => match &procedure.result {
                Some(result) => result.clone(),
                None => return Err(error!(InternalError; "DEF FN has no result variable")),
            },
            None => return Err(error!(InternalError; "DEF FN chunk has no procedure")),
        };
        let mut emit = Emit::new(chunk);
        let value = self.expr(program, &mut emit, expr)?;
        program.chunks[chunk].push(Statement::Assign {
            token: token.clone(),
            target: result,
            expr: value,
        });
        program.chunks[chunk].push(Statement::ExitProcedure {
            token: Token::internal(),
        });
        Ok(())
    }

    // === expressions and hoisting ===

    fn expr(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        expr: &ast::Expression,
    ) -> Result<Expr> {
        use ast::Expression as E;
        match expr {
            E::Integer(_, n) => Ok(Expr::literal(Val::Integer(*n))),
            E::Long(_, n) => Ok(Expr::literal(Val::Long(*n))),
            E::Single(_, n) => Ok(Expr::literal(Val::Single(*n))),
            E::Double(_, n) => Ok(Expr::literal(Val::Double(*n))),
            E::String(_, s) => Ok(Expr::literal(Val::String(s.clone()))),
            E::Var(v) => self.variable_expr(program, emit, v),
            E::Negation(_, inner) => Ok(Expr::Unary(
                UnaryOp::Negate,
                Box::new(self.expr(program, emit, inner)?),
            )),
            E::Not(_, inner) => Ok(Expr::Unary(
                UnaryOp::Not,
                Box::new(self.expr(program, emit, inner)?),
            )),
            E::Power(_, l, r) => self.binary(program, emit, BinaryOp::Power, l, r),
            E::Multiply(_, l, r) => self.binary(program, emit, BinaryOp::Multiply, l, r),
            E::Divide(_, l, r) => self.binary(program, emit, BinaryOp::Divide, l, r),
            E::DivideInt(_, l, r) => self.binary(program, emit, BinaryOp::DivideInt, l, r),
            E::Modulo(_, l, r) => self.binary(program, emit, BinaryOp::Modulo, l, r),
            E::Add(_, l, r) => self.binary(program, emit, BinaryOp::Add, l, r),
            E::Subtract(_, l, r) => self.binary(program, emit, BinaryOp::Subtract, l, r),
            E::Equal(_, l, r) => self.binary(program, emit, BinaryOp::Equal, l, r),
            E::NotEqual(_, l, r) => self.binary(program, emit, BinaryOp::NotEqual, l, r),
            E::Less(_, l, r) => self.binary(program, emit, BinaryOp::Less, l, r),
            E::LessEqual(_, l, r) => self.binary(program, emit, BinaryOp::LessEqual, l, r),
            E::Greater(_, l, r) => self.binary(program, emit, BinaryOp::Greater, l, r),
            E::GreaterEqual(_, l, r) => self.binary(program, emit, BinaryOp::GreaterEqual, l, r),
            E::And(_, l, r) => self.binary(program, emit, BinaryOp::And, l, r),
            E::Or(_, l, r) => self.binary(program, emit, BinaryOp::Or, l, r),
            E::Xor(_, l, r) => self.binary(program, emit, BinaryOp::Xor, l, r),
            E::Imp(_, l, r) => self.binary(program, emit, BinaryOp::Imp, l, r),
            E::Eqv(_, l, r) => self.binary(program, emit, BinaryOp::Eqv, l, r),
        }
    }

    fn binary(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        op: BinaryOp,
        lhs: &ast::Expression,
        rhs: &ast::Expression,
    ) -> Result<Expr> {
        let lhs = self.expr(program, emit, lhs)?;
        let rhs = self.expr(program, emit, rhs)?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn variable_expr(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        v: &ast::Variable,
    ) -> Result<Expr> {
        match self.notes.var_use(v.id)? {
            VarUse::Constant(val) => Ok(Expr::literal(val.clone())),
            VarUse::Scalar(var) => Ok(Expr::read(var.clone())),
            VarUse::Element { .. } => {
                let element = self.element(program, emit, v)?;
                Ok(Expr::read(element))
            }
            VarUse::Function { .. } => {
                let result = self.function_call(program, emit, v)?;
                Ok(Expr::read(result))
            }
            VarUse::Builtin(_) => {
                let result = self.builtin_call(program, emit, v)?;
                Ok(Expr::read(result))
            }
            VarUse::WholeArray(_) => Err(error!(InternalError; "Array used as a value")),
        }
    }

    /// Hoist one subscripted access: emit the bounds-checked index
    /// statement and hand back the synthetic reference variable.
    fn element(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        v: &ast::Variable,
    ) -> Result<Rc<Variable>> {
        let (array, field_offset, result) = match self.notes.var_use(v.id)? {
            VarUse::Element {
                array,
                field_offset,
                result,
            } => (array.clone(), *field_offset, result.clone()),
            _ => return Err(error!(InternalError; "Expected an element annotation")),
        };
        let mut indices = Vec::with_capacity(v.args.len());
        for arg in &v.args {
            indices.push(self.expr(program, emit, arg)?);
        }
        program.chunks[emit.chunk].push(Statement::IndexArray {
            token: v.name.clone(),
            array,
            indices,
            field_offset,
            result: result.clone(),
        });
        Ok(result)
    }

    /// Hoist a user function call: argument hoists, a priming write
    /// of the result default, then the CALL whose frame writes alias
    /// the callee's result slot to the synthetic variable.
    fn function_call(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        v: &ast::Variable,
    ) -> Result<Rc<Variable>> {
        let (procedure, modes, result) = match self.notes.var_use(v.id)? {
            VarUse::Function {
                procedure,
                args,
                result,
            } => (procedure.clone(), args.clone(), result.clone()),
            _ => return Err(error!(InternalError; "Expected a function annotation")),
        };
        let writes =
            self.frame_writes(program, emit, &procedure, &modes, &v.args, Some(&result))?;
        program.chunks[emit.chunk].push(Statement::Assign {
            token: Token::internal(),
            target: result.clone(),
            expr: Expr::literal(Val::default_of(&result.ty)),
        });
        let frame_size = program.chunks[procedure.chunk].frame_size;
        program.chunks[emit.chunk].push(Statement::Call {
            token: v.name.clone(),
            chunk: procedure.chunk,
            frame_size,
            writes,
        });
        Ok(result)
    }

    fn frame_writes(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        procedure: &Rc<super::symbol::Procedure>,
        modes: &[PassMode],
        args: &[ast::Expression],
        result: Option<&Rc<Variable>>,
    ) -> Result<Vec<FrameWrite>> {
        let mut writes = Vec::with_capacity(args.len() + 1);
        for ((param, mode), arg) in procedure.params.iter().zip(modes).zip(args) {
            let slot = param
                .address
                .ok_or_else(|| error!(InternalError; "Parameter has no slot"))?
                .slot;
            let source = match mode {
                PassMode::ByRef => WriteSource::Ref(self.ref_operand(program, emit, arg)?),
                PassMode::ByVal(ty) => {
                    WriteSource::Value(self.expr(program, emit, arg)?, ty.clone())
                }
            };
            writes.push(FrameWrite { slot, source });
        }
        if let Some(result) = result {
            let result_param = procedure
                .result
                .as_ref()
                .ok_or_else(|| error!(InternalError; "Function has no result slot"))?;
            let slot = result_param
                .address
                .ok_or_else(|| error!(InternalError; "Result has no slot"))?
                .slot;
            writes.push(FrameWrite {
                slot,
                source: WriteSource::Ref(result.clone()),
            });
        }
        Ok(writes)
    }

    /// A by-reference operand: the variable itself, or the synthetic
    /// reference produced by hoisting a subscript.
    fn ref_operand(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        expr: &ast::Expression,
    ) -> Result<Rc<Variable>> {
        let v = match expr {
            ast::Expression::Var(v) => v,
            _ => return Err(error!(InternalError; "Expected a variable operand")),
        };
        match self.notes.var_use(v.id)? {
            VarUse::Scalar(var) | VarUse::WholeArray(var) => Ok(var.clone()),
            VarUse::Element { .. } => self.element(program, emit, v),
            _ => Err(error!(InternalError; "Expected a variable operand")),
        }
    }

    /// An assignment, READ, INPUT or SWAP target.
    fn target_variable(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        v: &ast::Variable,
    ) -> Result<Rc<Variable>> {
        match self.notes.var_use(v.id)? {
            VarUse::Scalar(var) => Ok(var.clone()),
            VarUse::Element { .. } => self.element(program, emit, v),
            _ => Err(error!(InternalError; "Expected a storage target")),
        }
    }

    /// The LBOUND/UBOUND family and VARSEG/VARPTR need a variable
    /// operand rather than a value; their statements carry it.
    fn builtin_call(
        &mut self,
        program: &mut Program,
        emit: &mut Emit,
        v: &ast::Variable,
    ) -> Result<Rc<Variable>> {
        let use_ = match self.notes.var_use(v.id)? {
            VarUse::Builtin(builtin) => builtin.clone(),
            _ => return Err(error!(InternalError; "Expected a builtin annotation")),
        };
        match use_ {
            BuiltinUse::Func { kind, result } => {
                let mut ops = Vec::with_capacity(v.args.len());
                for arg in &v.args {
                    ops.push(self.expr(program, emit, arg)?);
                }
                program.chunks[emit.chunk].push(Statement::CallBuiltin {
                    token: v.name.clone(),
                    kind,
                    args: ops,
                    result: result.clone(),
                });
                Ok(result)
            }
            BuiltinUse::Bound { upper, result } => {
                let array = match &v.args[0] {
                    ast::Expression::Var(array) => match self.notes.var_use(array.id)? {
                        VarUse::WholeArray(var) => var.clone(),
                        _ => return Err(error!(InternalError; "Expected an array operand")),
                    },
                    _ => return Err(error!(InternalError; "Expected an array operand")),
                };
                let dimension = match v.args.get(1) {
                    Some(expr) => Some(self.expr(program, emit, expr)?),
                    None => None,
                };
                program.chunks[emit.chunk].push(Statement::ArrayBound {
                    token: v.name.clone(),
                    array,
                    dimension,
                    upper,
                    result: result.clone(),
                });
                Ok(result)
            }
            BuiltinUse::Pointer { result } => {
                let variable = match &v.args[0] {
                    ast::Expression::Var(target) => match self.notes.var_use(target.id)? {
                        VarUse::Scalar(var) | VarUse::WholeArray(var) => var.clone(),
                        VarUse::Element { .. } => self.element(program, emit, target)?,
                        _ => return Err(error!(InternalError; "Expected a variable operand")),
                    },
                    _ => return Err(error!(InternalError; "Expected a variable operand")),
                };
                program.chunks[emit.chunk].push(Statement::VarPointer {
                    token: v.name.clone(),
                    variable,
                    result: result.clone(),
                });
                Ok(result)
            }
        }
    }

    fn patch_restores(&mut self, program: &mut Program) -> Result<()> {
        for (chunk, index, label, token) in self.restores.drain(..) {
            let offset = match program.data_labels.get(&label) {
                Some(offset) => *offset,
                None => return Err(error!(LabelNotDefined, &token)),
            };
            match &mut program.chunks[chunk].statements[index] {
                Statement::Restore { data_index } => *data_index = offset,
                _ => return Err(error!(InternalError; "RESTORE site moved")),
            }
        }
        Ok(())
    }
}

fn channel_kind(event: ast::EventKind) -> ChannelKind {
    match event {
        ast::EventKind::Timer => ChannelKind::Timer,
        ast::EventKind::Key => ChannelKind::Key,
        ast::EventKind::Strig => ChannelKind::Strig,
        ast::EventKind::Pen => ChannelKind::Pen,
    }
}

fn case_rel(rel: ast::CaseRel) -> CaseRel {
    match rel {
        ast::CaseRel::Equal => CaseRel::Equal,
        ast::CaseRel::NotEqual => CaseRel::NotEqual,
        ast::CaseRel::Less => CaseRel::Less,
        ast::CaseRel::LessEqual => CaseRel::LessEqual,
        ast::CaseRel::Greater => CaseRel::Greater,
        ast::CaseRel::GreaterEqual => CaseRel::GreaterEqual,
    }
}

fn file_mode(mode: ast::OpenMode) -> FileMode {
    match mode {
        ast::OpenMode::Input => FileMode::Input,
        ast::OpenMode::Output => FileMode::Output,
        ast::OpenMode::Append => FileMode::Append,
        ast::OpenMode::Random => FileMode::Random,
        ast::OpenMode::Binary => FileMode::Binary,
    }
}
