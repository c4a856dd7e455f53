use super::builtins::{self, ArgTy, Builtin, BuiltinOp, FuncKind, ProcKind};
use super::memory::{Address, StorageClass};
use super::program::{Program, ProgramChunk};
use super::symbol::{Procedure, Symbol};
use super::ty::{RecordTy, Ty};
use super::val::Val;
use super::var::{ArrayBounds, Variable};
use crate::error;
use crate::lang::ast::{self, NodeId};
use crate::lang::{first_char, split_sigil, untyped, untyped_no_period, Error, Token};
use std::collections::HashMap;
use std::rc::Rc;

type Result<T> = std::result::Result<T, Error>;

/// ## Semantic analyzer
///
/// The first compile pass. A signature scan registers record types
/// and procedure declarations, then one walk over the whole tree
/// resolves every name to a variable, constant, procedure, or
/// builtin, checks types, assigns storage addresses, and synthesizes
/// the temporary variables that hoisted sub-expressions fill at run
/// time. The tree itself is never written to; everything the code
/// generator needs goes into a side table keyed by node id.

/// Analyze a parsed program, producing the program skeleton (chunks,
/// symbol tables, record registry, storage sizes) and the annotation
/// table the code generator consumes.
pub fn analyze(ast: &[ast::Statement]) -> Result<(Program, Notes)> {
    let mut typer = Typer::new();
    typer.prescan(ast)?;
    let mut scope = Scope::top();
    for statement in ast {
        typer.statement(&mut scope, statement)?;
    }
    typer.program.static_size = typer.statics;
    Ok((typer.program, typer.notes))
}

/// Annotations left on syntax nodes, keyed by their stable id. DIM
/// declarations carry no node id, so their resolved variables travel
/// in a parallel list consumed in walk order.
#[derive(Default, Debug)]
pub struct Notes {
    map: HashMap<NodeId, Note>,
    dims: Vec<Rc<Variable>>,
}

#[derive(Debug)]
pub enum Note {
    Use(VarUse),
    For(ForNote),
    Select(Rc<Variable>),
    Call(CallNote),
    Chunk(usize),
    Proc(ProcKind),
}

/// What a name use resolved to.
#[derive(Clone, Debug)]
pub enum VarUse {
    Constant(Val),
    /// A scalar variable or a record-field child.
    Scalar(Rc<Variable>),
    /// A subscripted array access, hoisted into a synthetic reference
    /// variable by the code generator.
    Element {
        array: Rc<Variable>,
        field_offset: usize,
        result: Rc<Variable>,
    },
    /// The `a()` form: the array itself, for ERASE, COMMON, LBOUND
    /// and by-reference parameters.
    WholeArray(Rc<Variable>),
    /// A user function call, hoisted into `result`.
    Function {
        procedure: Rc<Procedure>,
        args: Vec<PassMode>,
        result: Rc<Variable>,
    },
    Builtin(BuiltinUse),
}

#[derive(Clone, Debug)]
pub enum BuiltinUse {
    Func { kind: FuncKind, result: Rc<Variable> },
    Bound { upper: bool, result: Rc<Variable> },
    Pointer { result: Rc<Variable> },
}

impl BuiltinUse {
    pub fn result(&self) -> &Rc<Variable> {
        match self {
            BuiltinUse::Func { result, .. }
            | BuiltinUse::Bound { result, .. }
            | BuiltinUse::Pointer { result } => result,
        }
    }
}

/// How one argument travels into a callee frame.
#[derive(Clone, Debug)]
pub enum PassMode {
    ByRef,
    ByVal(Ty),
}

#[derive(Clone, Debug)]
pub struct ForNote {
    pub counter: Rc<Variable>,
    pub end: Rc<Variable>,
    pub step: Option<Rc<Variable>>,
}

#[derive(Clone, Debug)]
pub struct CallNote {
    pub procedure: Rc<Procedure>,
    pub args: Vec<PassMode>,
}

fn missing() -> Error {
    error!(InternalError; "Missing analyzer annotation")
}

impl Notes {
    fn insert(&mut self, id: NodeId, note: Note) {
        self.map.insert(id, note);
    }

    pub fn var_use(&self, id: NodeId) -> Result<&VarUse> {
        match self.map.get(&id) {
            Some(Note::Use(u)) => Ok(u),
            _ => Err(missing()),
        }
    }

    pub fn for_note(&self, id: NodeId) -> Result<&ForNote> {
        match self.map.get(&id) {
            Some(Note::For(n)) => Ok(n),
            _ => Err(missing()),
        }
    }

    pub fn select_test(&self, id: NodeId) -> Result<&Rc<Variable>> {
        match self.map.get(&id) {
            Some(Note::Select(v)) => Ok(v),
            _ => Err(missing()),
        }
    }

    pub fn call(&self, id: NodeId) -> Result<&CallNote> {
        match self.map.get(&id) {
            Some(Note::Call(n)) => Ok(n),
            _ => Err(missing()),
        }
    }

    pub fn chunk_of(&self, id: NodeId) -> Result<usize> {
        match self.map.get(&id) {
            Some(Note::Chunk(index)) => Ok(*index),
            _ => Err(missing()),
        }
    }

    pub fn proc_kind(&self, id: NodeId) -> Result<ProcKind> {
        match self.map.get(&id) {
            Some(Note::Proc(kind)) => Ok(*kind),
            _ => Err(missing()),
        }
    }

    pub fn dim_arrays(&self) -> &[Rc<Variable>] {
        &self.dims
    }
}

/// Which kind of body the walk is inside, which decides what the
/// module-level table contributes to lookup.
#[derive(Clone, Copy, PartialEq)]
enum ScopeKind {
    Top,
    Sub,
    Function,
    DefFn,
}

struct Scope {
    chunk: usize,
    kind: ScopeKind,
    /// Next automatic frame slot.
    auto: usize,
    /// Synthetic variable counter, for names only.
    synth: usize,
    is_static: bool,
}

impl Scope {
    fn top() -> Scope {
        Scope {
            chunk: 0,
            kind: ScopeKind::Top,
            auto: 0,
            synth: 0,
            is_static: false,
        }
    }
}

struct Typer {
    program: Program,
    notes: Notes,
    /// Next static frame slot.
    statics: usize,
    /// DEFtype default per letter, SINGLE unless overridden.
    defaults: Vec<Ty>,
}

impl Typer {
    fn new() -> Typer {
        Typer {
            program: Program::new(),
            notes: Notes::default(),
            statics: 0,
            defaults: vec![Ty::Single; 26],
        }
    }

    /// Register record types and procedure signatures so that forward
    /// calls resolve. DEFtype statements are replayed here because
    /// they are positional and parameter defaults depend on them.
    fn prescan(&mut self, ast: &[ast::Statement]) -> Result<()> {
        use ast::Statement as S;
        for statement in ast {
            match statement {
                S::TypeDecl {
                    token,
                    name,
                    fields,
                } => self.record_decl(token, name, fields)?,
                S::DefType { ty, ranges, .. } => self.deftype(*ty, ranges)?,
                S::Sub {
                    token,
                    id,
                    name,
                    params,
                    is_static,
                    ..
                } => self.declare_procedure(token, *id, name, params, false, *is_static)?,
                S::Function {
                    token,
                    id,
                    name,
                    params,
                    is_static,
                    ..
                } => self.declare_procedure(token, *id, name, params, true, *is_static)?,
                S::DefFn {
                    token,
                    id,
                    name,
                    params,
                    ..
                } => self.declare_def_fn(token, *id, name, params)?,
                _ => {}
            }
        }
        // The main walk replays DEFtype from a clean slate.
        self.defaults = vec![Ty::Single; 26];
        Ok(())
    }

    fn record_decl(
        &mut self,
        token: &Token,
        name: &Token,
        fields: &[(Token, ast::TypeName)],
    ) -> Result<()> {
        let name_text = untyped_no_period(name)?;
        if self.program.records.contains_key(&name_text) {
            return Err(error!(DuplicateDefinition, name));
        }
        if fields.is_empty() {
            return Err(error!(SyntaxError, token; "TYPE must contain at least one element"));
        }
        let mut resolved: Vec<(Rc<str>, Ty)> = Vec::with_capacity(fields.len());
        for (field, type_name) in fields {
            let field_name = untyped_no_period(field)?;
            if resolved.iter().any(|(n, _)| n == &field_name) {
                return Err(error!(DuplicateDefinition, field));
            }
            let ty = self.type_of_name(type_name, field)?;
            resolved.push((field_name, ty));
        }
        self.program.records.insert(
            name_text.clone(),
            Rc::new(RecordTy {
                name: name_text,
                fields: resolved,
            }),
        );
        Ok(())
    }

    fn type_of_name(&self, type_name: &ast::TypeName, token: &Token) -> Result<Ty> {
        use ast::TypeName as T;
        Ok(match type_name {
            T::Integer => Ty::Integer,
            T::Long => Ty::Long,
            T::Single => Ty::Single,
            T::Double => Ty::Double,
            T::String => Ty::String,
            T::FixedString(len) => Ty::FixedString(*len),
            T::Named(name) => {
                let name = untyped_no_period(name)?;
                match self.program.records.get(&name) {
                    Some(record) => Ty::Record(record.clone()),
                    None => return Err(error!(TypeNotDefined, token)),
                }
            }
        })
    }

    fn deftype(&mut self, ty: ast::ScalarType, ranges: &[(Token, Token)]) -> Result<()> {
        for (from, to) in ranges {
            let from = range_letter(from)?;
            let to = range_letter(to)?;
            if to < from {
                return Err(error!(SyntaxError, &ranges[0].1));
            }
            for letter in from..=to {
                self.defaults[(letter as u8 - b'a') as usize] = Ty::of_scalar(ty);
            }
        }
        Ok(())
    }

    fn declare_procedure(
        &mut self,
        token: &Token,
        id: NodeId,
        name: &Token,
        params: &[ast::Param],
        has_result: bool,
        is_static: bool,
    ) -> Result<()> {
        let (name_text, sigil) = split_sigil(&name.text);
        if !has_result && sigil.is_some() {
            return Err(
                error!(SyntaxError, name; "Identifier cannot end with %, &, !, # or $"),
            );
        }
        let chunk_index = self.program.chunks.len();
        let mut auto = 0usize;
        let parameters = self.parameter_variables(params, &mut auto)?;
        let result = if has_result {
            let ty = match sigil {
                Some(c) => Ty::of_sigil(c),
                None => self.default_ty(&name_text),
            };
            let mut var = Variable::scalar(
                name_text.clone(),
                ty,
                Address::new(StorageClass::Automatic, auto),
            );
            var.is_parameter = true;
            auto += 1;
            Some(Rc::new(var))
        } else {
            None
        };
        let procedure = Rc::new(Procedure {
            name: name_text,
            params: parameters,
            result,
            chunk: chunk_index,
            is_static,
        });
        self.program.chunks[0]
            .symbols
            .define_procedure(procedure.clone())
            .map_err(|e| e.at(token))?;
        self.push_chunk(procedure, auto, token)?;
        self.notes.insert(id, Note::Chunk(chunk_index));
        Ok(())
    }

    fn declare_def_fn(
        &mut self,
        token: &Token,
        id: NodeId,
        name: &Token,
        params: &[ast::Param],
    ) -> Result<()> {
        let (name_text, sigil) = split_sigil(&name.text);
        if !name_text.starts_with("fn") {
            return Err(error!(SyntaxError, name; "DEF function name must begin with FN"));
        }
        let chunk_index = self.program.chunks.len();
        let mut auto = 0usize;
        let parameters = self.parameter_variables(params, &mut auto)?;
        if parameters.iter().any(|p| p.is_array()) {
            return Err(error!(SyntaxError, token; "DEF FN parameters must be scalar"));
        }
        let ty = match sigil {
            Some(c) => Ty::of_sigil(c),
            None => self.default_ty(&name_text),
        };
        let mut result = Variable::scalar(
            name_text.clone(),
            ty,
            Address::new(StorageClass::Automatic, auto),
        );
        result.is_parameter = true;
        auto += 1;
        let procedure = Rc::new(Procedure {
            name: name_text,
            params: parameters,
            result: Some(Rc::new(result)),
            chunk: chunk_index,
            is_static: false,
        });
        self.program.chunks[0]
            .symbols
            .define_def_fn(procedure.clone())
            .map_err(|e| e.at(token))?;
        self.push_chunk(procedure, auto, token)?;
        self.notes.insert(id, Note::Chunk(chunk_index));
        Ok(())
    }

    fn parameter_variables(
        &self,
        params: &[ast::Param],
        auto: &mut usize,
    ) -> Result<Vec<Rc<Variable>>> {
        let mut variables = Vec::with_capacity(params.len());
        for param in params {
            let (name, sigil) = split_sigil(&param.name.text);
            let ty = match &param.as_type {
                Some(type_name) => {
                    if sigil.is_some() {
                        return Err(error!(SyntaxError, &param.name;
                            "Identifier cannot end with %, &, !, # or $"));
                    }
                    self.type_of_name(type_name, &param.name)?
                }
                None => match sigil {
                    Some(c) => Ty::of_sigil(c),
                    None => self.default_ty(&name),
                },
            };
            let address = Address::new(StorageClass::Automatic, *auto);
            *auto += 1;
            let mut var = if param.is_array {
                Variable::array(name, ty, vec![], address)
            } else {
                Variable::scalar(name, ty, address)
            };
            var.is_parameter = true;
            var.as_type = param.as_type.is_some();
            variables.push(Rc::new(var));
        }
        Ok(variables)
    }

    fn push_chunk(&mut self, procedure: Rc<Procedure>, auto: usize, token: &Token) -> Result<()> {
        let mut chunk = ProgramChunk::new(Some(procedure.clone()));
        for param in &procedure.params {
            chunk
                .symbols
                .define_variable(param.clone())
                .map_err(|e| e.at(token))?;
        }
        if let Some(result) = &procedure.result {
            chunk
                .symbols
                .define_variable(result.clone())
                .map_err(|e| e.at(token))?;
        }
        chunk.frame_size = auto;
        self.program.chunks.push(chunk);
        Ok(())
    }

    // === statement walk ===

    fn statement(&mut self, scope: &mut Scope, statement: &ast::Statement) -> Result<()> {
        use ast::Statement as S;
        match statement {
            S::Assign { token, target, expr } => self.assign(scope, token, target, expr),
            S::Builtin {
                token,
                id,
                name,
                args,
            } => self.builtin_statement(scope, token, *id, name, args),
            S::Call {
                token,
                id,
                name,
                args,
            } => self.call_statement(scope, token, *id, name, args),
            S::Chain { token: _, path } => {
                self.string_expr(scope, path)?;
                Ok(())
            }
            S::Close { token: _, numbers } => {
                for number in numbers {
                    self.numeric(scope, number)?;
                }
                Ok(())
            }
            S::Common { token, vars } => self.common(scope, token, vars),
            S::Const { token: _, decls } => self.constants(scope, decls),
            S::Data { .. } => Ok(()),
            S::DefFn {
                token, id, expr, ..
            } => self.def_fn_body(scope, token, *id, expr),
            S::DefType { ty, ranges, .. } => self.deftype(*ty, ranges),
            S::Dim {
                token: _,
                redim,
                decls,
            } => {
                for decl in decls {
                    self.dim(scope, decl, *redim)?;
                }
                Ok(())
            }
            S::DoLoop {
                token: _,
                pre,
                body,
                post,
            } => {
                if let Some(test) = pre {
                    self.numeric(scope, &test.test)?;
                }
                for inner in body {
                    self.statement(scope, inner)?;
                }
                if let Some(test) = post {
                    self.numeric(scope, &test.test)?;
                }
                Ok(())
            }
            S::End { .. } | S::Stop { .. } | S::Return { .. } | S::Label { .. } => Ok(()),
            S::Erase { token: _, arrays } => {
                for array in arrays {
                    self.whole_array_use(scope, array)?;
                }
                Ok(())
            }
            S::EventControl { token: _, param, .. } => {
                if let Some(param) = param {
                    self.numeric(scope, param)?;
                }
                Ok(())
            }
            S::Exit { token, kind } => self.exit(scope, token, *kind),
            S::For {
                token: _,
                id,
                counter,
                from,
                to,
                step,
                body,
            } => self.for_loop(scope, *id, counter, from, to, step.as_ref(), body),
            S::Function {
                token, id, body, is_static, ..
            } => self.procedure_body(scope, token, *id, body, ScopeKind::Function, *is_static),
            S::Goto { .. } | S::Gosub { .. } | S::Restore { .. } => Ok(()),
            S::If {
                token: _,
                arms,
                else_body,
            } => {
                for arm in arms {
                    self.numeric(scope, &arm.test)?;
                    for inner in &arm.body {
                        self.statement(scope, inner)?;
                    }
                }
                for inner in else_body {
                    self.statement(scope, inner)?;
                }
                Ok(())
            }
            S::Input {
                token,
                prompt: _,
                line,
                targets,
            } => self.input(scope, token, *line, targets),
            S::OnError { .. } | S::Resume { .. } => Ok(()),
            S::OnEvent { token, param, .. } => {
                if scope.kind != ScopeKind::Top {
                    return Err(
                        error!(SyntaxError, token; "ON event GOSUB must be at module level"),
                    );
                }
                if let Some(param) = param {
                    self.numeric(scope, param)?;
                }
                Ok(())
            }
            S::OnIndex { token: _, expr, .. } => {
                self.numeric(scope, expr)?;
                Ok(())
            }
            S::Open {
                token: _,
                path,
                mode: _,
                number,
                len,
            } => {
                self.string_expr(scope, path)?;
                self.numeric(scope, number)?;
                if let Some(len) = len {
                    self.numeric(scope, len)?;
                }
                Ok(())
            }
            S::Print {
                token: _, items, ..
            } => {
                for item in items {
                    if let ast::PrintItem::Expr(expr) = item {
                        let ty = self.expression(scope, expr)?;
                        if !ty.is_numeric() && !ty.is_string() {
                            return Err(error!(TypeMismatch, expr.token()));
                        }
                    }
                }
                Ok(())
            }
            S::Read { token: _, targets } => {
                for target in targets {
                    let use_ = self.resolve_variable(scope, target)?;
                    let ty = target_ty(&use_, target.token())?;
                    if !ty.is_numeric() && !ty.is_string() {
                        return Err(error!(TypeMismatch, target.token()));
                    }
                }
                Ok(())
            }
            S::Select {
                token,
                id,
                expr,
                cases,
            } => self.select(scope, token, *id, expr, cases),
            S::Shared { token, vars } => self.shared(scope, token, vars),
            S::Sub {
                token, id, body, is_static, ..
            } => self.procedure_body(scope, token, *id, body, ScopeKind::Sub, *is_static),
            S::Swap { token, left, right } => {
                let left_use = self.resolve_variable(scope, left)?;
                let right_use = self.resolve_variable(scope, right)?;
                let left_ty = target_ty(&left_use, left.token())?;
                let right_ty = target_ty(&right_use, right.token())?;
                if left_ty != right_ty {
                    return Err(error!(TypeMismatch, token));
                }
                Ok(())
            }
            S::TypeDecl { token, .. } => {
                if scope.kind != ScopeKind::Top {
                    return Err(error!(SyntaxError, token));
                }
                // Registered by the signature scan.
                Ok(())
            }
            S::While {
                token: _,
                test,
                body,
            } => {
                self.numeric(scope, test)?;
                for inner in body {
                    self.statement(scope, inner)?;
                }
                Ok(())
            }
        }
    }

    fn assign(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        target: &ast::Variable,
        expr: &ast::Expression,
    ) -> Result<()> {
        let use_ = self.resolve_variable(scope, target)?;
        let target_ty = match &use_ {
            VarUse::Scalar(var) => var.ty.clone(),
            VarUse::Element { result, .. } => result.ty.clone(),
            VarUse::Constant(_) | VarUse::Function { .. } | VarUse::Builtin(_) => {
                return Err(error!(DuplicateDefinition, target.token()));
            }
            VarUse::WholeArray(_) => return Err(error!(TypeMismatch, target.token())),
        };
        let value_ty = self.expression(scope, expr)?;
        if !assign_compat(&target_ty, &value_ty) {
            return Err(error!(TypeMismatch, token));
        }
        Ok(())
    }

    fn builtin_statement(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        id: NodeId,
        name: &Token,
        args: &[ast::Expression],
    ) -> Result<()> {
        let key = name.text.to_ascii_lowercase();
        let builtin = match builtins::lookup_statement(&key) {
            Some(builtin) => builtin,
            None => return Err(error!(SyntaxError, name)),
        };
        let kind = match builtin.op {
            BuiltinOp::Proc(kind) => kind,
            _ => return Err(error!(SyntaxError, name; "Not a statement")),
        };
        if args.len() < builtin.required || args.len() > builtin.args.len() {
            return Err(error!(ArgumentCountMismatch, token));
        }
        for (spec, arg) in builtin.args.iter().zip(args) {
            let ty = self.expression(scope, arg)?;
            check_arg_ty(*spec, &ty, arg.token())?;
        }
        self.notes.insert(id, Note::Proc(kind));
        Ok(())
    }

    fn call_statement(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        id: NodeId,
        name: &Token,
        args: &[ast::Expression],
    ) -> Result<()> {
        let name_text = untyped(name)?;
        let procedure = match self.program.chunks[0].symbols.lookup_procedure(&name_text) {
            Some(procedure) => procedure,
            None => return Err(error!(SubprogramNotDefined, name)),
        };
        if procedure.result.is_some() {
            return Err(error!(SubprogramNotDefined, name; "Not a SUB"));
        }
        let modes = self.argument_modes(scope, token, &procedure.params, args, false)?;
        self.notes.insert(
            id,
            Note::Call(CallNote {
                procedure,
                args: modes,
            }),
        );
        Ok(())
    }

    fn common(&mut self, scope: &mut Scope, token: &Token, vars: &[ast::Variable]) -> Result<()> {
        if scope.kind != ScopeKind::Top {
            return Err(error!(SyntaxError, token; "COMMON must be at module level"));
        }
        for var in vars {
            let use_ = self.resolve_variable(scope, var)?;
            let element_ty = match &use_ {
                VarUse::Scalar(v) => v.ty.clone(),
                VarUse::WholeArray(v) => v.ty.clone(),
                _ => return Err(error!(VariableRequired, var.token())),
            };
            if matches!(element_ty, Ty::Record(_)) {
                return Err(error!(TypeMismatch, var.token()));
            }
        }
        Ok(())
    }

    fn constants(&mut self, scope: &mut Scope, decls: &[(Token, ast::Expression)]) -> Result<()> {
        for (name, expr) in decls {
            let (name_text, sigil) = split_sigil(&name.text);
            let value = self.fold(scope, expr)?;
            let value = match sigil {
                Some(c) => value
                    .cast(&Ty::of_sigil(c))
                    .map_err(|code| Error::new(code).at(name))?,
                None => value,
            };
            self.program.chunks[scope.chunk]
                .symbols
                .define_constant(name_text, value)
                .map_err(|e| e.at(name))?;
        }
        Ok(())
    }

    fn def_fn_body(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        id: NodeId,
        expr: &ast::Expression,
    ) -> Result<()> {
        if scope.kind != ScopeKind::Top {
            return Err(error!(SyntaxError, token));
        }
        let chunk = self.notes.chunk_of(id)?;
        let mut inner = Scope {
            chunk,
            kind: ScopeKind::DefFn,
            auto: self.program.chunks[chunk].frame_size,
            synth: 0,
            is_static: false,
        };
        let value_ty = self.expression(&mut inner, expr)?;
        let result_ty = self.result_ty(chunk)?;
        if !value_compat(&result_ty, &value_ty) {
            return Err(error!(TypeMismatch, token));
        }
        self.program.chunks[chunk].frame_size = inner.auto;
        Ok(())
    }

    fn procedure_body(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        id: NodeId,
        body: &[ast::Statement],
        kind: ScopeKind,
        is_static: bool,
    ) -> Result<()> {
        if scope.kind != ScopeKind::Top {
            return Err(error!(SyntaxError, token));
        }
        let chunk = self.notes.chunk_of(id)?;
        let mut inner = Scope {
            chunk,
            kind,
            auto: self.program.chunks[chunk].frame_size,
            synth: 0,
            is_static,
        };
        for statement in body {
            self.statement(&mut inner, statement)?;
        }
        self.program.chunks[chunk].frame_size = inner.auto;
        Ok(())
    }

    fn result_ty(&self, chunk: usize) -> Result<Ty> {
        let procedure = self.program.chunks[chunk]
            .procedure
            .as_ref()
            .ok_or_else(|| error!(InternalError; "Chunk has no procedure"))?;
        let result = procedure
            .result
            .as_ref()
            .ok_or_else(|| error!(InternalError; "Procedure has no result"))?;
        Ok(result.ty.clone())
    }

    fn dim(&mut self, scope: &mut Scope, decl: &ast::DimVar, redim: bool) -> Result<()> {
        let token = &decl.name;
        let (name, sigil) = split_sigil(&token.text);
        let (ty, is_default) = match &decl.as_type {
            Some(type_name) => {
                if sigil.is_some() {
                    return Err(
                        error!(SyntaxError, token; "Identifier cannot end with %, &, !, # or $"),
                    );
                }
                (self.type_of_name(type_name, token)?, false)
            }
            None => self.use_ty(scope, &name, sigil),
        };
        if decl.bounds.is_empty() {
            let address = self.local_address(scope, ty.span());
            let mut var = Variable::scalar(name, ty, address);
            var.as_type = decl.as_type.is_some();
            var.is_static = scope.is_static;
            self.program.chunks[scope.chunk]
                .symbols
                .define_variable(Rc::new(var))
                .map_err(|e| e.at(token))?;
            return Ok(());
        }
        let mut bounds = Vec::with_capacity(decl.bounds.len());
        let mut dynamic = redim;
        for (lower, upper) in &decl.bounds {
            let lower = match lower {
                None => Some(0),
                Some(expr) => self.fold_i32(scope, expr),
            };
            let upper = self.fold_i32(scope, upper);
            match (lower, upper) {
                (Some(lower), Some(upper)) if !dynamic => {
                    if upper < lower {
                        return Err(error!(SubscriptOutOfRange, token));
                    }
                    bounds.push(ArrayBounds {
                        lower: Some(lower),
                        upper: Some(upper),
                    });
                }
                _ => dynamic = true,
            }
        }
        // Bound expressions are typed (and their names resolved)
        // whether or not they folded to constants.
        for (lower, upper) in &decl.bounds {
            if let Some(expr) = lower {
                self.numeric(scope, expr)?;
            }
            self.numeric(scope, upper)?;
        }
        if dynamic {
            bounds = vec![
                ArrayBounds {
                    lower: None,
                    upper: None,
                };
                decl.bounds.len()
            ];
        }
        let var = if redim {
            // REDIM of an already declared array reuses its slot.
            match self.program.chunks[scope.chunk]
                .symbols
                .find(&name, &ty, is_default, decl.bounds.len())
            {
                Some(Symbol::Variable(var)) => {
                    if let Some(dims) = &var.dims {
                        if !dims.is_empty() && dims.len() != decl.bounds.len() {
                            return Err(error!(SubscriptOutOfRange, token));
                        }
                    }
                    var
                }
                Some(_) => return Err(error!(DuplicateDefinition, token)),
                None => self.define_array(scope, name, ty, bounds, decl, token)?,
            }
        } else {
            self.define_array(scope, name, ty, bounds, decl, token)?
        };
        self.notes.dims.push(var);
        Ok(())
    }

    fn define_array(
        &mut self,
        scope: &mut Scope,
        name: Rc<str>,
        ty: Ty,
        bounds: Vec<ArrayBounds>,
        decl: &ast::DimVar,
        token: &Token,
    ) -> Result<Rc<Variable>> {
        let address = self.local_address(scope, 1);
        let mut var = Variable::array(name, ty, bounds, address);
        var.as_type = decl.as_type.is_some();
        var.is_static = scope.is_static;
        let var = Rc::new(var);
        self.program.chunks[scope.chunk]
            .symbols
            .define_variable(var.clone())
            .map_err(|e| e.at(token))?;
        Ok(var)
    }

    fn exit(&mut self, scope: &mut Scope, token: &Token, kind: ast::ExitKind) -> Result<()> {
        use ast::ExitKind as K;
        let ok = match kind {
            K::Sub => scope.kind == ScopeKind::Sub,
            K::Function => scope.kind == ScopeKind::Function,
            K::Def => scope.kind == ScopeKind::DefFn,
            // Loop context is the code generator's to check.
            K::For | K::Do => true,
        };
        if ok {
            Ok(())
        } else {
            Err(error!(SyntaxError, token; "EXIT outside its block"))
        }
    }

    fn for_loop(
        &mut self,
        scope: &mut Scope,
        id: NodeId,
        counter: &Token,
        from: &ast::Expression,
        to: &ast::Expression,
        step: Option<&ast::Expression>,
        body: &[ast::Statement],
    ) -> Result<()> {
        let counter_var = self.for_counter(scope, counter)?;
        self.numeric(scope, from)?;
        self.numeric(scope, to)?;
        let end = self.synthetic(scope, counter_var.ty.clone());
        let step_var = match step {
            Some(expr) => {
                self.numeric(scope, expr)?;
                Some(self.synthetic(scope, counter_var.ty.clone()))
            }
            None => None,
        };
        self.notes.insert(
            id,
            Note::For(ForNote {
                counter: counter_var,
                end,
                step: step_var,
            }),
        );
        for statement in body {
            self.statement(scope, statement)?;
        }
        Ok(())
    }

    fn for_counter(&mut self, scope: &mut Scope, token: &Token) -> Result<Rc<Variable>> {
        let (full, sigil) = split_sigil(&token.text);
        if let Some(dot) = full.find('.') {
            let head: Rc<str> = full[..dot].into();
            if let Some(record) = self.visible_record(scope, &head, false) {
                let path: Vec<&str> = full[dot + 1..].split('.').collect();
                let (offset, leaf) = match record.ty.field_offset(&path) {
                    Some(pair) => pair,
                    None => return Err(error!(SyntaxError, token; "Element not defined")),
                };
                if !leaf.is_numeric() {
                    return Err(error!(TypeMismatch, token));
                }
                return Ok(Rc::new(Variable::field(&record, offset, full, leaf)));
            }
        }
        let (ty, is_default) = self.use_ty(scope, &full, sigil);
        let var = match self.find_visible(scope, &full, &ty, is_default, 0) {
            Some(Symbol::Variable(var)) => var,
            Some(_) => return Err(error!(DuplicateDefinition, token)),
            None => self.define_implicit(scope, full, ty, 0, token)?,
        };
        if !var.ty.is_numeric() {
            return Err(error!(TypeMismatch, token));
        }
        Ok(var)
    }

    fn input(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        line: bool,
        targets: &[ast::Variable],
    ) -> Result<()> {
        if line && targets.len() != 1 {
            return Err(error!(SyntaxError, token));
        }
        for target in targets {
            let use_ = self.resolve_variable(scope, target)?;
            let ty = target_ty(&use_, target.token())?;
            if !ty.is_numeric() && !ty.is_string() {
                return Err(error!(TypeMismatch, target.token()));
            }
            if line && !ty.is_string() {
                return Err(error!(TypeMismatch, target.token()));
            }
        }
        Ok(())
    }

    fn select(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        id: NodeId,
        expr: &ast::Expression,
        cases: &[ast::CaseBlock],
    ) -> Result<()> {
        let selector_ty = self.expression(scope, expr)?;
        if !selector_ty.is_numeric() && !selector_ty.is_string() {
            return Err(error!(TypeMismatch, token));
        }
        let test = self.synthetic(scope, selector_ty.clone());
        self.notes.insert(id, Note::Select(test));
        for (index, case) in cases.iter().enumerate() {
            if case.items.is_empty() && index + 1 != cases.len() {
                return Err(error!(SyntaxError, &case.token; "CASE ELSE must be last"));
            }
            for item in &case.items {
                match item {
                    ast::CaseItem::Value(expr) | ast::CaseItem::Is(_, expr) => {
                        let ty = self.expression(scope, expr)?;
                        if !value_compat(&selector_ty, &ty) {
                            return Err(error!(TypeMismatch, expr.token()));
                        }
                    }
                    ast::CaseItem::Range(low, high) => {
                        for expr in [low, high] {
                            let ty = self.expression(scope, expr)?;
                            if !value_compat(&selector_ty, &ty) {
                                return Err(error!(TypeMismatch, expr.token()));
                            }
                        }
                    }
                }
            }
            for statement in &case.body {
                self.statement(scope, statement)?;
            }
        }
        Ok(())
    }

    fn shared(&mut self, scope: &mut Scope, token: &Token, vars: &[(Token, bool)]) -> Result<()> {
        if scope.kind != ScopeKind::Sub && scope.kind != ScopeKind::Function {
            return Err(error!(SyntaxError, token; "SHARED outside SUB or FUNCTION"));
        }
        for (name_token, is_array) in vars {
            let (name, sigil) = split_sigil(&name_token.text);
            let (ty, is_default) = {
                let module = &self.program.chunks[0].symbols;
                match sigil {
                    Some(c) => (Ty::of_sigil(c), false),
                    None => match module.as_type(&name) {
                        Some(ty) => (ty, false),
                        None => (self.default_ty(&name), true),
                    },
                }
            };
            let dims = if *is_array { 1 } else { 0 };
            let var = match self.program.chunks[0].symbols.find(&name, &ty, is_default, dims) {
                Some(Symbol::Variable(var)) => var,
                Some(_) => return Err(error!(DuplicateDefinition, name_token)),
                None => {
                    let address = Address::new(StorageClass::Static, self.statics);
                    self.statics += if *is_array { 1 } else { ty.span() };
                    let mut var = if *is_array {
                        Variable::array(
                            name,
                            ty,
                            vec![ArrayBounds {
                                lower: None,
                                upper: None,
                            }],
                            address,
                        )
                    } else {
                        Variable::scalar(name, ty, address)
                    };
                    var.is_shared = true;
                    let var = Rc::new(var);
                    self.program.chunks[0]
                        .symbols
                        .define_variable(var.clone())
                        .map_err(|e| e.at(name_token))?;
                    var
                }
            };
            self.program.chunks[scope.chunk]
                .symbols
                .define_variable(var)
                .map_err(|e| e.at(name_token))?;
        }
        Ok(())
    }

    // === name resolution ===

    /// Resolve one use of a name, leaving the result in the side
    /// table for the code generator.
    fn resolve_variable(&mut self, scope: &mut Scope, v: &ast::Variable) -> Result<VarUse> {
        let use_ = self.resolve_variable_inner(scope, v)?;
        self.notes.insert(v.id, Note::Use(use_.clone()));
        Ok(use_)
    }

    fn resolve_variable_inner(&mut self, scope: &mut Scope, v: &ast::Variable) -> Result<VarUse> {
        let token = &v.name;
        if v.parens && v.args.is_empty() {
            return Ok(VarUse::WholeArray(self.array_by_name(scope, token)?));
        }
        let (full, sigil) = split_sigil(&token.text);
        // Field access binds to a record form of the head name; a
        // dotted name with no record head is an ordinary variable.
        if let Some(dot) = full.find('.') {
            let head: Rc<str> = full[..dot].into();
            let wants_array = !v.args.is_empty();
            if let Some(record) = self.visible_record(scope, &head, wants_array) {
                let path: Vec<&str> = full[dot + 1..].split('.').collect();
                let (offset, leaf) = match record.ty.field_offset(&path) {
                    Some(pair) => pair,
                    None => return Err(error!(SyntaxError, token; "Element not defined")),
                };
                if let Some(c) = sigil {
                    if !sigil_matches(&leaf, c) {
                        return Err(error!(TypeMismatch, token));
                    }
                }
                if wants_array {
                    check_dimension_count(&record, v.args.len(), token)?;
                    for arg in &v.args {
                        self.numeric(scope, arg)?;
                    }
                    let result = self.synthetic(scope, leaf);
                    return Ok(VarUse::Element {
                        array: record,
                        field_offset: offset,
                        result,
                    });
                }
                let child = Variable::field(&record, offset, full, leaf);
                return Ok(VarUse::Scalar(Rc::new(child)));
            }
        }
        let (ty, is_default) = self.use_ty(scope, &full, sigil);
        if let Some(symbol) = self.find_visible(scope, &full, &ty, is_default, v.args.len()) {
            return match symbol {
                Symbol::Constant(val) => {
                    if !v.args.is_empty() {
                        return Err(error!(DuplicateDefinition, token));
                    }
                    Ok(VarUse::Constant(val))
                }
                Symbol::Procedure(procedure) => {
                    let result = match &procedure.result {
                        Some(result) => result.clone(),
                        None => return Err(error!(TypeMismatch, token; "SUB has no value")),
                    };
                    let by_val = procedure.name.starts_with("fn");
                    let args =
                        self.argument_modes(scope, token, &procedure.params, &v.args, by_val)?;
                    let synth = self.synthetic(scope, result.ty.clone());
                    Ok(VarUse::Function {
                        procedure,
                        args,
                        result: synth,
                    })
                }
                Symbol::Variable(var) => {
                    if v.args.is_empty() {
                        Ok(VarUse::Scalar(var))
                    } else {
                        check_dimension_count(&var, v.args.len(), token)?;
                        for arg in &v.args {
                            self.numeric(scope, arg)?;
                        }
                        let result = self.synthetic(scope, var.ty.clone());
                        Ok(VarUse::Element {
                            array: var,
                            field_offset: 0,
                            result,
                        })
                    }
                }
            };
        }
        let key = token.text.to_ascii_lowercase();
        if let Some(builtin) = builtins::lookup(&key) {
            // A call-shaped use always binds to the builtin; a bare
            // name reaches one only when it takes no arguments (RND,
            // TIMER, INKEY$), otherwise the name is free for a user
            // variable.
            if !v.args.is_empty() || builtin.required == 0 {
                return self.builtin_use(scope, v, builtin);
            }
        }
        let var = self.define_implicit(scope, full, ty, v.args.len(), token)?;
        if v.args.is_empty() {
            Ok(VarUse::Scalar(var))
        } else {
            for arg in &v.args {
                self.numeric(scope, arg)?;
            }
            let result = self.synthetic(scope, var.ty.clone());
            Ok(VarUse::Element {
                array: var,
                field_offset: 0,
                result,
            })
        }
    }

    fn builtin_use(
        &mut self,
        scope: &mut Scope,
        v: &ast::Variable,
        builtin: &Builtin,
    ) -> Result<VarUse> {
        let token = &v.name;
        if v.args.len() < builtin.required || v.args.len() > builtin.args.len() {
            return Err(error!(ArgumentCountMismatch, token));
        }
        match builtin.op {
            BuiltinOp::Proc(_) => Err(error!(SyntaxError, token; "Not a function")),
            BuiltinOp::Func(kind) => {
                let mut hint = None;
                for (spec, arg) in builtin.args.iter().zip(&v.args) {
                    let ty = self.expression(scope, arg)?;
                    check_arg_ty(*spec, &ty, arg.token())?;
                    if hint.is_none() {
                        hint = Some(ty);
                    }
                }
                let ret = builtin
                    .result_ty(hint.as_ref())
                    .ok_or_else(|| error!(InternalError; "Function builtin without result"))?;
                let result = self.synthetic(scope, ret);
                Ok(VarUse::Builtin(BuiltinUse::Func { kind, result }))
            }
            BuiltinOp::ArrayBound { upper } => {
                match &v.args[0] {
                    ast::Expression::Var(array) if array.args.is_empty() => {
                        self.whole_array_use(scope, array)?;
                    }
                    other => return Err(error!(VariableRequired, other.token())),
                }
                if let Some(dimension) = v.args.get(1) {
                    self.numeric(scope, dimension)?;
                }
                let result = self.synthetic(scope, Ty::Long);
                Ok(VarUse::Builtin(BuiltinUse::Bound { upper, result }))
            }
            BuiltinOp::VarPointer { .. } => {
                match &v.args[0] {
                    ast::Expression::Var(target) => {
                        let use_ = self.resolve_variable(scope, target)?;
                        match use_ {
                            VarUse::Scalar(_) | VarUse::Element { .. } | VarUse::WholeArray(_) => {}
                            _ => return Err(error!(VariableRequired, target.token())),
                        }
                    }
                    other => return Err(error!(VariableRequired, other.token())),
                }
                let result = self.synthetic(scope, Ty::Long);
                Ok(VarUse::Builtin(BuiltinUse::Pointer { result }))
            }
        }
    }

    /// Resolve `a()` (or the bare head of an ERASE/LBOUND operand) to
    /// the array form of the name, defining a dynamic array when none
    /// exists yet, and annotate the node.
    fn whole_array_use(&mut self, scope: &mut Scope, v: &ast::Variable) -> Result<Rc<Variable>> {
        if !v.args.is_empty() {
            return Err(error!(SyntaxError, v.token()));
        }
        let var = self.array_by_name(scope, &v.name)?;
        self.notes
            .insert(v.id, Note::Use(VarUse::WholeArray(var.clone())));
        Ok(var)
    }

    fn array_by_name(&mut self, scope: &mut Scope, token: &Token) -> Result<Rc<Variable>> {
        let (name, sigil) = split_sigil(&token.text);
        let (ty, is_default) = self.use_ty(scope, &name, sigil);
        match self.find_visible(scope, &name, &ty, is_default, 1) {
            Some(Symbol::Variable(var)) => Ok(var),
            Some(_) => Err(error!(DuplicateDefinition, token)),
            None => {
                let address = self.local_address(scope, 1);
                let var = Rc::new(Variable::array(
                    name,
                    ty,
                    vec![ArrayBounds {
                        lower: None,
                        upper: None,
                    }],
                    address,
                ));
                self.program.chunks[scope.chunk]
                    .symbols
                    .define_variable(var.clone())
                    .map_err(|e| e.at(token))?;
                Ok(var)
            }
        }
    }

    fn argument_modes(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        params: &[Rc<Variable>],
        args: &[ast::Expression],
        by_val: bool,
    ) -> Result<Vec<PassMode>> {
        if args.len() != params.len() {
            return Err(error!(ArgumentCountMismatch, token));
        }
        let mut modes = Vec::with_capacity(args.len());
        for (param, arg) in params.iter().zip(args) {
            if param.is_array() {
                let var = match arg {
                    ast::Expression::Var(v) if v.args.is_empty() => {
                        self.whole_array_use(scope, v)?
                    }
                    _ => return Err(error!(ParameterTypeMismatch, arg.token())),
                };
                if var.ty != param.ty {
                    return Err(error!(ParameterTypeMismatch, arg.token()));
                }
                modes.push(PassMode::ByRef);
                continue;
            }
            if by_val {
                let ty = self.expression(scope, arg)?;
                if !value_compat(&param.ty, &ty) {
                    return Err(error!(TypeMismatch, arg.token()));
                }
                modes.push(PassMode::ByVal(param.ty.clone()));
                continue;
            }
            match arg.as_variable() {
                Some(v) => {
                    let use_ = self.resolve_variable(scope, v)?;
                    match use_ {
                        VarUse::Scalar(var) => {
                            if var.ty != param.ty {
                                return Err(error!(ParameterTypeMismatch, v.token()));
                            }
                            modes.push(PassMode::ByRef);
                        }
                        VarUse::Element { result, .. } => {
                            if result.ty != param.ty {
                                return Err(error!(ParameterTypeMismatch, v.token()));
                            }
                            modes.push(PassMode::ByRef);
                        }
                        VarUse::Constant(val) => {
                            if !value_compat(&param.ty, &ty_of_constant(&val)) {
                                return Err(error!(TypeMismatch, v.token()));
                            }
                            modes.push(PassMode::ByVal(param.ty.clone()));
                        }
                        VarUse::Function { result, .. } => {
                            if !value_compat(&param.ty, &result.ty) {
                                return Err(error!(TypeMismatch, v.token()));
                            }
                            modes.push(PassMode::ByVal(param.ty.clone()));
                        }
                        VarUse::Builtin(builtin) => {
                            if !value_compat(&param.ty, &builtin.result().ty) {
                                return Err(error!(TypeMismatch, v.token()));
                            }
                            modes.push(PassMode::ByVal(param.ty.clone()));
                        }
                        VarUse::WholeArray(_) => {
                            return Err(error!(ParameterTypeMismatch, v.token()));
                        }
                    }
                }
                None => {
                    let ty = self.expression(scope, arg)?;
                    if !value_compat(&param.ty, &ty) {
                        return Err(error!(TypeMismatch, arg.token()));
                    }
                    modes.push(PassMode::ByVal(param.ty.clone()));
                }
            }
        }
        Ok(modes)
    }

    fn use_ty(&self, scope: &Scope, name: &str, sigil: Option<char>) -> (Ty, bool) {
        match sigil {
            Some(c) => (Ty::of_sigil(c), false),
            None => match self.as_type_of(scope, name) {
                Some(ty) => (ty, false),
                None => (self.default_ty(name), true),
            },
        }
    }

    fn as_type_of(&self, scope: &Scope, name: &str) -> Option<Ty> {
        let pinned = self.program.chunks[scope.chunk].symbols.as_type(name);
        if pinned.is_some() || scope.kind == ScopeKind::Top {
            return pinned;
        }
        if scope.kind == ScopeKind::DefFn {
            return self.program.chunks[0].symbols.as_type(name);
        }
        None
    }

    fn default_ty(&self, name: &str) -> Ty {
        match first_char(name) {
            Some(c @ 'a'..='z') => self.defaults[(c as u8 - b'a') as usize].clone(),
            _ => Ty::Single,
        }
    }

    /// Chunk-local lookup first. Inside a procedure the module table
    /// contributes procedures and constants; DEF FN bodies also see
    /// module variables.
    fn find_visible(
        &self,
        scope: &Scope,
        name: &str,
        ty: &Ty,
        is_default: bool,
        dims: usize,
    ) -> Option<Symbol> {
        let chunk_table = &self.program.chunks[scope.chunk].symbols;
        if let Some(symbol) = chunk_table.find(name, ty, is_default, dims) {
            return Some(symbol);
        }
        if scope.kind == ScopeKind::Top {
            return None;
        }
        match self.program.chunks[0].symbols.find(name, ty, is_default, dims)? {
            symbol @ Symbol::Procedure(_) | symbol @ Symbol::Constant(_) => Some(symbol),
            Symbol::Variable(var) => {
                if scope.kind == ScopeKind::DefFn {
                    Some(Symbol::Variable(var))
                } else {
                    None
                }
            }
        }
    }

    fn visible_record(&self, scope: &Scope, head: &str, array: bool) -> Option<Rc<Variable>> {
        let chunk_table = &self.program.chunks[scope.chunk].symbols;
        if let Some(var) = chunk_table.lookup_record(head, array) {
            return Some(var);
        }
        if scope.kind == ScopeKind::DefFn {
            return self.program.chunks[0].symbols.lookup_record(head, array);
        }
        None
    }

    /// First untyped use of a name defines it. Arrays default to ten
    /// elements per dimension, as the legacy runtime dimensions them.
    fn define_implicit(
        &mut self,
        scope: &mut Scope,
        name: Rc<str>,
        ty: Ty,
        dims: usize,
        token: &Token,
    ) -> Result<Rc<Variable>> {
        let module = scope.kind == ScopeKind::DefFn;
        let chunk = if module { 0 } else { scope.chunk };
        let span = if dims == 0 { ty.span() } else { 1 };
        let address = if module {
            let address = Address::new(StorageClass::Static, self.statics);
            self.statics += span;
            address
        } else {
            self.local_address(scope, span)
        };
        let var = if dims == 0 {
            Variable::scalar(name, ty, address)
        } else {
            Variable::array(
                name,
                ty,
                vec![
                    ArrayBounds {
                        lower: Some(0),
                        upper: Some(10),
                    };
                    dims
                ],
                address,
            )
        };
        let var = Rc::new(var);
        self.program.chunks[chunk]
            .symbols
            .define_variable(var.clone())
            .map_err(|e| e.at(token))?;
        Ok(var)
    }

    fn local_address(&mut self, scope: &mut Scope, span: usize) -> Address {
        if scope.chunk == 0 || scope.is_static {
            let address = Address::new(StorageClass::Static, self.statics);
            self.statics += span;
            address
        } else {
            let address = Address::new(StorageClass::Automatic, scope.auto);
            scope.auto += span;
            address
        }
    }

    /// A compiler temporary: no symbol table entry, one slot in the
    /// enclosing chunk's frame (static at module level).
    fn synthetic(&mut self, scope: &mut Scope, ty: Ty) -> Rc<Variable> {
        let name: Rc<str> = format!("_v{}", scope.synth).into();
        scope.synth += 1;
        let address = if scope.chunk == 0 {
            let address = Address::new(StorageClass::Static, self.statics);
            self.statics += 1;
            address
        } else {
            let address = Address::new(StorageClass::Automatic, scope.auto);
            scope.auto += 1;
            address
        };
        Rc::new(Variable::scalar(name, ty, address))
    }

    // === expression typing ===

    fn expression(&mut self, scope: &mut Scope, expr: &ast::Expression) -> Result<Ty> {
        use ast::Expression as E;
        match expr {
            E::Integer(..) => Ok(Ty::Integer),
            E::Long(..) => Ok(Ty::Long),
            E::Single(..) => Ok(Ty::Single),
            E::Double(..) => Ok(Ty::Double),
            E::String(..) => Ok(Ty::String),
            E::Var(v) => {
                let use_ = self.resolve_variable(scope, v)?;
                match use_ {
                    VarUse::Constant(val) => Ok(ty_of_constant(&val)),
                    VarUse::Scalar(var) => Ok(var.ty.clone()),
                    VarUse::Element { result, .. } | VarUse::Function { result, .. } => {
                        Ok(result.ty.clone())
                    }
                    VarUse::Builtin(builtin) => Ok(builtin.result().ty.clone()),
                    VarUse::WholeArray(_) => Err(error!(TypeMismatch, v.token())),
                }
            }
            E::Negation(token, inner) => {
                let ty = self.expression(scope, inner)?;
                if ty.is_numeric() {
                    Ok(ty)
                } else {
                    Err(error!(TypeMismatch, token))
                }
            }
            E::Not(token, inner) => {
                let ty = self.expression(scope, inner)?;
                if ty.is_numeric() {
                    Ok(logic_ty(&ty, &ty))
                } else {
                    Err(error!(TypeMismatch, token))
                }
            }
            E::Add(token, lhs, rhs) => {
                let (l, r) = self.pair(scope, lhs, rhs)?;
                if l.is_string() && r.is_string() {
                    Ok(Ty::String)
                } else if l.is_numeric() && r.is_numeric() {
                    Ok(promote(&l, &r))
                } else {
                    Err(error!(TypeMismatch, token))
                }
            }
            E::Subtract(token, lhs, rhs) | E::Multiply(token, lhs, rhs) => {
                let (l, r) = self.numeric_pair(scope, token, lhs, rhs)?;
                Ok(promote(&l, &r))
            }
            E::Divide(token, lhs, rhs) | E::Power(token, lhs, rhs) => {
                let (l, r) = self.numeric_pair(scope, token, lhs, rhs)?;
                if l == Ty::Double || r == Ty::Double {
                    Ok(Ty::Double)
                } else {
                    Ok(Ty::Single)
                }
            }
            E::DivideInt(token, lhs, rhs) | E::Modulo(token, lhs, rhs) => {
                let (l, r) = self.numeric_pair(scope, token, lhs, rhs)?;
                Ok(logic_ty(&l, &r))
            }
            E::Equal(token, lhs, rhs)
            | E::NotEqual(token, lhs, rhs)
            | E::Less(token, lhs, rhs)
            | E::LessEqual(token, lhs, rhs)
            | E::Greater(token, lhs, rhs)
            | E::GreaterEqual(token, lhs, rhs) => {
                let (l, r) = self.pair(scope, lhs, rhs)?;
                if (l.is_string() && r.is_string()) || (l.is_numeric() && r.is_numeric()) {
                    Ok(Ty::Integer)
                } else {
                    Err(error!(TypeMismatch, token))
                }
            }
            E::And(token, lhs, rhs)
            | E::Or(token, lhs, rhs)
            | E::Xor(token, lhs, rhs)
            | E::Imp(token, lhs, rhs)
            | E::Eqv(token, lhs, rhs) => {
                let (l, r) = self.numeric_pair(scope, token, lhs, rhs)?;
                Ok(logic_ty(&l, &r))
            }
        }
    }

    fn pair(
        &mut self,
        scope: &mut Scope,
        lhs: &ast::Expression,
        rhs: &ast::Expression,
    ) -> Result<(Ty, Ty)> {
        let l = self.expression(scope, lhs)?;
        let r = self.expression(scope, rhs)?;
        Ok((l, r))
    }

    fn numeric_pair(
        &mut self,
        scope: &mut Scope,
        token: &Token,
        lhs: &ast::Expression,
        rhs: &ast::Expression,
    ) -> Result<(Ty, Ty)> {
        let (l, r) = self.pair(scope, lhs, rhs)?;
        if l.is_numeric() && r.is_numeric() {
            Ok((l, r))
        } else {
            Err(error!(TypeMismatch, token))
        }
    }

    fn numeric(&mut self, scope: &mut Scope, expr: &ast::Expression) -> Result<Ty> {
        let ty = self.expression(scope, expr)?;
        if ty.is_numeric() {
            Ok(ty)
        } else {
            Err(error!(TypeMismatch, expr.token()))
        }
    }

    fn string_expr(&mut self, scope: &mut Scope, expr: &ast::Expression) -> Result<Ty> {
        let ty = self.expression(scope, expr)?;
        if ty.is_string() {
            Ok(ty)
        } else {
            Err(error!(TypeMismatch, expr.token()))
        }
    }

    // === constant folding ===

    /// Trial evaluation for CONST and array bounds: literals,
    /// previously defined constants, and operators only.
    fn fold(&self, scope: &Scope, expr: &ast::Expression) -> Result<Val> {
        use ast::Expression as E;
        let value = match expr {
            E::Integer(_, n) => Val::Integer(*n),
            E::Long(_, n) => Val::Long(*n),
            E::Single(_, n) => Val::Single(*n),
            E::Double(_, n) => Val::Double(*n),
            E::String(_, s) => Val::String(s.clone()),
            E::Var(v) => {
                if !v.args.is_empty() || v.parens {
                    return Err(error!(InvalidConstant, v.token()));
                }
                let (name, _) = split_sigil(&v.name.text);
                let chunk_table = &self.program.chunks[scope.chunk].symbols;
                match chunk_table
                    .lookup_constant(&name)
                    .or_else(|| self.program.chunks[0].symbols.lookup_constant(&name))
                {
                    Some(val) => val,
                    None => return Err(error!(InvalidConstant, v.token())),
                }
            }
            E::Negation(_, inner) => self.fold(scope, inner)?.negate(),
            E::Not(_, inner) => self.fold(scope, inner)?.not(),
            E::Power(_, l, r) => self.fold(scope, l)?.power(self.fold(scope, r)?),
            E::Multiply(_, l, r) => self.fold(scope, l)?.multiply(self.fold(scope, r)?),
            E::Divide(_, l, r) => self.fold(scope, l)?.divide(self.fold(scope, r)?),
            E::DivideInt(_, l, r) => self.fold(scope, l)?.divide_int(self.fold(scope, r)?),
            E::Modulo(_, l, r) => self.fold(scope, l)?.modulo(self.fold(scope, r)?),
            E::Add(_, l, r) => self.fold(scope, l)?.add(self.fold(scope, r)?),
            E::Subtract(_, l, r) => self.fold(scope, l)?.subtract(self.fold(scope, r)?),
            E::Equal(_, l, r) => self.fold(scope, l)?.compare_eq(self.fold(scope, r)?),
            E::NotEqual(_, l, r) => self.fold(scope, l)?.compare_ne(self.fold(scope, r)?),
            E::Less(_, l, r) => self.fold(scope, l)?.compare_lt(self.fold(scope, r)?),
            E::LessEqual(_, l, r) => self.fold(scope, l)?.compare_le(self.fold(scope, r)?),
            E::Greater(_, l, r) => self.fold(scope, l)?.compare_gt(self.fold(scope, r)?),
            E::GreaterEqual(_, l, r) => self.fold(scope, l)?.compare_ge(self.fold(scope, r)?),
            E::And(_, l, r) => self.fold(scope, l)?.and(self.fold(scope, r)?),
            E::Or(_, l, r) => self.fold(scope, l)?.or(self.fold(scope, r)?),
            E::Xor(_, l, r) => self.fold(scope, l)?.xor(self.fold(scope, r)?),
            E::Imp(_, l, r) => self.fold(scope, l)?.imp(self.fold(scope, r)?),
            E::Eqv(_, l, r) => self.fold(scope, l)?.eqv(self.fold(scope, r)?),
        };
        match value {
            Val::Error(code) => Err(Error::new(code).at(expr.token())),
            value => Ok(value),
        }
    }

    /// Constant-fold an array bound; `None` marks the array dynamic.
    fn fold_i32(&self, scope: &Scope, expr: &ast::Expression) -> Option<i32> {
        match self.fold(scope, expr).ok()?.cast(&Ty::Long).ok()? {
            Val::Long(n) => Some(n),
            _ => None,
        }
    }
}

fn range_letter(token: &Token) -> Result<char> {
    let lower = token.text.to_ascii_lowercase();
    let mut chars = lower.chars();
    match (chars.next(), chars.next()) {
        (Some(c @ 'a'..='z'), None) => Ok(c),
        _ => Err(error!(SyntaxError, token)),
    }
}

fn check_dimension_count(array: &Rc<Variable>, args: usize, token: &Token) -> Result<()> {
    match &array.dims {
        // Empty means an array parameter; the caller's shape decides.
        Some(dims) if !dims.is_empty() && dims.len() != args => {
            Err(error!(SubscriptOutOfRange, token))
        }
        Some(_) => Ok(()),
        None => Err(error!(InternalError; "Not an array variable")),
    }
}

fn check_arg_ty(spec: ArgTy, ty: &Ty, token: &Token) -> Result<()> {
    let ok = match spec {
        ArgTy::Num => ty.is_numeric(),
        ArgTy::Str => ty.is_string(),
        ArgTy::Any => ty.is_numeric() || ty.is_string(),
    };
    if ok {
        Ok(())
    } else {
        Err(error!(TypeMismatch, token))
    }
}

/// The type a use target may carry: scalars and elements only.
fn target_ty(use_: &VarUse, token: &Token) -> Result<Ty> {
    match use_ {
        VarUse::Scalar(var) => Ok(var.ty.clone()),
        VarUse::Element { result, .. } => Ok(result.ty.clone()),
        VarUse::Constant(_) => Err(error!(DuplicateDefinition, token)),
        _ => Err(error!(VariableRequired, token)),
    }
}

fn ty_of_constant(val: &Val) -> Ty {
    match val {
        Val::Integer(_) => Ty::Integer,
        Val::Long(_) => Ty::Long,
        Val::Single(_) => Ty::Single,
        Val::Double(_) => Ty::Double,
        _ => Ty::String,
    }
}

fn assign_compat(target: &Ty, value: &Ty) -> bool {
    match (target, value) {
        (Ty::Record(a), Ty::Record(b)) => a.name == b.name,
        _ => value_compat(target, value),
    }
}

fn value_compat(target: &Ty, value: &Ty) -> bool {
    (target.is_numeric() && value.is_numeric()) || (target.is_string() && value.is_string())
}

fn promote(a: &Ty, b: &Ty) -> Ty {
    match (a, b) {
        (Ty::Double, _) | (_, Ty::Double) => Ty::Double,
        (Ty::Single, _) | (_, Ty::Single) => Ty::Single,
        (Ty::Long, _) | (_, Ty::Long) => Ty::Long,
        _ => Ty::Integer,
    }
}

/// `\`, MOD and the bitwise operators produce integer16 only when
/// both operands are integer16.
fn logic_ty(a: &Ty, b: &Ty) -> Ty {
    match (a, b) {
        (Ty::Integer, Ty::Integer) => Ty::Integer,
        _ => Ty::Long,
    }
}

fn sigil_matches(ty: &Ty, sigil: char) -> bool {
    match sigil {
        '$' => ty.is_string(),
        '%' => *ty == Ty::Integer,
        '&' => *ty == Ty::Long,
        '!' => *ty == Ty::Single,
        '#' => *ty == Ty::Double,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::ast::{Expression, IdGen, Statement};

    fn tok(text: &str) -> Token {
        Token::new(1, 0, text)
    }

    fn var(ids: &mut IdGen, name: &str) -> ast::Variable {
        ast::Variable {
            id: ids.next(),
            name: tok(name),
            args: vec![],
            parens: false,
        }
    }

    fn assign(ids: &mut IdGen, name: &str, expr: Expression) -> Statement {
        Statement::Assign {
            token: tok("="),
            target: var(ids, name),
            expr,
        }
    }

    #[test]
    fn test_implicit_definition_allocates_static_storage() {
        let mut ids = IdGen::new();
        let ast = vec![
            assign(&mut ids, "a", Expression::Integer(tok("1"), 1)),
            assign(&mut ids, "b$", Expression::String(tok("\"x\""), "x".into())),
        ];
        let (program, _) = analyze(&ast).unwrap();
        // a, b$, and no temporaries.
        assert_eq!(program.static_size, 2);
        let module = &program.chunks[0].symbols;
        assert!(module.find("a", &Ty::Single, true, 0).is_some());
        assert!(module.find("b", &Ty::String, false, 0).is_some());
    }

    #[test]
    fn test_assign_type_mismatch() {
        let mut ids = IdGen::new();
        let ast = vec![assign(
            &mut ids,
            "a$",
            Expression::Integer(tok("1"), 1),
        )];
        let error = analyze(&ast).unwrap_err();
        assert_eq!(error.code(), crate::lang::ErrorCode::TypeMismatch);
    }

    #[test]
    fn test_const_folds_and_rejects_variables() {
        let mut ids = IdGen::new();
        let ast = vec![
            Statement::Const {
                token: tok("CONST"),
                decls: vec![(
                    tok("limit"),
                    Expression::Multiply(
                        tok("*"),
                        Box::new(Expression::Integer(tok("6"), 6)),
                        Box::new(Expression::Integer(tok("7"), 7)),
                    ),
                )],
            },
            assign(&mut ids, "a", Expression::Var(Box::new(var(&mut ids, "limit")))),
        ];
        let (program, _) = analyze(&ast).unwrap();
        assert_eq!(
            program.chunks[0].symbols.lookup_constant("limit"),
            Some(Val::Integer(42))
        );

        let mut ids = IdGen::new();
        let bad = vec![
            assign(&mut ids, "a", Expression::Integer(tok("1"), 1)),
            Statement::Const {
                token: tok("CONST"),
                decls: vec![(
                    tok("c"),
                    Expression::Var(Box::new(var(&mut ids, "a"))),
                )],
            },
        ];
        let error = analyze(&bad).unwrap_err();
        assert_eq!(error.code(), crate::lang::ErrorCode::InvalidConstant);
    }

    #[test]
    fn test_deftype_defaults_apply_per_letter() {
        let mut ids = IdGen::new();
        let ast = vec![
            Statement::DefType {
                token: tok("DEFINT"),
                ty: ast::ScalarType::Integer,
                ranges: vec![(tok("i"), tok("n"))],
            },
            assign(&mut ids, "index", Expression::Integer(tok("1"), 1)),
            assign(&mut ids, "value", Expression::Integer(tok("1"), 1)),
        ];
        let (program, _) = analyze(&ast).unwrap();
        let module = &program.chunks[0].symbols;
        assert!(module.find("index", &Ty::Integer, true, 0).is_some());
        assert!(module.find("value", &Ty::Single, true, 0).is_some());
    }

    #[test]
    fn test_dim_constant_bounds_rejects_inverted_range() {
        let decl = ast::DimVar {
            name: tok("a"),
            bounds: vec![(
                Some(Expression::Integer(tok("5"), 5)),
                Expression::Integer(tok("1"), 1),
            )],
            as_type: None,
        };
        let ast = vec![Statement::Dim {
            token: tok("DIM"),
            redim: false,
            decls: vec![decl],
        }];
        let error = analyze(&ast).unwrap_err();
        assert_eq!(error.code(), crate::lang::ErrorCode::SubscriptOutOfRange);
    }

    #[test]
    fn test_record_assignment_requires_same_declared_type() {
        let mut ids = IdGen::new();
        let point_fields = vec![
            (tok("x"), ast::TypeName::Single),
            (tok("y"), ast::TypeName::Single),
        ];
        let ast = vec![
            Statement::TypeDecl {
                token: tok("TYPE"),
                name: tok("Point"),
                fields: point_fields.clone(),
            },
            Statement::TypeDecl {
                token: tok("TYPE"),
                name: tok("Vec2"),
                fields: point_fields,
            },
            Statement::Dim {
                token: tok("DIM"),
                redim: false,
                decls: vec![
                    ast::DimVar {
                        name: tok("p"),
                        bounds: vec![],
                        as_type: Some(ast::TypeName::Named(tok("Point"))),
                    },
                    ast::DimVar {
                        name: tok("v"),
                        bounds: vec![],
                        as_type: Some(ast::TypeName::Named(tok("Vec2"))),
                    },
                ],
            },
            assign(&mut ids, "p", Expression::Var(Box::new(var(&mut ids, "v")))),
        ];
        let error = analyze(&ast).unwrap_err();
        assert_eq!(error.code(), crate::lang::ErrorCode::TypeMismatch);
    }

    #[test]
    fn test_call_argument_count_checked() {
        let mut ids = IdGen::new();
        let ast = vec![
            Statement::Sub {
                token: tok("SUB"),
                id: ids.next(),
                name: tok("Foo"),
                params: vec![
                    ast::Param {
                        name: tok("a"),
                        as_type: None,
                        is_array: false,
                    },
                    ast::Param {
                        name: tok("b"),
                        as_type: None,
                        is_array: false,
                    },
                    ast::Param {
                        name: tok("c"),
                        as_type: None,
                        is_array: false,
                    },
                ],
                is_static: false,
                body: vec![],
            },
            Statement::Call {
                token: tok("CALL"),
                id: ids.next(),
                name: tok("Foo"),
                args: vec![
                    Expression::Integer(tok("1"), 1),
                    Expression::Integer(tok("2"), 2),
                ],
            },
        ];
        let error = analyze(&ast).unwrap_err();
        assert_eq!(
            error.code(),
            crate::lang::ErrorCode::ArgumentCountMismatch
        );
    }

    #[test]
    fn test_by_reference_parameter_type_must_match_exactly() {
        let mut ids = IdGen::new();
        let ast = vec![
            Statement::Sub {
                token: tok("SUB"),
                id: ids.next(),
                name: tok("Foo"),
                params: vec![ast::Param {
                    name: tok("a%"),
                    as_type: None,
                    is_array: false,
                }],
                is_static: false,
                body: vec![],
            },
            // x defaults to SINGLE; by-reference INTEGER parameter
            // cannot alias it.
            assign(&mut ids, "x", Expression::Integer(tok("1"), 1)),
            Statement::Call {
                token: tok("CALL"),
                id: ids.next(),
                name: tok("Foo"),
                args: vec![Expression::Var(Box::new(var(&mut ids, "x")))],
            },
        ];
        let error = analyze(&ast).unwrap_err();
        assert_eq!(
            error.code(),
            crate::lang::ErrorCode::ParameterTypeMismatch
        );
    }

    #[test]
    fn test_builtin_shadowed_by_user_variable() {
        let mut ids = IdGen::new();
        // A scalar named len shadows the builtin for bare uses, while
        // len("...") still reaches the builtin.
        let ast = vec![
            assign(&mut ids, "len", Expression::Integer(tok("5"), 5)),
            Statement::Assign {
                token: tok("="),
                target: var(&mut ids, "n"),
                expr: Expression::Var(Box::new(ast::Variable {
                    id: ids.next(),
                    name: tok("len"),
                    args: vec![Expression::String(tok("\"ab\""), "ab".into())],
                    parens: true,
                })),
            },
        ];
        let (_, notes) = analyze(&ast).unwrap();
        // The second use's note is a builtin call.
        match notes.var_use(2) {
            Ok(VarUse::Builtin(BuiltinUse::Func { kind, .. })) => {
                assert_eq!(*kind, FuncKind::Len);
            }
            other => panic!(
                "expected builtin note, got {:?}",
                other.map(|_| "note").map_err(|e| e.to_string())
            ),
        }
    }
}
