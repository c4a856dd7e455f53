#![allow(dead_code)]

use qb::lang::ast::{self, Expression, IdGen, Statement};
use qb::lang::{Error, Token};
use qb::mach::{self, Devices, Event, FakeHandles, Invocation, Program};
use std::rc::Rc;

/// Builds syntax trees the way the external parser would: every
/// variable node gets a fresh id, every node a source token.
pub struct Build {
    ids: IdGen,
    pub line: u32,
}

impl Build {
    pub fn new() -> Build {
        Build {
            ids: IdGen::new(),
            line: 1,
        }
    }

    pub fn t(&mut self, text: &str) -> Token {
        Token::new(self.line, 0, text)
    }

    pub fn ids_next(&mut self) -> ast::NodeId {
        self.ids.next()
    }

    // expressions

    pub fn int(&mut self, n: i16) -> Expression {
        let token = self.t(&n.to_string());
        Expression::Integer(token, n)
    }

    pub fn lng(&mut self, n: i32) -> Expression {
        let token = self.t(&n.to_string());
        Expression::Long(token, n)
    }

    pub fn sng(&mut self, n: f32) -> Expression {
        let token = self.t(&n.to_string());
        Expression::Single(token, n)
    }

    pub fn txt(&mut self, s: &str) -> Expression {
        let token = self.t(&format!("{:?}", s));
        Expression::String(token, s.into())
    }

    pub fn v(&mut self, name: &str) -> ast::Variable {
        ast::Variable {
            id: self.ids.next(),
            name: self.t(name),
            args: vec![],
            parens: false,
        }
    }

    pub fn v_el(&mut self, name: &str, args: Vec<Expression>) -> ast::Variable {
        ast::Variable {
            id: self.ids.next(),
            name: self.t(name),
            args,
            parens: true,
        }
    }

    /// The whole-array form `name()`.
    pub fn v_arr(&mut self, name: &str) -> ast::Variable {
        ast::Variable {
            id: self.ids.next(),
            name: self.t(name),
            args: vec![],
            parens: true,
        }
    }

    pub fn var(&mut self, name: &str) -> Expression {
        let v = self.v(name);
        Expression::Var(Box::new(v))
    }

    /// A subscripted access or call: `name(args...)`.
    pub fn el(&mut self, name: &str, args: Vec<Expression>) -> Expression {
        let v = self.v_el(name, args);
        Expression::Var(Box::new(v))
    }

    pub fn add(&mut self, l: Expression, r: Expression) -> Expression {
        Expression::Add(self.t("+"), Box::new(l), Box::new(r))
    }

    pub fn sub(&mut self, l: Expression, r: Expression) -> Expression {
        Expression::Subtract(self.t("-"), Box::new(l), Box::new(r))
    }

    pub fn mul(&mut self, l: Expression, r: Expression) -> Expression {
        Expression::Multiply(self.t("*"), Box::new(l), Box::new(r))
    }

    pub fn le(&mut self, l: Expression, r: Expression) -> Expression {
        Expression::LessEqual(self.t("<="), Box::new(l), Box::new(r))
    }

    pub fn lt(&mut self, l: Expression, r: Expression) -> Expression {
        Expression::Less(self.t("<"), Box::new(l), Box::new(r))
    }

    pub fn gt(&mut self, l: Expression, r: Expression) -> Expression {
        Expression::Greater(self.t(">"), Box::new(l), Box::new(r))
    }

    pub fn eq(&mut self, l: Expression, r: Expression) -> Expression {
        Expression::Equal(self.t("="), Box::new(l), Box::new(r))
    }

    // statements

    pub fn assign(&mut self, name: &str, expr: Expression) -> Statement {
        let target = self.v(name);
        Statement::Assign {
            token: self.t("="),
            target,
            expr,
        }
    }

    pub fn assign_el(&mut self, name: &str, args: Vec<Expression>, expr: Expression) -> Statement {
        let target = self.v_el(name, args);
        Statement::Assign {
            token: self.t("="),
            target,
            expr,
        }
    }

    pub fn print(&mut self, expr: Expression) -> Statement {
        Statement::Print {
            token: self.t("PRINT"),
            to_printer: false,
            items: vec![ast::PrintItem::Expr(expr)],
        }
    }

    pub fn print_items(&mut self, items: Vec<ast::PrintItem>) -> Statement {
        Statement::Print {
            token: self.t("PRINT"),
            to_printer: false,
            items,
        }
    }

    pub fn label(&mut self, name: &str) -> Statement {
        Statement::Label { token: self.t(name) }
    }

    pub fn goto(&mut self, target: &str) -> Statement {
        Statement::Goto {
            token: self.t("GOTO"),
            target: self.t(target),
        }
    }

    pub fn gosub(&mut self, target: &str) -> Statement {
        Statement::Gosub {
            token: self.t("GOSUB"),
            target: self.t(target),
        }
    }

    pub fn ret(&mut self) -> Statement {
        Statement::Return { token: self.t("RETURN") }
    }

    pub fn end(&mut self) -> Statement {
        Statement::End { token: self.t("END") }
    }

    pub fn for_loop(
        &mut self,
        counter: &str,
        from: Expression,
        to: Expression,
        step: Option<Expression>,
        body: Vec<Statement>,
    ) -> Statement {
        Statement::For {
            token: self.t("FOR"),
            id: self.ids.next(),
            counter: self.t(counter),
            from,
            to,
            step,
            body,
        }
    }

    pub fn dim(&mut self, name: &str, upper: i16, as_type: Option<ast::TypeName>) -> Statement {
        let bound = self.int(upper);
        let decl = ast::DimVar {
            name: self.t(name),
            bounds: vec![(None, bound)],
            as_type,
        };
        Statement::Dim {
            token: self.t("DIM"),
            redim: false,
            decls: vec![decl],
        }
    }

    pub fn dim_scalar(&mut self, name: &str, as_type: ast::TypeName) -> Statement {
        let decl = ast::DimVar {
            name: self.t(name),
            bounds: vec![],
            as_type: Some(as_type),
        };
        Statement::Dim {
            token: self.t("DIM"),
            redim: false,
            decls: vec![decl],
        }
    }

    pub fn param(&mut self, name: &str) -> ast::Param {
        ast::Param {
            name: self.t(name),
            as_type: None,
            is_array: false,
        }
    }

    pub fn param_as(&mut self, name: &str, as_type: ast::TypeName) -> ast::Param {
        ast::Param {
            name: self.t(name),
            as_type: Some(as_type),
            is_array: false,
        }
    }

    pub fn sub_def(
        &mut self,
        name: &str,
        params: Vec<ast::Param>,
        body: Vec<Statement>,
    ) -> Statement {
        Statement::Sub {
            token: self.t("SUB"),
            id: self.ids.next(),
            name: self.t(name),
            params,
            is_static: false,
            body,
        }
    }

    pub fn function_def(
        &mut self,
        name: &str,
        params: Vec<ast::Param>,
        body: Vec<Statement>,
    ) -> Statement {
        Statement::Function {
            token: self.t("FUNCTION"),
            id: self.ids.next(),
            name: self.t(name),
            params,
            is_static: false,
            body,
        }
    }

    pub fn call(&mut self, name: &str, args: Vec<Expression>) -> Statement {
        Statement::Call {
            token: self.t("CALL"),
            id: self.ids.next(),
            name: self.t(name),
            args,
        }
    }

    pub fn builtin(&mut self, name: &str, args: Vec<Expression>) -> Statement {
        Statement::Builtin {
            token: self.t(name),
            id: self.ids.next(),
            name: self.t(name),
            args,
        }
    }

    pub fn record(&mut self, name: &str, fields: Vec<(&str, ast::TypeName)>) -> Statement {
        let fields = fields
            .into_iter()
            .map(|(field, ty)| (self.t(field), ty))
            .collect();
        Statement::TypeDecl {
            token: self.t("TYPE"),
            name: self.t(name),
            fields,
        }
    }

    pub fn if_then(
        &mut self,
        test: Expression,
        body: Vec<Statement>,
        else_body: Vec<Statement>,
    ) -> Statement {
        Statement::If {
            token: self.t("IF"),
            arms: vec![ast::IfArm {
                token: self.t("IF"),
                test,
                body,
            }],
            else_body,
        }
    }

    pub fn read(&mut self, targets: Vec<ast::Variable>) -> Statement {
        Statement::Read {
            token: self.t("READ"),
            targets,
        }
    }

    pub fn data(&mut self, items: Vec<(&str, bool)>) -> Statement {
        let items = items
            .into_iter()
            .map(|(text, quoted)| ast::DataConst {
                token: self.t(text),
                text: Some(text.into()),
                quoted,
            })
            .collect();
        Statement::Data {
            token: self.t("DATA"),
            items,
        }
    }
}

pub fn compile(ast: &[Statement]) -> Result<Program, Error> {
    mach::compile(ast)
}

/// Run a program to completion against fake devices, returning the
/// captured screen output.
pub fn exec(ast: &[Statement]) -> String {
    let program = mach::compile(ast).expect("program should compile");
    let (mut invocation, handles) = start_program(program);
    drive(&mut invocation);
    handles.screen.contents()
}

/// Run a program that is expected to stop on a runtime error.
pub fn exec_error(ast: &[Statement]) -> Error {
    let program = mach::compile(ast).expect("program should compile");
    let (mut invocation, _handles) = start_program(program);
    let mut bursts = 0;
    loop {
        match invocation.run(1000) {
            Event::Errors(mut errors) => return errors.remove(0),
            Event::Stopped => panic!("program stopped without an error"),
            Event::Suspended(_) => panic!("unexpected input suspension"),
            Event::Running => {
                bursts += 1;
                assert!(bursts < 100, "execution cycles exceeded");
            }
        }
    }
}

pub fn start(ast: &[Statement]) -> (Invocation, FakeHandles) {
    let program = mach::compile(ast).expect("program should compile");
    start_program(program)
}

pub fn start_program(program: Program) -> (Invocation, FakeHandles) {
    let _ = env_logger::builder().is_test(true).try_init();
    let (devices, handles) = Devices::fake();
    (Invocation::new(Rc::new(program), devices), handles)
}

pub fn drive(invocation: &mut Invocation) {
    let mut bursts = 0;
    loop {
        match invocation.run(1000) {
            Event::Stopped => return,
            Event::Errors(errors) => panic!("runtime error: {}", errors[0]),
            Event::Suspended(_) => panic!("unexpected input suspension"),
            Event::Running => {
                bursts += 1;
                assert!(bursts < 100, "execution cycles exceeded");
            }
        }
    }
}
