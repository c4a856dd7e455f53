mod common;
use common::*;
use qb::lang::ast::{Expression, Statement};

#[test]
fn test_sub_by_reference_argument_writes_back() {
    let mut b = Build::new();
    let body = {
        let x = b.var("x%");
        let one = b.int(1);
        let bump = b.add(x, one);
        vec![b.assign("x%", bump)]
    };
    let param = b.param("x%");
    let sub = b.sub_def("Bump", vec![param], body);
    let init = {
        let five = b.int(5);
        b.assign("n%", five)
    };
    let arg = b.var("n%");
    let call = b.call("Bump", vec![arg]);
    let report = {
        let n = b.var("n%");
        b.print(n)
    };
    let ast = vec![sub, init, call, report];
    assert_eq!(exec(&ast), " 6 \n");
}

#[test]
fn test_expression_argument_passes_by_value() {
    let mut b = Build::new();
    let body = {
        let x = b.var("x%");
        let one = b.int(1);
        let bump = b.add(x, one);
        vec![b.assign("x%", bump)]
    };
    let param = b.param("x%");
    let sub = b.sub_def("Bump", vec![param], body);
    let init = {
        let five = b.int(5);
        b.assign("n%", five)
    };
    // n% + 0 is an expression, so the callee gets a copy.
    let arg = {
        let n = b.var("n%");
        let zero = b.int(0);
        b.add(n, zero)
    };
    let call = b.call("Bump", vec![arg]);
    let report = {
        let n = b.var("n%");
        b.print(n)
    };
    let ast = vec![sub, init, call, report];
    assert_eq!(exec(&ast), " 5 \n");
}

#[test]
fn test_function_returns_its_result_variable() {
    let mut b = Build::new();
    let body = {
        let x = b.var("x%");
        let x2 = b.var("x%");
        let product = b.mul(x, x2);
        vec![b.assign("square&", product)]
    };
    let param = b.param("x%");
    let function = b.function_def("square&", vec![param], body);
    let call = b.el("square&", vec![Expression::Integer(b.t("12"), 12)]);
    let report = b.print(call);
    let ast = vec![function, report];
    assert_eq!(exec(&ast), " 144 \n");
}

#[test]
fn test_recursive_function() {
    let mut b = Build::new();
    // FUNCTION fact&(n%) with the classic base case.
    let base_test = {
        let n = b.var("n%");
        let one = b.int(1);
        b.le(n, one)
    };
    let base = {
        let one = b.int(1);
        vec![b.assign("fact&", one)]
    };
    let recurse = {
        let n = b.var("n%");
        let one = b.int(1);
        let smaller = b.sub(n, one);
        let inner = b.el("fact&", vec![smaller]);
        let n = b.var("n%");
        let product = b.mul(n, inner);
        vec![b.assign("fact&", product)]
    };
    let body = vec![b.if_then(base_test, base, recurse)];
    let param = b.param("n%");
    let function = b.function_def("fact&", vec![param], body);
    let call = b.el("fact&", vec![Expression::Integer(b.t("5"), 5)]);
    let report = b.print(call);
    let ast = vec![function, report];
    assert_eq!(exec(&ast), " 120 \n");
}

#[test]
fn test_def_fn_evaluates_its_expression() {
    let mut b = Build::new();
    let expr = {
        let x = b.var("x");
        let two = b.int(2);
        b.mul(x, two)
    };
    let param = b.param("x");
    let def = Statement::DefFn {
        token: b.t("DEF"),
        id: b.ids_next(),
        name: b.t("FNdouble"),
        params: vec![param],
        expr,
    };
    let call = b.el("FNdouble", vec![Expression::Integer(b.t("21"), 21)]);
    let report = b.print(call);
    let ast = vec![def, report];
    assert_eq!(exec(&ast), " 42 \n");
}

#[test]
fn test_gosub_returns_to_the_calling_site() {
    let mut b = Build::new();
    let ast = vec![
        b.gosub("report"),
        {
            let t = b.txt("after");
            b.print(t)
        },
        b.end(),
        b.label("report"),
        {
            let t = b.txt("sub");
            b.print(t)
        },
        b.ret(),
    ];
    assert_eq!(exec(&ast), "sub\nafter\n");
}

#[test]
fn test_procedure_locals_do_not_leak_to_module_scope() {
    let mut b = Build::new();
    let body = {
        let nine = b.int(9);
        let set = b.assign("hidden%", nine);
        let h = b.var("hidden%");
        vec![set, b.print(h)]
    };
    let sub = b.sub_def("Work", vec![], body);
    let call = b.call("Work", vec![]);
    // The module-level hidden% is a distinct variable, still unset.
    let report = {
        let h = b.var("hidden%");
        b.print(h)
    };
    let ast = vec![sub, call, report];
    assert_eq!(exec(&ast), " 9 \n 0 \n");
}

#[test]
fn test_shared_aliases_module_variable() {
    let mut b = Build::new();
    let body = {
        let shared = Statement::Shared {
            token: b.t("SHARED"),
            vars: vec![(b.t("total%"), false)],
        };
        let t = b.var("total%");
        let seven = b.int(7);
        let sum = b.add(t, seven);
        vec![shared, b.assign("total%", sum)]
    };
    let sub = b.sub_def("Accumulate", vec![], body);
    let init = {
        let one = b.int(1);
        b.assign("total%", one)
    };
    let call = b.call("Accumulate", vec![]);
    let report = {
        let t = b.var("total%");
        b.print(t)
    };
    let ast = vec![init, sub, call, report];
    assert_eq!(exec(&ast), " 8 \n");
}
