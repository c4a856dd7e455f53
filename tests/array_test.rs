mod common;
use common::*;
use qb::lang::ast::{DimVar, Statement, TypeName};
use qb::lang::{ErrorCode, Phase};

#[test]
fn test_dim_and_element_access() {
    let mut b = Build::new();
    let dim = b.dim("a", 5, Some(TypeName::Integer));
    let store = {
        let three = b.int(3);
        let seven = b.int(7);
        b.assign_el("a", vec![three], seven)
    };
    let report = {
        let three = b.int(3);
        let a3 = b.el("a", vec![three]);
        b.print(a3)
    };
    let ast = vec![dim, store, report];
    assert_eq!(exec(&ast), " 7 \n");
}

#[test]
fn test_subscript_out_of_range_at_the_access() {
    let mut b = Build::new();
    let dim = b.dim("a", 5, Some(TypeName::Integer));
    b.line = 9;
    let store = {
        let six = b.int(6);
        let one = b.int(1);
        b.assign_el("a", vec![six], one)
    };
    let ast = vec![dim, store];
    let error = exec_error(&ast);
    assert_eq!(error.code(), ErrorCode::SubscriptOutOfRange);
    assert_eq!(error.phase(), Phase::Runtime);
    assert_eq!(error.line(), 9);
}

#[test]
fn test_bounds_builtins() {
    let mut b = Build::new();
    let dim = {
        let lower = b.int(2);
        let upper = b.int(8);
        let decl = DimVar {
            name: b.t("a"),
            bounds: vec![(Some(lower), upper)],
            as_type: None,
        };
        Statement::Dim {
            token: b.t("DIM"),
            redim: false,
            decls: vec![decl],
        }
    };
    let low = {
        let whole = b.v_arr("a");
        let call = b.el("lbound", vec![qb::lang::ast::Expression::Var(Box::new(whole))]);
        b.print(call)
    };
    let high = {
        let whole = b.v_arr("a");
        let call = b.el("ubound", vec![qb::lang::ast::Expression::Var(Box::new(whole))]);
        b.print(call)
    };
    let ast = vec![dim, low, high];
    assert_eq!(exec(&ast), " 2 \n 8 \n");
}

#[test]
fn test_dynamic_dim_computes_bounds_at_run_time() {
    let mut b = Build::new();
    let init = {
        let four = b.int(4);
        b.assign("n%", four)
    };
    let dim = {
        let n = b.var("n%");
        let decl = DimVar {
            name: b.t("d"),
            bounds: vec![(None, n)],
            as_type: None,
        };
        Statement::Dim {
            token: b.t("DIM"),
            redim: false,
            decls: vec![decl],
        }
    };
    let store = {
        let four = b.int(4);
        let nine = b.int(9);
        b.assign_el("d", vec![four], nine)
    };
    let report = {
        let four = b.int(4);
        let d4 = b.el("d", vec![four]);
        b.print(d4)
    };
    let ast = vec![init, dim, store, report];
    assert_eq!(exec(&ast), " 9 \n");
}

#[test]
fn test_erase_frees_a_dynamic_array() {
    let mut b = Build::new();
    let init = {
        let four = b.int(4);
        b.assign("n%", four)
    };
    let dim = {
        let n = b.var("n%");
        let decl = DimVar {
            name: b.t("d"),
            bounds: vec![(None, n)],
            as_type: None,
        };
        Statement::Dim {
            token: b.t("DIM"),
            redim: false,
            decls: vec![decl],
        }
    };
    let store = {
        let one = b.int(1);
        let two = b.int(2);
        b.assign_el("d", vec![one], two)
    };
    let erase = {
        let whole = b.v_arr("d");
        Statement::Erase {
            token: b.t("ERASE"),
            arrays: vec![whole],
        }
    };
    // A dynamic array is gone after ERASE; touching it again is a
    // subscript error.
    let touch = {
        let one = b.int(1);
        let two = b.int(2);
        b.assign_el("d", vec![one], two)
    };
    let ast = vec![init, dim, store, erase, touch];
    let error = exec_error(&ast);
    assert_eq!(error.code(), ErrorCode::SubscriptOutOfRange);
}

#[test]
fn test_redim_replaces_contents() {
    let mut b = Build::new();
    let init = {
        let three = b.int(3);
        b.assign("n%", three)
    };
    let dim = |b: &mut Build, redim: bool| {
        let n = b.var("n%");
        let decl = DimVar {
            name: b.t("d"),
            bounds: vec![(None, n)],
            as_type: None,
        };
        Statement::Dim {
            token: b.t("DIM"),
            redim,
            decls: vec![decl],
        }
    };
    let first = dim(&mut b, false);
    let store = {
        let one = b.int(1);
        let five = b.int(5);
        b.assign_el("d", vec![one], five)
    };
    let second = dim(&mut b, true);
    // REDIM allocated a fresh frame; elements read back as defaults.
    let report = {
        let one = b.int(1);
        let d1 = b.el("d", vec![one]);
        b.print(d1)
    };
    let ast = vec![init, first, store, second, report];
    assert_eq!(exec(&ast), " 0 \n");
}

#[test]
fn test_implicit_array_gets_legacy_default_bounds() {
    let mut b = Build::new();
    // No DIM: using a(10) auto-dimensions 0..10.
    let store = {
        let ten = b.int(10);
        let one = b.int(1);
        b.assign_el("a", vec![ten], one)
    };
    let report = {
        let ten = b.int(10);
        let a10 = b.el("a", vec![ten]);
        b.print(a10)
    };
    let ast = vec![store, report];
    assert_eq!(exec(&ast), " 1 \n");
}
