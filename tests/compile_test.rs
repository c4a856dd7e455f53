mod common;
use common::*;
use qb::lang::ast::{Statement, TypeName};
use qb::lang::{ErrorCode, Phase};

#[test]
fn test_goto_undefined_label_names_the_use_site() {
    let mut b = Build::new();
    b.line = 7;
    let goto = b.goto("nowhere");
    let error = compile(&[goto]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::LabelNotDefined);
    assert_eq!(error.phase(), Phase::Compile);
    assert_eq!(error.line(), 7);
    assert!(error.to_string().starts_with("Label not defined"));
}

#[test]
fn test_labels_do_not_cross_procedures() {
    let mut b = Build::new();
    let body = vec![b.label("inside")];
    let sub = b.sub_def("Foo", vec![], body);
    let goto = b.goto("inside");
    let error = compile(&[sub, goto]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::LabelNotDefined);
}

#[test]
fn test_duplicate_label() {
    let mut b = Build::new();
    let first = b.label("again");
    let second = b.label("again");
    let error = compile(&[first, second]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::DuplicateLabel);
}

#[test]
fn test_argument_count_mismatch() {
    let mut b = Build::new();
    let params = vec![b.param("a"), b.param("b"), b.param("c")];
    let sub = b.sub_def("Foo", params, vec![]);
    let args = vec![b.int(1), b.int(2)];
    let call = b.call("Foo", args);
    let error = compile(&[sub, call]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::ArgumentCountMismatch);
}

#[test]
fn test_by_reference_parameter_type_mismatch() {
    let mut b = Build::new();
    let params = vec![b.param("a%")];
    let sub = b.sub_def("Foo", params, vec![]);
    let init = {
        let one = b.int(1);
        b.assign("x", one)
    };
    let arg = b.var("x");
    let call = b.call("Foo", vec![arg]);
    let error = compile(&[sub, init, call]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::ParameterTypeMismatch);
}

#[test]
fn test_calling_an_undefined_sub() {
    let mut b = Build::new();
    let call = b.call("Ghost", vec![]);
    let error = compile(&[call]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::SubprogramNotDefined);
}

#[test]
fn test_record_assignment_across_types_is_compile_time() {
    let mut b = Build::new();
    let point = b.record("Point", vec![("x", TypeName::Single)]);
    let spot = b.record("Spot", vec![("x", TypeName::Single)]);
    let dim_p = b.dim_scalar("p", TypeName::Named(b.t("Point")));
    let dim_s = b.dim_scalar("s", TypeName::Named(b.t("Spot")));
    let copy = {
        let s = b.var("s");
        b.assign("p", s)
    };
    let error = compile(&[point, spot, dim_p, dim_s, copy]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::TypeMismatch);
    assert_eq!(error.phase(), Phase::Compile);
}

#[test]
fn test_string_number_assignment_mismatch() {
    let mut b = Build::new();
    let bad = {
        let one = b.int(1);
        b.assign("s$", one)
    };
    let error = compile(&[bad]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::TypeMismatch);
}

#[test]
fn test_duplicate_dim_is_a_duplicate_definition() {
    let mut b = Build::new();
    let first = b.dim("a", 5, Some(TypeName::Integer));
    let second = b.dim("a", 5, Some(TypeName::Integer));
    let error = compile(&[first, second]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::DuplicateDefinition);
}

#[test]
fn test_undefined_record_type() {
    let mut b = Build::new();
    let dim = b.dim_scalar("p", TypeName::Named(b.t("Ghost")));
    let error = compile(&[dim]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::TypeNotDefined);
}

#[test]
fn test_sigil_on_label_rejected() {
    let mut b = Build::new();
    let goto = Statement::Goto {
        token: b.t("GOTO"),
        target: b.t("where$"),
    };
    let error = compile(&[goto]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::SyntaxError);
}

#[test]
fn test_exit_for_outside_a_loop() {
    let mut b = Build::new();
    let exit = Statement::Exit {
        token: b.t("EXIT"),
        kind: qb::lang::ast::ExitKind::For,
    };
    let error = compile(&[exit]).unwrap_err();
    assert_eq!(error.code(), ErrorCode::SyntaxError);
}

#[test]
fn test_on_error_compiles_but_fails_at_run_time() {
    let mut b = Build::new();
    let hook = Statement::OnError { token: b.t("ON ERROR") };
    let ast = vec![hook];
    compile(&ast).expect("ON ERROR is structurally accepted");
    let error = exec_error(&ast);
    assert_eq!(error.code(), ErrorCode::AdvancedFeature);
    assert_eq!(error.phase(), Phase::Runtime);
}

#[test]
fn test_compile_twice_produces_identical_programs() {
    let mut b = Build::new();
    let from = b.int(1);
    let to = b.int(3);
    let body = {
        let i = b.var("i");
        vec![b.print(i)]
    };
    let ast = vec![b.for_loop("i", from, to, None, body)];
    let first = compile(&ast).unwrap();
    let second = compile(&ast).unwrap();
    assert_eq!(first.chunks.len(), second.chunks.len());
    assert_eq!(first.static_size, second.static_size);
    for (a, z) in first.chunks.iter().zip(second.chunks.iter()) {
        assert_eq!(format!("{:?}", a.statements), format!("{:?}", z.statements));
    }
}
