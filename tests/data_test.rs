mod common;
use common::*;
use qb::lang::ast::Statement;
use qb::lang::ErrorCode;

#[test]
fn test_read_consumes_data_in_order() {
    let mut b = Build::new();
    let data = b.data(vec![("1", false), ("2", false)]);
    let targets = vec![b.v("a%"), b.v("b%")];
    let read = b.read(targets);
    let report = {
        let a = b.var("a%");
        let bb = b.var("b%");
        let sum = b.add(a, bb);
        b.print(sum)
    };
    let ast = vec![data, read, report];
    assert_eq!(exec(&ast), " 3 \n");
}

#[test]
fn test_restore_label_rewinds_to_its_data() {
    let mut b = Build::new();
    let first = b.data(vec![("1", false), ("2", false)]);
    let names = b.label("names");
    let second = b.data(vec![("alpha", true)]);
    let read_numbers = {
        let targets = vec![b.v("a%"), b.v("b%")];
        b.read(targets)
    };
    let restore = Statement::Restore {
        token: b.t("RESTORE"),
        target: Some(b.t("names")),
    };
    let read_name = {
        let targets = vec![b.v("s$")];
        b.read(targets)
    };
    let report = {
        let s = b.var("s$");
        b.print(s)
    };
    let ast = vec![first, names, second, read_numbers, restore, read_name, report];
    assert_eq!(exec(&ast), "alpha\n");
}

#[test]
fn test_restore_forward_label() {
    let mut b = Build::new();
    let restore = Statement::Restore {
        token: b.t("RESTORE"),
        target: Some(b.t("later")),
    };
    let skip = b.data(vec![("99", false)]);
    let later = b.label("later");
    let wanted = b.data(vec![("7", false)]);
    let read = {
        let targets = vec![b.v("n%")];
        b.read(targets)
    };
    let report = {
        let n = b.var("n%");
        b.print(n)
    };
    let ast = vec![restore, skip, later, wanted, read, report];
    assert_eq!(exec(&ast), " 7 \n");
}

#[test]
fn test_reading_past_the_end_is_out_of_data() {
    let mut b = Build::new();
    let data = b.data(vec![("1", false)]);
    let read = {
        let targets = vec![b.v("a%"), b.v("b%")];
        b.read(targets)
    };
    let ast = vec![data, read];
    let error = exec_error(&ast);
    assert_eq!(error.code(), ErrorCode::OutOfData);
}

#[test]
fn test_quoted_data_rejected_for_numeric_targets() {
    let mut b = Build::new();
    let data = b.data(vec![("oops", true)]);
    let read = {
        let targets = vec![b.v("n%")];
        b.read(targets)
    };
    let ast = vec![data, read];
    let error = exec_error(&ast);
    assert_eq!(error.code(), ErrorCode::SyntaxError);
}

#[test]
fn test_data_cursor_is_shared_across_procedures() {
    let mut b = Build::new();
    let data = b.data(vec![("10", false), ("20", false)]);
    let body = {
        let targets = vec![b.v("n%")];
        let read = b.read(targets);
        let n = b.var("n%");
        vec![read, b.print(n)]
    };
    let sub = b.sub_def("Pull", vec![], body);
    let call_one = b.call("Pull", vec![]);
    let call_two = b.call("Pull", vec![]);
    let ast = vec![data, sub, call_one, call_two];
    assert_eq!(exec(&ast), " 10 \n 20 \n");
}
