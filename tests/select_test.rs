mod common;
use common::*;
use qb::lang::ast::{CaseBlock, CaseItem, CaseRel, Statement};

fn select_on(b: &mut Build, selector: i16) -> Vec<Statement> {
    let init = {
        let n = b.int(selector);
        b.assign("x", n)
    };
    let value_case = |b: &mut Build, items: Vec<CaseItem>, text: &str| {
        let body = {
            let t = b.txt(text);
            vec![b.print(t)]
        };
        CaseBlock {
            token: b.t("CASE"),
            items,
            body,
        }
    };
    let one = b.int(1);
    let first = value_case(b, vec![CaseItem::Value(one)], "one");
    let two = b.int(2);
    let three = b.int(3);
    let second = value_case(
        b,
        vec![CaseItem::Value(two), CaseItem::Value(three)],
        "few",
    );
    let lo = b.int(4);
    let hi = b.int(6);
    let third = value_case(b, vec![CaseItem::Range(lo, hi)], "several");
    let ten = b.int(10);
    let fourth = value_case(b, vec![CaseItem::Is(CaseRel::GreaterEqual, ten)], "lots");
    let else_case = value_case(b, vec![], "other");
    let x = b.var("x");
    vec![
        init,
        Statement::Select {
            token: b.t("SELECT"),
            id: b.ids_next(),
            expr: x,
            cases: vec![first, second, third, fourth, else_case],
        },
    ]
}

#[test]
fn test_single_value_case() {
    let mut b = Build::new();
    let ast = select_on(&mut b, 1);
    assert_eq!(exec(&ast), "one\n");
}

#[test]
fn test_value_list_matches_either() {
    let mut b = Build::new();
    let ast = select_on(&mut b, 3);
    assert_eq!(exec(&ast), "few\n");
}

#[test]
fn test_range_case() {
    let mut b = Build::new();
    let ast = select_on(&mut b, 5);
    assert_eq!(exec(&ast), "several\n");
}

#[test]
fn test_is_relation_case() {
    let mut b = Build::new();
    let ast = select_on(&mut b, 42);
    assert_eq!(exec(&ast), "lots\n");
}

#[test]
fn test_case_else_catches_the_rest() {
    let mut b = Build::new();
    let ast = select_on(&mut b, 7);
    assert_eq!(exec(&ast), "other\n");
}

#[test]
fn test_string_selector() {
    let mut b = Build::new();
    let init = {
        let s = b.txt("b");
        b.assign("k$", s)
    };
    let case = |b: &mut Build, value: &str, text: &str| {
        let item = b.txt(value);
        let body = {
            let t = b.txt(text);
            vec![b.print(t)]
        };
        CaseBlock {
            token: b.t("CASE"),
            items: vec![CaseItem::Value(item)],
            body,
        }
    };
    let first = case(&mut b, "a", "alpha");
    let second = case(&mut b, "b", "beta");
    let k = b.var("k$");
    let ast = vec![
        init,
        Statement::Select {
            token: b.t("SELECT"),
            id: b.ids_next(),
            expr: k,
            cases: vec![first, second],
        },
    ];
    assert_eq!(exec(&ast), "beta\n");
}
