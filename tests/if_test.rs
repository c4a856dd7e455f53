mod common;
use common::*;
use qb::lang::ast::{IfArm, LoopTest, Statement};

#[test]
fn test_if_takes_the_true_branch() {
    let mut b = Build::new();
    let test = {
        let one = b.int(1);
        let two = b.int(2);
        b.lt(one, two)
    };
    let then = {
        let yes = b.txt("yes");
        vec![b.print(yes)]
    };
    let otherwise = {
        let no = b.txt("no");
        vec![b.print(no)]
    };
    let ast = vec![b.if_then(test, then, otherwise)];
    assert_eq!(exec(&ast), "yes\n");
}

#[test]
fn test_elseif_chain_falls_through_to_matching_arm() {
    let mut b = Build::new();
    let n = b.int(2);
    let assign = b.assign("x", n);
    let arm = |b: &mut Build, n: i16, text: &str| {
        let x = b.var("x");
        let value = b.int(n);
        let test = b.eq(x, value);
        let body = {
            let t = b.txt(text);
            vec![b.print(t)]
        };
        IfArm {
            token: b.t("IF"),
            test,
            body,
        }
    };
    let arms = vec![
        arm(&mut b, 1, "one"),
        arm(&mut b, 2, "two"),
        arm(&mut b, 3, "three"),
    ];
    let else_body = {
        let t = b.txt("none");
        vec![b.print(t)]
    };
    let ast = vec![
        assign,
        Statement::If {
            token: b.t("IF"),
            arms,
            else_body,
        },
    ];
    assert_eq!(exec(&ast), "two\n");
}

#[test]
fn test_while_wend_runs_until_false() {
    let mut b = Build::new();
    let init = {
        let one = b.int(1);
        b.assign("n", one)
    };
    let test = {
        let n = b.var("n");
        let three = b.int(3);
        b.le(n, three)
    };
    let body = {
        let n = b.var("n");
        let print_n = b.print(n);
        let n = b.var("n");
        let one = b.int(1);
        let bump = b.add(n, one);
        vec![print_n, b.assign("n", bump)]
    };
    let ast = vec![
        init,
        Statement::While {
            token: b.t("WHILE"),
            test,
            body,
        },
    ];
    assert_eq!(exec(&ast), " 1 \n 2 \n 3 \n");
}

#[test]
fn test_do_loop_post_test_runs_body_at_least_once() {
    let mut b = Build::new();
    let init = {
        let nine = b.int(9);
        b.assign("n", nine)
    };
    let body = {
        let n = b.var("n");
        vec![b.print(n)]
    };
    let post = {
        let n = b.var("n");
        let five = b.int(5);
        LoopTest {
            is_while: true,
            test: b.lt(n, five),
        }
    };
    let ast = vec![
        init,
        Statement::DoLoop {
            token: b.t("DO"),
            pre: None,
            body,
            post: Some(post),
        },
    ];
    // n starts past the limit but the post-test shape still prints it
    // once.
    assert_eq!(exec(&ast), " 9 \n");
}

#[test]
fn test_do_while_pre_test_skips_body_entirely() {
    let mut b = Build::new();
    let pre = {
        let zero = b.int(0);
        let one = b.int(1);
        LoopTest {
            is_while: true,
            test: b.gt(zero, one),
        }
    };
    let body = {
        let t = b.txt("never");
        vec![b.print(t)]
    };
    let done = {
        let t = b.txt("done");
        b.print(t)
    };
    let ast = vec![
        Statement::DoLoop {
            token: b.t("DO"),
            pre: Some(pre),
            body,
            post: None,
        },
        done,
    ];
    assert_eq!(exec(&ast), "done\n");
}

#[test]
fn test_on_index_takes_the_nth_target() {
    let mut b = Build::new();
    let init = {
        let two = b.int(2);
        b.assign("x%", two)
    };
    let jump = {
        let x = b.var("x%");
        Statement::OnIndex {
            token: b.t("ON"),
            expr: x,
            targets: vec![b.t("one"), b.t("two")],
            gosub: false,
        }
    };
    let fell = {
        let t = b.txt("fell");
        b.print(t)
    };
    let ast = vec![
        init,
        jump,
        fell,
        b.end(),
        b.label("one"),
        {
            let t = b.txt("one");
            b.print(t)
        },
        b.end(),
        b.label("two"),
        {
            let t = b.txt("two");
            b.print(t)
        },
        b.end(),
    ];
    assert_eq!(exec(&ast), "two\n");
}

#[test]
fn test_on_index_out_of_range_falls_through() {
    let mut b = Build::new();
    let init = {
        let nine = b.int(9);
        b.assign("x%", nine)
    };
    let jump = {
        let x = b.var("x%");
        Statement::OnIndex {
            token: b.t("ON"),
            expr: x,
            targets: vec![b.t("one")],
            gosub: false,
        }
    };
    let fell = {
        let t = b.txt("fell");
        b.print(t)
    };
    let ast = vec![
        init,
        jump,
        fell,
        b.end(),
        b.label("one"),
        b.end(),
    ];
    assert_eq!(exec(&ast), "fell\n");
}

#[test]
fn test_exit_do_breaks_an_endless_loop() {
    let mut b = Build::new();
    let init = {
        let zero = b.int(0);
        b.assign("n", zero)
    };
    let body = {
        let n = b.var("n");
        let one = b.int(1);
        let bump = b.add(n, one);
        let grow = b.assign("n", bump);
        let n = b.var("n");
        let three = b.int(3);
        let test = b.eq(n, three);
        let exit = Statement::Exit {
            token: b.t("EXIT"),
            kind: qb::lang::ast::ExitKind::Do,
        };
        vec![grow, b.if_then(test, vec![exit], vec![])]
    };
    let report = {
        let n = b.var("n");
        b.print(n)
    };
    let ast = vec![
        init,
        Statement::DoLoop {
            token: b.t("DO"),
            pre: None,
            body,
            post: None,
        },
        report,
    ];
    assert_eq!(exec(&ast), " 3 \n");
}
