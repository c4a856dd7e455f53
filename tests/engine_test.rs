mod common;
use common::*;
use qb::lang::ast::{EventControlKind, EventKind, OpenMode, Statement};
use qb::mach::{CommonBlock, Event, State};

#[test]
fn test_input_suspends_and_resumes() {
    let mut b = Build::new();
    let input = {
        let target = b.v("n%");
        Statement::Input {
            token: b.t("INPUT"),
            prompt: None,
            line: false,
            targets: vec![target],
        }
    };
    let report = {
        let n = b.var("n%");
        let two = b.int(2);
        let doubled = b.mul(n, two);
        b.print(doubled)
    };
    let ast = vec![input, report];
    let (mut invocation, handles) = start(&ast);
    match invocation.run(100) {
        Event::Suspended(request) => {
            assert_eq!(&*request.prompt, "? ");
            assert!(!request.line);
        }
        other => panic!("expected suspension, got {:?}", other),
    }
    assert_eq!(invocation.state(), State::Waiting);
    invocation.provide_input(&["21".to_string()]).unwrap();
    drive(&mut invocation);
    assert_eq!(handles.screen.contents(), " 42 \n");
}

#[test]
fn test_bad_numeric_input_stays_suspended() {
    let mut b = Build::new();
    let input = {
        let target = b.v("n%");
        Statement::Input {
            token: b.t("INPUT"),
            prompt: None,
            line: false,
            targets: vec![target],
        }
    };
    let ast = vec![input];
    let (mut invocation, _handles) = start(&ast);
    assert!(matches!(invocation.run(100), Event::Suspended(_)));
    // The legacy runtime re-prompts; the engine stays parked.
    assert!(invocation.provide_input(&["what".to_string()]).is_err());
    assert_eq!(invocation.state(), State::Waiting);
    invocation.provide_input(&["5".to_string()]).unwrap();
    drive(&mut invocation);
}

#[test]
fn test_line_input_takes_the_whole_line() {
    let mut b = Build::new();
    let input = {
        let target = b.v("s$");
        Statement::Input {
            token: b.t("LINE INPUT"),
            prompt: Some("name: ".into()),
            line: true,
            targets: vec![target],
        }
    };
    let report = {
        let s = b.var("s$");
        b.print(s)
    };
    let ast = vec![input, report];
    let (mut invocation, handles) = start(&ast);
    match invocation.run(100) {
        Event::Suspended(request) => assert_eq!(&*request.prompt, "name: "),
        other => panic!("expected suspension, got {:?}", other),
    }
    invocation
        .provide_input(&["one, two and three".to_string()])
        .unwrap();
    drive(&mut invocation);
    assert_eq!(handles.screen.contents(), "one, two and three\n");
}

#[test]
fn test_timer_trap_runs_its_handler_between_statements() {
    let mut b = Build::new();
    let arm = Statement::OnEvent {
        token: b.t("ON TIMER"),
        event: EventKind::Timer,
        param: Some(b.int(2)),
        target: b.t("tick"),
    };
    let enable = Statement::EventControl {
        token: b.t("TIMER ON"),
        event: EventKind::Timer,
        param: None,
        control: EventControlKind::On,
    };
    let spin = b.label("spin");
    let again = b.goto("spin");
    let handler = b.label("tick");
    let report = {
        let t = b.txt("tick");
        b.print(t)
    };
    let stop = b.end();
    let ast = vec![arm, enable, spin, again, handler, report, stop];
    let (mut invocation, handles) = start(&ast);
    // Spinning, no trigger yet.
    assert!(matches!(invocation.run(50), Event::Running));
    assert_eq!(handles.screen.contents(), "");
    handles.timer.advance(3.0);
    let mut bursts = 0;
    loop {
        match invocation.run(50) {
            Event::Stopped => break,
            Event::Running => {
                bursts += 1;
                assert!(bursts < 100, "trap never fired");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
    assert_eq!(handles.screen.contents(), "tick\n");
}

#[test]
fn test_stop_request_halts_between_steps() {
    let mut b = Build::new();
    let spin = b.label("spin");
    let again = b.goto("spin");
    let ast = vec![spin, again];
    let (mut invocation, _handles) = start(&ast);
    assert!(matches!(invocation.run(100), Event::Running));
    invocation.stop();
    assert!(matches!(invocation.run(100), Event::Stopped));
    assert_eq!(invocation.state(), State::Stopped);
}

#[test]
fn test_sleep_parks_until_the_clock_advances() {
    let mut b = Build::new();
    let sleep_arg = b.int(5);
    let sleep = b.builtin("SLEEP", vec![sleep_arg]);
    let report = {
        let t = b.txt("awake");
        b.print(t)
    };
    let ast = vec![sleep, report];
    let (mut invocation, handles) = start(&ast);
    assert!(matches!(invocation.run(100), Event::Running));
    assert_eq!(handles.screen.contents(), "");
    handles.timer.advance(6.0);
    drive(&mut invocation);
    assert_eq!(handles.screen.contents(), "awake\n");
}

#[test]
fn test_chain_hands_common_variables_to_the_successor() {
    let mut b = Build::new();
    let declare = Statement::Common {
        token: b.t("COMMON"),
        vars: vec![b.v("n%")],
    };
    let init = {
        let n = b.int(42);
        b.assign("n%", n)
    };
    let chain = Statement::Chain {
        token: b.t("CHAIN"),
        path: b.txt("successor"),
    };
    let first = vec![declare, init, chain];
    let (mut invocation, _handles) = start(&first);
    drive(&mut invocation);
    let (path, envelope) = invocation.chained().expect("CHAIN recorded a successor");
    assert_eq!(&*path, "successor");

    let mut b = Build::new();
    let declare = Statement::Common {
        token: b.t("COMMON"),
        vars: vec![b.v("n%")],
    };
    let report = {
        let n = b.var("n%");
        b.print(n)
    };
    let second = vec![declare, report];
    let (mut invocation, handles) = start(&second);
    invocation.context_mut().common = CommonBlock::from_envelope(&envelope).unwrap();
    drive(&mut invocation);
    assert_eq!(handles.screen.contents(), " 42 \n");
}

#[test]
fn test_varseg_peek_and_poke_round_trip() {
    let mut b = Build::new();
    let init = {
        let zero = b.int(0);
        b.assign("x%", zero)
    };
    let handle = {
        let target = b.var("x%");
        let call = b.el("varseg", vec![target]);
        b.assign("s&", call)
    };
    let select = {
        let s = b.var("s&");
        b.builtin("DEFSEG", vec![s])
    };
    let poke = {
        let offset = b.int(0);
        let byte = b.int(65);
        b.builtin("POKE", vec![offset, byte])
    };
    let report = {
        let offset = b.int(0);
        let peeked = b.el("peek", vec![offset]);
        b.print(peeked)
    };
    let ast = vec![init, handle, select, poke, report];
    assert_eq!(exec(&ast), " 65 \n");
}

#[test]
fn test_open_reaches_the_injected_file_seam() {
    let mut b = Build::new();
    let open = Statement::Open {
        token: b.t("OPEN"),
        path: b.txt("scores.txt"),
        mode: OpenMode::Output,
        number: b.int(1),
        len: None,
    };
    let report = {
        let number = b.int(1);
        let length = b.el("lof", vec![number]);
        b.print(length)
    };
    let close = Statement::Close {
        token: b.t("CLOSE"),
        numbers: vec![b.int(1)],
    };
    let ast = vec![open, report, close];
    assert_eq!(exec(&ast), " 0 \n");
}

#[test]
fn test_missing_input_file_is_a_runtime_error() {
    let mut b = Build::new();
    let open = Statement::Open {
        token: b.t("OPEN"),
        path: b.txt("absent.txt"),
        mode: OpenMode::Input,
        number: b.int(1),
        len: None,
    };
    let ast = vec![open];
    let error = exec_error(&ast);
    assert_eq!(error.code(), qb::lang::ErrorCode::FileNotFound);
}

#[test]
fn test_sleep_cancelled_by_a_keypress() {
    let mut b = Build::new();
    let sleep_arg = b.int(100);
    let sleep = b.builtin("SLEEP", vec![sleep_arg]);
    let report = {
        let t = b.txt("awake");
        b.print(t)
    };
    let ast = vec![sleep, report];
    let (mut invocation, handles) = start(&ast);
    assert!(matches!(invocation.run(100), Event::Running));
    handles.keyboard.press('x');
    drive(&mut invocation);
    assert_eq!(handles.screen.contents(), "awake\n");
}
