//! End-to-end runs through the public interpreter API

use brandy::keyboard::KEY_F0;
use brandy::{Config, ErrorKind, Interpreter};

fn interp() -> Interpreter {
    Interpreter::headless(Config::new()).unwrap()
}

fn run(interp: &mut Interpreter, lines: &[&str]) -> String {
    for line in lines {
        let _ = interp.execute_line(line.as_bytes());
    }
    interp.output()
}

#[test]
fn test_stored_program_output() {
    let mut i = interp();
    let out = run(&mut i, &["10 PRINT \"HELLO\"", "20 FOR I=1 TO 3:PRINT I;:NEXT", "RUN"]);
    assert_eq!(out.as_bytes(), b"HELLO\r\n         1         2         3\r\n");
}

#[test]
fn test_mode_change_homes_cursor() {
    let mut i = interp();
    let out = run(&mut i, &["MODE 0:PRINT POS,VPOS"]);
    assert!(out.ends_with("         0         0\r\n"), "{:?}", out);
    let mode = i.screen.mode();
    assert_eq!((mode.xres, mode.yres, mode.colours), (640, 256, 2));
}

#[test]
fn test_low_memory_indirection() {
    let mut i = interp();
    let out = run(
        &mut i,
        &["FOR I=&100 TO &7F STEP -1:?I=I AND 255:NEXT:A%=0:FOR I=&100 TO &7F STEP -1:A%=A% EOR ?I:NEXT:PRINT ~A%"],
    );
    // 0x00 and 0x7F..=0xFF: the XOR of 0x80..=0xFF is 0, leaving 0x7F
    assert_eq!(out, "        7F\r\n");
    assert!(i.last_error().is_none());
}

#[test]
fn test_local_handler_leaves_no_frames() {
    let mut i = interp();
    let out = run(
        &mut i,
        &[
            "10 PROCx",
            "20 END",
            "30 DEF PROCx:LOCAL I",
            "40 ON ERROR LOCAL PRINT \"CAUGHT\":ENDPROC",
            "50 I=1/0",
            "60 ENDPROC",
            "RUN",
        ],
    );
    assert_eq!(out, "CAUGHT\r\n");
    assert_eq!(i.stack_depth(), 0);
    assert_eq!(run(&mut i, &["PRINT 1"]), "         1\r\n");
}

#[test]
fn test_function_key_expansion() {
    let mut i = interp();
    i.set_keys(b"");
    run(&mut i, &["*KEY 1 |A|B|!|@hello"]);
    i.keyboard.push_back(KEY_F0 + 1);
    let mut keys = Vec::new();
    while let Ok(Some(key)) = i.keyboard.get(Some(0)) {
        keys.push(key);
    }
    assert_eq!(keys, b"\x01\x02\x80hello");
}

#[test]
fn test_scroll_right_keeps_row() {
    let mut i = interp();
    run(&mut i, &["MODE 6", "VDU 23,7,0,0,0;0;0;:PRINT \"X\"", "VDU 23,7,0,0,0;0;0;:PRINT \"X\""]);
    assert_eq!(i.screen.char_at(0, 0), b' ');
    assert_eq!(i.screen.char_at(1, 0), b'X');
}

#[test]
fn test_quit_sets_status() {
    let mut i = interp();
    let err = i.execute_line(b"QUIT 3").unwrap_err();
    assert_eq!(err.kind, ErrorKind::Exit);
    assert_eq!(i.quit_code(), Some(3));
}

#[test]
fn test_repeat_and_case() {
    let mut i = interp();
    let out = run(
        &mut i,
        &[
            "10 N%=0",
            "20 REPEAT:N%+=1",
            "30 CASE N% OF",
            "40 WHEN 1:PRINT \"one\"",
            "50 WHEN 2,3:PRINT \"few\"",
            "60 OTHERWISE PRINT \"many\"",
            "70 ENDCASE",
            "80 UNTIL N%=4",
            "RUN",
        ],
    );
    assert_eq!(out, "one\r\nfew\r\nfew\r\nmany\r\n");
}

#[test]
fn test_error_report_from_program() {
    let mut i = interp();
    let out = run(&mut i, &["10 ERROR 100, \"Custom\"", "RUN"]);
    assert_eq!(out, "Custom at line 10\r\n");
    assert_eq!(run(&mut i, &["PRINT ERR;\" \";ERL"]), "       100 10\r\n");
}

#[test]
fn test_program_arguments_visible() {
    let mut i = interp();
    i.set_args(vec!["-x".to_string()]);
    assert_eq!(run(&mut i, &["SYS \"OS_GetEnv\" TO A$:PRINT A$"]), "brandy -x\r\n");
}
