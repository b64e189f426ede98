//! Property tests over whole programs

use brandy::{Config, Interpreter};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

fn interp() -> Interpreter {
    Interpreter::headless(Config::new()).unwrap()
}

fn listing(i: &mut Interpreter) -> String {
    i.output();
    i.execute_line(b"LIST").unwrap();
    i.output()
}

#[quickcheck]
fn prop_renumber_is_idempotent(numbers: Vec<u16>) -> TestResult {
    if numbers.is_empty() {
        return TestResult::discard();
    }
    let mut i = interp();
    for n in numbers.iter().take(30) {
        let n = n % 5000 + 1;
        let line = format!("{} PRINT {}:GOTO {}", n, n, n);
        if i.execute_line(line.as_bytes()).is_err() {
            return TestResult::failed();
        }
    }
    if i.execute_line(b"RENUMBER").is_err() {
        return TestResult::failed();
    }
    let once = listing(&mut i);
    if i.execute_line(b"RENUMBER").is_err() {
        return TestResult::failed();
    }
    TestResult::from_bool(listing(&mut i) == once)
}

#[quickcheck]
fn prop_listing_reenters_unchanged(values: Vec<i32>, words: Vec<u8>) -> bool {
    let mut i = interp();
    for (n, v) in values.iter().take(20).enumerate() {
        let name = (b'A' + words.get(n).copied().unwrap_or(0) % 26) as char;
        let line = format!("{} {}%={}:PRINT {}%", (n + 1) * 10, name, v, name);
        if i.execute_line(line.as_bytes()).is_err() {
            return false;
        }
    }
    let first = listing(&mut i);
    // Feed the listing back in as typed lines
    let mut again = interp();
    for line in first.split("\r\n").filter(|l| !l.is_empty()) {
        if again.execute_line(line.trim_start().as_bytes()).is_err() {
            return false;
        }
    }
    listing(&mut again) == first
}

#[quickcheck]
fn prop_file_values_survive(ints: Vec<i32>, text: String) -> TestResult {
    let text: String = text.chars().filter(|c| c.is_ascii_alphanumeric()).take(40).collect();
    let path = std::env::temp_dir().join(format!("brandy-prop-{}-{}", std::process::id(), ints.len()));
    let name = path.display().to_string();
    let mut i = interp();
    let values: Vec<i32> = ints.into_iter().take(8).collect();
    let write = format!(
        "F%=OPENOUT \"{}\":{}PRINT#F%,\"{}\":CLOSE#F%",
        name,
        values.iter().map(|v| format!("PRINT#F%,{}:", v)).collect::<String>(),
        text
    );
    if i.execute_line(write.as_bytes()).is_err() {
        return TestResult::failed();
    }
    let mut read = format!("F%=OPENIN \"{}\":", name);
    for _ in &values {
        read.push_str("INPUT#F%,V%:PRINT ;V%;:");
    }
    read.push_str("INPUT#F%,S$:PRINT S$:CLOSE#F%");
    i.output();
    let ok = i.execute_line(read.as_bytes()).is_ok();
    let _ = std::fs::remove_file(&path);
    if !ok {
        return TestResult::failed();
    }
    let mut expected: String = values.iter().map(|v| v.to_string()).collect();
    expected.push_str(&text);
    expected.push_str("\r\n");
    TestResult::from_bool(i.output() == expected)
}
