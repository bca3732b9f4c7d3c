use std::path::Path;

use linedis::{FunctionDetailMode, ReportError, ReportOptions, SourceFile, compile, generate_report, render_report};

fn rule() -> String {
    "-".repeat(120)
}

fn report(text: &str) -> String {
    render_report(&SourceFile::from_text(text), &ReportOptions::default()).unwrap()
}

fn fixture(name: &str) -> String {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
    generate_report(path, &ReportOptions::default()).unwrap()
}

/// Opcode name and description of every row under the mapping header, with the row's line.
fn mapping_rows(report: &str) -> Vec<(u32, String, String)> {
    report
        .lines()
        .skip(4)
        .take_while(|row| !row.is_empty())
        .map(|row| {
            let mut columns = row.split(" | ");
            let line = columns.next().unwrap()[..5].trim().parse().unwrap();
            let opname = columns.next().unwrap().trim().to_owned();
            let description = columns.next().unwrap().to_owned();
            (line, opname, description)
        })
        .collect()
}

/// Replaces the address in code object descriptions, which changes from run to run.
fn mask_addresses(report: &str) -> String {
    let mut masked = String::with_capacity(report.len());
    let mut rest = report;
    while let Some(at) = rest.find(" at 0x") {
        let (head, tail) = rest.split_at(at + " at ".len());
        masked.push_str(head);
        masked.push_str("ADDR");
        rest = tail.trim_start_matches(|c: char| c == 'x' || c.is_ascii_hexdigit());
    }
    masked.push_str(rest);
    masked
}

#[test]
fn module_without_functions() {
    let out = report("x = 1\ny = x + 2\n");
    let rule = rule();
    let expected = format!(
        "Detailed Bytecode Mapping:\n{rule}\n\
         Line  Source Code                                        | Bytecode                       | Description\n\
         {rule}\n\
         1     {x:<50} | {:<30} | (2 -> 1)\n\
         1     {x:<50} | {:<30} | (4 -> x)\n\
         2     {y:<50} | {:<30} | (6 -> x)\n\
         2     {y:<50} | {:<30} | (8 -> 2)\n\
         2     {y:<50} | {:<30} | (10 -> +)\n\
         2     {y:<50} | {:<30} | (12 -> y)\n\
         2     {y:<50} | {:<30} | (14 -> None)\n",
        "LOAD_CONST",
        "STORE_NAME",
        "LOAD_NAME",
        "LOAD_CONST",
        "BINARY_OP",
        "STORE_NAME",
        "RETURN_CONST",
        x = "x = 1",
        y = "y = x + 2",
    );
    assert_eq!(out, expected);
    assert!(!out.contains("Function Bytecode Details"));
}

#[test]
fn single_function() {
    let out = report("def f():\n    return 1\n");
    let (mapping, details) = out.split_once("\n\nFunction Bytecode Details:\n").unwrap();

    let rows = mapping_rows(mapping);
    assert_eq!(rows[0].1, "LOAD_CONST");
    assert!(
        rows[0].2.starts_with("(2 -> <code object f at 0x"),
        "unexpected description: {}",
        rows[0].2
    );
    assert!(rows[0].2.ends_with(", file \"<script>\", line 1>)"));
    assert_eq!(rows[1].1, "MAKE_FUNCTION");
    assert_eq!(rows[2], (1, "STORE_NAME".to_owned(), "(6 -> f)".to_owned()));

    assert_eq!(details.matches("\nFunction: ").count(), 1);
    assert!(details.contains("\nFunction: f\n"));
    let return_row = details
        .lines()
        .find(|row| row.contains("RETURN_CONST"))
        .expect("function table has a return row");
    // source text keeps its indentation
    assert!(return_row.starts_with("2         return 1"), "unexpected row: {return_row}");
    assert!(return_row.contains("(1 -> 1)"));
}

#[test]
fn decorated_units_name_the_line_of_their_row() {
    let out = report("def dec(f):\n    return f\n\n\n@dec\ndef g():\n    pass\n\n\n@dec\nclass C:\n    pass\n");
    let rows = mapping_rows(&out);
    let code_rows: Vec<&(u32, String, String)> = rows.iter().filter(|(_, _, d)| d.contains("<code object")).collect();
    assert_eq!(code_rows.len(), 3);
    assert!(code_rows[0].2.ends_with(", file \"<script>\", line 1>)"), "{}", code_rows[0].2);
    // the decorator is on line 5, the code object is loaded on the `def` line
    assert_eq!(code_rows[1].0, 6);
    assert!(code_rows[1].2.contains("<code object g at 0x"));
    assert!(code_rows[1].2.ends_with(", file \"<script>\", line 6>)"), "{}", code_rows[1].2);
    assert_eq!(code_rows[2].0, 11);
    assert!(code_rows[2].2.contains("<code object C at 0x"));
    assert!(code_rows[2].2.ends_with(", file \"<script>\", line 11>)"), "{}", code_rows[2].2);
}

#[test]
fn positional_pairing_stops_at_the_shorter_list() {
    let out = report("def f(a):\n    b = a\n    return b\n");
    let (_, details) = out.split_once("Function: f\n").unwrap();
    let rows: Vec<(&str, &str)> = details
        .lines()
        .skip(3)
        .map(|row| {
            let mut columns = row.split(" | ");
            (columns.next().unwrap()[..5].trim(), columns.next().unwrap().trim())
        })
        .collect();
    // three line-table entries, five instructions: the tail is dropped and line 2 is shown with
    // the first instruction after `RESUME`, whatever line that instruction belongs to
    assert_eq!(rows, vec![("1", "RESUME"), ("2", "LOAD_FAST"), ("3", "STORE_FAST")]);
}

#[test]
fn with_rows_sit_on_the_with_line() {
    let rows = mapping_rows(&report("with a as b:\n    c()\n"));
    let opnames = |line: u32| -> Vec<&str> {
        rows.iter()
            .filter(|(l, _, _)| *l == line)
            .map(|(_, opname, _)| opname.as_str())
            .collect()
    };
    let with_line = opnames(1);
    assert_eq!(with_line[..3], ["LOAD_NAME", "BEFORE_WITH", "STORE_NAME"]);
    assert!(with_line.contains(&"CALL"));
    assert!(with_line.contains(&"WITH_EXCEPT_START"));
    assert_eq!(opnames(2), ["PUSH_NULL", "LOAD_NAME", "CALL", "POP_TOP"]);
}

#[test]
fn blank_and_comment_lines_never_appear() {
    let out = fixture("assignments.py");
    let rows = mapping_rows(&out);
    assert!(rows.iter().all(|(line, _, _)| ![3, 4].contains(line)));
    // the folded expression loads one constant
    let line_five: Vec<_> = rows.iter().filter(|(line, _, _)| *line == 5).collect();
    assert_eq!(line_five.len(), 2);
    assert!(line_five[0].2.ends_with(" -> 9)"));
}

#[test]
fn constants_render_like_python() {
    let rows = mapping_rows(&fixture("assignments.py"));
    let descriptions: Vec<&str> = rows.iter().map(|(_, _, d)| d.as_str()).collect();
    assert!(descriptions.iter().any(|d| d.ends_with(" -> \"it's\")")));
    assert!(descriptions.iter().any(|d| d.ends_with(r" -> b'\x00\xff')")));
    assert!(descriptions.iter().any(|d| d.ends_with(" -> 18446744073709551616)")));
    assert!(descriptions.iter().any(|d| d.ends_with(" -> ('sep',))")));
}

#[test]
fn one_header_per_top_level_unit() {
    let out = fixture("functions.py");
    let headers: Vec<&str> = out.lines().filter_map(|l| l.strip_prefix("Function: ")).collect();
    // `increment` is nested inside `counter` and gets no table of its own
    assert_eq!(headers, vec!["area", "greet", "counter", "<lambda>"]);
}

#[test]
fn classes_and_comprehensions_are_units() {
    let out = fixture("classes.py");
    let headers: Vec<&str> = out.lines().filter_map(|l| l.strip_prefix("Function: ")).collect();
    assert_eq!(headers, vec!["Point", "Point3"]);

    let out = fixture("comprehensions.py");
    let headers: Vec<&str> = out.lines().filter_map(|l| l.strip_prefix("Function: ")).collect();
    assert_eq!(headers, vec!["<listcomp>", "<dictcomp>", "<setcomp>", "<genexpr>", "pairs", "evens"]);
}

#[test]
fn mapping_rows_match_instructions_with_lines() {
    for name in ["assignments.py", "functions.py", "control_flow.py", "classes.py", "with_statement.py"] {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures").join(name);
        let source = SourceFile::load(&path).unwrap();
        let code = compile(source.text(), "<script>").unwrap();
        let with_line = code.instructions().filter(|i| i.line.is_some()).count();
        let out = render_report(&source, &ReportOptions::default()).unwrap();
        assert_eq!(mapping_rows(&out).len(), with_line, "{name}");
    }
}

#[test]
fn grouped_mode_lists_every_instruction_of_a_function() {
    let text = "def f(a):\n    b = a + 1\n    return b\n";
    let options = ReportOptions {
        function_detail: FunctionDetailMode::Grouped,
    };
    let out = render_report(&SourceFile::from_text(text), &options).unwrap();
    let (_, details) = out.split_once("Function: f\n").unwrap();
    let opnames: Vec<&str> = details
        .lines()
        .skip(3)
        .map(|row| row.split(" | ").nth(1).unwrap().trim())
        .collect();
    assert_eq!(
        opnames,
        vec!["RESUME", "LOAD_FAST", "LOAD_CONST", "BINARY_OP", "STORE_FAST", "LOAD_FAST", "RETURN_VALUE"]
    );
}

#[test]
fn rerunning_is_stable_apart_from_addresses() {
    let first = fixture("control_flow.py");
    let second = fixture("control_flow.py");
    assert_eq!(mask_addresses(&first), mask_addresses(&second));
    assert!(mask_addresses(&first).contains("<code object classify at ADDR, file \"<script>\", line 1>"));
}

#[test]
fn missing_file_is_reported_as_not_found() {
    let err = generate_report("nope.txt", &ReportOptions::default()).unwrap_err();
    assert!(matches!(err, ReportError::FileNotFound { .. }));
    assert_eq!(err.to_string(), "File 'nope.txt' not found.");
}

#[test]
fn invalid_utf8_is_a_decode_error() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/invalid/latin1.py");
    let err = generate_report(path, &ReportOptions::default()).unwrap_err();
    assert!(matches!(err, ReportError::Decode { .. }), "{err:?}");
}
