use std::path::Path;

use linedis::{CompileError, CompileErrorKind, ReportError, ReportOptions, compile, generate_report};

/// Helper to extract the compile error from a compilation that must fail.
fn compile_error(source: &str) -> CompileError {
    compile(source, "<script>").expect_err("expected compile error")
}

fn invalid_report(name: &str) -> ReportError {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/invalid").join(name);
    generate_report(path, &ReportOptions::default()).expect_err("expected report error")
}

#[test]
fn unbalanced_parenthesis_is_a_syntax_error() {
    let err = compile_error("print((1, 2)\n");
    assert_eq!(err.kind(), CompileErrorKind::SyntaxError);
    assert!(err.to_string().contains("<script>"), "message should name the file, got: {err}");
}

#[test]
fn unbalanced_parenthesis_fails_the_whole_report() {
    let err = invalid_report("unbalanced.py");
    assert!(matches!(err, ReportError::Compile(_)), "{err:?}");
}

#[test]
fn return_outside_function_reports_its_line() {
    let err = compile_error("x = 1\nreturn x\n");
    assert_eq!(err.message(), "'return' outside function");
    assert_eq!(err.line(), 2);
    assert_eq!(err.to_string(), "'return' outside function (<script>, line 2)");

    let ReportError::Compile(err) = invalid_report("return_outside.py") else {
        panic!("expected a compile error");
    };
    assert_eq!(err.line(), 2);
}

#[test]
fn loop_control_outside_loop() {
    assert_eq!(compile_error("break\n").message(), "'break' outside loop");
    let err = compile_error("if x:\n    pass\nelse:\n    continue\n");
    assert_eq!(err.kind(), CompileErrorKind::SyntaxError);
}

#[test]
fn match_statement_returns_not_implemented_error() {
    let err = compile_error("match x:\n    case 1:\n        pass\n");
    assert_eq!(err.kind(), CompileErrorKind::NotImplementedError);
    assert!(
        err.message().contains("'match' statement"),
        "message should mention 'match', got: {err}"
    );
    assert!(matches!(invalid_report("match_statement.py"), ReportError::Compile(_)));
}

#[test]
fn with_statement_compiles() {
    let code = compile("with open('f') as f:\n    pass\n", "<script>").unwrap();
    assert!(code.instructions().any(|i| i.opname == "BEFORE_WITH"));
}

#[test]
fn async_code_returns_not_implemented_error() {
    let err = compile_error("async def f():\n    pass\n");
    assert_eq!(err.kind(), CompileErrorKind::NotImplementedError);
}

#[test]
fn yield_outside_function() {
    let err = compile_error("yield 1\n");
    assert_eq!(err.message(), "'yield' outside function");
}

#[test]
fn import_star_inside_function() {
    let err = compile_error("def f():\n    from os import *\n");
    assert_eq!(err.kind(), CompileErrorKind::SyntaxError);
    assert_eq!(err.line(), 2);
}

#[test]
fn repeated_keyword_argument() {
    let err = compile_error("f(a=1, a=2)\n");
    assert_eq!(err.kind(), CompileErrorKind::SyntaxError);
}

#[test]
fn report_error_displays_the_compile_error() {
    let err = invalid_report("return_outside.py");
    assert_eq!(err.to_string(), "'return' outside function (<script>, line 2)");
}
