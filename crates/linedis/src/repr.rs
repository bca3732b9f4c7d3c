//! Python `repr` formatting for constant values.

use std::fmt::{self, Write};

/// Writes `value` the way Python's `repr(float)` does: shortest round-trip digits, scientific
/// notation when the decimal exponent is below -4 or at least 16, and a trailing `.0` for
/// integral values.
pub(crate) fn float_repr(f: &mut impl Write, value: f64) -> fmt::Result {
    write_float(f, value, true)
}

/// Writes an imaginary literal such as `2j` or `1.5e-07j`.
pub(crate) fn complex_repr(f: &mut impl Write, imag: f64) -> fmt::Result {
    write_float(f, imag, false)?;
    f.write_char('j')
}

fn write_float(f: &mut impl Write, value: f64, add_dot_0: bool) -> fmt::Result {
    if value.is_nan() {
        return f.write_str("nan");
    }
    if value.is_infinite() {
        return f.write_str(if value.is_sign_negative() { "-inf" } else { "inf" });
    }
    let scientific = format!("{value:e}");
    let (mantissa, exponent) = scientific.split_once('e').unwrap_or((&scientific, "0"));
    let exponent: i32 = exponent.parse().unwrap_or(0);
    if value != 0.0 && !(-4..16).contains(&exponent) {
        let sign = if exponent < 0 { '-' } else { '+' };
        return write!(f, "{mantissa}e{sign}{:02}", exponent.unsigned_abs());
    }
    let plain = value.to_string();
    f.write_str(&plain)?;
    if add_dot_0 && !plain.contains('.') {
        f.write_str(".0")?;
    }
    Ok(())
}

/// Writes `s` as a Python string literal, choosing quotes like `repr(str)` does.
pub(crate) fn str_repr(f: &mut impl Write, s: &str) -> fmt::Result {
    let quote = pick_quote(s.contains('\''), s.contains('"'));
    f.write_char(quote)?;
    for c in s.chars() {
        match c {
            '\\' => f.write_str("\\\\")?,
            '\n' => f.write_str("\\n")?,
            '\r' => f.write_str("\\r")?,
            '\t' => f.write_str("\\t")?,
            c if c == quote => write!(f, "\\{c}")?,
            c if is_printable(c) => f.write_char(c)?,
            c => match u32::from(c) {
                code @ 0..=0xff => write!(f, "\\x{code:02x}")?,
                code @ 0x100..=0xffff => write!(f, "\\u{code:04x}")?,
                code => write!(f, "\\U{code:08x}")?,
            },
        }
    }
    f.write_char(quote)
}

/// Writes `bytes` as a Python bytes literal, like `repr(bytes)`.
pub(crate) fn bytes_repr(f: &mut impl Write, bytes: &[u8]) -> fmt::Result {
    let quote = pick_quote(bytes.contains(&b'\''), bytes.contains(&b'"'));
    f.write_char('b')?;
    f.write_char(quote)?;
    for &b in bytes {
        match b {
            b'\\' => f.write_str("\\\\")?,
            b'\n' => f.write_str("\\n")?,
            b'\r' => f.write_str("\\r")?,
            b'\t' => f.write_str("\\t")?,
            b if char::from(b) == quote => write!(f, "\\{quote}")?,
            0x20..0x7f => f.write_char(char::from(b))?,
            b => write!(f, "\\x{b:02x}")?,
        }
    }
    f.write_char(quote)
}

/// Single quotes unless the text contains a single quote and no double quote.
fn pick_quote(has_single: bool, has_double: bool) -> char {
    if has_single && !has_double { '"' } else { '\'' }
}

/// Approximates `str.isprintable()`: control characters and whitespace other than the
/// ASCII space are escaped.
fn is_printable(c: char) -> bool {
    c == ' ' || !(c.is_control() || c.is_whitespace() || matches!(c, '\u{ad}' | '\u{200b}'..='\u{200f}' | '\u{feff}'))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(write: impl FnOnce(&mut String) -> fmt::Result) -> String {
        let mut out = String::new();
        write(&mut out).unwrap();
        out
    }

    #[test]
    fn floats_match_python() {
        let cases = [
            (1.0, "1.0"),
            (0.5, "0.5"),
            (-0.0, "-0.0"),
            (1e16, "1e+16"),
            (1.5e16, "1.5e+16"),
            (1e15, "1000000000000000.0"),
            (0.0001, "0.0001"),
            (1e-5, "1e-05"),
            (1.25e-10, "1.25e-10"),
            (0.1 + 0.2, "0.30000000000000004"),
            (f64::INFINITY, "inf"),
            (f64::NAN, "nan"),
        ];
        for (value, expected) in cases {
            assert_eq!(render(|s| float_repr(s, value)), expected, "repr of {value:?}");
        }
    }

    #[test]
    fn imaginary_numbers_have_no_trailing_dot_zero() {
        assert_eq!(render(|s| complex_repr(s, 2.0)), "2j");
        assert_eq!(render(|s| complex_repr(s, 1.5)), "1.5j");
        assert_eq!(render(|s| complex_repr(s, 1e20)), "1e+20j");
    }

    #[test]
    fn strings_choose_quotes_like_python() {
        assert_eq!(render(|s| str_repr(s, "a")), "'a'");
        assert_eq!(render(|s| str_repr(s, "it's")), "\"it's\"");
        assert_eq!(render(|s| str_repr(s, "both ' and \"")), "'both \\' and \"'");
        assert_eq!(render(|s| str_repr(s, "tab\there\n")), "'tab\\there\\n'");
        assert_eq!(render(|s| str_repr(s, "\u{0}é\u{2028}")), "'\\x00é\\u2028'");
    }

    #[test]
    fn bytes_escape_non_ascii() {
        assert_eq!(render(|s| bytes_repr(s, b"\x00")), "b'\\x00'");
        assert_eq!(render(|s| bytes_repr(s, b"abc\xff")), "b'abc\\xff'");
        assert_eq!(render(|s| bytes_repr(s, b"it's")), "b\"it's\"");
    }
}
