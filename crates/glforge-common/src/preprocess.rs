//! GLSL source preprocessing applied before a compile call.
//!
//! Three transforms, in order:
//! - the `#version` / `#extension` prologue is split off so injected lines
//!   land after it (GLSL requires `#version` to be the first directive),
//! - C++-style `#line N "file"` directives are rewritten to plain numeric
//!   `#line N` for drivers without GL_GOOGLE_cpp_style_line_directive,
//! - specialization constants are injected as `#define`s.
//!
//! Pure text transform; no driver calls. Runs on a worker thread in pool
//! mode and on the driving thread otherwise.

use crate::program::SpecializationConstant;

/// Preprocess one stage's source, folding in the given constants.
pub fn preprocess_source(source: &str, constants: &[SpecializationConstant]) -> String {
    let (prologue, body) = split_prologue(source);

    let mut out = String::with_capacity(source.len() + constants.len() * 32);
    out.push_str(prologue);
    for constant in constants {
        out.push_str("#define ");
        out.push_str(&constant.name);
        out.push(' ');
        out.push_str(&constant.value.to_string());
        out.push('\n');
    }
    for line in body.lines() {
        out.push_str(&rewrite_line_directive(line));
        out.push('\n');
    }
    out
}

/// Split the `#version` / `#extension` prologue from the body. Returns an
/// empty prologue when the source has none, so injected lines are prepended.
fn split_prologue(source: &str) -> (&str, &str) {
    let mut split = 0usize;
    for line in source.lines() {
        let trimmed = line.trim_start();
        let is_prologue = trimmed.starts_with("#version")
            || trimmed.starts_with("#extension")
            || (split > 0 && trimmed.is_empty());
        if !is_prologue {
            break;
        }
        // lines() strips the terminator, account for it manually
        split += line.len();
        if source[split..].starts_with("\r\n") {
            split += 2;
        } else if source[split..].starts_with('\n') {
            split += 1;
        }
    }
    source.split_at(split)
}

/// Rewrite `#line N "file"` to `#line N`; other lines pass through.
fn rewrite_line_directive(line: &str) -> std::borrow::Cow<'_, str> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with("#line") {
        return std::borrow::Cow::Borrowed(line);
    }
    let rest = trimmed["#line".len()..].trim_start();
    let digits: &str = rest
        .split(|c: char| !c.is_ascii_digit())
        .next()
        .unwrap_or("");
    if digits.is_empty() || !rest[digits.len()..].trim_start().starts_with('"') {
        // no quoted filename, nothing to rewrite
        return std::borrow::Cow::Borrowed(line);
    }
    std::borrow::Cow::Owned(format!("#line {}", digits))
}
