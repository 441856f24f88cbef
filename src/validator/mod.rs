//! Static allowlist validation of synthesized scene source. Refuses
//! anything outside the known-safe surface before it can reach the
//! renderer subprocess.

use std::collections::HashSet;
use std::sync::LazyLock;

use crate::spec::{ActionKind, ObjectKind, SceneKind};
use crate::synth::SCENE_CLASS;

pub const MAX_SOURCE_BYTES: usize = 20 * 1024;
pub const MAX_NESTING_DEPTH: usize = 8;
pub const MAX_LOOPS: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    Schema,
    BannedSymbol,
    Shape,
    TooLarge,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::BannedSymbol => "banned_symbol",
            Self::Shape => "shape",
            Self::TooLarge => "too_large",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{} at line {line}: {message} ({token:?})", .kind.as_str())]
pub struct Violation {
    pub kind: ViolationKind,
    pub token: String,
    pub line: usize,
    pub message: String,
}

impl Violation {
    fn new(kind: ViolationKind, token: &str, line: usize, message: impl Into<String>) -> Self {
        Self {
            kind,
            token: token.to_string(),
            line,
            message: message.into(),
        }
    }
}

/// Names that must never appear as identifiers, in any position.
static BANNED_NAMES: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    HashSet::from([
        "exec",
        "eval",
        "compile",
        "open",
        "input",
        "__import__",
        "getattr",
        "setattr",
        "delattr",
        "globals",
        "locals",
        "vars",
        "breakpoint",
        "os",
        "sys",
        "subprocess",
        "shutil",
        "socket",
        "pathlib",
        "importlib",
        "builtins",
        "requests",
        "urllib",
        "http",
        "ftplib",
        "pickle",
        "ctypes",
        "file",
    ])
});

/// Identifiers accepted in call position: the frozen vocabulary plus the
/// scene/mobject methods and numpy helpers the synthesizer emits.
static ALLOWED_CALLS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    let mut set: HashSet<&'static str> = HashSet::new();
    for token in ObjectKind::all_tokens() {
        set.insert(token);
    }
    for token in ActionKind::all_tokens() {
        set.insert(token);
    }
    for token in [
        "play",
        "wait",
        "move_to",
        "set_color",
        "set_stroke",
        "set_fill",
        "set_z_index",
        "scale",
        "set_camera_orientation",
        "array",
        "sin",
        "cos",
    ] {
        set.insert(token);
    }
    set
});

#[derive(Debug)]
struct Token {
    text: String,
    line: usize,
    is_call: bool,
    after_def: bool,
    after_class: bool,
}

/// Lexes identifiers out of the source, skipping string literals and
/// comments entirely so payload text is never mistaken for code.
fn lex_identifiers(source: &str) -> Result<Vec<Token>, Violation> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut line = 1usize;
    let mut i = 0usize;
    let mut prev_keyword: Option<String> = None;

    while i < chars.len() {
        let c = chars[i];
        if c == '\n' {
            line += 1;
            prev_keyword = None;
            i += 1;
            continue;
        }
        if c == '#' {
            while i < chars.len() && chars[i] != '\n' {
                i += 1;
            }
            continue;
        }
        if c == '"' || c == '\'' {
            let quote = c;
            let triple = i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote;
            i += if triple { 3 } else { 1 };
            loop {
                if i >= chars.len() {
                    return Err(Violation::new(
                        ViolationKind::Schema,
                        "\"",
                        line,
                        "unterminated string literal",
                    ));
                }
                let s = chars[i];
                if s == '\n' {
                    line += 1;
                    if !triple {
                        return Err(Violation::new(
                            ViolationKind::Schema,
                            "\"",
                            line,
                            "newline in string literal",
                        ));
                    }
                    i += 1;
                    continue;
                }
                if s == '\\' {
                    i += 2;
                    continue;
                }
                if s == quote {
                    if triple {
                        if i + 2 < chars.len() && chars[i + 1] == quote && chars[i + 2] == quote {
                            i += 3;
                            break;
                        }
                        i += 1;
                        continue;
                    }
                    i += 1;
                    break;
                }
                i += 1;
            }
            continue;
        }
        if c == '\\' {
            return Err(Violation::new(
                ViolationKind::BannedSymbol,
                "\\",
                line,
                "backslash outside string literal",
            ));
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().collect();
            let mut j = i;
            while j < chars.len() && (chars[j] == ' ' || chars[j] == '\t') {
                j += 1;
            }
            let is_call = j < chars.len() && chars[j] == '(';
            let after_def = prev_keyword.as_deref() == Some("def");
            let after_class = prev_keyword.as_deref() == Some("class");
            prev_keyword = Some(text.clone());
            tokens.push(Token {
                text,
                line,
                is_call,
                after_def,
                after_class,
            });
            continue;
        }
        i += 1;
    }
    Ok(tokens)
}

fn strip_strings_and_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut chars = line.chars().peekable();
    let mut in_string: Option<char> = None;
    while let Some(c) = chars.next() {
        match in_string {
            Some(quote) => {
                if c == '\\' {
                    chars.next();
                } else if c == quote {
                    in_string = None;
                }
            }
            None => {
                if c == '#' {
                    break;
                }
                if c == '"' || c == '\'' {
                    in_string = Some(c);
                } else {
                    out.push(c);
                }
            }
        }
    }
    out
}

/// Validate synthesized source against the requested scene kind.
pub fn validate_source(source: &str, scene_kind: SceneKind) -> Result<(), Violation> {
    if source.len() > MAX_SOURCE_BYTES {
        return Err(Violation::new(
            ViolationKind::TooLarge,
            "",
            1,
            format!("source is {} bytes, cap is {}", source.len(), MAX_SOURCE_BYTES),
        ));
    }

    let tokens = lex_identifiers(source)?;

    // Identifier-level rules.
    let mut loop_count = 0usize;
    for token in &tokens {
        let name = token.text.as_str();
        if name.starts_with("__") && name.ends_with("__") && name.len() > 4 {
            return Err(Violation::new(
                ViolationKind::BannedSymbol,
                name,
                token.line,
                "dunder name reference",
            ));
        }
        if BANNED_NAMES.contains(name) {
            return Err(Violation::new(
                ViolationKind::BannedSymbol,
                name,
                token.line,
                "banned name reference",
            ));
        }
        if name == "for" || name == "while" {
            loop_count += 1;
        }
        if token.is_call
            && !token.after_def
            && !token.after_class
            && !ALLOWED_CALLS.contains(name)
        {
            return Err(Violation::new(
                ViolationKind::BannedSymbol,
                name,
                token.line,
                "identifier not in the call allowlist",
            ));
        }
    }
    if loop_count > MAX_LOOPS {
        return Err(Violation::new(
            ViolationKind::Schema,
            "for",
            1,
            format!("{} loops exceed the cap of {}", loop_count, MAX_LOOPS),
        ));
    }

    // Line-level structural rules.
    let mut import_lines = Vec::new();
    let mut class_line: Option<String> = None;
    let mut construct_line: Option<String> = None;
    for (index, raw) in source.lines().enumerate() {
        let line_no = index + 1;
        let code = strip_strings_and_comments(raw);
        let trimmed = code.trim();
        if trimmed.is_empty() {
            continue;
        }

        let indent = code.len() - code.trim_start().len();
        let depth = indent / 4;
        if depth > MAX_NESTING_DEPTH {
            return Err(Violation::new(
                ViolationKind::Shape,
                trimmed,
                line_no,
                format!("nesting depth {} exceeds {}", depth, MAX_NESTING_DEPTH),
            ));
        }

        if trimmed.starts_with("import ") || trimmed.starts_with("from ") {
            if indent != 0 {
                return Err(Violation::new(
                    ViolationKind::Shape,
                    trimmed,
                    line_no,
                    "indented import",
                ));
            }
            import_lines.push(trimmed.to_string());
            continue;
        }
        if trimmed.starts_with("class ") {
            if class_line.is_some() {
                return Err(Violation::new(
                    ViolationKind::Shape,
                    trimmed,
                    line_no,
                    "more than one class declaration",
                ));
            }
            class_line = Some(trimmed.to_string());
            continue;
        }
        if trimmed.starts_with("def ") {
            if construct_line.is_some() {
                return Err(Violation::new(
                    ViolationKind::Shape,
                    trimmed,
                    line_no,
                    "more than one method declaration",
                ));
            }
            construct_line = Some(trimmed.to_string());
            continue;
        }
        if indent == 0 {
            return Err(Violation::new(
                ViolationKind::Shape,
                trimmed,
                line_no,
                "statement outside the scene class",
            ));
        }
    }

    if import_lines != ["from manim import *", "import numpy as np"] {
        return Err(Violation::new(
            ViolationKind::Shape,
            import_lines.first().map(String::as_str).unwrap_or(""),
            1,
            "imports must be exactly the animation library wildcard and the numeric helper",
        ));
    }

    let expected_class = format!("class {}({}):", SCENE_CLASS, scene_kind.scene_base());
    match &class_line {
        Some(line) if line == &expected_class => {}
        Some(line) => {
            return Err(Violation::new(
                ViolationKind::Shape,
                line,
                1,
                format!("scene class must be declared as {:?}", expected_class),
            ));
        }
        None => {
            return Err(Violation::new(
                ViolationKind::Shape,
                "",
                1,
                "missing scene class declaration",
            ));
        }
    }

    match &construct_line {
        Some(line) if line == "def construct(self):" => {}
        Some(line) => {
            return Err(Violation::new(
                ViolationKind::Shape,
                line,
                1,
                "scene body must be a construct(self) method with no extra parameters",
            ));
        }
        None => {
            return Err(Violation::new(
                ViolationKind::Shape,
                "",
                1,
                "missing construct method",
            ));
        }
    }

    Ok(())
}
