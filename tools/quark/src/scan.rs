//! Lightweight preprocessor scan of C/C++ sources.
//!
//! quark does not run the preprocessor. It strips comments and continued
//! lines, then reads the directives it cares about (`#include`, `#import`)
//! and looks for a program entry point. Conditional directives are
//! recognized but not evaluated, so an include guarded by `#if 0` still counts
//! as a dependency.

/// How an include name was delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncludeStyle {
    /// `#include "name"`: searched in the including file's directory first.
    Quoted,
    /// `#include <name>`: searched in source directories only.
    Angled,
}

/// An include directive as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective {
    pub name: String,
    pub style: IncludeStyle,
}

/// What a scan of one file yields.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    pub includes: Vec<IncludeDirective>,
    /// Number of `#if`/`#ifdef`/`#ifndef`/`#elif`/`#else`/`#endif` lines seen.
    pub conditionals: usize,
    pub has_entry_point: bool,
}

const ENTRY_POINTS: &[&str] = &["main", "wmain", "WinMain", "wWinMain"];

/// Tokens that may directly precede an entry-point name in its definition.
const ENTRY_RETURN_TYPES: &[&str] = &["int", "void", "auto", "WINAPI", "APIENTRY", "CALLBACK"];

const CONDITIONALS: &[&str] = &["if", "ifdef", "ifndef", "elif", "elifdef", "elifndef", "else", "endif"];

/// Scan source text.
pub fn scan(text: &str) -> ScanResult {
    let cleaned = strip_comments(&join_continuations(text));
    let mut result = ScanResult::default();
    let mut code = String::with_capacity(cleaned.len());

    for line in cleaned.lines() {
        let trimmed = line.trim_start();
        let Some(directive) = trimmed.strip_prefix('#') else {
            code.push_str(line);
            code.push('\n');
            continue;
        };
        let directive = directive.trim_start();
        let name_len = directive
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(directive.len());
        let (name, rest) = directive.split_at(name_len);
        match name {
            "include" | "import" | "include_next" => {
                if let Some(include) = parse_include_operand(rest.trim_start()) {
                    result.includes.push(include);
                }
            }
            n if CONDITIONALS.contains(&n) => result.conditionals += 1,
            _ => {}
        }
    }

    result.has_entry_point = defines_entry_point(&code);
    result
}

/// Whether `text` contains `token` outside comments.
pub fn contains_token(text: &str, token: &str) -> bool {
    strip_comments(&join_continuations(text)).contains(token)
}

fn parse_include_operand(operand: &str) -> Option<IncludeDirective> {
    let (style, close) = match operand.chars().next()? {
        '"' => (IncludeStyle::Quoted, '"'),
        '<' => (IncludeStyle::Angled, '>'),
        // Computed includes (`#include MACRO`) cannot be followed.
        _ => return None,
    };
    let body = &operand[1..];
    let end = body.find(close)?;
    let name = body[..end].trim();
    if name.is_empty() {
        return None;
    }
    Some(IncludeDirective {
        name: name.to_string(),
        style,
    })
}

/// Join backslash-newline continuations.
fn join_continuations(text: &str) -> String {
    text.replace("\\\r\n", "").replace("\\\n", "")
}

/// Remove `//` and `/* */` comments, leaving string and character literals
/// intact. Newlines inside block comments are kept so line structure
/// survives.
fn strip_comments(text: &str) -> String {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Code,
        LineComment,
        BlockComment,
        Literal(char),
    }

    let mut out = String::with_capacity(text.len());
    let mut state = State::Code;
    let mut chars = text.chars().peekable();

    while let Some(ch) = chars.next() {
        match state {
            State::Code => match ch {
                '/' if chars.peek() == Some(&'/') => {
                    chars.next();
                    state = State::LineComment;
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    out.push(' ');
                    state = State::BlockComment;
                }
                '"' | '\'' => {
                    out.push(ch);
                    state = State::Literal(ch);
                }
                _ => out.push(ch),
            },
            State::LineComment => {
                if ch == '\n' {
                    out.push('\n');
                    state = State::Code;
                }
            }
            State::BlockComment => {
                if ch == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    state = State::Code;
                } else if ch == '\n' {
                    out.push('\n');
                }
            }
            State::Literal(quote) => {
                out.push(ch);
                if ch == '\\' {
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                } else if ch == quote || ch == '\n' {
                    state = State::Code;
                }
            }
        }
    }
    out
}

/// Token-level search for `<return type> main (`.
fn defines_entry_point(code: &str) -> bool {
    let tokens = tokenize(code);
    tokens.windows(3).any(|w| {
        ENTRY_RETURN_TYPES.contains(&w[0]) && ENTRY_POINTS.contains(&w[1]) && w[2] == "("
    })
}

/// Split code into identifiers and single-character punctuation.
fn tokenize(code: &str) -> Vec<&str> {
    let mut tokens = Vec::new();
    let bytes = code.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
        } else if b.is_ascii_alphabetic() || b == b'_' {
            let start = i;
            while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                i += 1;
            }
            tokens.push(&code[start..i]);
        } else if b.is_ascii() {
            tokens.push(&code[i..=i]);
            i += 1;
        } else {
            // Skip the whole multi-byte character.
            i += 1;
            while i < bytes.len() && !code.is_char_boundary(i) {
                i += 1;
            }
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(result: &ScanResult) -> Vec<&str> {
        result.includes.iter().map(|i| i.name.as_str()).collect()
    }

    #[test]
    fn quoted_and_angled_includes() {
        let result = scan("#include \"util.h\"\n#  include <vector>\n#import \"objc.h\"\n");
        assert_eq!(names(&result), ["util.h", "vector", "objc.h"]);
        assert_eq!(result.includes[0].style, IncludeStyle::Quoted);
        assert_eq!(result.includes[1].style, IncludeStyle::Angled);
    }

    #[test]
    fn commented_includes_are_ignored() {
        let result = scan(
            "// #include \"a.h\"\n/* #include \"b.h\"\n#include \"c.h\" */\n#include \"d.h\" // trailing\n",
        );
        assert_eq!(names(&result), ["d.h"]);
    }

    #[test]
    fn conditional_includes_still_count() {
        let result = scan("#if 0\n#include \"never.h\"\n#else\n#include \"always.h\"\n#endif\n");
        assert_eq!(names(&result), ["never.h", "always.h"]);
        assert_eq!(result.conditionals, 3);
    }

    #[test]
    fn continued_directive_lines_are_joined() {
        let result = scan("#include \\\n  \"split.h\"\n");
        assert_eq!(names(&result), ["split.h"]);
    }

    #[test]
    fn string_literal_does_not_open_comment() {
        let result = scan("const char* s = \"/*\";\n#include \"after.h\"\n");
        assert_eq!(names(&result), ["after.h"]);
    }

    #[test]
    fn computed_include_is_skipped() {
        let result = scan("#include HEADER_NAME\n");
        assert!(result.includes.is_empty());
    }

    #[test]
    fn detects_main() {
        assert!(scan("int main(int argc, char** argv) { return 0; }\n").has_entry_point);
        assert!(scan("int\nmain (void)\n{\n}\n").has_entry_point);
        assert!(scan("int WINAPI WinMain(HINSTANCE a, HINSTANCE b, LPSTR c, int d) {}\n").has_entry_point);
    }

    #[test]
    fn main_in_comment_or_call_is_not_an_entry_point() {
        assert!(!scan("// int main() {}\n").has_entry_point);
        assert!(!scan("/* int main() */ void helper();\n").has_entry_point);
        assert!(!scan("int x = main(1);\n").has_entry_point);
        assert!(!scan("int domain(int);\n").has_entry_point);
    }

    #[test]
    fn token_search_skips_comments() {
        assert!(contains_token("class W { Q_OBJECT };", "Q_OBJECT"));
        assert!(!contains_token("// Q_OBJECT\nclass W {};", "Q_OBJECT"));
    }
}
