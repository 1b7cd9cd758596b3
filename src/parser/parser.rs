//! Parser
//!
//! Turns a script string into a sequence of `ParsedCommand`s (spec.md
//! §4.1). Three public entry points, matching the spec's own naming:
//! `remove_comments`, `normalize_keywords`, `parse_command_sequence`.

use indexmap::IndexMap;

use super::lexer::{is_word_boundary_match, scan_balanced, skip_quoted};
use super::types::{ParsedCommand, Position, RawArg, Separator, MAX_INPUT_SIZE, MAX_PARSER_DEPTH};
use crate::errors::ParseError;

/// Strip `#...\n` line comments and `#( ... )#` block comments, leaving
/// quoted occurrences of `#` untouched. Newlines inside a stripped block
/// comment are preserved so downstream line numbers stay meaningful.
pub fn remove_comments(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                let end = skip_quoted(&chars, i, '"');
                out.extend(&chars[i..end]);
                i = end;
            }
            '\'' => {
                let end = skip_quoted(&chars, i, '\'');
                out.extend(&chars[i..end]);
                i = end;
            }
            '#' if chars.get(i + 1) == Some(&'(') => {
                let mut j = i + 2;
                let mut depth = 1i32;
                while j < chars.len() {
                    if chars[j] == '#' && chars.get(j + 1) == Some(&'(') {
                        depth += 1;
                        j += 2;
                        continue;
                    }
                    if chars[j] == ')' && chars.get(j + 1) == Some(&'#') {
                        depth -= 1;
                        j += 2;
                        if depth == 0 {
                            break;
                        }
                        continue;
                    }
                    if chars[j] == '\n' {
                        out.push('\n');
                    }
                    j += 1;
                }
                i = j;
            }
            '#' => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

/// Replace bare `then`/`else` keywords with `&`/`|` outside strings and
/// `(...)`/`{...}` groups (those are re-normalized when the parser later
/// recurses into them as their own command sequences).
pub fn normalize_keywords(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                let end = skip_quoted(&chars, i, '"');
                out.extend(&chars[i..end]);
                i = end;
            }
            '\'' => {
                let end = skip_quoted(&chars, i, '\'');
                out.extend(&chars[i..end]);
                i = end;
            }
            '(' => {
                let end = scan_balanced(&chars, i, '(', ')');
                out.extend(&chars[i..end]);
                i = end;
            }
            '{' => {
                let end = scan_balanced(&chars, i, '{', '}');
                out.extend(&chars[i..end]);
                i = end;
            }
            _ if is_word_boundary_match(&chars, i, "then") => {
                out.push('&');
                i += 4;
            }
            _ if is_word_boundary_match(&chars, i, "else") => {
                out.push('|');
                i += 4;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn context_snippet(chars: &[char], around_line: usize, context_lines: usize) -> String {
    let text: String = chars.iter().collect();
    let lines: Vec<&str> = text.lines().collect();
    if lines.is_empty() {
        return String::new();
    }
    let lo = around_line.saturating_sub(context_lines + 1);
    let hi = (around_line + context_lines).min(lines.len());
    lines[lo..hi].join("\n")
}

/// Split a preprocessed script into top-level segments on `;`/`&`/`|`,
/// pairing each with the separator that preceded it.
fn split_top_level_statements(chars: &[char]) -> Vec<(Separator, usize, usize)> {
    let mut out = Vec::new();
    let mut seg_start = 0usize;
    let mut sep = Separator::None;
    let mut i = 0usize;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                i = skip_quoted(chars, i, '"');
                continue;
            }
            '\'' => {
                i = skip_quoted(chars, i, '\'');
                continue;
            }
            '(' => {
                i = scan_balanced(chars, i, '(', ')');
                continue;
            }
            '{' => {
                i = scan_balanced(chars, i, '{', '}');
                continue;
            }
            ';' | '\n' => {
                out.push((sep, seg_start, i));
                sep = Separator::Sequence;
                i += 1;
                seg_start = i;
            }
            '&' => {
                out.push((sep, seg_start, i));
                sep = Separator::Then;
                i += 1;
                seg_start = i;
            }
            '|' => {
                out.push((sep, seg_start, i));
                sep = Separator::Else;
                i += 1;
                seg_start = i;
            }
            _ => i += 1,
        }
    }
    out.push((sep, seg_start, chars.len()));
    out
}

/// Split one command's argument list on top-level commas.
fn split_top_level_args(chars: &[char]) -> Vec<(usize, usize)> {
    let mut out = Vec::new();
    if chars.is_empty() {
        return out;
    }
    let mut start = 0usize;
    let mut i = 0usize;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                i = skip_quoted(chars, i, '"');
                continue;
            }
            '\'' => {
                i = skip_quoted(chars, i, '\'');
                continue;
            }
            '(' => {
                i = scan_balanced(chars, i, '(', ')');
                continue;
            }
            '{' => {
                i = scan_balanced(chars, i, '{', '}');
                continue;
            }
            ',' => {
                out.push((start, i));
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    out.push((start, chars.len()));
    out
}

fn trim_span(chars: &[char], start: usize, end: usize) -> (usize, usize) {
    let mut s = start;
    let mut e = end;
    while s < e && chars[s].is_whitespace() {
        s += 1;
    }
    while e > s && chars[e - 1].is_whitespace() {
        e -= 1;
    }
    (s, e)
}

fn parse_arg_value(chars: &[char], start: usize, end: usize) -> RawArg {
    let (s, e) = trim_span(chars, start, end);
    if s >= e {
        return RawArg::Bare(String::new());
    }
    if chars[s] == '"' {
        let close = skip_quoted(chars, s, '"');
        if close >= e {
            return RawArg::Double(chars[s + 1..(close - 1).max(s + 1)].iter().collect());
        }
    }
    if chars[s] == '\'' {
        let close = skip_quoted(chars, s, '\'');
        if close >= e {
            return RawArg::Single(chars[s + 1..(close - 1).max(s + 1)].iter().collect());
        }
    }
    if chars[s] == '(' {
        let close = scan_balanced(chars, s, '(', ')');
        if close >= e {
            return RawArg::Paren(chars[s + 1..(close - 1).max(s + 1)].iter().collect());
        }
    }
    RawArg::Bare(chars[s..e].iter().collect())
}

/// A leading `name:` on an argument slot (colon at top level, identifier
/// before it) marks a named argument.
fn split_named_arg(chars: &[char], start: usize, end: usize) -> Option<(String, usize, usize)> {
    let (s, e) = trim_span(chars, start, end);
    let mut i = s;
    if i >= e || !(chars[i].is_alphabetic() || chars[i] == '_') {
        return None;
    }
    let name_start = i;
    while i < e && (chars[i].is_alphanumeric() || chars[i] == '_') {
        i += 1;
    }
    let name_end = i;
    let mut j = i;
    while j < e && chars[j].is_whitespace() {
        j += 1;
    }
    if j >= e || chars[j] != ':' {
        return None;
    }
    let name: String = chars[name_start..name_end].iter().collect();
    Some((name, j + 1, e))
}

/// Parse a full command sequence, applying `remove_comments` and
/// `normalize_keywords` first.
pub fn parse_command_sequence(text: &str) -> Result<Vec<ParsedCommand>, ParseError> {
    if text.len() > MAX_INPUT_SIZE {
        return Err(ParseError::new("input too large", Position::start(), String::new()));
    }
    let preprocessed = normalize_keywords(&remove_comments(text));
    let chars: Vec<char> = preprocessed.chars().collect();

    let mut depth: i32 = 0;
    let mut max_depth: i32 = 0;
    for &c in &chars {
        match c {
            '(' | '{' => {
                depth += 1;
                max_depth = max_depth.max(depth);
            }
            ')' | '}' => depth -= 1,
            _ => {}
        }
    }
    if max_depth as usize > MAX_PARSER_DEPTH {
        return Err(ParseError::new("max nesting depth exceeded", Position::start(), String::new()));
    }
    if depth != 0 {
        let (line, _) = super::lexer::position_at(&chars, chars.len().saturating_sub(1));
        return Err(ParseError::new(
            "unterminated group",
            Position { line, column: 1 },
            context_snippet(&chars, line, 2),
        ));
    }

    let statements = split_top_level_statements(&chars);
    let mut commands = Vec::new();

    for (sep, seg_start, seg_end) in statements {
        let (s, e) = trim_span(&chars, seg_start, seg_end);
        if s >= e {
            continue;
        }

        let (line, column) = super::lexer::position_at(&chars, s);
        let position = Position { line, column };

        let mut name_end = s;
        while name_end < e && !chars[name_end].is_whitespace() {
            name_end += 1;
        }
        let command: String = chars[s..name_end].iter().collect();
        if command.is_empty() {
            continue;
        }

        let (arg_start, _) = trim_span(&chars, name_end, e);

        let mut args = Vec::new();
        let mut named_args = IndexMap::new();
        if arg_start < e {
            for (a_start, a_end) in split_top_level_args(&chars[arg_start..e]) {
                let abs_start = arg_start + a_start;
                let abs_end = arg_start + a_end;
                let (ts, te) = trim_span(&chars, abs_start, abs_end);
                if ts >= te {
                    continue;
                }
                if let Some((name, vs, ve)) = split_named_arg(&chars, ts, te) {
                    named_args.insert(name, parse_arg_value(&chars, vs, ve));
                } else {
                    args.push(parse_arg_value(&chars, ts, te));
                }
            }
        }

        commands.push(ParsedCommand { command, args, named_args, separator: sep, position });
    }

    Ok(commands)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_sequence_operators() {
        let cmds = parse_command_sequence("echo 1; echo 2 & echo 3 | echo 4").unwrap();
        assert_eq!(cmds.len(), 4);
        assert_eq!(cmds[0].separator, Separator::None);
        assert_eq!(cmds[1].separator, Separator::Sequence);
        assert_eq!(cmds[2].separator, Separator::Then);
        assert_eq!(cmds[3].separator, Separator::Else);
    }

    #[test]
    fn then_else_normalize_outside_groups() {
        let cmds = parse_command_sequence("echo 1 then echo 2 else echo 3").unwrap();
        assert_eq!(cmds.len(), 3);
        assert_eq!(cmds[1].separator, Separator::Then);
        assert_eq!(cmds[2].separator, Separator::Else);
    }

    #[test]
    fn splits_named_and_positional_args() {
        let cmds = parse_command_sequence("cmd 1, 2, name: value").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(cmds[0].args.len(), 2);
        assert_eq!(cmds[0].named_args.get("name").unwrap().source_text(), "value");
    }

    #[test]
    fn line_comments_stripped_outside_quotes() {
        let cmds = parse_command_sequence("echo 1 # a comment\necho 2").unwrap();
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn block_comments_stripped() {
        let cmds = parse_command_sequence("echo 1 #( skip\nthis )# ; echo 2").unwrap();
        assert_eq!(cmds.len(), 2);
    }

    #[test]
    fn quoted_hash_is_not_a_comment() {
        let cmds = parse_command_sequence("echo \"a # b\"").unwrap();
        assert_eq!(cmds[0].args[0], RawArg::Double("a # b".to_string()));
    }

    #[test]
    fn nested_parens_and_braces_stay_intact() {
        let cmds = parse_command_sequence("echo {add 1, (2)}").unwrap();
        assert_eq!(cmds[0].args.len(), 1);
        assert_eq!(cmds[0].args[0].source_text(), "{add 1, (2)}");
    }

    #[test]
    fn positions_are_one_based() {
        let cmds = parse_command_sequence("echo a\necho b").unwrap();
        assert_eq!(cmds[0].position, Position { line: 1, column: 1 });
        assert_eq!(cmds[1].position, Position { line: 2, column: 1 });
    }
}
