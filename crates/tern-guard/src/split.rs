//! Shell command-line splitting into independently checkable fragments.

use crate::error::SplitError;

/// Placeholder left in an outer fragment where a `$(...)` or backtick span was lifted out.
pub const SUBSHELL_MARKER: &str = "__SUBSHELL__";

/// Splits a command line on `&&`, `||`, `;`, `|`, `&`, and newlines outside quotes.
///
/// A lone `&` backgrounds the command before it, so it separates fragments too.
/// The redirection forms `&>`, `>&` and `2>&1` are kept inside their fragment.
///
/// Subshell spans are replaced by [`SUBSHELL_MARKER`] in the enclosing fragment
/// and their inner text is split recursively. Top-level fragments come first,
/// followed by subshell fragments in order of appearance. Empty fragments are
/// discarded.
pub fn split_command(command: &str) -> Result<Vec<String>, SplitError> {
    let mut fragments = Vec::new();
    split_into(command, &mut fragments)?;
    Ok(fragments)
}

fn split_into(command: &str, out: &mut Vec<String>) -> Result<(), SplitError> {
    let (flattened, subshells) = extract_subshells(command)?;
    out.extend(split_top_level(&flattened)?);
    for inner in subshells {
        split_into(&inner, out)?;
    }
    Ok(())
}

fn extract_subshells(command: &str) -> Result<(String, Vec<String>), SplitError> {
    let chars = command.chars().collect::<Vec<_>>();
    let mut flattened = String::with_capacity(command.len());
    let mut subshells = Vec::new();
    let mut quote: Option<char> = None;
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        if quote == Some('\'') {
            flattened.push(ch);
            if ch == '\'' {
                quote = None;
            }
            index += 1;
            continue;
        }
        if ch == '\\' {
            flattened.push(ch);
            if let Some(next) = chars.get(index + 1) {
                flattened.push(*next);
            }
            index += 2;
            continue;
        }
        if ch == '$' && chars.get(index + 1) == Some(&'(') {
            let end = find_subshell_end(&chars, index + 2)?;
            subshells.push(chars[index + 2..end].iter().collect());
            flattened.push_str(SUBSHELL_MARKER);
            index = end + 1;
            continue;
        }
        if ch == '`' {
            let end = find_backtick_end(&chars, index + 1)?;
            subshells.push(chars[index + 1..end].iter().collect());
            flattened.push_str(SUBSHELL_MARKER);
            index = end + 1;
            continue;
        }
        match (quote, ch) {
            (None, '\'') => quote = Some('\''),
            (None, '"') => quote = Some('"'),
            (Some('"'), '"') => quote = None,
            _ => {}
        }
        flattened.push(ch);
        index += 1;
    }

    if let Some(quote) = quote {
        return Err(SplitError::UnterminatedQuote { quote });
    }
    Ok((flattened, subshells))
}

/// Index of the `)` closing a `$(` whose body starts at `start`.
fn find_subshell_end(chars: &[char], start: usize) -> Result<usize, SplitError> {
    let mut depth = 1_usize;
    let mut quote: Option<char> = None;
    let mut index = start;
    while index < chars.len() {
        let ch = chars[index];
        match quote {
            Some('\'') => {
                if ch == '\'' {
                    quote = None;
                }
            }
            _ if ch == '\\' => {
                index += 1;
            }
            Some(open) => {
                if ch == open {
                    quote = None;
                }
            }
            None => match ch {
                '\'' | '"' => quote = Some(ch),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth == 0 {
                        return Ok(index);
                    }
                }
                _ => {}
            },
        }
        index += 1;
    }
    Err(SplitError::UnterminatedSubshell)
}

fn find_backtick_end(chars: &[char], start: usize) -> Result<usize, SplitError> {
    let mut index = start;
    while index < chars.len() {
        match chars[index] {
            '\\' => index += 2,
            '`' => return Ok(index),
            _ => index += 1,
        }
    }
    Err(SplitError::UnterminatedSubshell)
}

fn split_top_level(command: &str) -> Result<Vec<String>, SplitError> {
    let chars = command.chars().collect::<Vec<_>>();
    let mut fragments = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut index = 0;

    while index < chars.len() {
        let ch = chars[index];
        let next = chars.get(index + 1).copied();
        if let Some(open) = quote {
            if ch == '\\' && open == '"' {
                current.push(ch);
                if let Some(next) = next {
                    current.push(next);
                }
                index += 2;
                continue;
            }
            if ch == open {
                quote = None;
            }
            current.push(ch);
            index += 1;
            continue;
        }

        let previous = index.checked_sub(1).map(|at| chars[at]);
        let separator_len = match (ch, next) {
            ('&', Some('&')) | ('|', Some('|')) => 2,
            ('&', Some('>')) => 0,
            ('&', _) if previous == Some('>') => 0,
            ('|', _) | (';', _) | ('&', _) | ('\n', _) => 1,
            _ => 0,
        };
        if separator_len > 0 {
            push_fragment(&mut fragments, &mut current);
            index += separator_len;
            continue;
        }

        match ch {
            '\\' => {
                current.push(ch);
                if let Some(next) = next {
                    current.push(next);
                }
                index += 2;
                continue;
            }
            '\'' | '"' => quote = Some(ch),
            _ => {}
        }
        current.push(ch);
        index += 1;
    }

    if let Some(quote) = quote {
        return Err(SplitError::UnterminatedQuote { quote });
    }
    push_fragment(&mut fragments, &mut current);
    Ok(fragments)
}

fn push_fragment(fragments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        fragments.push(trimmed.to_string());
    }
    current.clear();
}
