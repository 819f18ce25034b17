//! Shared token grammar: space-separated program arguments (spec §4.2) and
//! comma-separated engine extra tokens (spec §4.3) use the same escaping
//! rule, differing only in separator.

/// Split `input` on unescaped occurrences of `sep`. `\` escapes the next
/// character literally (so `\<sep>` is a literal separator inside a token
/// and `\\` is a literal backslash). An empty `input` yields zero tokens.
pub fn tokenize(input: &str, sep: char) -> Vec<String> {
    if input.is_empty() {
        return Vec::new();
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                current.push(next);
            }
            continue;
        }
        if c == sep {
            tokens.push(std::mem::take(&mut current));
            continue;
        }
        current.push(c);
    }
    tokens.push(current);
    tokens
}

/// A length-bounded tokenizer for engine extra-argument strings (spec §4.3:
/// "The token list is length-bounded; overflow is reported").
pub fn tokenize_bounded(input: &str, sep: char, max_tokens: usize) -> Result<Vec<String>, usize> {
    let tokens = tokenize(input, sep);
    if tokens.len() > max_tokens {
        Err(tokens.len())
    } else {
        Ok(tokens)
    }
}

/// Parse the program-arguments string (spec §4.2): the first token is a
/// class/entry-point identifier, the rest become its arguments. `None` for
/// an empty string ("the restored process continues at its original entry
/// point", spec §8 boundary case).
pub fn parse_program_args(input: &str) -> Option<(String, Vec<String>)> {
    let mut tokens = tokenize(input, ' ');
    if tokens.is_empty() {
        return None;
    }
    let entry_point = tokens.remove(0);
    Some((entry_point, tokens))
}
