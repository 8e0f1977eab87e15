//! Shell-style line tokenizer for the prompt: single quotes are literal,
//! double quotes allow `\"` and `\\`, a bare backslash escapes the next
//! character, and an unquoted `#` at a word boundary starts a comment.

use anyhow::{bail, Result};

pub fn tokenize(line: &str) -> Result<Vec<String>> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                current.push(c);
            }
            continue;
        }
        if in_double {
            match c {
                '"' => in_double = false,
                '\\' => match chars.next() {
                    Some(next @ ('"' | '\\')) => current.push(next),
                    Some(next) => {
                        current.push('\\');
                        current.push(next);
                    }
                    None => bail!("trailing backslash"),
                },
                _ => current.push(c),
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                started = true;
            }
            '"' => {
                in_double = true;
                started = true;
            }
            '\\' => match chars.next() {
                Some(next) => {
                    current.push(next);
                    started = true;
                }
                None => bail!("trailing backslash"),
            },
            '#' if !started => break,
            c if c.is_whitespace() => {
                if started {
                    tokens.push(std::mem::take(&mut current));
                    started = false;
                }
            }
            _ => {
                current.push(c);
                started = true;
            }
        }
    }
    if in_single || in_double {
        bail!("unterminated quote");
    }
    if started {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_basic() {
        assert_eq!(
            tokenize("add /a /b").unwrap(),
            vec!["add".to_string(), "/a".into(), "/b".into()]
        );
        assert_eq!(tokenize("   ").unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_tokenize_quotes() {
        assert_eq!(
            tokenize("add '/my dir' \"/an other\"").unwrap(),
            vec!["add".to_string(), "/my dir".into(), "/an other".into()]
        );
        // Empty quotes still produce a token.
        assert_eq!(tokenize("''").unwrap(), vec![String::new()]);
        // Escapes inside double quotes.
        assert_eq!(tokenize(r#""a\"b\\c""#).unwrap(), vec![r#"a"b\c"#.to_string()]);
        // Single quotes are fully literal.
        assert_eq!(tokenize(r"'a\b'").unwrap(), vec![r"a\b".to_string()]);
    }

    #[test]
    fn test_tokenize_escapes() {
        assert_eq!(
            tokenize(r"add /a\ b").unwrap(),
            vec!["add".to_string(), "/a b".into()]
        );
        assert!(tokenize(r"add \").is_err());
    }

    #[test]
    fn test_tokenize_comments() {
        assert_eq!(tokenize("list # everything").unwrap(), vec!["list".to_string()]);
        assert_eq!(tokenize("# just a note").unwrap(), Vec::<String>::new());
        // A hash inside a word or inside quotes is literal.
        assert_eq!(tokenize("a#b").unwrap(), vec!["a#b".to_string()]);
        assert_eq!(tokenize("'#note'").unwrap(), vec!["#note".to_string()]);
    }

    #[test]
    fn test_tokenize_unterminated() {
        assert!(tokenize("add 'oops").is_err());
        assert!(tokenize("add \"oops").is_err());
    }
}
