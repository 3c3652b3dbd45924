use crate::error::{Error, Result};

/// Comparison and grouping operators of the language.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Op {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Comma,
    LParen,
    RParen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token {
    /// A reserved word, stored upper case.
    Keyword(String),
    /// Bare word: identifiers, numbers, tag values.
    Ident(String),
    /// Quoted string with escapes resolved.
    Str(String),
    Op(Op),
}

const KEYWORDS: &[&str] = &[
    "SELECT", "FORMAT", "FROM", "WHERE", "POSITION", "OFFSET", "LIMIT", "AND", "OR", "NOT",
    "CONTAINS", "PREFIX", "SUFFIX", "LIKE",
];

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || "-_@#$%?&*{}".contains(c)
}

/// Splits the query text into tokens. Keywords are case-insensitive;
/// anything else keeps its case.
pub(crate) fn tokenize(text: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        if c == '\'' || c == '"' {
            chars.next();
            let quote = c;
            let mut val = String::new();
            let mut closed = false;
            while let Some(n) = chars.next() {
                if n == '\\' {
                    match chars.next() {
                        Some(esc) => val.push(esc),
                        None => break,
                    }
                } else if n == quote {
                    closed = true;
                    break;
                } else {
                    val.push(n);
                }
            }
            if !closed {
                return Err(Error::invalid_query(format!(
                    "unterminated string literal near '{val}'"
                )));
            }
            tokens.push(Token::Str(val));
            continue;
        }

        if let Some(op) = match c {
            '<' | '>' | '!' | '=' | ',' | '(' | ')' => Some(c),
            _ => None,
        } {
            chars.next();
            let token = match op {
                '<' => {
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        Op::Le
                    } else {
                        Op::Lt
                    }
                }
                '>' => {
                    if chars.peek() == Some(&'=') {
                        chars.next();
                        Op::Ge
                    } else {
                        Op::Gt
                    }
                }
                '!' => {
                    if chars.next() != Some('=') {
                        return Err(Error::invalid_query("'!' must be followed by '='"));
                    }
                    Op::Ne
                }
                '=' => Op::Eq,
                ',' => Op::Comma,
                '(' => Op::LParen,
                _ => Op::RParen,
            };
            tokens.push(Token::Op(token));
            continue;
        }

        if is_ident_char(c) {
            let mut word = String::new();
            while let Some(&n) = chars.peek() {
                if is_ident_char(n) {
                    word.push(n);
                    chars.next();
                } else {
                    break;
                }
            }
            let upper = word.to_ascii_uppercase();
            if KEYWORDS.contains(&upper.as_str()) {
                tokens.push(Token::Keyword(upper));
            } else {
                tokens.push(Token::Ident(word));
            }
            continue;
        }

        return Err(Error::invalid_query(format!(
            "unexpected character '{c}' in query"
        )));
    }

    Ok(tokens)
}
