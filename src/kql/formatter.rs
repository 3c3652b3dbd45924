use crate::error::{Error, Result};

/// A compiled output template.
///
/// The template mixes literal text with variable placeholders: `{name}`
/// inserts the value as is, `{{name}}` inserts it quoted with special
/// characters escaped. Braces themselves are escaped with a backslash.
///
/// Examples:
/// - `plain text`
/// - `ts={ts} msg={msg}`
/// - `{"ts": "{ts}", "msg": {{msg}}}` renders a JSON-ish line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatter {
    tokens: Vec<FmtToken>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FmtToken {
    Lit(Vec<u8>),
    Var { name: String, escape: bool },
}

impl Formatter {
    /// Compiles the template, rejecting unbalanced braces.
    pub fn compile(template: &str) -> Result<Formatter> {
        let mut tokens = Vec::new();
        let mut val = String::new();
        let mut depth = 0u32;
        let mut prev = '\0';

        for (idx, c) in template.char_indices() {
            if prev == '\\' {
                val.push(c);
                prev = '\0';
                continue;
            }

            if c == '{' {
                if depth == 0 {
                    if !val.is_empty() {
                        tokens.push(FmtToken::Lit(std::mem::take(&mut val).into_bytes()));
                    }
                } else if prev != '{' {
                    return Err(Error::invalid_query(format!(
                        "unexpected '{{' in format: ...{}",
                        &template[idx..]
                    )));
                }
                if depth == 2 {
                    return Err(Error::invalid_query(format!(
                        "too many '{{' in format: ...{}",
                        &template[idx..]
                    )));
                }
                depth += 1;
                prev = c;
                continue;
            }

            if c == '}' {
                if depth == 0 {
                    return Err(Error::invalid_query(format!(
                        "unexpected '}}' in format: ...{}",
                        &template[idx..]
                    )));
                }
                if !val.is_empty() {
                    tokens.push(FmtToken::Var {
                        name: std::mem::take(&mut val),
                        escape: depth > 1,
                    });
                }
                depth -= 1;
                prev = if depth > 0 { c } else { '\0' };
                continue;
            }

            if prev == '}' {
                return Err(Error::invalid_query(format!(
                    "unexpected '}}' in format: ...{}",
                    &template[idx..]
                )));
            }

            prev = c;
            if c == '\\' {
                continue;
            }
            val.push(c);
        }

        if depth > 0 {
            return Err(Error::invalid_query("format ends inside a placeholder"));
        }
        if !val.is_empty() {
            tokens.push(FmtToken::Lit(val.into_bytes()));
        }
        Ok(Formatter { tokens })
    }

    /// Renders one record into `out` using `resolve` to look up variable
    /// values.
    pub fn format<F>(&self, out: &mut Vec<u8>, mut resolve: F)
    where
        F: FnMut(&str) -> String,
    {
        for token in &self.tokens {
            match token {
                FmtToken::Lit(bytes) => out.extend_from_slice(bytes),
                FmtToken::Var { name, escape } => {
                    let value = resolve(name);
                    if *escape {
                        out.extend_from_slice(format!("{value:?}").as_bytes());
                    } else {
                        out.extend_from_slice(value.as_bytes());
                    }
                }
            }
        }
    }
}
