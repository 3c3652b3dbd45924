use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::error::{Error, Result};
use crate::tags::Tags;

use super::parser::{AndCondition, CmpOp, Condition, Expression, XCondNode, XCondition};

/// Reserved operand names.
pub const OPERAND_TS: &str = "ts";
pub const OPERAND_MSG: &str = "msg";

/// Evaluation context handed to a compiled predicate.
pub struct EvalCtx<'a> {
    pub ts: i64,
    pub msg: &'a [u8],
    pub tags: Option<&'a Tags>,
}

pub(crate) type PredFn = Arc<dyn Fn(&EvalCtx<'_>) -> bool + Send + Sync>;

/// Which operand classes the compilation ignores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct IgnoreFlags {
    pub ts: bool,
    pub msg: bool,
}

impl IgnoreFlags {
    pub(crate) const NONE: IgnoreFlags = IgnoreFlags { ts: false, msg: false };
    /// Ignore record-level operands, keeping only the tag conditions.
    pub(crate) const RECORD_OPERANDS: IgnoreFlags = IgnoreFlags { ts: true, msg: true };
}

/// A compiled sub-expression. `ignore` marks the trust sentinel: the
/// sub-expression was removed by the ignore rules and always evaluates
/// to true.
#[derive(Clone)]
pub(crate) struct ExprFunc {
    pub f: PredFn,
    pub ignore: bool,
}

impl ExprFunc {
    fn trust() -> ExprFunc {
        ExprFunc {
            f: Arc::new(|_| true),
            ignore: true,
        }
    }

    fn user(f: PredFn) -> ExprFunc {
        ExprFunc { f, ignore: false }
    }

    /// `ignore OR x = ignore`
    fn or(self, other: ExprFunc) -> ExprFunc {
        if self.ignore || other.ignore {
            return ExprFunc::trust();
        }
        let (a, b) = (self.f, other.f);
        ExprFunc::user(Arc::new(move |ctx| a(ctx) || b(ctx)))
    }

    /// `ignore AND x = x`
    fn and(self, other: ExprFunc) -> ExprFunc {
        if self.ignore {
            return other;
        }
        if other.ignore {
            return self;
        }
        let (a, b) = (self.f, other.f);
        ExprFunc::user(Arc::new(move |ctx| a(ctx) && b(ctx)))
    }

    /// `NOT ignore = ignore`
    fn not(self) -> ExprFunc {
        if self.ignore {
            return self;
        }
        let f = self.f;
        ExprFunc::user(Arc::new(move |ctx| !f(ctx)))
    }
}

/// Compiles an expression into a predicate under the given ignore rules.
///
/// Ignoring an operand class removes its conditions from the expression
/// while preserving soundness: when the reduced predicate returns false
/// the original expression is false for any values of the ignored
/// operands. A missing WHERE clause trusts everything.
pub(crate) fn evaluate(expr: Option<&Expression>, flags: IgnoreFlags) -> Result<ExprFunc> {
    match expr {
        None => Ok(ExprFunc::trust()),
        Some(expr) => build_or(&expr.or, flags),
    }
}

fn build_or(list: &[AndCondition], flags: IgnoreFlags) -> Result<ExprFunc> {
    let mut out: Option<ExprFunc> = None;
    for and in list {
        let f = build_and(&and.and, flags)?;
        out = Some(match out {
            None => f,
            Some(prev) => prev.or(f),
        });
    }
    Ok(out.unwrap_or_else(ExprFunc::trust))
}

fn build_and(list: &[XCondition], flags: IgnoreFlags) -> Result<ExprFunc> {
    let mut out: Option<ExprFunc> = None;
    for xc in list {
        let f = build_xcond(xc, flags)?;
        out = Some(match out {
            None => f,
            Some(prev) => prev.and(f),
        });
    }
    Ok(out.unwrap_or_else(ExprFunc::trust))
}

fn build_xcond(xc: &XCondition, flags: IgnoreFlags) -> Result<ExprFunc> {
    let inner = match &xc.node {
        XCondNode::Expr(expr) => build_or(&expr.or, flags)?,
        XCondNode::Cond(cond) => build_cond(cond, flags)?,
    };
    Ok(if xc.not { inner.not() } else { inner })
}

fn build_cond(cond: &Condition, flags: IgnoreFlags) -> Result<ExprFunc> {
    let operand = cond.operand.to_ascii_lowercase();
    match operand.as_str() {
        OPERAND_TS => build_ts_cond(cond, flags),
        OPERAND_MSG => build_msg_cond(cond, flags),
        _ => build_tag_cond(cond, operand),
    }
}

fn build_ts_cond(cond: &Condition, flags: IgnoreFlags) -> Result<ExprFunc> {
    if flags.ts {
        return Ok(ExprFunc::trust());
    }
    let tm = parse_time(&cond.value)?;
    let f: PredFn = match cond.op {
        CmpOp::Lt => Arc::new(move |ctx| ctx.ts < tm),
        CmpOp::Gt => Arc::new(move |ctx| ctx.ts > tm),
        CmpOp::Le => Arc::new(move |ctx| ctx.ts <= tm),
        CmpOp::Ge => Arc::new(move |ctx| ctx.ts >= tm),
        CmpOp::Eq => Arc::new(move |ctx| ctx.ts == tm),
        CmpOp::Ne => Arc::new(move |ctx| ctx.ts != tm),
        other => {
            return Err(Error::invalid_query(format!(
                "operator {other} is not applicable to the timestamp"
            )))
        }
    };
    Ok(ExprFunc::user(f))
}

fn build_msg_cond(cond: &Condition, flags: IgnoreFlags) -> Result<ExprFunc> {
    if flags.msg {
        return Ok(ExprFunc::trust());
    }
    let value = cond.value.clone().into_bytes();
    let f: PredFn = match cond.op {
        CmpOp::Contains => Arc::new(move |ctx| {
            value.is_empty() || ctx.msg.windows(value.len()).any(|w| w == &value[..])
        }),
        CmpOp::Prefix => Arc::new(move |ctx| ctx.msg.starts_with(&value)),
        CmpOp::Suffix => Arc::new(move |ctx| ctx.msg.ends_with(&value)),
        CmpOp::Eq => Arc::new(move |ctx| ctx.msg == &value[..]),
        CmpOp::Ne => Arc::new(move |ctx| ctx.msg != &value[..]),
        other => {
            return Err(Error::invalid_query(format!(
                "operator {other} is not applicable to the message"
            )))
        }
    };
    Ok(ExprFunc::user(f))
}

fn build_tag_cond(cond: &Condition, key: String) -> Result<ExprFunc> {
    let value = cond.value.clone();
    let f: PredFn = match cond.op {
        CmpOp::Eq => Arc::new(move |ctx| tag_value(ctx, &key) == value),
        CmpOp::Ne => Arc::new(move |ctx| tag_value(ctx, &key) != value),
        CmpOp::Like => {
            // surface malformed patterns at compile time
            glob_match(&value, "probe")?;
            Arc::new(move |ctx| glob_match(&value, tag_value(ctx, &key)).unwrap_or(false))
        }
        other => {
            return Err(Error::invalid_query(format!(
                "operator {other} is not applicable to tag '{}'",
                cond.operand
            )))
        }
    };
    Ok(ExprFunc::user(f))
}

fn tag_value<'a>(ctx: &'a EvalCtx<'_>, key: &str) -> &'a str {
    ctx.tags.map(|t| t.get(key)).unwrap_or("")
}

const SHORT_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Parses a timestamp literal into nanoseconds since the epoch. Accepts a
/// raw integer, RFC3339, or the short local form without a zone.
pub(crate) fn parse_time(value: &str) -> Result<i64> {
    if let Ok(n) = value.parse::<i64>() {
        return Ok(n);
    }
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        return dt
            .timestamp_nanos_opt()
            .ok_or_else(|| Error::invalid_query(format!("timestamp '{value}' is out of range")));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, SHORT_TIME_FORMAT) {
        return dt
            .and_utc()
            .timestamp_nanos_opt()
            .ok_or_else(|| Error::invalid_query(format!("timestamp '{value}' is out of range")));
    }
    Err(Error::invalid_query(format!(
        "cannot parse timestamp '{value}', expected an integer, RFC3339 or {SHORT_TIME_FORMAT}"
    )))
}

/// Shell-style glob match supporting `*`, `?` and `[...]` classes with
/// ranges and `^` negation. A malformed pattern is an error.
pub(crate) fn glob_match(pattern: &str, text: &str) -> Result<bool> {
    let pat: Vec<char> = pattern.chars().collect();
    let txt: Vec<char> = text.chars().collect();
    matches_at(&pat, &txt)
}

fn matches_at(pat: &[char], txt: &[char]) -> Result<bool> {
    let mut p = 0;
    let mut t = 0;
    let mut star: Option<(usize, usize)> = None;

    while t < txt.len() {
        if p < pat.len() {
            match pat[p] {
                '*' => {
                    star = Some((p, t));
                    p += 1;
                    continue;
                }
                '?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                '[' => {
                    let (matched, next) = match_class(pat, p, txt[t])?;
                    if matched {
                        p = next;
                        t += 1;
                        continue;
                    }
                }
                c => {
                    if c == txt[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((sp, st)) => {
                // retry with the star absorbing one more character
                p = sp + 1;
                t = st + 1;
                star = Some((sp, st + 1));
            }
            None => {
                // still have to validate the rest of the pattern
                validate_rest(pat, p)?;
                return Ok(false);
            }
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    if p < pat.len() {
        validate_rest(pat, p)?;
        return Ok(false);
    }
    Ok(true)
}

fn validate_rest(pat: &[char], mut p: usize) -> Result<()> {
    while p < pat.len() {
        if pat[p] == '[' {
            let (_, next) = match_class(pat, p, '\0')?;
            p = next;
        } else {
            p += 1;
        }
    }
    Ok(())
}

/// Matches `c` against the class starting at `pat[start] == '['`. Returns
/// the match result and the index just past the closing bracket.
fn match_class(pat: &[char], start: usize, c: char) -> Result<(bool, usize)> {
    let mut i = start + 1;
    let negate = pat.get(i) == Some(&'^');
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut any = false;
    while i < pat.len() && (pat[i] != ']' || !any) {
        let lo = pat[i];
        if i + 2 < pat.len() && pat[i + 1] == '-' && pat[i + 2] != ']' {
            let hi = pat[i + 2];
            if lo > hi {
                return Err(Error::invalid_query(format!(
                    "bad character range {lo}-{hi} in LIKE pattern"
                )));
            }
            if lo <= c && c <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if lo == c {
                matched = true;
            }
            i += 1;
        }
        any = true;
    }
    if i >= pat.len() || pat[i] != ']' {
        return Err(Error::invalid_query("unterminated class in LIKE pattern"));
    }
    Ok((matched != negate, i + 1))
}
