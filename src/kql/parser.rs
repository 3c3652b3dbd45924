use crate::error::{Error, Result};

use super::lexer::{tokenize, Op, Token};

/// Comparison operator of one condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Contains,
    Prefix,
    Suffix,
    Like,
}

impl std::fmt::Display for CmpOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Gt => ">",
            CmpOp::Le => "<=",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "=",
            CmpOp::Ne => "!=",
            CmpOp::Contains => "CONTAINS",
            CmpOp::Prefix => "PREFIX",
            CmpOp::Suffix => "SUFFIX",
            CmpOp::Like => "LIKE",
        };
        f.write_str(s)
    }
}

/// `operand op value`, the leaf of the WHERE grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    pub operand: String,
    pub op: CmpOp,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XCondNode {
    Cond(Condition),
    Expr(Expression),
}

/// An optionally negated condition or parenthesized sub-expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XCondition {
    pub not: bool,
    pub node: XCondNode,
}

/// AND-joined list of conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AndCondition {
    pub and: Vec<XCondition>,
}

/// OR-joined list of AND groups; the root of a WHERE clause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    pub or: Vec<AndCondition>,
}

/// A parsed SELECT statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Select {
    pub fields: Vec<String>,
    pub format: Option<String>,
    pub from: Vec<String>,
    pub where_expr: Option<Expression>,
    /// `head`, `tail` or an encoded position string.
    pub position: Option<String>,
    pub offset: i64,
    /// Negative means unlimited.
    pub limit: i64,
}

struct Parser {
    tokens: Vec<Token>,
    at: usize,
}

/// Parses a full SELECT statement.
pub fn parse(text: &str) -> Result<Select> {
    let mut p = Parser {
        tokens: tokenize(text)?,
        at: 0,
    };
    let sel = p.select()?;
    if let Some(extra) = p.peek() {
        return Err(Error::invalid_query(format!(
            "unexpected trailing input near {extra:?}"
        )));
    }
    Ok(sel)
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.at)
    }

    fn bump(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.at).cloned();
        if t.is_some() {
            self.at += 1;
        }
        t
    }

    fn eat_keyword(&mut self, kw: &str) -> bool {
        if matches!(self.peek(), Some(Token::Keyword(k)) if k == kw) {
            self.at += 1;
            return true;
        }
        false
    }

    fn select(&mut self) -> Result<Select> {
        if !self.eat_keyword("SELECT") {
            return Err(Error::invalid_query("query must start with SELECT"));
        }

        let mut fields = Vec::new();
        if matches!(self.peek(), Some(Token::Ident(_)) | Some(Token::Str(_))) {
            fields = self.name_list()?;
        }

        let mut format = None;
        if self.eat_keyword("FORMAT") {
            format = Some(self.string_or_ident("FORMAT")?);
        }

        let mut from = Vec::new();
        if self.eat_keyword("FROM") {
            from = self.name_list()?;
            if from.is_empty() {
                return Err(Error::invalid_query("FROM requires at least one journal name"));
            }
        }

        let mut where_expr = None;
        if self.eat_keyword("WHERE") {
            where_expr = Some(self.expression()?);
        }

        let mut position = None;
        if self.eat_keyword("POSITION") {
            position = Some(self.string_or_ident("POSITION")?);
        }

        let mut offset = 0;
        if self.eat_keyword("OFFSET") {
            offset = self.int_value("OFFSET")?;
        }

        if !self.eat_keyword("LIMIT") {
            return Err(Error::invalid_query("query must end with a LIMIT clause"));
        }
        let limit = self.int_value("LIMIT")?;

        Ok(Select {
            fields,
            format,
            from,
            where_expr,
            position,
            offset,
            limit,
        })
    }

    fn name_list(&mut self) -> Result<Vec<String>> {
        let mut names = vec![self.string_or_ident("name list")?];
        while matches!(self.peek(), Some(Token::Op(Op::Comma))) {
            self.at += 1;
            names.push(self.string_or_ident("name list")?);
        }
        Ok(names)
    }

    fn string_or_ident(&mut self, what: &str) -> Result<String> {
        match self.bump() {
            Some(Token::Ident(s)) | Some(Token::Str(s)) => Ok(s),
            other => Err(Error::invalid_query(format!(
                "{what} expects a name or string, got {other:?}"
            ))),
        }
    }

    fn int_value(&mut self, what: &str) -> Result<i64> {
        let raw = self.string_or_ident(what)?;
        raw.parse::<i64>()
            .map_err(|_| Error::invalid_query(format!("{what} expects an integer, got '{raw}'")))
    }

    fn expression(&mut self) -> Result<Expression> {
        let mut or = vec![self.and_condition()?];
        while self.eat_keyword("OR") {
            or.push(self.and_condition()?);
        }
        Ok(Expression { or })
    }

    fn and_condition(&mut self) -> Result<AndCondition> {
        let mut and = vec![self.xcondition()?];
        while self.eat_keyword("AND") {
            and.push(self.xcondition()?);
        }
        Ok(AndCondition { and })
    }

    fn xcondition(&mut self) -> Result<XCondition> {
        let not = self.eat_keyword("NOT");
        if matches!(self.peek(), Some(Token::Op(Op::LParen))) {
            self.at += 1;
            let expr = self.expression()?;
            if !matches!(self.bump(), Some(Token::Op(Op::RParen))) {
                return Err(Error::invalid_query("expected ')'"));
            }
            return Ok(XCondition {
                not,
                node: XCondNode::Expr(expr),
            });
        }
        Ok(XCondition {
            not,
            node: XCondNode::Cond(self.condition()?),
        })
    }

    fn condition(&mut self) -> Result<Condition> {
        let operand = self.string_or_ident("condition")?;
        let op = match self.bump() {
            Some(Token::Op(Op::Lt)) => CmpOp::Lt,
            Some(Token::Op(Op::Gt)) => CmpOp::Gt,
            Some(Token::Op(Op::Le)) => CmpOp::Le,
            Some(Token::Op(Op::Ge)) => CmpOp::Ge,
            Some(Token::Op(Op::Eq)) => CmpOp::Eq,
            Some(Token::Op(Op::Ne)) => CmpOp::Ne,
            Some(Token::Keyword(k)) if k == "CONTAINS" => CmpOp::Contains,
            Some(Token::Keyword(k)) if k == "PREFIX" => CmpOp::Prefix,
            Some(Token::Keyword(k)) if k == "SUFFIX" => CmpOp::Suffix,
            Some(Token::Keyword(k)) if k == "LIKE" => CmpOp::Like,
            other => {
                return Err(Error::invalid_query(format!(
                    "expected a comparison operator after '{operand}', got {other:?}"
                )))
            }
        };
        let value = self.string_or_ident("condition value")?;
        Ok(Condition { operand, op, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_query() {
        let sel = parse("SELECT LIMIT 10").unwrap();
        assert!(sel.where_expr.is_none());
        assert_eq!(sel.limit, 10);
        assert_eq!(sel.offset, 0);
    }

    #[test]
    fn full_query() {
        let sel = parse(
            "SELECT FORMAT '{ts} {msg}' FROM j1,j2 WHERE env=prod AND msg CONTAINS 'oops' \
             POSITION tail OFFSET -3 LIMIT 100",
        )
        .unwrap();
        assert_eq!(sel.format.as_deref(), Some("{ts} {msg}"));
        assert_eq!(sel.from, vec!["j1", "j2"]);
        assert_eq!(sel.position.as_deref(), Some("tail"));
        assert_eq!(sel.offset, -3);
        assert_eq!(sel.limit, 100);
        let expr = sel.where_expr.unwrap();
        assert_eq!(expr.or.len(), 1);
        assert_eq!(expr.or[0].and.len(), 2);
    }

    #[test]
    fn precedence_or_over_and() {
        let sel = parse("SELECT WHERE a=1 OR b=2 AND c=3 LIMIT 1").unwrap();
        let expr = sel.where_expr.unwrap();
        assert_eq!(expr.or.len(), 2);
        assert_eq!(expr.or[0].and.len(), 1);
        assert_eq!(expr.or[1].and.len(), 2);
    }

    #[test]
    fn parenthesized_not() {
        let sel = parse("SELECT WHERE NOT (env=prod OR env=stage) LIMIT 5").unwrap();
        let expr = sel.where_expr.unwrap();
        let xc = &expr.or[0].and[0];
        assert!(xc.not);
        assert!(matches!(xc.node, XCondNode::Expr(_)));
    }

    #[test]
    fn quoted_values_keep_spaces() {
        let sel = parse("SELECT WHERE msg CONTAINS 'two words' LIMIT 1").unwrap();
        let expr = sel.where_expr.unwrap();
        match &expr.or[0].and[0].node {
            XCondNode::Cond(c) => {
                assert_eq!(c.operand, "msg");
                assert_eq!(c.op, CmpOp::Contains);
                assert_eq!(c.value, "two words");
            }
            _ => panic!("expected a condition"),
        }
    }

    #[test]
    fn errors() {
        assert!(parse("WHERE a=1 LIMIT 1").is_err());
        assert!(parse("SELECT WHERE a=1").is_err());
        assert!(parse("SELECT LIMIT abc").is_err());
        assert!(parse("SELECT WHERE a= LIMIT 1").is_err());
        assert!(parse("SELECT WHERE (a=1 LIMIT 1").is_err());
        assert!(parse("SELECT LIMIT 1 garbage").is_err());
    }

    #[test]
    fn keywords_in_lower_case() {
        let sel = parse("select from j1 where a=1 limit 3").unwrap();
        assert_eq!(sel.from, vec!["j1"]);
        assert_eq!(sel.limit, 3);
    }
}
