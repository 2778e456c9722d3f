//! Guard predicates deciding whether a generation step runs for an item.
//!
//! The grammar is fixed and only reads item fields:
//!
//! ```text
//! expr    := and (("||" | "or") and)*
//! and     := unary (("&&" | "and") unary)*
//! unary   := ("!" | "not") unary | compare
//! compare := operand (("==" | "!=" | "<" | "<=" | ">" | ">=") operand)?
//! operand := field | "len(" field ")" | string | number | true | false | null | "(" expr ")"
//! ```
//!
//! A bare field is true when present and non-empty. Missing fields compare
//! equal only to `null`.

use datamap_core::types::{FieldValue, Item};
use datamap_core::{Error, Result};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Op(CmpOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Field(String),
    Len(String),
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Or(Vec<Expr>),
    And(Vec<Expr>),
    Not(Box<Expr>),
    Compare(Operand, CmpOp, Operand),
    Truthy(Operand),
}

/// A parsed guard; parse once at planning time, evaluate per item.
#[derive(Debug, Clone, PartialEq)]
pub struct Guard {
    source: String,
    expr: Expr,
}

impl Guard {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(Error::Validation(format!("unexpected trailing input in guard '{source}'")));
        }
        Ok(Self { source: source.to_string(), expr })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        collect_fields(&self.expr, &mut out);
        out
    }

    pub fn evaluate(&self, item: &Item) -> bool {
        eval(&self.expr, item)
    }
}

fn operand_field(op: &Operand) -> Option<&str> {
    match op {
        Operand::Field(f) | Operand::Len(f) => Some(f.as_str()),
        _ => None,
    }
}

fn collect_fields<'a>(expr: &'a Expr, out: &mut Vec<&'a str>) {
    match expr {
        Expr::Or(v) | Expr::And(v) => v.iter().for_each(|e| collect_fields(e, out)),
        Expr::Not(e) => collect_fields(e, out),
        Expr::Compare(a, _, b) => out.extend(operand_field(a).into_iter().chain(operand_field(b))),
        Expr::Truthy(a) => out.extend(operand_field(a)),
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |msg: &str| Error::Validation(format!("{msg} in guard '{src}'"));
    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(err("single '&' or '|'"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let next_eq = chars.get(i + 1) == Some(&'=');
                let tok = match (c, next_eq) {
                    ('=', true) => Token::Op(CmpOp::Eq),
                    ('!', true) => Token::Op(CmpOp::Ne),
                    ('<', true) => Token::Op(CmpOp::Le),
                    ('>', true) => Token::Op(CmpOp::Ge),
                    ('<', false) => Token::Op(CmpOp::Lt),
                    ('>', false) => Token::Op(CmpOp::Gt),
                    ('!', false) => Token::Not,
                    _ => return Err(err("single '='")),
                };
                i += if next_eq { 2 } else { 1 };
                tokens.push(tok);
            }
            '"' | '\'' => {
                let end = chars[i + 1..].iter().position(|&ch| ch == c).ok_or_else(|| err("unterminated string"))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            _ if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| err("bad number"))?;
                tokens.push(Token::Num(n));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || matches!(chars[i], '_' | '.' | '-')) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(err(&format!("unexpected character '{c}'"))),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expr(&mut self) -> Result<Expr> {
        let mut parts = vec![self.and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            parts.push(self.and()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::Or(parts) })
    }

    fn and(&mut self) -> Result<Expr> {
        let mut parts = vec![self.unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            parts.push(self.unary()?);
        }
        Ok(if parts.len() == 1 { parts.remove(0) } else { Expr::And(parts) })
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.peek() == Some(&Token::LParen) {
            self.pos += 1;
            let inner = self.expr()?;
            if self.advance() != Some(Token::RParen) {
                return Err(Error::Validation("missing ')' in guard".into()));
            }
            return Ok(inner);
        }
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek().cloned() {
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Expr::Compare(left, op, right));
        }
        Ok(Expr::Truthy(left))
    }

    fn operand(&mut self) -> Result<Operand> {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Operand::Str(s)),
            Some(Token::Num(n)) => Ok(Operand::Num(n)),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Operand::Bool(true)),
                "false" => Ok(Operand::Bool(false)),
                "null" | "None" => Ok(Operand::Null),
                "len" if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let field = match self.advance() {
                        Some(Token::Ident(f)) => f,
                        _ => return Err(Error::Validation("len() expects a field name".into())),
                    };
                    if self.advance() != Some(Token::RParen) {
                        return Err(Error::Validation("missing ')' after len(".into()));
                    }
                    Ok(Operand::Len(field))
                }
                _ => Ok(Operand::Field(word)),
            },
            other => Err(Error::Validation(format!("expected operand in guard, found {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
    Other(bool),
}

impl Val {
    fn truthy(&self) -> bool {
        match self {
            Val::Null => false,
            Val::Bool(b) | Val::Other(b) => *b,
            Val::Num(n) => *n != 0.0,
            Val::Str(s) => !s.is_empty(),
        }
    }
}

fn resolve(op: &Operand, item: &Item) -> Val {
    match op {
        Operand::Field(f) => match item.get(f) {
            None => Val::Null,
            Some(FieldValue::Text(s)) => Val::Str(s.clone()),
            Some(FieldValue::Number(n)) => Val::Num(*n),
            Some(FieldValue::Bool(b)) => Val::Bool(*b),
            Some(v) => Val::Other(v.is_truthy()),
        },
        Operand::Len(f) => {
            #[allow(clippy::cast_precision_loss)]
            let n = item.get(f).map_or(0, FieldValue::element_count) as f64;
            Val::Num(n)
        }
        Operand::Str(s) => Val::Str(s.clone()),
        Operand::Num(n) => Val::Num(*n),
        Operand::Bool(b) => Val::Bool(*b),
        Operand::Null => Val::Null,
    }
}

fn compare(a: &Val, op: CmpOp, b: &Val) -> bool {
    use std::cmp::Ordering;
    let ordering = match (a, b) {
        (Val::Num(x), Val::Num(y)) => x.partial_cmp(y),
        (Val::Str(x), Val::Str(y)) => Some(x.cmp(y)),
        (Val::Bool(x), Val::Bool(y)) => Some(x.cmp(y)),
        (Val::Null, Val::Null) => Some(Ordering::Equal),
        _ => None,
    };
    match op {
        CmpOp::Eq => ordering == Some(Ordering::Equal),
        CmpOp::Ne => ordering != Some(Ordering::Equal),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn eval(expr: &Expr, item: &Item) -> bool {
    match expr {
        Expr::Or(parts) => parts.iter().any(|e| eval(e, item)),
        Expr::And(parts) => parts.iter().all(|e| eval(e, item)),
        Expr::Not(e) => !eval(e, item),
        Expr::Compare(a, op, b) => compare(&resolve(a, item), *op, &resolve(b, item)),
        Expr::Truthy(a) => resolve(a, item).truthy(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paper() -> Item {
        Item::new(1, "p1")
            .with_field("title", FieldValue::Text("Graphene".into()))
            .with_field("year", FieldValue::Number(2019.0))
            .with_field("authors", FieldValue::TextList(vec!["a".into(), "b".into()]))
    }

    #[test]
    fn evaluates_presence_comparisons_and_logic() {
        let item = paper();
        let cases = [
            ("title", true),
            ("abstract", false),
            ("!abstract && title", true),
            ("year >= 2000 and year < 2020", true),
            ("year > 2020 || title == 'Graphene'", true),
            ("len(authors) == 2", true),
            ("abstract == null", true),
            ("not (title != \"Graphene\")", true),
        ];
        for (src, expected) in cases {
            let guard = Guard::parse(src).expect("parses");
            assert_eq!(guard.evaluate(&item), expected, "guard `{src}`");
        }
    }

    #[test]
    fn rejects_code_like_input() {
        for src in ["__import__('os')", "title = 1", "title &", "(title", "title title"] {
            assert!(Guard::parse(src).is_err(), "`{src}` must not parse");
        }
    }
}
