//! Boolean constraint expressions over parameter names.
//!
//! A constraint such as `fast < slow and (slow - fast) % 2 == 0` is parsed
//! once into a typed AST whose identifiers are resolved to parameter
//! positions. Evaluation then only reads a variant's values, so no string is
//! ever executed.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! or      := and (("or" | "||") and)*
//! and     := not (("and" | "&&") not)*
//! not     := ("not" | "!") not | compare
//! compare := sum (("<" | "<=" | ">" | ">=" | "==" | "!=") sum)?
//! sum     := product (("+" | "-") product)*
//! product := unary (("*" | "/" | "%") unary)*
//! unary   := "-" unary | atom
//! atom    := number | ident | "true" | "false" | "(" or ")"
//! ```

use stratlab_core::{EngineError, ParamValue};
use thiserror::Error;

const EQ_TOLERANCE: f64 = 1e-9;

/// Deepest allowed nesting of parentheses, `not` and unary minus.
const MAX_NESTING: usize = 64;

/// Operator chains are parsed in a loop but evaluated recursively, so the
/// token count bounds the tree height.
const MAX_TOKENS: usize = 1024;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("unexpected character `{ch}` at position {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("invalid number `{text}` at position {pos}")]
    InvalidNumber { text: String, pos: usize },

    #[error("unknown parameter `{0}`")]
    UnknownParameter(String),

    #[error("expected {expected} at position {pos}, found {found}")]
    Unexpected {
        expected: &'static str,
        found: String,
        pos: usize,
    },

    #[error("operator `{op}` expects {expected} operands")]
    TypeMismatch {
        op: &'static str,
        expected: &'static str,
    },

    #[error("constraint must be a boolean expression")]
    NotBoolean,

    #[error("constraint is empty")]
    Empty,

    #[error("constraint nests deeper than {limit} levels")]
    TooDeep { limit: usize },

    #[error("constraint has {tokens} tokens, more than the limit of {limit}")]
    TooLong { tokens: usize, limit: usize },
}

impl From<ParseError> for EngineError {
    fn from(err: ParseError) -> Self {
        Self::InvalidConstraint(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    True,
    False,
    And,
    Or,
    Not,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number {n}"),
            Self::Ident(name) => format!("`{name}`"),
            Self::True => "`true`".to_string(),
            Self::False => "`false`".to_string(),
            Self::And => "`and`".to_string(),
            Self::Or => "`or`".to_string(),
            Self::Not => "`not`".to_string(),
            Self::Plus => "`+`".to_string(),
            Self::Minus => "`-`".to_string(),
            Self::Star => "`*`".to_string(),
            Self::Slash => "`/`".to_string(),
            Self::Percent => "`%`".to_string(),
            Self::Lt => "`<`".to_string(),
            Self::Le => "`<=`".to_string(),
            Self::Gt => "`>`".to_string(),
            Self::Ge => "`>=`".to_string(),
            Self::Eq => "`==`".to_string(),
            Self::Ne => "`!=`".to_string(),
            Self::LParen => "`(`".to_string(),
            Self::RParen => "`)`".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<(Token, usize)>, ParseError> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < chars.len() {
        let ch = chars[pos];
        let start = pos;

        if ch.is_whitespace() {
            pos += 1;
            continue;
        }

        if ch.is_ascii_digit() || (ch == '.' && chars.get(pos + 1).is_some_and(char::is_ascii_digit)) {
            while pos < chars.len() && (chars[pos].is_ascii_digit() || chars[pos] == '.') {
                pos += 1;
            }
            let text: String = chars[start..pos].iter().collect();
            let value = text
                .parse::<f64>()
                .map_err(|_| ParseError::InvalidNumber { text, pos: start })?;
            tokens.push((Token::Number(value), start));
            continue;
        }

        if ch.is_alphabetic() || ch == '_' {
            while pos < chars.len() && (chars[pos].is_alphanumeric() || chars[pos] == '_') {
                pos += 1;
            }
            let word: String = chars[start..pos].iter().collect();
            let token = match word.as_str() {
                "and" => Token::And,
                "or" => Token::Or,
                "not" => Token::Not,
                "true" => Token::True,
                "false" => Token::False,
                _ => Token::Ident(word),
            };
            tokens.push((token, start));
            continue;
        }

        let next = chars.get(pos + 1).copied();
        let (token, width) = match (ch, next) {
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('&', Some('&')) => (Token::And, 2),
            ('|', Some('|')) => (Token::Or, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('!', _) => (Token::Not, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            _ => return Err(ParseError::UnexpectedChar { ch, pos }),
        };
        tokens.push((token, start));
        pos += width;
    }

    Ok(tokens)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
enum NumExpr {
    Literal(f64),
    Param(usize),
    Neg(Box<NumExpr>),
    Arith(ArithOp, Box<NumExpr>, Box<NumExpr>),
}

#[derive(Debug, Clone, PartialEq)]
enum BoolExpr {
    Literal(bool),
    Not(Box<BoolExpr>),
    And(Box<BoolExpr>, Box<BoolExpr>),
    Or(Box<BoolExpr>, Box<BoolExpr>),
    Compare(CmpOp, NumExpr, NumExpr),
}

/// Parser output before the final boolean check.
enum Expr {
    Num(NumExpr),
    Bool(BoolExpr),
}

impl Expr {
    fn into_num(self, op: &'static str) -> Result<NumExpr, ParseError> {
        match self {
            Self::Num(e) => Ok(e),
            Self::Bool(_) => Err(ParseError::TypeMismatch {
                op,
                expected: "numeric",
            }),
        }
    }

    fn into_bool(self, op: &'static str) -> Result<BoolExpr, ParseError> {
        match self {
            Self::Bool(e) => Ok(e),
            Self::Num(_) => Err(ParseError::TypeMismatch {
                op,
                expected: "boolean",
            }),
        }
    }
}

struct Parser<'a> {
    tokens: Vec<(Token, usize)>,
    cursor: usize,
    depth: usize,
    names: &'a [String],
    source_len: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.cursor).map(|(t, _)| t)
    }

    fn position(&self) -> usize {
        self.tokens
            .get(self.cursor)
            .map_or(self.source_len, |(_, pos)| *pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.cursor).map(|(t, _)| t.clone());
        self.cursor += 1;
        token
    }

    fn descend(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err(ParseError::TooDeep { limit: MAX_NESTING });
        }
        Ok(())
    }

    fn ascend(&mut self) {
        self.depth -= 1;
    }

    fn unexpected(&self, expected: &'static str) -> ParseError {
        ParseError::Unexpected {
            expected,
            found: self
                .peek()
                .map_or_else(|| "end of input".to_string(), Token::describe),
            pos: self.position(),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Bool(BoolExpr::Or(
                Box::new(lhs.into_bool("or")?),
                Box::new(rhs.into_bool("or")?),
            ));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let rhs = self.parse_not()?;
            lhs = Expr::Bool(BoolExpr::And(
                Box::new(lhs.into_bool("and")?),
                Box::new(rhs.into_bool("and")?),
            ));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            self.descend()?;
            let inner = self.parse_not()?.into_bool("not")?;
            self.ascend();
            return Ok(Expr::Bool(BoolExpr::Not(Box::new(inner))));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_sum()?;
        let (op, symbol) = match self.peek() {
            Some(Token::Lt) => (CmpOp::Lt, "<"),
            Some(Token::Le) => (CmpOp::Le, "<="),
            Some(Token::Gt) => (CmpOp::Gt, ">"),
            Some(Token::Ge) => (CmpOp::Ge, ">="),
            Some(Token::Eq) => (CmpOp::Eq, "=="),
            Some(Token::Ne) => (CmpOp::Ne, "!="),
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_sum()?;
        Ok(Expr::Bool(BoolExpr::Compare(
            op,
            lhs.into_num(symbol)?,
            rhs.into_num(symbol)?,
        )))
    }

    fn parse_sum(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_product()?;
        loop {
            let (op, symbol) = match self.peek() {
                Some(Token::Plus) => (ArithOp::Add, "+"),
                Some(Token::Minus) => (ArithOp::Sub, "-"),
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_product()?;
            lhs = Expr::Num(NumExpr::Arith(
                op,
                Box::new(lhs.into_num(symbol)?),
                Box::new(rhs.into_num(symbol)?),
            ));
        }
    }

    fn parse_product(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let (op, symbol) = match self.peek() {
                Some(Token::Star) => (ArithOp::Mul, "*"),
                Some(Token::Slash) => (ArithOp::Div, "/"),
                Some(Token::Percent) => (ArithOp::Rem, "%"),
                _ => return Ok(lhs),
            };
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::Num(NumExpr::Arith(
                op,
                Box::new(lhs.into_num(symbol)?),
                Box::new(rhs.into_num(symbol)?),
            ));
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Token::Minus) {
            self.advance();
            self.descend()?;
            let inner = self.parse_unary()?.into_num("-")?;
            self.ascend();
            return Ok(Expr::Num(NumExpr::Neg(Box::new(inner))));
        }
        self.parse_atom()
    }

    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        let expected = "a number, parameter name or `(`";
        match self.peek() {
            Some(Token::Number(_) | Token::Ident(_) | Token::True | Token::False | Token::LParen) => {}
            _ => return Err(self.unexpected(expected)),
        }

        match self.advance() {
            Some(Token::Number(value)) => Ok(Expr::Num(NumExpr::Literal(value))),
            Some(Token::True) => Ok(Expr::Bool(BoolExpr::Literal(true))),
            Some(Token::False) => Ok(Expr::Bool(BoolExpr::Literal(false))),
            Some(Token::Ident(name)) => self
                .names
                .iter()
                .position(|n| *n == name)
                .map(|index| Expr::Num(NumExpr::Param(index)))
                .ok_or(ParseError::UnknownParameter(name)),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::RParen) {
                    return Err(self.unexpected("`)`"));
                }
                self.advance();
                self.ascend();
                Ok(inner)
            }
            _ => Err(self.unexpected(expected)),
        }
    }
}

impl NumExpr {
    fn eval(&self, values: &[ParamValue]) -> Option<f64> {
        let result = match self {
            Self::Literal(v) => *v,
            Self::Param(index) => values.get(*index)?.as_f64(),
            Self::Neg(inner) => -inner.eval(values)?,
            Self::Arith(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(values)?, rhs.eval(values)?);
                match op {
                    ArithOp::Add => a + b,
                    ArithOp::Sub => a - b,
                    ArithOp::Mul => a * b,
                    ArithOp::Div | ArithOp::Rem if b == 0.0 => return None,
                    ArithOp::Div => a / b,
                    ArithOp::Rem => a % b,
                }
            }
        };
        result.is_finite().then_some(result)
    }
}

impl BoolExpr {
    fn eval(&self, values: &[ParamValue]) -> Option<bool> {
        match self {
            Self::Literal(v) => Some(*v),
            Self::Not(inner) => inner.eval(values).map(|v| !v),
            Self::And(lhs, rhs) => Some(lhs.eval(values)? && rhs.eval(values)?),
            Self::Or(lhs, rhs) => Some(lhs.eval(values)? || rhs.eval(values)?),
            Self::Compare(op, lhs, rhs) => {
                let (a, b) = (lhs.eval(values)?, rhs.eval(values)?);
                let equal = (a - b).abs() <= EQ_TOLERANCE;
                Some(match op {
                    CmpOp::Lt => a < b && !equal,
                    CmpOp::Le => a < b || equal,
                    CmpOp::Gt => a > b && !equal,
                    CmpOp::Ge => a > b || equal,
                    CmpOp::Eq => equal,
                    CmpOp::Ne => !equal,
                })
            }
        }
    }
}

/// A parsed, type-checked constraint bound to a fixed parameter order.
#[derive(Debug, Clone, PartialEq)]
pub struct Constraint {
    source: String,
    root: BoolExpr,
}

impl Constraint {
    /// Parses `source` against the grid's parameter names.
    ///
    /// # Errors
    /// Returns `EngineError::InvalidConstraint` for syntax errors, unknown
    /// parameter names, operand type mismatches, or a non-boolean result.
    pub fn parse(source: &str, names: &[String]) -> Result<Self, EngineError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(ParseError::Empty.into());
        }
        if tokens.len() > MAX_TOKENS {
            return Err(ParseError::TooLong {
                tokens: tokens.len(),
                limit: MAX_TOKENS,
            }
            .into());
        }

        let mut parser = Parser {
            tokens,
            cursor: 0,
            depth: 0,
            names,
            source_len: source.chars().count(),
        };
        let expr = parser.parse_or()?;
        if parser.peek().is_some() {
            return Err(parser.unexpected("an operator or end of input").into());
        }

        let root = match expr {
            Expr::Bool(root) => root,
            Expr::Num(_) => return Err(ParseError::NotBoolean.into()),
        };

        Ok(Self {
            source: source.to_string(),
            root,
        })
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// True when the candidate satisfies the constraint.
    ///
    /// `values` must follow the parameter order the constraint was parsed
    /// with. Arithmetic that cannot be evaluated (division by zero) rejects
    /// the candidate.
    #[must_use]
    pub fn accepts(&self, values: &[ParamValue]) -> bool {
        self.root.eval(values).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names() -> Vec<String> {
        vec!["fast".to_string(), "slow".to_string(), "k".to_string()]
    }

    fn ints(fast: i64, slow: i64) -> Vec<ParamValue> {
        vec![ParamValue::Int(fast), ParamValue::Int(slow), ParamValue::Float(1.5)]
    }

    fn accepts(source: &str, values: &[ParamValue]) -> bool {
        Constraint::parse(source, &names()).unwrap().accepts(values)
    }

    fn parse_error(source: &str) -> String {
        match Constraint::parse(source, &names()) {
            Err(EngineError::InvalidConstraint(message)) => message,
            other => panic!("expected InvalidConstraint for {source:?}, got {other:?}"),
        }
    }

    // ============================================
    // Evaluation
    // ============================================

    #[test]
    fn simple_comparison() {
        assert!(accepts("fast < slow", &ints(1, 2)));
        assert!(!accepts("fast < slow", &ints(2, 2)));
        assert!(accepts("fast <= slow", &ints(2, 2)));
        assert!(accepts("slow != fast", &ints(1, 2)));
    }

    #[test]
    fn arithmetic_and_precedence() {
        assert!(accepts("slow - fast * 2 == 0", &ints(3, 6)));
        assert!(accepts("(slow - fast) * 2 == 6", &ints(3, 6)));
        assert!(accepts("slow % 4 == 2", &ints(1, 6)));
        assert!(accepts("-fast + slow > 0", &ints(1, 6)));
        assert!(accepts("k * 2 == 3", &ints(1, 1)));
    }

    #[test]
    fn boolean_connectives() {
        assert!(accepts("fast < slow and slow < 10", &ints(1, 5)));
        assert!(!accepts("fast < slow && slow < 10", &ints(1, 50)));
        assert!(accepts("fast > slow or slow == 50", &ints(1, 50)));
        assert!(accepts("fast > slow || true", &ints(9, 1)));
        assert!(accepts("not fast > slow", &ints(1, 2)));
        assert!(accepts("!(fast > slow)", &ints(1, 2)));
        assert!(!accepts("false", &ints(1, 2)));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        // true or (false and false)
        assert!(accepts("fast == 1 or fast == 2 and slow == 3", &ints(1, 9)));
    }

    #[test]
    fn division_by_zero_rejects_candidate() {
        assert!(!accepts("slow / fast > 1", &ints(0, 5)));
        assert!(!accepts("slow % fast == 0", &ints(0, 5)));
        assert!(accepts("slow / fast > 1", &ints(2, 5)));
    }

    #[test]
    fn decimal_literals() {
        assert!(accepts("k >= 1.5 and k < 1.75", &ints(1, 1)));
        assert!(accepts("k * .5 == 0.75", &ints(1, 1)));
    }

    // ============================================
    // Build-time failures
    // ============================================

    #[test]
    fn unknown_parameter_fails_at_parse() {
        assert!(parse_error("fast < medium").contains("medium"));
    }

    #[test]
    fn numeric_expression_is_not_a_constraint() {
        assert!(parse_error("fast + slow").contains("boolean"));
    }

    #[test]
    fn type_mismatch_is_reported() {
        assert!(parse_error("(fast < slow) + 1 > 0").contains("numeric"));
        assert!(parse_error("fast and slow").contains("boolean"));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(parse_error("fast <").contains("end of input"));
        assert!(parse_error("(fast < slow").contains("`)`"));
        assert!(parse_error("fast < slow slow").contains("operator"));
        assert!(parse_error("fast $ slow").contains('$'));
        assert!(parse_error("   ").contains("empty"));
        assert!(parse_error("1.2.3 > fast").contains("1.2.3"));
    }

    #[test]
    fn deep_nesting_is_rejected() {
        let parens = format!("{}fast < slow{}", "(".repeat(20_000), ")".repeat(20_000));
        assert!(parse_error(&parens).contains("more than the limit"));

        let nested = format!("{}fast < slow{}", "(".repeat(100), ")".repeat(100));
        assert!(parse_error(&nested).contains("deeper than 64"));

        let negations = format!("{}fast < slow", "not ".repeat(100));
        assert!(parse_error(&negations).contains("deeper than 64"));

        let minus = format!("{}fast < slow", "-".repeat(100));
        assert!(parse_error(&minus).contains("deeper than 64"));
    }

    #[test]
    fn nesting_up_to_the_limit_is_accepted() {
        let nested = format!("{}fast < slow{}", "(".repeat(64), ")".repeat(64));
        assert!(accepts(&nested, &ints(1, 2)));
        assert!(accepts(&format!("{}fast < slow", "! !".repeat(32)), &ints(1, 2)));
    }

    #[test]
    fn long_operator_chain_is_rejected() {
        let chain = format!("{} > 0", vec!["fast"; 2_000].join(" + "));
        assert!(parse_error(&chain).contains("more than the limit"));
    }

    #[test]
    fn chained_comparison_is_rejected() {
        assert!(Constraint::parse("fast < slow < k", &names()).is_err());
    }

    #[test]
    fn errors_map_to_invalid_constraint_code() {
        let err = Constraint::parse("fast <", &names()).unwrap_err();
        assert_eq!(err.code(), "invalid_constraint");
    }
}
