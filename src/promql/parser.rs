//! Recursive-descent parser with precedence climbing for binary operators.

use super::ast::{
    AggregateExpr, AtModifier, BinOp, BinaryExpr, Expr, Group, GroupSide, Grouping, LabelMatcher,
    MatchOp, MatrixSelector, OffsetModifier, Subquery, UnaryOp, VectorMatching, VectorSelector,
};
use super::lexer::{lex, Token};
use super::ParseError;

const AGGREGATORS: [&str; 14] = [
    "sum",
    "min",
    "max",
    "avg",
    "group",
    "stddev",
    "stdvar",
    "count",
    "count_values",
    "bottomk",
    "topk",
    "quantile",
    "limitk",
    "limit_ratio",
];

/// Parse a full query expression.
pub fn parse_expr(input: &str) -> Result<Expr, ParseError> {
    let tokens = lex(input)?;
    let mut parser = Parser::new(tokens, input.len());
    let expr = parser.expr(0)?;
    parser.expect_eof()?;
    Ok(expr)
}

/// Parse a metric selector as accepted by `match[]` parameters: a bare metric
/// name, a brace-delimited matcher list, or both. The metric name is folded
/// into a `__name__` matcher so the selector can be re-serialized uniformly
/// as `{...}`.
pub fn parse_selector(input: &str) -> Result<Vec<LabelMatcher>, ParseError> {
    let tokens = lex(input)?;
    let mut parser = Parser::new(tokens, input.len());

    let name = match parser.peek() {
        Some(Token::Ident(_)) => Some(parser.expect_ident("metric name")?),
        _ => None,
    };
    let mut matchers = if matches!(parser.peek(), Some(Token::LBrace)) {
        parser.label_matchers()?
    } else {
        Vec::new()
    };
    if name.is_none() && matchers.is_empty() {
        return Err(ParseError::at(
            0,
            "vector selector must contain at least one non-empty matcher",
        ));
    }
    parser.expect_eof()?;

    if let Some(name) = name {
        matchers.insert(0, LabelMatcher::new(MatchOp::Equal, "__name__", name));
    }
    Ok(matchers)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    idx: usize,
    eof_pos: usize,
}

impl Parser {
    fn new(tokens: Vec<(Token, usize)>, eof_pos: usize) -> Self {
        Self {
            tokens,
            idx: 0,
            eof_pos,
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.idx).map(|(t, _)| t)
    }

    fn pos(&self) -> usize {
        self.tokens
            .get(self.idx)
            .map(|(_, p)| *p)
            .unwrap_or(self.eof_pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.idx).map(|(t, _)| t.clone());
        if token.is_some() {
            self.idx += 1;
        }
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(keyword))
    }

    fn eat_keyword(&mut self, keyword: &str) -> bool {
        if self.peek_keyword(keyword) {
            self.idx += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, token: &Token, what: &str) -> Result<(), ParseError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.unexpected(what))
        }
    }

    fn expect_ident(&mut self, what: &str) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Ident(s)) => {
                let s = s.clone();
                self.idx += 1;
                Ok(s)
            }
            _ => Err(self.unexpected(what)),
        }
    }

    fn expect_duration(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Some(Token::Duration(d)) => {
                let d = d.clone();
                self.idx += 1;
                Ok(d)
            }
            _ => Err(self.unexpected("duration")),
        }
    }

    fn expect_eof(&self) -> Result<(), ParseError> {
        match self.peek() {
            None => Ok(()),
            Some(t) => Err(ParseError::at(
                self.pos(),
                format!("unexpected {} after expression", t.describe()),
            )),
        }
    }

    fn unexpected(&self, what: &str) -> ParseError {
        match self.peek() {
            Some(t) => ParseError::at(
                self.pos(),
                format!("unexpected {}, expected {}", t.describe(), what),
            ),
            None => ParseError::at(self.pos(), format!("unexpected end of input, expected {}", what)),
        }
    }

    // Precedence climbing over binary operators.
    fn expr(&mut self, min_prec: u8) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;

        while let Some(op) = self.peek_binop() {
            let (prec, right_assoc) = op.precedence();
            if prec < min_prec {
                break;
            }
            self.idx += 1;
            let return_bool = op.is_comparison() && self.eat_keyword("bool");
            let matching = self.vector_matching()?;
            let next_min = if right_assoc { prec } else { prec + 1 };
            let rhs = self.expr(next_min)?;
            lhs = Expr::Binary(Box::new(BinaryExpr {
                op,
                lhs,
                rhs,
                return_bool,
                matching,
            }));
        }

        Ok(lhs)
    }

    fn peek_binop(&self) -> Option<BinOp> {
        match self.peek()? {
            Token::Add => Some(BinOp::Add),
            Token::Sub => Some(BinOp::Sub),
            Token::Mul => Some(BinOp::Mul),
            Token::Div => Some(BinOp::Div),
            Token::Mod => Some(BinOp::Mod),
            Token::Pow => Some(BinOp::Pow),
            Token::EqlEql => Some(BinOp::Eql),
            Token::Neq => Some(BinOp::Neq),
            Token::Lt => Some(BinOp::Lt),
            Token::Lte => Some(BinOp::Lte),
            Token::Gt => Some(BinOp::Gt),
            Token::Gte => Some(BinOp::Gte),
            Token::Ident(s) if s.eq_ignore_ascii_case("and") => Some(BinOp::And),
            Token::Ident(s) if s.eq_ignore_ascii_case("or") => Some(BinOp::Or),
            Token::Ident(s) if s.eq_ignore_ascii_case("unless") => Some(BinOp::Unless),
            Token::Ident(s) if s.eq_ignore_ascii_case("atan2") => Some(BinOp::Atan2),
            _ => None,
        }
    }

    fn vector_matching(&mut self) -> Result<Option<VectorMatching>, ParseError> {
        let on = if self.eat_keyword("on") {
            true
        } else if self.eat_keyword("ignoring") {
            false
        } else {
            return Ok(None);
        };
        let labels = self.label_list()?;

        let side = if self.eat_keyword("group_left") {
            Some(GroupSide::Left)
        } else if self.eat_keyword("group_right") {
            Some(GroupSide::Right)
        } else {
            None
        };
        let group = match side {
            Some(side) => {
                let labels = if matches!(self.peek(), Some(Token::LParen)) {
                    self.label_list()?
                } else {
                    Vec::new()
                };
                Some(Group { side, labels })
            }
            None => None,
        };

        Ok(Some(VectorMatching { on, labels, group }))
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        let op = match self.peek() {
            Some(Token::Add) => Some(UnaryOp::Plus),
            Some(Token::Sub) => Some(UnaryOp::Minus),
            _ => None,
        };
        if let Some(op) = op {
            self.idx += 1;
            // The operand may absorb a `^`: -a^2 parses as -(a^2).
            let expr = self.expr(6)?;
            return Ok(Expr::Unary {
                op,
                expr: Box::new(expr),
            });
        }
        self.postfix()
    }

    // Atom followed by any number of range/subquery/offset/@ modifiers.
    fn postfix(&mut self) -> Result<Expr, ParseError> {
        let mut expr = self.atom()?;

        loop {
            if self.eat(&Token::LBracket) {
                let range = self.expect_duration()?;
                if self.eat(&Token::Colon) {
                    let step = match self.peek() {
                        Some(Token::Duration(_)) => Some(self.expect_duration()?),
                        _ => None,
                    };
                    self.expect(&Token::RBracket, "']'")?;
                    expr = Expr::Subquery(Subquery {
                        expr: Box::new(expr),
                        range,
                        step,
                        offset: None,
                        at: None,
                    });
                } else {
                    self.expect(&Token::RBracket, "']' or ':'")?;
                    expr = match expr {
                        Expr::Vector(vs) if vs.offset.is_none() && vs.at.is_none() => {
                            Expr::Matrix(MatrixSelector {
                                selector: vs,
                                range,
                                offset: None,
                                at: None,
                            })
                        }
                        _ => {
                            return Err(ParseError::at(
                                self.pos(),
                                "range specification must be preceded by an instant vector selector",
                            ));
                        }
                    };
                }
            } else if self.peek_keyword("offset") {
                self.idx += 1;
                let negative = self.eat(&Token::Sub);
                let duration = self.expect_duration()?;
                let modifier = if negative {
                    OffsetModifier::Neg(duration)
                } else {
                    OffsetModifier::Pos(duration)
                };
                self.attach_offset(&mut expr, modifier)?;
            } else if self.eat(&Token::At) {
                let at = if self.eat_keyword("start") {
                    self.expect(&Token::LParen, "'('")?;
                    self.expect(&Token::RParen, "')'")?;
                    AtModifier::Start
                } else if self.eat_keyword("end") {
                    self.expect(&Token::LParen, "'('")?;
                    self.expect(&Token::RParen, "')'")?;
                    AtModifier::End
                } else {
                    let negative = self.eat(&Token::Sub);
                    match self.advance() {
                        Some(Token::Number(n)) => {
                            let raw = if negative { format!("-{}", n) } else { n };
                            AtModifier::Timestamp(raw)
                        }
                        _ => return Err(self.unexpected("timestamp, start() or end()")),
                    }
                };
                self.attach_at(&mut expr, at)?;
            } else {
                break;
            }
        }

        Ok(expr)
    }

    fn attach_offset(&mut self, expr: &mut Expr, modifier: OffsetModifier) -> Result<(), ParseError> {
        let slot = match expr {
            Expr::Vector(vs) => &mut vs.offset,
            Expr::Matrix(m) => &mut m.offset,
            Expr::Subquery(sq) => &mut sq.offset,
            _ => {
                return Err(ParseError::at(
                    self.pos(),
                    "offset modifier must be preceded by a selector or subquery",
                ));
            }
        };
        if slot.is_some() {
            return Err(ParseError::at(self.pos(), "offset may not be set multiple times"));
        }
        *slot = Some(modifier);
        Ok(())
    }

    fn attach_at(&mut self, expr: &mut Expr, at: AtModifier) -> Result<(), ParseError> {
        let slot = match expr {
            Expr::Vector(vs) => &mut vs.at,
            Expr::Matrix(m) => &mut m.at,
            Expr::Subquery(sq) => &mut sq.at,
            _ => {
                return Err(ParseError::at(
                    self.pos(),
                    "@ modifier must be preceded by a selector or subquery",
                ));
            }
        };
        if slot.is_some() {
            return Err(ParseError::at(self.pos(), "@ may not be set multiple times"));
        }
        *slot = Some(at);
        Ok(())
    }

    fn atom(&mut self) -> Result<Expr, ParseError> {
        match self.peek() {
            Some(Token::LParen) => {
                self.idx += 1;
                let inner = self.expr(0)?;
                self.expect(&Token::RParen, "')'")?;
                Ok(Expr::Paren(Box::new(inner)))
            }
            Some(Token::Number(_)) => match self.advance() {
                Some(Token::Number(raw)) => Ok(Expr::Number(raw)),
                _ => unreachable!(),
            },
            Some(Token::Str(_)) => match self.advance() {
                Some(Token::Str(raw)) => Ok(Expr::String(raw)),
                _ => unreachable!(),
            },
            Some(Token::LBrace) => {
                let matchers = self.label_matchers()?;
                if matchers.is_empty() {
                    return Err(ParseError::at(
                        self.pos(),
                        "vector selector must contain at least one non-empty matcher",
                    ));
                }
                Ok(Expr::Vector(VectorSelector {
                    name: None,
                    matchers,
                    offset: None,
                    at: None,
                }))
            }
            Some(Token::Ident(_)) => {
                let name = self.expect_ident("expression")?;
                if is_aggregator(&name)
                    && (matches!(self.peek(), Some(Token::LParen))
                        || self.peek_keyword("by")
                        || self.peek_keyword("without"))
                {
                    return self.aggregation(name);
                }
                if self.eat(&Token::LParen) {
                    let args = self.call_args()?;
                    return Ok(Expr::Call { func: name, args });
                }
                let matchers = if matches!(self.peek(), Some(Token::LBrace)) {
                    self.label_matchers()?
                } else {
                    Vec::new()
                };
                Ok(Expr::Vector(VectorSelector {
                    name: Some(name),
                    matchers,
                    offset: None,
                    at: None,
                }))
            }
            Some(_) => Err(self.unexpected("expression")),
            None => Err(ParseError::at(self.pos(), "unexpected end of input")),
        }
    }

    fn aggregation(&mut self, op: String) -> Result<Expr, ParseError> {
        let mut grouping = self.grouping()?;
        self.expect(&Token::LParen, "'('")?;
        let args = self.call_args()?;
        if grouping.is_none() {
            grouping = self.grouping()?;
        }
        Ok(Expr::Aggregate(AggregateExpr { op, grouping, args }))
    }

    fn grouping(&mut self) -> Result<Option<Grouping>, ParseError> {
        let without = if self.eat_keyword("by") {
            false
        } else if self.eat_keyword("without") {
            true
        } else {
            return Ok(None);
        };
        let labels = self.label_list()?;
        Ok(Some(Grouping { without, labels }))
    }

    // Arguments of a call or aggregation; the opening paren is already
    // consumed.
    fn call_args(&mut self) -> Result<Vec<Expr>, ParseError> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.expr(0)?);
            if self.eat(&Token::Comma) {
                continue;
            }
            self.expect(&Token::RParen, "')' or ','")?;
            return Ok(args);
        }
    }

    fn label_list(&mut self) -> Result<Vec<String>, ParseError> {
        self.expect(&Token::LParen, "'('")?;
        let mut labels = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(labels);
        }
        loop {
            labels.push(self.expect_ident("label name")?);
            if self.eat(&Token::Comma) {
                if self.eat(&Token::RParen) {
                    return Ok(labels);
                }
                continue;
            }
            self.expect(&Token::RParen, "')' or ','")?;
            return Ok(labels);
        }
    }

    fn label_matchers(&mut self) -> Result<Vec<LabelMatcher>, ParseError> {
        self.expect(&Token::LBrace, "'{'")?;
        let mut matchers = Vec::new();
        if self.eat(&Token::RBrace) {
            return Ok(matchers);
        }
        loop {
            let name = self.expect_ident("label name")?;
            if name.contains(':') {
                return Err(ParseError::at(self.pos(), "invalid label name"));
            }
            let op = match self.advance() {
                Some(Token::Eq) => MatchOp::Equal,
                Some(Token::Neq) => MatchOp::NotEqual,
                Some(Token::EqlRegex) => MatchOp::Regex,
                Some(Token::NeqRegex) => MatchOp::NotRegex,
                _ => return Err(self.unexpected("label matching operator")),
            };
            let value = match self.advance() {
                Some(Token::Str(raw)) => unquote(&raw, self.pos())?,
                _ => return Err(self.unexpected("string literal")),
            };
            matchers.push(LabelMatcher::new(op, name, value));

            if self.eat(&Token::Comma) {
                if self.eat(&Token::RBrace) {
                    return Ok(matchers);
                }
                continue;
            }
            self.expect(&Token::RBrace, "'}' or ','")?;
            return Ok(matchers);
        }
    }
}

fn is_aggregator(name: &str) -> bool {
    AGGREGATORS.iter().any(|a| name.eq_ignore_ascii_case(a))
}

/// Decode a string literal (raw text including quotes) into its value.
fn unquote(raw: &str, pos: usize) -> Result<String, ParseError> {
    if raw.starts_with('`') {
        return Ok(raw[1..raw.len() - 1].to_string());
    }
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some('\'') => out.push('\''),
            Some('/') => out.push('/'),
            Some('x') => out.push(hex_escape(&mut chars, 2, pos)?),
            Some('u') => out.push(hex_escape(&mut chars, 4, pos)?),
            Some('U') => out.push(hex_escape(&mut chars, 8, pos)?),
            _ => return Err(ParseError::at(pos, "invalid escape sequence in string")),
        }
    }
    Ok(out)
}

fn hex_escape(
    chars: &mut std::str::Chars<'_>,
    len: usize,
    pos: usize,
) -> Result<char, ParseError> {
    let mut value = 0u32;
    for _ in 0..len {
        let c = chars
            .next()
            .ok_or_else(|| ParseError::at(pos, "truncated escape sequence in string"))?;
        let digit = c
            .to_digit(16)
            .ok_or_else(|| ParseError::at(pos, "invalid escape sequence in string"))?;
        value = value * 16 + digit;
    }
    char::from_u32(value).ok_or_else(|| ParseError::at(pos, "invalid character escape in string"))
}
