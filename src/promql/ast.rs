//! Expression tree for the query language.
//!
//! The tree is produced by [`crate::promql::parse_expr`], mutated in place by
//! the label enforcer, and serialized back to text via `Display`. Numbers,
//! strings and durations keep their original spelling so that untouched parts
//! of a query round-trip unchanged.

use std::fmt;

/// Comparison operator of a label matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchOp {
    Equal,
    NotEqual,
    Regex,
    NotRegex,
}

impl MatchOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchOp::Equal => "=",
            MatchOp::NotEqual => "!=",
            MatchOp::Regex => "=~",
            MatchOp::NotRegex => "!~",
        }
    }
}

/// A single `name<op>"value"` matcher inside a selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelMatcher {
    pub op: MatchOp,
    pub name: String,
    pub value: String,
}

impl LabelMatcher {
    pub fn new(op: MatchOp, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            op,
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for LabelMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.name, self.op.as_str(), quote(&self.value))
    }
}

/// Quote a matcher value, escaping backslashes, quotes and common control
/// characters.
pub fn quote(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

/// `offset` modifier with its original duration spelling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OffsetModifier {
    Pos(String),
    Neg(String),
}

impl fmt::Display for OffsetModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OffsetModifier::Pos(d) => write!(f, "offset {}", d),
            OffsetModifier::Neg(d) => write!(f, "offset -{}", d),
        }
    }
}

/// `@` modifier: a literal timestamp or the `start()`/`end()` preprocessors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtModifier {
    Timestamp(String),
    Start,
    End,
}

impl fmt::Display for AtModifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AtModifier::Timestamp(t) => write!(f, "@ {}", t),
            AtModifier::Start => write!(f, "@ start()"),
            AtModifier::End => write!(f, "@ end()"),
        }
    }
}

/// An instant vector selector: optional metric name plus matchers.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorSelector {
    pub name: Option<String>,
    pub matchers: Vec<LabelMatcher>,
    pub offset: Option<OffsetModifier>,
    pub at: Option<AtModifier>,
}

impl fmt::Display for VectorSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = &self.name {
            f.write_str(name)?;
        }
        if !self.matchers.is_empty() || self.name.is_none() {
            f.write_str("{")?;
            for (i, m) in self.matchers.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                write!(f, "{}", m)?;
            }
            f.write_str("}")?;
        }
        if let Some(at) = &self.at {
            write!(f, " {}", at)?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " {}", offset)?;
        }
        Ok(())
    }
}

/// A range vector selector, e.g. `up[5m]`.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixSelector {
    pub selector: VectorSelector,
    pub range: String,
    pub offset: Option<OffsetModifier>,
    pub at: Option<AtModifier>,
}

impl fmt::Display for MatrixSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.selector, self.range)?;
        if let Some(at) = &self.at {
            write!(f, " {}", at)?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " {}", offset)?;
        }
        Ok(())
    }
}

/// A subquery, e.g. `rate(x[5m])[30m:1m]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Subquery {
    pub expr: Box<Expr>,
    pub range: String,
    pub step: Option<String>,
    pub offset: Option<OffsetModifier>,
    pub at: Option<AtModifier>,
}

impl fmt::Display for Subquery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}:", self.expr, self.range)?;
        if let Some(step) = &self.step {
            f.write_str(step)?;
        }
        f.write_str("]")?;
        if let Some(at) = &self.at {
            write!(f, " {}", at)?;
        }
        if let Some(offset) = &self.offset {
            write!(f, " {}", offset)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Plus,
    Minus,
}

impl UnaryOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnaryOp::Plus => "+",
            UnaryOp::Minus => "-",
        }
    }
}

/// Binary operators, in all precedence classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Atan2,
    Eql,
    Neq,
    Lt,
    Gt,
    Lte,
    Gte,
    And,
    Or,
    Unless,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Pow => "^",
            BinOp::Atan2 => "atan2",
            BinOp::Eql => "==",
            BinOp::Neq => "!=",
            BinOp::Lt => "<",
            BinOp::Gt => ">",
            BinOp::Lte => "<=",
            BinOp::Gte => ">=",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Unless => "unless",
        }
    }

    /// Precedence class (higher binds tighter) and right-associativity.
    pub fn precedence(&self) -> (u8, bool) {
        match self {
            BinOp::Or => (1, false),
            BinOp::And | BinOp::Unless => (2, false),
            BinOp::Eql | BinOp::Neq | BinOp::Lt | BinOp::Gt | BinOp::Lte | BinOp::Gte => {
                (3, false)
            }
            BinOp::Add | BinOp::Sub => (4, false),
            BinOp::Mul | BinOp::Div | BinOp::Mod | BinOp::Atan2 => (5, false),
            BinOp::Pow => (6, true),
        }
    }

    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinOp::Eql | BinOp::Neq | BinOp::Lt | BinOp::Gt | BinOp::Lte | BinOp::Gte
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSide {
    Left,
    Right,
}

/// `group_left`/`group_right` clause of a vector matching.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub side: GroupSide,
    pub labels: Vec<String>,
}

/// `on`/`ignoring` vector matching with optional grouping.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorMatching {
    pub on: bool,
    pub labels: Vec<String>,
    pub group: Option<Group>,
}

impl fmt::Display for VectorMatching {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = if self.on { "on" } else { "ignoring" };
        write!(f, "{} ({})", keyword, self.labels.join(", "))?;
        if let Some(group) = &self.group {
            let side = match group.side {
                GroupSide::Left => "group_left",
                GroupSide::Right => "group_right",
            };
            if group.labels.is_empty() {
                write!(f, " {} ()", side)?;
            } else {
                write!(f, " {} ({})", side, group.labels.join(", "))?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BinaryExpr {
    pub op: BinOp,
    pub lhs: Expr,
    pub rhs: Expr,
    pub return_bool: bool,
    pub matching: Option<VectorMatching>,
}

/// `by`/`without` grouping of an aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct Grouping {
    pub without: bool,
    pub labels: Vec<String>,
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keyword = if self.without { "without" } else { "by" };
        write!(f, "{} ({})", keyword, self.labels.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregateExpr {
    pub op: String,
    pub grouping: Option<Grouping>,
    pub args: Vec<Expr>,
}

/// A parsed query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(String),
    String(String),
    Vector(VectorSelector),
    Matrix(MatrixSelector),
    Subquery(Subquery),
    Unary { op: UnaryOp, expr: Box<Expr> },
    Binary(Box<BinaryExpr>),
    Paren(Box<Expr>),
    Call { func: String, args: Vec<Expr> },
    Aggregate(AggregateExpr),
}

impl Expr {
    /// Visit every vector selector in the tree (including the ones wrapped in
    /// matrix selectors and subqueries), depth-first.
    pub fn for_each_selector<E>(
        &mut self,
        f: &mut impl FnMut(&mut VectorSelector) -> Result<(), E>,
    ) -> Result<(), E> {
        match self {
            Expr::Number(_) | Expr::String(_) => Ok(()),
            Expr::Vector(vs) => f(vs),
            Expr::Matrix(m) => f(&mut m.selector),
            Expr::Subquery(sq) => sq.expr.for_each_selector(f),
            Expr::Unary { expr, .. } | Expr::Paren(expr) => expr.for_each_selector(f),
            Expr::Binary(b) => {
                b.lhs.for_each_selector(f)?;
                b.rhs.for_each_selector(f)
            }
            Expr::Call { args, .. } => {
                for arg in args {
                    arg.for_each_selector(f)?;
                }
                Ok(())
            }
            Expr::Aggregate(agg) => {
                for arg in &mut agg.args {
                    arg.for_each_selector(f)?;
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Number(raw) | Expr::String(raw) => f.write_str(raw),
            Expr::Vector(vs) => write!(f, "{}", vs),
            Expr::Matrix(m) => write!(f, "{}", m),
            Expr::Subquery(sq) => write!(f, "{}", sq),
            Expr::Unary { op, expr } => write!(f, "{}{}", op.as_str(), expr),
            Expr::Binary(b) => {
                write!(f, "{} {}", b.lhs, b.op.as_str())?;
                if b.return_bool {
                    f.write_str(" bool")?;
                }
                if let Some(matching) = &b.matching {
                    write!(f, " {}", matching)?;
                }
                write!(f, " {}", b.rhs)
            }
            Expr::Paren(expr) => write!(f, "({})", expr),
            Expr::Call { func, args } => {
                write!(f, "{}(", func)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
            Expr::Aggregate(agg) => {
                f.write_str(&agg.op)?;
                if let Some(grouping) = &agg.grouping {
                    write!(f, " {} ", grouping)?;
                }
                f.write_str("(")?;
                for (i, arg) in agg.args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                f.write_str(")")
            }
        }
    }
}
