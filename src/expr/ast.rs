use core::fmt;

use crate::model::QName;

// Expression AST
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Literal(String),
    Path(LocationPath),
    /// Primary expression followed by predicates and further steps,
    /// e.g. `instance('x')/root/item[2]`.
    Filter {
        primary: Box<Expr>,
        predicates: Vec<Expr>,
        steps: Vec<Step>,
    },
    FunctionCall {
        name: String,
        args: Vec<Expr>,
    },
    Binary {
        op: BinaryOperator,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Negate(Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocationPath {
    pub absolute: bool,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub axis: Axis,
    pub test: NodeTest,
    pub predicates: Vec<Expr>,
}

impl Step {
    pub fn child(name: QName) -> Self {
        Self {
            axis: Axis::Child,
            test: NodeTest::Name(name),
            predicates: Vec::new(),
        }
    }

    /// Child step with a plain name test and no predicates.
    pub fn child_name(&self) -> Option<&QName> {
        match (&self.axis, &self.test) {
            (Axis::Child, NodeTest::Name(name)) => Some(name),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum Axis {
    Child,
    Attribute,
    #[strum(serialize = "self")]
    SelfAxis,
    Parent,
    Descendant,
    DescendantOrSelf,
    Ancestor,
    AncestorOrSelf,
    FollowingSibling,
    PrecedingSibling,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeTest {
    Name(QName),
    /// `*` or `prefix:*`
    Wildcard(Option<String>),
    AnyNode,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOperator {
    Or,
    And,
    Equal,
    NotEqual,
    LessThan,
    LessThanEqual,
    GreaterThan,
    GreaterThanEqual,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Union,
}

impl BinaryOperator {
    fn precedence(&self) -> u8 {
        match self {
            BinaryOperator::Or => 1,
            BinaryOperator::And => 2,
            BinaryOperator::Equal | BinaryOperator::NotEqual => 3,
            BinaryOperator::LessThan
            | BinaryOperator::LessThanEqual
            | BinaryOperator::GreaterThan
            | BinaryOperator::GreaterThanEqual => 4,
            BinaryOperator::Add | BinaryOperator::Subtract => 5,
            BinaryOperator::Multiply | BinaryOperator::Divide | BinaryOperator::Modulo => 6,
            BinaryOperator::Union => 8,
        }
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinaryOperator::Or => "or",
            BinaryOperator::And => "and",
            BinaryOperator::Equal => "=",
            BinaryOperator::NotEqual => "!=",
            BinaryOperator::LessThan => "<",
            BinaryOperator::LessThanEqual => "<=",
            BinaryOperator::GreaterThan => ">",
            BinaryOperator::GreaterThanEqual => ">=",
            BinaryOperator::Add => "+",
            BinaryOperator::Subtract => "-",
            BinaryOperator::Multiply => "*",
            BinaryOperator::Divide => "div",
            BinaryOperator::Modulo => "mod",
            BinaryOperator::Union => "|",
        }
    }
}

impl Expr {
    pub fn path(absolute: bool, steps: Vec<Step>) -> Self {
        Expr::Path(LocationPath { absolute, steps })
    }

    pub fn binary(op: BinaryOperator, left: Expr, right: Expr) -> Self {
        Expr::Binary {
            op,
            left: Box::new(left),
            right: Box::new(right),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            Expr::Binary { op, .. } => op.precedence(),
            Expr::Negate(_) => 7,
            _ => 9,
        }
    }

    /// Visits this expression and every sub-expression, including predicates.
    pub fn walk(&self, visit: &mut dyn FnMut(&Expr)) {
        visit(self);
        match self {
            Expr::Path(path) => walk_steps(&path.steps, visit),
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                primary.walk(visit);
                predicates.iter().for_each(|p| p.walk(visit));
                walk_steps(steps, visit);
            }
            Expr::FunctionCall { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Negate(inner) => inner.walk(visit),
            Expr::Number(_) | Expr::Literal(_) => {}
        }
    }
}

fn walk_steps(steps: &[Step], visit: &mut dyn FnMut(&Expr)) {
    for step in steps {
        for predicate in &step.predicates {
            predicate.walk(visit);
        }
    }
}

pub(crate) fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Expr::Number(n) => write!(f, "{}", format_number(*n)),
            Expr::Literal(s) => {
                if s.contains('\'') {
                    write!(f, "\"{}\"", s)
                } else {
                    write!(f, "'{}'", s)
                }
            }
            Expr::Path(path) => write!(f, "{}", path),
            Expr::Filter {
                primary,
                predicates,
                steps,
            } => {
                match primary.as_ref() {
                    Expr::FunctionCall { .. } | Expr::Literal(_) | Expr::Number(_) => {
                        write!(f, "{}", primary)?
                    }
                    other => write!(f, "({})", other)?,
                }
                for predicate in predicates {
                    write!(f, "[{}]", predicate)?;
                }
                for step in steps {
                    write!(f, "/{}", step)?;
                }
                Ok(())
            }
            Expr::FunctionCall { name, args } => {
                let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
                write!(f, "{}({})", name, args.join(", "))
            }
            Expr::Binary { op, left, right } => {
                let prec = op.precedence();
                if left.precedence() < prec {
                    write!(f, "({})", left)?;
                } else {
                    write!(f, "{}", left)?;
                }
                write!(f, " {} ", op.symbol())?;
                if right.precedence() <= prec {
                    write!(f, "({})", right)
                } else {
                    write!(f, "{}", right)
                }
            }
            Expr::Negate(inner) => {
                if inner.precedence() < 7 {
                    write!(f, "-({})", inner)
                } else {
                    write!(f, "-{}", inner)
                }
            }
        }
    }
}

impl fmt::Display for LocationPath {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.absolute {
            write!(f, "/")?;
        }
        let steps: Vec<String> = self.steps.iter().map(|s| s.to_string()).collect();
        write!(f, "{}", steps.join("/"))
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.axis, &self.test) {
            (Axis::SelfAxis, NodeTest::AnyNode) => write!(f, ".")?,
            (Axis::Parent, NodeTest::AnyNode) => write!(f, "..")?,
            (Axis::Child, test) => write!(f, "{}", test)?,
            (Axis::Attribute, test) => write!(f, "@{}", test)?,
            (axis, test) => write!(f, "{}::{}", axis, test)?,
        }
        for predicate in &self.predicates {
            write!(f, "[{}]", predicate)?;
        }
        Ok(())
    }
}

impl fmt::Display for NodeTest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NodeTest::Name(name) => write!(f, "{}", name),
            NodeTest::Wildcard(Some(prefix)) => write!(f, "{}:*", prefix),
            NodeTest::Wildcard(None) => write!(f, "*"),
            NodeTest::AnyNode => write!(f, "node()"),
            NodeTest::Text => write!(f, "text()"),
        }
    }
}
