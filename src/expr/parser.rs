use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take_while, take_while1},
    character::complete::{char, digit0, digit1, multispace0},
    combinator::{
        all_consuming, map, map_res, not, opt, peek, recognize, success, value, verify,
    },
    multi::{many0, separated_list0},
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use tracing::instrument;

use super::ast::*;
use super::ExprError;
use crate::model::QName;

/// Parses a complete expression. Trailing input is an error.
#[instrument(level = "debug")]
pub fn parse_expression(source: &str) -> Result<Expr, ExprError> {
    match all_consuming(ws(parse_or))(source) {
        Ok((_, expr)) => Ok(expr),
        Err(e) => Err(ExprError::Parse {
            expression: source.to_string(),
            message: e.to_string(),
        }),
    }
}

// or
#[instrument(level = "trace", skip(input))]
fn parse_or(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_and(input)?;
    let (input, rest) = many0(preceded(ws(keyword("or")), parse_and))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |left, right| Expr::binary(BinaryOperator::Or, left, right)),
    ))
}

// and
#[instrument(level = "trace", skip(input))]
fn parse_and(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_equality(input)?;
    let (input, rest) = many0(preceded(ws(keyword("and")), parse_equality))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |left, right| Expr::binary(BinaryOperator::And, left, right)),
    ))
}

// =, !=
#[instrument(level = "trace", skip(input))]
fn parse_equality(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_relational(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOperator::NotEqual, tag("!=")),
            value(BinaryOperator::Equal, tag("=")),
        ))),
        parse_relational,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

// <, <=, >, >=
#[instrument(level = "trace", skip(input))]
fn parse_relational(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_additive(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOperator::LessThanEqual, tag("<=")),
            value(BinaryOperator::GreaterThanEqual, tag(">=")),
            value(BinaryOperator::LessThan, tag("<")),
            value(BinaryOperator::GreaterThan, tag(">")),
        ))),
        parse_additive,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

// +, -
#[instrument(level = "trace", skip(input))]
fn parse_additive(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_multiplicative(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOperator::Add, tag("+")),
            value(BinaryOperator::Subtract, tag("-")),
        ))),
        parse_multiplicative,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

// *, div, mod
#[instrument(level = "trace", skip(input))]
fn parse_multiplicative(input: &str) -> IResult<&str, Expr> {
    let (input, first) = parse_unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinaryOperator::Multiply, tag("*")),
            value(BinaryOperator::Divide, keyword("div")),
            value(BinaryOperator::Modulo, keyword("mod")),
        ))),
        parse_unary,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn fold_binary(first: Expr, rest: Vec<(BinaryOperator, Expr)>) -> Expr {
    rest.into_iter()
        .fold(first, |left, (op, right)| Expr::binary(op, left, right))
}

#[instrument(level = "trace", skip(input))]
fn parse_unary(input: &str) -> IResult<&str, Expr> {
    alt((
        map(preceded(ws(char('-')), parse_unary), |e| {
            Expr::Negate(Box::new(e))
        }),
        parse_union,
    ))(input)
}

#[instrument(level = "trace", skip(input))]
fn parse_union(input: &str) -> IResult<&str, Expr> {
    let (input, first) = ws(parse_path_expr)(input)?;
    let (input, rest) = many0(preceded(ws(char('|')), ws(parse_path_expr)))(input)?;
    Ok((
        input,
        rest.into_iter()
            .fold(first, |left, right| Expr::binary(BinaryOperator::Union, left, right)),
    ))
}

#[instrument(level = "trace", skip(input))]
fn parse_path_expr(input: &str) -> IResult<&str, Expr> {
    alt((parse_filter_expr, map(parse_location_path, Expr::Path)))(input)
}

/// Primary expression with optional predicates and trailing steps.
#[instrument(level = "trace", skip(input))]
fn parse_filter_expr(input: &str) -> IResult<&str, Expr> {
    let (input, primary) = parse_primary(input)?;
    let (input, predicates) = many0(parse_predicate)(input)?;
    let (input, steps) = opt(parse_trailing_steps)(input)?;
    let steps = steps.unwrap_or_default();
    if predicates.is_empty() && steps.is_empty() {
        return Ok((input, primary));
    }
    Ok((
        input,
        Expr::Filter {
            primary: Box::new(primary),
            predicates,
            steps,
        },
    ))
}

fn parse_trailing_steps(input: &str) -> IResult<&str, Vec<Step>> {
    let (input, separator) = alt((tag("//"), tag("/")))(input)?;
    let (input, mut steps) = parse_relative_steps(input)?;
    if separator == "//" {
        steps.insert(0, descendant_or_self());
    }
    Ok((input, steps))
}

#[instrument(level = "trace", skip(input))]
fn parse_primary(input: &str) -> IResult<&str, Expr> {
    alt((
        delimited(ws(char('(')), parse_or, ws(char(')'))),
        map(parse_literal, Expr::Literal),
        map(parse_number, Expr::Number),
        parse_function_call,
    ))(input)
}

#[instrument(level = "trace", skip(input))]
fn parse_function_call(input: &str) -> IResult<&str, Expr> {
    let (input, name) = verify(function_name, |name: &str| {
        !matches!(name, "node" | "text" | "comment" | "processing-instruction")
    })(input)?;
    let (input, args) = delimited(
        ws(char('(')),
        separated_list0(ws(char(',')), ws(parse_or)),
        ws(char(')')),
    )(input)?;
    Ok((
        input,
        Expr::FunctionCall {
            name: name.to_string(),
            args,
        },
    ))
}

fn function_name(input: &str) -> IResult<&str, &str> {
    terminated(
        recognize(pair(ncname, opt(pair(single_colon, ncname)))),
        peek(preceded(multispace0, char('('))),
    )(input)
}

fn parse_literal(input: &str) -> IResult<&str, String> {
    map(
        alt((
            delimited(char('\''), opt(is_not("'")), char('\'')),
            delimited(char('"'), opt(is_not("\"")), char('"')),
        )),
        |s: Option<&str>| s.unwrap_or_default().to_string(),
    )(input)
}

fn parse_number(input: &str) -> IResult<&str, f64> {
    map_res(
        alt((
            recognize(tuple((digit1, opt(pair(char('.'), digit0))))),
            recognize(pair(char('.'), digit1)),
        )),
        |s: &str| s.parse::<f64>(),
    )(input)
}

#[instrument(level = "trace", skip(input))]
fn parse_location_path(input: &str) -> IResult<&str, LocationPath> {
    alt((
        map(preceded(tag("//"), parse_relative_steps), |mut steps| {
            steps.insert(0, descendant_or_self());
            LocationPath {
                absolute: true,
                steps,
            }
        }),
        map(preceded(char('/'), opt(parse_relative_steps)), |steps| {
            LocationPath {
                absolute: true,
                steps: steps.unwrap_or_default(),
            }
        }),
        map(parse_relative_steps, |steps| LocationPath {
            absolute: false,
            steps,
        }),
    ))(input)
}

fn parse_relative_steps(input: &str) -> IResult<&str, Vec<Step>> {
    let (mut input, first) = parse_step(input)?;
    let mut steps = vec![first];
    loop {
        let separator: IResult<&str, &str> = alt((tag("//"), tag("/")))(input);
        let Ok((rest, separator)) = separator else {
            break;
        };
        let (rest, step) = parse_step(rest)?;
        if separator == "//" {
            steps.push(descendant_or_self());
        }
        steps.push(step);
        input = rest;
    }
    Ok((input, steps))
}

#[instrument(level = "trace", skip(input))]
fn parse_step(input: &str) -> IResult<&str, Step> {
    alt((
        value(
            Step {
                axis: Axis::Parent,
                test: NodeTest::AnyNode,
                predicates: Vec::new(),
            },
            tag(".."),
        ),
        value(
            Step {
                axis: Axis::SelfAxis,
                test: NodeTest::AnyNode,
                predicates: Vec::new(),
            },
            terminated(char('.'), not(peek(digit1))),
        ),
        map(
            tuple((parse_axis, parse_node_test, many0(parse_predicate))),
            |(axis, test, predicates)| Step {
                axis,
                test,
                predicates,
            },
        ),
    ))(input)
}

fn parse_axis(input: &str) -> IResult<&str, Axis> {
    alt((
        value(Axis::Attribute, char('@')),
        map_res(terminated(ncname, tag("::")), |name: &str| name.parse::<Axis>()),
        success(Axis::Child),
    ))(input)
}

fn parse_node_test(input: &str) -> IResult<&str, NodeTest> {
    alt((
        value(
            NodeTest::AnyNode,
            tuple((tag("node"), ws(char('(')), char(')'))),
        ),
        value(
            NodeTest::Text,
            tuple((tag("text"), ws(char('(')), char(')'))),
        ),
        value(NodeTest::Wildcard(None), char('*')),
        map(terminated(ncname, tag(":*")), |prefix| {
            NodeTest::Wildcard(Some(prefix.to_string()))
        }),
        map(qname, NodeTest::Name),
    ))(input)
}

fn parse_predicate(input: &str) -> IResult<&str, Expr> {
    delimited(ws(char('[')), ws(parse_or), ws(char(']')))(input)
}

fn descendant_or_self() -> Step {
    Step {
        axis: Axis::DescendantOrSelf,
        test: NodeTest::AnyNode,
        predicates: Vec::new(),
    }
}

fn qname(input: &str) -> IResult<&str, QName> {
    map(
        pair(ncname, opt(preceded(single_colon, ncname))),
        |(first, second)| match second {
            Some(local) => QName::prefixed(first, local),
            None => QName::new(first),
        },
    )(input)
}

/// A `:` that is not part of an axis separator.
fn single_colon(input: &str) -> IResult<&str, char> {
    terminated(char(':'), not(peek(char(':'))))(input)
}

fn ncname(input: &str) -> IResult<&str, &str> {
    let start_chars = |c: char| c.is_alphabetic() || c == '_';
    let name_chars = |c: char| c.is_alphanumeric() || c == '_' || c == '-' || c == '.';
    recognize(pair(take_while1(start_chars), take_while(name_chars)))(input)
}

/// Operator keyword that is not the prefix of a longer name.
fn keyword<'a>(word: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, &'a str> {
    terminated(
        tag(word),
        not(peek(take_while1(|c: char| {
            c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == ':'
        }))),
    )
}

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}
