//! Condition expression grammar and evaluation (component C6).
//!
//! spec.md §4.3 specifies the policy-line keyword table but leaves the
//! condition expression syntax itself unspecified. SPEC_FULL.md §4.3 fixes
//! a minimal grammar (boolean connectives, comparisons, glob literals for
//! text variables) sufficient to express the example policies in spec.md
//! §8 — see DESIGN.md, Open Question decision 1.
//!
//! ```text
//! condition   := or_expr
//! or_expr     := and_expr ( "or" and_expr )*
//! and_expr    := cmp_expr ( "and" cmp_expr )*
//! cmp_expr    := "(" or_expr ")" | var cmp_op literal
//! cmp_op      := "==" | "!=" | "<" | "<=" | ">" | ">="
//! var         := identifier
//! literal     := number | quoted-string | bareword (glob pattern)
//! ```

use nom::branch::alt;
use nom::bytes::complete::{escaped, is_not, tag};
use nom::character::complete::{alphanumeric1, char, multispace0};
use nom::combinator::{map, recognize, value};
use nom::multi::many0;
use nom::number::complete::double;
use nom::sequence::{delimited, pair, preceded, tuple};
use nom::IResult;
use regex::Regex;

use crate::error::ConfigurationError;
use crate::inventory::entity::BlockReplica;

/// Variables a condition may reference. The type determines how a literal
/// on the right-hand side is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VarType {
    Text,
    Number,
}

/// Variables that vary with external demand data rather than pure replica
/// state. A condition referencing one of these is not `static` (spec.md
/// §4.3's static/dynamic distinction for caching evaluation results).
const DYNAMIC_VARS: &[&str] = &["demand_weight", "request_count"];

/// Whether `name` is backed by a demand plugin (spec.md §4.3's
/// `used_demand_plugins`); used both for condition variables and sort keys.
pub fn is_demand_variable(name: &str) -> bool {
    DYNAMIC_VARS.contains(&name)
}

pub fn variable_type(name: &str) -> Option<VarType> {
    match name {
        "site_name" | "dataset_name" | "block_name" | "group_name" => Some(VarType::Text),
        "size" | "replica_size" | "num_files" | "time_created" | "time_updated" | "replica_age" | "site_occupancy"
        | "demand_weight" | "request_count" => Some(VarType::Number),
        "is_custodial" => Some(VarType::Number),
        _ => None,
    }
}

/// Extracts a variable's value for a given replica. `now` is the reference
/// time used to compute `replica_age`.
///
/// `On`/`When`/`Until` lines are, in the original, conditions over a `Site`
/// rather than a `BlockReplica` (`detox.condition.SiteCondition` vs.
/// `ReplicaCondition`, in `detox/condition.py` — not present in the
/// retrieval pack's `original_source/`, only `policy.py` is). Rather than
/// invent a second condition grammar to match a module this crate can't
/// see, site-level lines are evaluated against a throwaway replica anchored
/// to the real site (see `Policy::applies_to_site`/`triggers_deletion_at`),
/// and `site_occupancy` resolves through the replica's site back-reference.
pub fn variable_value(name: &str, replica: &BlockReplica, now: i64) -> Option<Value> {
    match name {
        "site_name" => Some(Value::Text(replica.site_name.clone())),
        "dataset_name" => Some(Value::Text(replica.dataset_name.clone())),
        "block_name" => Some(Value::Text(replica.block_name.clone())),
        "group_name" => Some(Value::Text(
            replica.group.borrow().as_ref().map(|g| g.name.clone()).unwrap_or_default(),
        )),
        "size" | "replica_size" => Some(Value::Number(replica.block_size() as f64)),
        "num_files" => replica.block.upgrade().map(|b| Value::Number(b.num_files() as f64)),
        "time_created" => Some(Value::Number(replica.time_created.get() as f64)),
        "time_updated" => Some(Value::Number(replica.time_updated.get() as f64)),
        "replica_age" => Some(Value::Number((now - replica.time_created.get()) as f64)),
        "site_occupancy" => Some(Value::Number(replica.site.upgrade().map(|s| s.occupancy() as f64).unwrap_or(0.0))),
        "is_custodial" => Some(Value::Number(if replica.is_custodial.get() { 1.0 } else { 0.0 })),
        "demand_weight" | "request_count" => Some(Value::Number(0.0)),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub enum Value {
    Text(String),
    Number(f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub enum Literal {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(String, CmpOp, Literal),
}

impl Expr {
    pub fn parse(input: &str) -> Result<Expr, ConfigurationError> {
        match or_expr(input.trim()) {
            Ok((rest, expr)) if rest.trim().is_empty() => Ok(expr),
            Ok((rest, _)) => Err(ConfigurationError::ConditionParseError(format!("trailing input: '{}'", rest))),
            Err(e) => Err(ConfigurationError::ConditionParseError(e.to_string())),
        }
    }

    /// True if this expression references no variable whose value depends
    /// on external demand data — such expressions' results may be cached
    /// across evaluation rounds (spec.md §4.3).
    pub fn is_static(&self) -> bool {
        match self {
            Expr::And(a, b) | Expr::Or(a, b) => a.is_static() && b.is_static(),
            Expr::Cmp(var, _, _) => !DYNAMIC_VARS.contains(&var.as_str()),
        }
    }

    /// Demand-plugin-backed variables this expression references (spec.md
    /// §4.3: "The parser accumulates `used_demand_plugins` across all
    /// conditions and the sort key"). A variable name doubles as its
    /// plugin's name, since this crate has no separate plugin registry.
    pub fn demand_plugins(&self) -> Vec<&str> {
        match self {
            Expr::And(a, b) | Expr::Or(a, b) => {
                let mut vars = a.demand_plugins();
                vars.extend(b.demand_plugins());
                vars
            }
            Expr::Cmp(var, _, _) => {
                if DYNAMIC_VARS.contains(&var.as_str()) {
                    vec![var.as_str()]
                } else {
                    Vec::new()
                }
            }
        }
    }

    pub fn evaluate(&self, replica: &BlockReplica, now: i64) -> Result<bool, ConfigurationError> {
        match self {
            Expr::And(a, b) => Ok(a.evaluate(replica, now)? && b.evaluate(replica, now)?),
            Expr::Or(a, b) => Ok(a.evaluate(replica, now)? || b.evaluate(replica, now)?),
            Expr::Cmp(var, op, literal) => evaluate_cmp(var, *op, literal, replica, now),
        }
    }
}

fn evaluate_cmp(var: &str, op: CmpOp, literal: &Literal, replica: &BlockReplica, now: i64) -> Result<bool, ConfigurationError> {
    let vtype = variable_type(var).ok_or_else(|| ConfigurationError::UnknownVariable(var.to_string()))?;
    let value = variable_value(var, replica, now).ok_or_else(|| ConfigurationError::UnknownVariable(var.to_string()))?;

    match (vtype, value, literal) {
        (VarType::Number, Value::Number(n), Literal::Number(l)) => Ok(match op {
            CmpOp::Eq => (n - l).abs() < f64::EPSILON,
            CmpOp::Ne => (n - l).abs() >= f64::EPSILON,
            CmpOp::Lt => n < *l,
            CmpOp::Le => n <= *l,
            CmpOp::Gt => n > *l,
            CmpOp::Ge => n >= *l,
        }),
        (VarType::Text, Value::Text(s), Literal::Text(pattern)) => {
            let matched = glob_match(pattern, &s);
            match op {
                CmpOp::Eq => Ok(matched),
                CmpOp::Ne => Ok(!matched),
                _ => Err(ConfigurationError::ConditionParseError(format!(
                    "ordering comparisons are not defined for text variable '{}'",
                    var
                ))),
            }
        }
        _ => Err(ConfigurationError::ConditionParseError(format!(
            "type mismatch comparing variable '{}'",
            var
        ))),
    }
}

/// `fnmatch`-style glob match (`*` any run, `?` single char), used for
/// `==`/`!=` against TEXT variables (spec.md §8's `site_name == "*"` and
/// `dataset_name == "/keep/me/*"` examples).
fn glob_match(pattern: &str, text: &str) -> bool {
    let regex_str = format!(
        "^{}$",
        regex::escape(pattern).replace("\\*", ".*").replace("\\?", ".")
    );
    Regex::new(&regex_str).map(|re| re.is_match(text)).unwrap_or(false)
}

// ---------------------------------------------------------------------
// nom grammar
// ---------------------------------------------------------------------

fn ws<'a, F, O>(inner: F) -> impl Fn(&'a str) -> IResult<&'a str, O>
where
    F: Fn(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn identifier(input: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((nom::character::complete::alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

fn or_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("or")), and_expr))(input)?;
    Ok((input, rest.into_iter().fold(first, |acc, e| Expr::Or(Box::new(acc), Box::new(e)))))
}

fn and_expr(input: &str) -> IResult<&str, Expr> {
    let (input, first) = cmp_expr(input)?;
    let (input, rest) = many0(preceded(ws(tag("and")), cmp_expr))(input)?;
    Ok((input, rest.into_iter().fold(first, |acc, e| Expr::And(Box::new(acc), Box::new(e)))))
}

fn cmp_expr(input: &str) -> IResult<&str, Expr> {
    alt((
        delimited(ws(char('(')), or_expr, ws(char(')'))),
        map(tuple((ws(identifier), ws(cmp_op), ws(literal))), |(var, op, lit)| {
            Expr::Cmp(var.to_string(), op, lit)
        }),
    ))(input)
}

fn cmp_op(input: &str) -> IResult<&str, CmpOp> {
    alt((
        value(CmpOp::Eq, tag("==")),
        value(CmpOp::Ne, tag("!=")),
        value(CmpOp::Le, tag("<=")),
        value(CmpOp::Ge, tag(">=")),
        value(CmpOp::Lt, tag("<")),
        value(CmpOp::Gt, tag(">")),
    ))(input)
}

fn quoted_string(input: &str) -> IResult<&str, &str> {
    delimited(char('"'), escaped(is_not("\"\\"), '\\', nom::character::complete::anychar), char('"'))(input)
}

fn bareword(input: &str) -> IResult<&str, &str> {
    recognize(nom::multi::many1(nom::character::complete::none_of(" \t\r\n()\"")))(input)
}

fn literal(input: &str) -> IResult<&str, Literal> {
    alt((
        map(quoted_string, |s: &str| Literal::Text(s.to_string())),
        map(double, Literal::Number),
        map(bareword, |s: &str| Literal::Text(s.to_string())),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::entity::{Block, Dataset, Site};

    fn sample_replica(site_name: &str, dataset_name: &str) -> std::rc::Rc<BlockReplica> {
        let site = Site::new(site_name, "h".into(), "disk".into(), "gfal2".into());
        let dataset = Dataset::new(dataset_name);
        let block = Block::new(&dataset, "0", 100, 1, false, 0, 1);
        BlockReplica::new(&block, &site, None, false, 0, 0)
    }

    #[test]
    fn parses_and_evaluates_glob_equality() {
        let expr = Expr::parse("site_name == T2_*").unwrap();
        let replica = sample_replica("T2_US_Foo", "/a/b/c");
        assert!(expr.evaluate(&replica, 0).unwrap());
        let replica2 = sample_replica("T1_CH_Bar", "/a/b/c");
        assert!(!expr.evaluate(&replica2, 0).unwrap());
    }

    #[test]
    fn parses_and_and_or_with_precedence() {
        let expr = Expr::parse("size > 10 and size < 200 or site_name == T3_*").unwrap();
        let replica = sample_replica("T3_Any", "/a/b/c");
        assert!(expr.evaluate(&replica, 0).unwrap());
    }

    #[test]
    fn parenthesized_expression_groups_or_before_and() {
        let expr = Expr::parse("(site_name == T1_* or site_name == T2_*) and size >= 100").unwrap();
        let replica = sample_replica("T2_US_Foo", "/a/b/c");
        assert!(expr.evaluate(&replica, 0).unwrap());
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let expr = Expr::parse("bogus_var == 1").unwrap();
        let replica = sample_replica("T2_US_Foo", "/a/b/c");
        assert!(expr.evaluate(&replica, 0).is_err());
    }

    #[test]
    fn static_detection_flags_dynamic_variables() {
        let static_expr = Expr::parse("size > 1").unwrap();
        let dynamic_expr = Expr::parse("demand_weight > 1").unwrap();
        assert!(static_expr.is_static());
        assert!(!dynamic_expr.is_static());
    }
}
