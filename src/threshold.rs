//! Threshold evaluation: pass/fail predicates over a [`MetricSnapshot`].
//!
//! Expressions follow the k6 notation `<aggregation> <op> <number>`:
//!
//! ```text
//! count==0        counter total, or number of trend samples
//! rate>100        counter total per second of run time
//! avg<200         trend mean
//! min>=0 max<5000 trend extremes
//! med<100         trend median
//! p(95)<10000     trend percentile
//! ```
//!
//! Operators are `<`, `<=`, `>`, `>=`, `==` and `!=`. `count` and `rate` on a
//! metric that was never recorded observe `0`; trend aggregations on a metric
//! with no samples have nothing to observe and fail.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{
    aggregate::{MetricSnapshot, Series},
    error::ThresholdParseError,
};

/// Statistic extracted from a metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Count,
    Rate,
    Avg,
    Min,
    Max,
    Med,
    /// Percentile in `(0, 100]`.
    P(f64),
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Count => f.write_str("count"),
            Self::Rate => f.write_str("rate"),
            Self::Avg => f.write_str("avg"),
            Self::Min => f.write_str("min"),
            Self::Max => f.write_str("max"),
            Self::Med => f.write_str("med"),
            Self::P(p) => write!(f, "p({p})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        }
    }

    pub fn holds(self, observed: f64, bound: f64) -> bool {
        match self {
            Self::Lt => observed < bound,
            Self::Le => observed <= bound,
            Self::Gt => observed > bound,
            Self::Ge => observed >= bound,
            Self::Eq => observed == bound,
            Self::Ne => observed != bound,
        }
    }
}

/// A parsed threshold expression such as `p(95)<10000`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ThresholdExpr {
    pub aggregation: Aggregation,
    pub op: Op,
    pub bound: f64,
}

impl fmt::Display for ThresholdExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.aggregation, self.op.as_str(), self.bound)
    }
}

impl From<ThresholdExpr> for String {
    fn from(expr: ThresholdExpr) -> Self {
        expr.to_string()
    }
}

impl TryFrom<String> for ThresholdExpr {
    type Error = ThresholdParseError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        raw.parse()
    }
}

impl FromStr for ThresholdExpr {
    type Err = ThresholdParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_threshold_expr(raw)
    }
}

/// Parse `<aggregation> <op> <number>`; whitespace between the parts is optional.
pub fn parse_threshold_expr(raw: &str) -> Result<ThresholdExpr, ThresholdParseError> {
    let expr: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let op_at = expr
        .find(['<', '>', '=', '!'])
        .ok_or_else(|| ThresholdParseError::new(raw, "missing comparison operator"))?;
    let (lhs, rest) = expr.split_at(op_at);

    let (op, rhs) = [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
    ]
    .into_iter()
    .find_map(|(token, op)| rest.strip_prefix(token).map(|rhs| (op, rhs)))
    .ok_or_else(|| ThresholdParseError::new(raw, "unknown comparison operator"))?;

    let aggregation = parse_aggregation(lhs).ok_or_else(|| {
        ThresholdParseError::new(raw, format!("unknown aggregation `{lhs}`"))
    })?;
    let bound: f64 = rhs
        .parse()
        .ok()
        .filter(|b: &f64| b.is_finite())
        .ok_or_else(|| ThresholdParseError::new(raw, format!("`{rhs}` is not a number")))?;

    Ok(ThresholdExpr {
        aggregation,
        op,
        bound,
    })
}

fn parse_aggregation(raw: &str) -> Option<Aggregation> {
    match raw {
        "count" => Some(Aggregation::Count),
        "rate" => Some(Aggregation::Rate),
        "avg" => Some(Aggregation::Avg),
        "min" => Some(Aggregation::Min),
        "max" => Some(Aggregation::Max),
        "med" => Some(Aggregation::Med),
        _ => {
            let p: f64 = raw.strip_prefix("p(")?.strip_suffix(')')?.parse().ok()?;
            (p > 0.0 && p <= 100.0).then_some(Aggregation::P(p))
        }
    }
}

/// A predicate on one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSpec {
    pub metric: String,
    pub expr: ThresholdExpr,
}

impl ThresholdSpec {
    pub fn new(metric: impl Into<String>, expr: &str) -> Result<Self, ThresholdParseError> {
        Ok(Self {
            metric: metric.into(),
            expr: expr.parse()?,
        })
    }

    /// The value this threshold looks at, if the snapshot has one.
    pub fn observe(&self, snapshot: &MetricSnapshot) -> Option<f64> {
        let series = snapshot.get(&self.metric);
        match (self.expr.aggregation, series) {
            (Aggregation::Count, None) => Some(0.0),
            (Aggregation::Count, Some(Series::Counter(c))) => Some(c.total as f64),
            (Aggregation::Count, Some(Series::Trend(t))) => Some(t.count() as f64),
            (Aggregation::Rate, series) => {
                let secs = snapshot.elapsed().as_secs_f64();
                let total = match series {
                    None => 0.0,
                    Some(Series::Counter(c)) => c.total as f64,
                    Some(Series::Trend(t)) => t.count() as f64,
                };
                (secs > 0.0).then(|| total / secs)
            }
            (agg, Some(Series::Trend(t))) => match agg {
                Aggregation::Avg => t.avg(),
                Aggregation::Min => t.min(),
                Aggregation::Max => t.max(),
                Aggregation::Med => t.median(),
                Aggregation::P(p) => t.percentile(p),
                Aggregation::Count | Aggregation::Rate => None,
            },
            // distribution statistics of a counter or of nothing at all
            _ => None,
        }
    }

    pub fn evaluate(&self, snapshot: &MetricSnapshot) -> ThresholdResult {
        let observed = self.observe(snapshot);
        let passed = observed.is_some_and(|v| self.expr.op.holds(v, self.expr.bound));
        ThresholdResult {
            spec: self.clone(),
            observed,
            passed,
        }
    }
}

impl fmt::Display for ThresholdSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.metric, self.expr)
    }
}

/// Outcome of one threshold.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub spec: ThresholdSpec,
    /// `None` when the metric had nothing to aggregate.
    pub observed: Option<f64>,
    pub passed: bool,
}

/// All threshold results of a run. Passes iff every result passes, so a run
/// without thresholds always passes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Verdict {
    pub results: Vec<ThresholdResult>,
}

impl Verdict {
    pub fn passed(&self) -> bool {
        self.results.iter().all(|r| r.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ThresholdResult> {
        self.results.iter().filter(|r| !r.passed)
    }
}

/// Evaluate every spec against one snapshot.
pub fn evaluate_thresholds(specs: &[ThresholdSpec], snapshot: &MetricSnapshot) -> Verdict {
    let results: Vec<ThresholdResult> = specs.iter().map(|s| s.evaluate(snapshot)).collect();
    for r in results.iter().filter(|r| !r.passed) {
        tracing::warn!("Threshold {} failed, observed {:?}", r.spec, r.observed);
    }
    Verdict { results }
}
