//! Version constraints.
//!
//! Constraint strings are parsed exactly once, when a manifest or index entry
//! is loaded, into a [`VersionConstraint`]. The resolver only ever works with
//! the parsed clauses and the equivalent PubGrub [`Range`].

use std::fmt;
use std::str::FromStr;

use pubgrub::Range;
use semver::Version;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Comparison operator of a single clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `==1.2.3` (also `=1.2.3` and a bare `1.2.3`)
    Exact,
    /// `!=1.2.3`
    NotEqual,
    /// `>1.2.3`
    Greater,
    /// `>=1.2.3`
    GreaterEq,
    /// `<1.2.3`
    Less,
    /// `<=1.2.3`
    LessEq,
    /// `^1.2.3`
    Caret,
    /// `~1.2.3`
    Tilde,
    /// `1.2.*`
    Wildcard,
}

impl Op {
    fn as_str(&self) -> &'static str {
        match self {
            Op::Exact => "==",
            Op::NotEqual => "!=",
            Op::Greater => ">",
            Op::GreaterEq => ">=",
            Op::Less => "<",
            Op::LessEq => "<=",
            Op::Caret => "^",
            Op::Tilde => "~",
            Op::Wildcard => "",
        }
    }
}

/// A version with optional minor and patch components, as written by the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartialVersion {
    pub major: u64,
    pub minor: Option<u64>,
    pub patch: Option<u64>,
}

impl PartialVersion {
    /// The version with missing components filled with zero.
    pub fn floor(&self) -> Version {
        Version::new(self.major, self.minor.unwrap_or(0), self.patch.unwrap_or(0))
    }

    /// The smallest version above everything this partial version covers.
    ///
    /// A component at `u64::MAX` carries into the one before it; `None`
    /// means no such version exists.
    fn bump_last(&self) -> Option<Version> {
        match (self.minor, self.patch) {
            (None, _) => self.major.checked_add(1).map(|major| Version::new(major, 0, 0)),
            (Some(minor), None) => match minor.checked_add(1) {
                Some(minor) => Some(Version::new(self.major, minor, 0)),
                None => self.truncate(0).bump_last(),
            },
            (Some(minor), Some(patch)) => match patch.checked_add(1) {
                Some(patch) => Some(Version::new(self.major, minor, patch)),
                None => self.truncate(1).bump_last(),
            },
        }
    }

    /// Keep only the major and the first `extra` further components.
    fn truncate(&self, extra: usize) -> PartialVersion {
        PartialVersion {
            major: self.major,
            minor: self.minor.filter(|_| extra >= 1),
            patch: self.patch.filter(|_| extra >= 2),
        }
    }
}

impl fmt::Display for PartialVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.major)?;
        if let Some(minor) = self.minor {
            write!(f, ".{}", minor)?;
        }
        if let Some(patch) = self.patch {
            write!(f, ".{}", patch)?;
        }
        Ok(())
    }
}

/// One `(operator, version)` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Clause {
    pub op: Op,
    pub version: PartialVersion,
}

impl Clause {
    /// Convert the clause to the set of versions it admits.
    fn to_range(&self) -> Range<Version> {
        let v = &self.version;
        let floor = v.floor();

        match self.op {
            Op::Exact => Range::singleton(floor),

            Op::NotEqual => Range::singleton(floor).complement(),

            Op::Greater => Range::strictly_higher_than(floor),

            Op::GreaterEq => Range::higher_than(floor),

            Op::Less => Range::strictly_lower_than(floor),

            // <=1.2 admits every 1.2.x
            Op::LessEq => match v.bump_last() {
                Some(upper) => Range::strictly_lower_than(upper),
                None => Range::full(),
            },

            // ~1.2.3 := >=1.2.3 <1.3.0, ~1 := >=1.0.0 <2.0.0
            Op::Tilde => up_to(floor, v.truncate(1).bump_last()),

            Op::Caret => {
                // Left-most non-zero component stays fixed.
                let fixed = if v.major > 0 || v.minor.is_none() {
                    0
                } else if v.minor != Some(0) || v.patch.is_none() {
                    1
                } else {
                    2
                };
                up_to(floor, v.truncate(fixed).bump_last())
            }

            Op::Wildcard => up_to(floor, v.bump_last()),
        }
    }
}

/// `[floor, upper)`, or everything from `floor` up when there is no bound.
fn up_to(floor: Version, upper: Option<Version>) -> Range<Version> {
    match upper {
        Some(upper) => Range::between(floor, upper),
        None => Range::higher_than(floor),
    }
}

impl fmt::Display for Clause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op {
            Op::Wildcard => write!(f, "{}.*", self.version),
            op => write!(f, "{}{}", op.as_str(), self.version),
        }
    }
}

/// Error produced when a constraint string is malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid version constraint `{input}`: {reason}")]
pub struct ConstraintParseError {
    pub input: String,
    pub reason: String,
}

/// A parsed version constraint: the conjunction of its clauses.
///
/// An empty clause list admits every version (`*`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    clauses: Vec<Clause>,
    range: Range<Version>,
}

impl VersionConstraint {
    /// The constraint that admits every version.
    pub fn any() -> Self {
        VersionConstraint {
            clauses: Vec::new(),
            range: Range::full(),
        }
    }

    /// The constraint that admits exactly `version`.
    pub fn exact(version: &Version) -> Self {
        let clause = Clause {
            op: Op::Exact,
            version: PartialVersion {
                major: version.major,
                minor: Some(version.minor),
                patch: Some(version.patch),
            },
        };
        VersionConstraint {
            range: clause.to_range(),
            clauses: vec![clause],
        }
    }

    /// Parse a constraint such as `>=1.0,<2.0`, `==1.0`, `^1.2` or `1.2.*`.
    pub fn parse(input: &str) -> Result<Self, ConstraintParseError> {
        let err = |reason: &str| ConstraintParseError {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(err("constraint is empty"));
        }

        let mut clauses = Vec::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(err("empty clause between commas"));
            }
            if part == "*" {
                continue;
            }
            clauses.push(parse_clause(part).map_err(|reason| err(&reason))?);
        }

        let range = clauses
            .iter()
            .fold(Range::full(), |acc, clause| acc.intersection(&clause.to_range()));

        Ok(VersionConstraint { clauses, range })
    }

    /// The parsed clauses.
    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    /// The set of versions this constraint admits.
    pub fn range(&self) -> &Range<Version> {
        &self.range
    }

    /// Check whether a version satisfies the constraint.
    pub fn matches(&self, version: &Version) -> bool {
        self.range.contains(version)
    }

    /// Check whether this is the unrestricted constraint.
    pub fn is_any(&self) -> bool {
        self.clauses.is_empty()
    }
}

impl Default for VersionConstraint {
    fn default() -> Self {
        VersionConstraint::any()
    }
}

fn parse_clause(part: &str) -> Result<Clause, String> {
    const PREFIXES: [(&str, Op); 9] = [
        ("==", Op::Exact),
        ("!=", Op::NotEqual),
        (">=", Op::GreaterEq),
        ("<=", Op::LessEq),
        ("=", Op::Exact),
        (">", Op::Greater),
        ("<", Op::Less),
        ("^", Op::Caret),
        ("~", Op::Tilde),
    ];

    let (op, rest) = PREFIXES
        .iter()
        .find_map(|(prefix, op)| part.strip_prefix(prefix).map(|rest| (Some(*op), rest)))
        .unwrap_or((None, part));

    let rest = rest.trim();
    let (version, wildcard) = parse_partial(rest)?;

    let op = match (op, wildcard) {
        (None, false) => Op::Exact,
        (None, true) | (Some(Op::Exact), true) => Op::Wildcard,
        (Some(op), false) => op,
        (Some(op), true) => {
            return Err(format!(
                "wildcard cannot be combined with `{}`",
                op.as_str()
            ))
        }
    };

    Ok(Clause { op, version })
}

/// Parse `1`, `1.2`, `1.2.3`, `1.*` or `1.2.*`; the flag reports a wildcard.
fn parse_partial(s: &str) -> Result<(PartialVersion, bool), String> {
    if s.is_empty() {
        return Err("missing version".to_string());
    }

    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() > 3 {
        return Err(format!("`{}` has more than three components", s));
    }

    let mut numbers = Vec::with_capacity(3);
    let mut wildcard = false;
    for (i, part) in parts.iter().enumerate() {
        if matches!(*part, "*" | "x" | "X") {
            if i == 0 {
                return Err("major version cannot be a wildcard".to_string());
            }
            if i != parts.len() - 1 {
                return Err("wildcard must be the last component".to_string());
            }
            wildcard = true;
            break;
        }
        let n: u64 = part
            .parse()
            .map_err(|_| format!("`{}` is not a number", part))?;
        numbers.push(n);
    }

    let version = PartialVersion {
        major: numbers[0],
        minor: numbers.get(1).copied(),
        patch: numbers.get(2).copied(),
    };
    Ok((version, wildcard))
}

impl FromStr for VersionConstraint {
    type Err = ConstraintParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionConstraint::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.clauses.is_empty() {
            return write!(f, "*");
        }
        for (i, clause) in self.clauses.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{}", clause)?;
        }
        Ok(())
    }
}

impl Serialize for VersionConstraint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionConstraint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        VersionConstraint::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Parse a version string, allowing for incomplete versions.
///
/// Full semver strings pass through unchanged, pre-release tags included.
/// Constraint clauses never carry a pre-release, so `==1.2.3` does not pin
/// `1.2.3-rc1`; since `1.2.3-rc1` sorts below `1.2.3`, ranges such as
/// `>=1.2,<1.3` or `^1.2` do admit it.
pub fn parse_version_lenient(s: &str) -> Option<Version> {
    let s = s.trim();
    if let Ok(v) = s.parse() {
        return Some(v);
    }

    let parts: Vec<&str> = s.split('.').collect();
    match parts.len() {
        1 => {
            let major: u64 = parts[0].parse().ok()?;
            Some(Version::new(major, 0, 0))
        }
        2 => {
            let major: u64 = parts[0].parse().ok()?;
            let minor: u64 = parts[1].parse().ok()?;
            Some(Version::new(major, minor, 0))
        }
        _ => None,
    }
}
