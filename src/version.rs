/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Dotted versions and the relational predicates applied during external
//! and toolchain discovery.

use std::cmp::Ordering;
use std::fmt;
use std::fmt::Display;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
#[error("unparsable version {value:?}")]
pub struct VersionParseError {
    pub value: String,
}

/// A version is a 4-tuple of non-negative integers, right-padded with
/// zeros: `"3.5"` parses to `(3, 5, 0, 0)`. Each dotted component is either
/// a run of digits or a single letter taken as an ordinal (`a` = 0,
/// `b` = 1, ...). Ordering is tuple order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version([u32; 4]);

impl Version {
    pub fn new(parts: [u32; 4]) -> Version {
        Version(parts)
    }

    fn component(raw: &str, value: &str) -> Result<u32, VersionParseError> {
        let err = || VersionParseError {
            value: value.to_string(),
        };
        if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
            return raw.parse().map_err(|_| err());
        }
        let mut chars = raw.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if c.is_ascii_lowercase() => Ok(c as u32 - 'a' as u32),
            (Some(c), None) if c.is_ascii_uppercase() => Ok(c as u32 - 'A' as u32),
            _ => Err(err()),
        }
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(value: &str) -> Result<Version, VersionParseError> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(VersionParseError {
                value: value.to_string(),
            });
        }
        let mut parts = [0u32; 4];
        let mut count = 0;
        for raw in trimmed.split('.') {
            if count == parts.len() {
                return Err(VersionParseError {
                    value: value.to_string(),
                });
            }
            parts[count] = Version::component(raw, value)?;
            count += 1;
        }
        Ok(Version(parts))
    }
}

impl Display for Version {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{}.{}.{}.{}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Eq,
    Ne,
    Gt,
    Ge,
}

impl CmpOp {
    fn accepts(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
        }
    }
}

/// A version predicate: a relational operator against a reference version.
/// `VersionSpec::parse(">= 2.0")` yields a check that accepts any version
/// not less than 2.0.0.0. A bare version string means `>=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionSpec {
    pub op: CmpOp,
    pub version: Version,
}

impl VersionSpec {
    pub fn new(op: CmpOp, version: Version) -> VersionSpec {
        VersionSpec { op, version }
    }

    pub fn parse(value: &str) -> Result<VersionSpec, VersionParseError> {
        let trimmed = value.trim();
        let (op, rest) = if let Some(rest) = trimmed.strip_prefix("<=") {
            (CmpOp::Le, rest)
        } else if let Some(rest) = trimmed.strip_prefix(">=") {
            (CmpOp::Ge, rest)
        } else if let Some(rest) = trimmed.strip_prefix("==") {
            (CmpOp::Eq, rest)
        } else if let Some(rest) = trimmed.strip_prefix("!=") {
            (CmpOp::Ne, rest)
        } else if let Some(rest) = trimmed.strip_prefix('<') {
            (CmpOp::Lt, rest)
        } else if let Some(rest) = trimmed.strip_prefix('>') {
            (CmpOp::Gt, rest)
        } else {
            (CmpOp::Ge, trimmed)
        };
        Ok(VersionSpec {
            op,
            version: rest.parse()?,
        })
    }

    pub fn check(&self, version: Version) -> bool {
        self.op.accepts(version.cmp(&self.version))
    }

    /// Check a version that is still a raw probe string.
    pub fn check_str(&self, version: &str) -> Result<bool, VersionParseError> {
        Ok(self.check(version.parse()?))
    }
}

impl Display for VersionSpec {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{} {}", self.op.symbol(), self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pads_right() {
        assert_eq!("3.5".parse::<Version>().unwrap(), Version([3, 5, 0, 0]));
        assert_eq!("3".parse::<Version>().unwrap(), Version([3, 0, 0, 0]));
        assert_eq!(
            "1.2.3.4".parse::<Version>().unwrap(),
            Version([1, 2, 3, 4])
        );
    }

    #[test]
    fn parse_letter_ordinals() {
        assert_eq!("6.c".parse::<Version>().unwrap(), Version([6, 2, 0, 0]));
        assert_eq!("1.a".parse::<Version>().unwrap(), Version([1, 0, 0, 0]));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("".parse::<Version>().is_err());
        assert!("1.x2".parse::<Version>().is_err());
        assert!("1.2.3.4.5".parse::<Version>().is_err());
    }

    #[test]
    fn predicate_less_than() {
        let spec = VersionSpec::parse("< 3.5").unwrap();
        assert!(spec.check(Version([3, 4, 0, 0])));
        assert!(!spec.check(Version([3, 5, 0, 0])));
        assert!(spec.check(Version([3, 4, 99, 99])));
    }

    #[test]
    fn bare_version_means_at_least() {
        let spec = VersionSpec::parse("2.0").unwrap();
        assert!(spec.check(Version([2, 0, 13, 0])));
        assert!(!spec.check(Version([1, 9, 0, 0])));
    }

    #[test]
    fn check_str_reports_parse_failure() {
        let spec = VersionSpec::parse(">= 1").unwrap();
        assert!(spec.check_str("not-a-version").is_err());
        assert!(spec.check_str("1.2").unwrap());
    }
}
