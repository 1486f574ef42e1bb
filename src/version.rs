//! Version ranges as intervals.
//!
//! `semver::VersionReq` can test a single version but cannot tell whether two
//! requirements overlap. Each requirement is reduced here to one interval of
//! versions, which makes compatibility an interval intersection.

use semver::{Comparator, Op, Version, VersionReq};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bound {
    pub version: Version,
    pub inclusive: bool,
}

impl Bound {
    fn inclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: true,
        }
    }

    fn exclusive(version: Version) -> Self {
        Self {
            version,
            inclusive: false,
        }
    }
}

/// A contiguous interval of versions. The upper bound is open-ended when
/// `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    lower: Bound,
    upper: Option<Bound>,
}

impl VersionRange {
    /// Every version.
    pub fn any() -> Self {
        Self {
            lower: Bound::inclusive(Version::new(0, 0, 0)),
            upper: None,
        }
    }

    /// Reduce a requirement to the interval of versions it accepts.
    ///
    /// Comparators within one requirement are conjunctive, so the result is
    /// the intersection of every comparator's interval. Returns an error for
    /// operators this crate does not understand or for requirements that
    /// accept no version at all.
    pub fn from_req(req: &VersionReq) -> Result<Self, String> {
        let mut range = Self::any();
        for comparator in &req.comparators {
            let next = comparator_range(comparator)?;
            range = range
                .intersect(&next)
                .ok_or_else(|| format!("requirement '{req}' accepts no version"))?;
        }
        Ok(range)
    }

    pub fn lower(&self) -> &Bound {
        &self.lower
    }

    pub fn upper(&self) -> Option<&Bound> {
        self.upper.as_ref()
    }

    pub fn contains(&self, version: &Version) -> bool {
        let above = match version.cmp(&self.lower.version) {
            Ordering::Greater => true,
            Ordering::Equal => self.lower.inclusive,
            Ordering::Less => false,
        };
        let below = match &self.upper {
            None => true,
            Some(upper) => match version.cmp(&upper.version) {
                Ordering::Less => true,
                Ordering::Equal => upper.inclusive,
                Ordering::Greater => false,
            },
        };
        above && below
    }

    /// The overlap of two ranges, or `None` when they are disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let lower = match self.lower.version.cmp(&other.lower.version) {
            Ordering::Greater => self.lower.clone(),
            Ordering::Less => other.lower.clone(),
            Ordering::Equal => Bound {
                version: self.lower.version.clone(),
                inclusive: self.lower.inclusive && other.lower.inclusive,
            },
        };

        let upper = match (&self.upper, &other.upper) {
            (None, None) => None,
            (Some(a), None) => Some(a.clone()),
            (None, Some(b)) => Some(b.clone()),
            (Some(a), Some(b)) => Some(match a.version.cmp(&b.version) {
                Ordering::Less => a.clone(),
                Ordering::Greater => b.clone(),
                Ordering::Equal => Bound {
                    version: a.version.clone(),
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
        };

        if let Some(upper) = &upper {
            match lower.version.cmp(&upper.version) {
                Ordering::Greater => return None,
                Ordering::Equal if !(lower.inclusive && upper.inclusive) => return None,
                _ => {}
            }
        }
        Some(Self { lower, upper })
    }

    pub fn intersects(&self, other: &Self) -> bool {
        self.intersect(other).is_some()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(upper) = &self.upper
            && upper.version == self.lower.version
        {
            return write!(f, "={}", upper.version);
        }
        let op = if self.lower.inclusive { ">=" } else { ">" };
        write!(f, "{op}{}", self.lower.version)?;
        if let Some(upper) = &self.upper {
            let op = if upper.inclusive { "<=" } else { "<" };
            write!(f, ", {op}{}", upper.version)?;
        }
        Ok(())
    }
}

fn comparator_range(c: &Comparator) -> Result<VersionRange, String> {
    let major = c.major;
    let minor = c.minor;
    let patch = c.patch;

    let full = |major: u64, minor: u64, patch: u64| {
        let mut version = Version::new(major, minor, patch);
        version.pre = c.pre.clone();
        version
    };
    let plain = Version::new;
    let between = |lower: Version, upper: Version| VersionRange {
        lower: Bound::inclusive(lower),
        upper: Some(Bound::exclusive(upper)),
    };
    let at_least = |bound: Bound| VersionRange {
        lower: bound,
        upper: None,
    };
    let below = |bound: Bound| VersionRange {
        lower: Bound::inclusive(Version::new(0, 0, 0)),
        upper: Some(bound),
    };
    let next = |n: u64| {
        n.checked_add(1)
            .ok_or_else(|| format!("version component {n} in '{c}' has no successor"))
    };

    let range = match c.op {
        Op::Exact | Op::Wildcard => match (minor, patch) {
            (Some(minor), Some(patch)) => {
                let version = full(major, minor, patch);
                VersionRange {
                    lower: Bound::inclusive(version.clone()),
                    upper: Some(Bound::inclusive(version)),
                }
            }
            (Some(minor), None) => between(plain(major, minor, 0), plain(major, next(minor)?, 0)),
            (None, _) => between(plain(major, 0, 0), plain(next(major)?, 0, 0)),
        },
        Op::Greater => match (minor, patch) {
            (Some(minor), Some(patch)) => at_least(Bound::exclusive(full(major, minor, patch))),
            (Some(minor), None) => at_least(Bound::inclusive(plain(major, next(minor)?, 0))),
            (None, _) => at_least(Bound::inclusive(plain(next(major)?, 0, 0))),
        },
        Op::GreaterEq => at_least(Bound::inclusive(full(
            major,
            minor.unwrap_or(0),
            patch.unwrap_or(0),
        ))),
        Op::Less => below(Bound::exclusive(full(
            major,
            minor.unwrap_or(0),
            patch.unwrap_or(0),
        ))),
        Op::LessEq => match (minor, patch) {
            (Some(minor), Some(patch)) => below(Bound::inclusive(full(major, minor, patch))),
            (Some(minor), None) => below(Bound::exclusive(plain(major, next(minor)?, 0))),
            (None, _) => below(Bound::exclusive(plain(next(major)?, 0, 0))),
        },
        Op::Tilde => match (minor, patch) {
            (Some(minor), Some(patch)) => {
                between(full(major, minor, patch), plain(major, next(minor)?, 0))
            }
            (Some(minor), None) => between(plain(major, minor, 0), plain(major, next(minor)?, 0)),
            (None, _) => between(plain(major, 0, 0), plain(next(major)?, 0, 0)),
        },
        Op::Caret => match (major, minor, patch) {
            (0, None, _) => between(plain(0, 0, 0), plain(1, 0, 0)),
            (0, Some(0), None) => between(plain(0, 0, 0), plain(0, 1, 0)),
            (0, Some(0), Some(patch)) => between(full(0, 0, patch), plain(0, 0, next(patch)?)),
            (0, Some(minor), patch) => {
                between(full(0, minor, patch.unwrap_or(0)), plain(0, next(minor)?, 0))
            }
            (major, minor, patch) => between(
                full(major, minor.unwrap_or(0), patch.unwrap_or(0)),
                plain(next(major)?, 0, 0),
            ),
        },
        _ => return Err(format!("unsupported comparator '{c}'")),
    };
    Ok(range)
}
