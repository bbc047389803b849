//! Semver parsing, comparison and npm range matching.
//!
//! Ranges are desugared into a list of primitive comparators (`>=`, `<`, ...)
//! that must all hold; `||` alternatives are tried in turn.

use super::error::PkgError;
use super::registry::PackageManifest;
use regex_lite::Regex;
use std::cmp::Ordering;
use std::fmt;
use std::sync::OnceLock;

/// A parsed `major.minor.patch[-prerelease][+build]` version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub prerelease: Option<String>,
    pub build: Option<String>,
}

impl Version {
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            prerelease: None,
            build: None,
        }
    }

    /// Strict parse. A leading `v` or `=` is tolerated.
    #[must_use]
    pub fn parse(input: &str) -> Option<Self> {
        let partial = Partial::parse(input)?;
        Some(Self {
            major: partial.major?,
            minor: partial.minor?,
            patch: partial.patch?,
            prerelease: partial.prerelease,
            build: partial.build,
        })
    }

    /// Loose parse: also accepts `N` and `N.N`, filling missing parts with 0.
    #[must_use]
    pub fn parse_loose(input: &str) -> Option<Self> {
        let partial = Partial::parse(input)?;
        Some(partial.floor())
    }

    // `None` when the component is already `u64::MAX`: no upper bound.

    fn bump_major(&self) -> Option<Self> {
        Some(Self::new(self.major.checked_add(1)?, 0, 0))
    }

    fn bump_minor(&self) -> Option<Self> {
        Some(Self::new(self.major, self.minor.checked_add(1)?, 0))
    }

    fn bump_patch(&self) -> Option<Self> {
        Some(Self::new(self.major, self.minor, self.patch.checked_add(1)?))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then(self.minor.cmp(&other.minor))
            .then(self.patch.cmp(&other.patch))
            .then_with(|| match (&self.prerelease, &other.prerelease) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => a.cmp(b),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(pre) = &self.prerelease {
            write!(f, "-{pre}")?;
        }
        if let Some(build) = &self.build {
            write!(f, "+{build}")?;
        }
        Ok(())
    }
}

/// A possibly incomplete version; `None` parts are wildcards.
#[derive(Debug, Clone, Default)]
struct Partial {
    major: Option<u64>,
    minor: Option<u64>,
    patch: Option<u64>,
    prerelease: Option<String>,
    build: Option<String>,
}

impl Partial {
    fn parse(input: &str) -> Option<Self> {
        let s = input.trim();
        let s = s.strip_prefix('=').unwrap_or(s).trim_start();
        let s = s.strip_prefix('v').unwrap_or(s);
        if s.is_empty() {
            return None;
        }

        let (s, build) = match s.split_once('+') {
            Some((core, build)) => (core, Some(build.to_string())),
            None => (s, None),
        };
        let (core, prerelease) = match s.split_once('-') {
            Some((core, pre)) if !pre.is_empty() => (core, Some(pre.to_string())),
            Some(_) => return None,
            None => (s, None),
        };

        let parts: Vec<&str> = core.split('.').collect();
        if parts.len() > 3 {
            return None;
        }
        let mut numbers = [None; 3];
        let mut wildcard_seen = false;
        for (slot, part) in numbers.iter_mut().zip(&parts) {
            match *part {
                "x" | "X" | "*" => wildcard_seen = true,
                digits if !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) => {
                    if wildcard_seen {
                        return None;
                    }
                    *slot = Some(digits.parse().ok()?);
                }
                _ => return None,
            }
        }

        Some(Self {
            major: numbers[0],
            minor: numbers[1],
            patch: numbers[2],
            prerelease,
            build,
        })
    }

    fn is_any(&self) -> bool {
        self.major.is_none()
    }

    fn is_full(&self) -> bool {
        self.patch.is_some()
    }

    /// Lowest version matched by this partial.
    fn floor(&self) -> Version {
        Version {
            major: self.major.unwrap_or(0),
            minor: self.minor.unwrap_or(0),
            patch: self.patch.unwrap_or(0),
            prerelease: self.prerelease.clone(),
            build: None,
        }
    }

    /// Exclusive upper bound of the X-range this partial denotes; `None`
    /// when unbounded.
    fn x_ceiling(&self) -> Option<Version> {
        let floor = self.floor();
        match (self.major, self.minor, self.patch) {
            (None, _, _) => None,
            (Some(_), None, _) => floor.bump_major(),
            (Some(_), Some(_), None) => floor.bump_minor(),
            (Some(_), Some(_), Some(_)) => floor.bump_patch(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

#[derive(Debug, Clone)]
struct Comparator {
    op: Op,
    version: Version,
}

impl Comparator {
    fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    fn matches(&self, v: &Version) -> bool {
        let ord = v.cmp(&self.version);
        match self.op {
            Op::Gt => ord == Ordering::Greater,
            Op::Gte => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Lte => ord != Ordering::Greater,
            Op::Eq => ord == Ordering::Equal,
        }
    }
}

/// `>= floor`, plus `< ceiling` when there is one.
fn bounded(floor: Version, ceiling: Option<Version>) -> Vec<Comparator> {
    let mut out = vec![Comparator::new(Op::Gte, floor)];
    if let Some(ceiling) = ceiling {
        out.push(Comparator::new(Op::Lt, ceiling));
    }
    out
}

/// Comparators for `>= floor` and `< ceiling` of an X-range.
fn x_range(partial: &Partial) -> Vec<Comparator> {
    bounded(partial.floor(), partial.x_ceiling())
}

/// A comparator no version satisfies.
fn nothing() -> Vec<Comparator> {
    vec![Comparator::new(Op::Lt, Version::new(0, 0, 0))]
}

fn caret(partial: &Partial) -> Vec<Comparator> {
    if partial.is_any() {
        return Vec::new();
    }
    let floor = partial.floor();
    let ceiling = match (partial.major, partial.minor, partial.patch) {
        (Some(0), Some(0), Some(_)) => floor.bump_patch(),
        (Some(0), Some(_), _) => floor.bump_minor(),
        _ => floor.bump_major(),
    };
    bounded(floor, ceiling)
}

fn tilde(partial: &Partial) -> Vec<Comparator> {
    if partial.is_any() {
        return Vec::new();
    }
    let floor = partial.floor();
    let ceiling = if partial.minor.is_some() {
        floor.bump_minor()
    } else {
        floor.bump_major()
    };
    bounded(floor, ceiling)
}

fn primitive(op: Op, partial: &Partial) -> Vec<Comparator> {
    if partial.is_any() {
        return match op {
            Op::Gt | Op::Lt => nothing(),
            _ => Vec::new(),
        };
    }
    if partial.is_full() {
        return vec![Comparator::new(op, partial.floor())];
    }
    match op {
        Op::Eq => x_range(partial),
        Op::Gte => vec![Comparator::new(Op::Gte, partial.floor())],
        Op::Lt => vec![Comparator::new(Op::Lt, partial.floor())],
        // `>1.2` means `>=1.3.0`; `<=1.2` means `<1.3.0`
        Op::Gt => partial
            .x_ceiling()
            .map_or_else(nothing, |c| vec![Comparator::new(Op::Gte, c)]),
        Op::Lte => partial
            .x_ceiling()
            .map(|c| vec![Comparator::new(Op::Lt, c)])
            .unwrap_or_default(),
    }
}

/// Desugar one range token. `None` means the token is not a range.
fn desugar(token: &str) -> Option<Vec<Comparator>> {
    let token = token.trim();
    if matches!(token, "" | "*" | "x" | "X" | "latest") {
        return Some(Vec::new());
    }
    if let Some(rest) = token.strip_prefix('^') {
        return Partial::parse(rest).map(|p| caret(&p));
    }
    if let Some(rest) = token.strip_prefix("~>").or_else(|| token.strip_prefix('~')) {
        return Partial::parse(rest).map(|p| tilde(&p));
    }
    let ops: [(&str, Op); 5] = [
        (">=", Op::Gte),
        ("<=", Op::Lte),
        (">", Op::Gt),
        ("<", Op::Lt),
        ("=", Op::Eq),
    ];
    for (prefix, op) in ops {
        if let Some(rest) = token.strip_prefix(prefix) {
            return Partial::parse(rest).map(|p| primitive(op, &p));
        }
    }
    Partial::parse(token).map(|p| x_range(&p))
}

fn hyphen(lower: &str, upper: &str) -> Option<Vec<Comparator>> {
    let lower = Partial::parse(lower)?;
    let upper = Partial::parse(upper)?;
    let mut out = Vec::new();
    if !lower.is_any() {
        out.push(Comparator::new(Op::Gte, lower.floor()));
    }
    if upper.is_full() {
        out.push(Comparator::new(Op::Lte, upper.floor()));
    } else if let Some(ceiling) = upper.x_ceiling() {
        out.push(Comparator::new(Op::Lt, ceiling));
    }
    Some(out)
}

/// Split a comparator set into tokens, re-attaching detached operators
/// (`>= 1.2.3` becomes `>=1.2.3`).
fn tokens(set: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut pending_op = String::new();
    for raw in set.split(|c: char| c.is_whitespace() || c == ',') {
        if raw.is_empty() {
            continue;
        }
        if raw.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            pending_op.push_str(raw);
            continue;
        }
        out.push(format!("{pending_op}{raw}"));
        pending_op.clear();
    }
    if !pending_op.is_empty() {
        out.push(pending_op);
    }
    out
}

/// Desugar a comparator set (no `||`). `None` if any token is unparseable.
fn desugar_set(set: &str) -> Option<Vec<Comparator>> {
    let set = set.trim();
    if let Some((lower, upper)) = set.split_once(" - ") {
        return hyphen(lower, upper);
    }
    let mut out = Vec::new();
    for token in tokens(set) {
        out.extend(desugar(&token)?);
    }
    Some(out)
}

/// Whether the range string itself names a prerelease.
fn range_has_prerelease(range: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\d-[0-9A-Za-z]").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(range))
}

/// Compare two version strings. Unparseable strings sort below valid
/// versions and compare lexically among themselves.
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (Version::parse(a), Version::parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Whether `version` satisfies `range`.
#[must_use]
pub fn satisfies(version: &str, range: &str) -> bool {
    let range = range.trim();
    let Some(v) = Version::parse(version) else {
        return version.trim() == range;
    };

    if let Some(exact) = Version::parse(range) {
        return v.cmp(&exact) == Ordering::Equal;
    }

    if v.prerelease.is_some() && !range_has_prerelease(range) {
        return false;
    }

    let mut any_parsed = false;
    for alternative in range.split("||") {
        if let Some(comparators) = desugar_set(alternative) {
            any_parsed = true;
            if comparators.iter().all(|c| c.matches(&v)) {
                return true;
            }
        }
    }

    !any_parsed && version.trim() == range
}

/// The highest version in `versions` satisfying `range`.
#[must_use]
pub fn find_best_version<S: AsRef<str>>(versions: &[S], range: &str) -> Option<String> {
    let mut sorted: Vec<&str> = versions.iter().map(AsRef::as_ref).collect();
    sorted.sort_by(|a, b| compare_versions(b, a));
    sorted
        .into_iter()
        .find(|v| satisfies(v, range))
        .map(String::from)
}

/// Pick a version from a registry manifest.
///
/// A dist-tag hit wins for a named tag, `latest`, `*` or an empty range;
/// otherwise the highest satisfying version.
pub fn resolve_version(manifest: &PackageManifest, range: &str) -> Result<String, PkgError> {
    let range = range.trim();

    if let Some(tagged) = manifest.dist_tags.get(range) {
        if manifest.versions.contains_key(tagged) {
            return Ok(tagged.clone());
        }
    }
    if matches!(range, "" | "*" | "latest") {
        if let Some(latest) = manifest.dist_tags.get("latest") {
            if manifest.versions.contains_key(latest) {
                return Ok(latest.clone());
            }
        }
    }
    if manifest.versions.contains_key(range) {
        return Ok(range.to_string());
    }

    let versions: Vec<&String> = manifest.versions.keys().collect();
    find_best_version(&versions, range)
        .ok_or_else(|| PkgError::version_not_found(&manifest.name, range))
}
