//! Dependency spec parsing.
//!
//! Two grammars live here:
//! - [`PackageSpec`]: `name[@spec]` as typed on a command line;
//! - [`ParsedDependencySpec`]: a `package.json` dependency value classified
//!   by protocol (`workspace:`, `npm:`, `file:`, GitHub, tarball URL, ...).

use super::error::PkgError;
use std::fmt;

/// A `name[@spec]` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSpec {
    pub name: String,
    /// Everything after the version `@`, unparsed (None means latest).
    pub range: Option<String>,
}

impl PackageSpec {
    pub fn parse(input: &str) -> Result<Self, PkgError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(PkgError::spec_invalid("Empty package spec"));
        }

        // The version separator is the first '@' after the (optional) scope.
        let search_from = usize::from(input.starts_with('@'));
        let (name, range) = match input[search_from..].find('@') {
            Some(idx) => {
                let at = idx + search_from;
                (&input[..at], Some(&input[at + 1..]))
            }
            None => (input, None),
        };

        validate_name(name)?;
        if range.is_some_and(str::is_empty) {
            return Err(PkgError::spec_invalid(format!(
                "Invalid package spec: empty version range in '{input}'"
            )));
        }

        Ok(Self {
            name: name.to_string(),
            range: range.map(String::from),
        })
    }

    /// The dependency value to record in `package.json`.
    #[must_use]
    pub fn spec_or_latest(&self) -> &str {
        self.range.as_deref().unwrap_or("latest")
    }
}

/// Check an npm package name: `name` or `@scope/name`, no whitespace, no
/// leading dot or underscore.
pub fn validate_name(name: &str) -> Result<(), PkgError> {
    let bare = if let Some(scoped) = name.strip_prefix('@') {
        let Some((scope, rest)) = scoped.split_once('/') else {
            return Err(PkgError::spec_invalid(format!(
                "Invalid scoped package: missing '/' in '{name}'"
            )));
        };
        if scope.is_empty() || rest.is_empty() || rest.contains('/') {
            return Err(PkgError::spec_invalid(format!("Invalid scoped package '{name}'")));
        }
        rest
    } else {
        name
    };

    if bare.is_empty()
        || bare.starts_with('.')
        || bare.starts_with('_')
        || bare.contains('/')
        || name.chars().any(|c| c.is_whitespace() || matches!(c, '"' | '\'' | '\\' | '<' | '>' | '|' | '?' | '*'))
    {
        return Err(PkgError::spec_invalid(format!("Invalid package name '{name}'")));
    }
    Ok(())
}

/// How a dependency is sourced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepProtocol {
    Registry,
    NpmAlias,
    Workspace,
    File,
    Link,
    Tarball,
    Github,
    /// Recognized but not supported.
    Git,
}

impl DepProtocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Registry => "registry",
            Self::NpmAlias => "npm",
            Self::Workspace => "workspace",
            Self::File => "file",
            Self::Link => "link",
            Self::Tarball => "tarball",
            Self::Github => "github",
            Self::Git => "git",
        }
    }
}

impl fmt::Display for DepProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A GitHub source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GithubRef {
    pub owner: String,
    pub repo: String,
    pub reference: Option<String>,
    /// Package directory inside the repository, for `tree`/`blob` URLs.
    pub subdir: Option<String>,
}

impl GithubRef {
    /// Archive URL for the referenced commit-ish.
    #[must_use]
    pub fn tarball_url(&self) -> String {
        format!(
            "https://codeload.github.com/{}/{}/tar.gz/{}",
            self.owner,
            self.repo,
            self.reference.as_deref().unwrap_or("HEAD")
        )
    }
}

/// A classified `package.json` dependency value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDependencySpec {
    /// The name the dependency is installed under.
    pub name: String,
    pub protocol: DepProtocol,
    pub raw: String,
    /// Version range (registry, alias and workspace protocols).
    pub range: Option<String>,
    /// Path (`file:`/`link:`), URL (tarball) or alias target name (`npm:`).
    pub target: Option<String>,
    pub github: Option<GithubRef>,
}

impl ParsedDependencySpec {
    fn new(name: &str, protocol: DepProtocol, raw: &str) -> Self {
        Self {
            name: name.to_string(),
            protocol,
            raw: raw.to_string(),
            range: None,
            target: None,
            github: None,
        }
    }

    /// Whether the resolver can follow this edge through the registry.
    #[must_use]
    pub fn is_registry_backed(&self) -> bool {
        matches!(self.protocol, DepProtocol::Registry | DepProtocol::NpmAlias)
    }

    /// Reject protocols that cannot be installed.
    pub fn ensure_supported(&self) -> Result<(), PkgError> {
        if self.protocol == DepProtocol::Git {
            return Err(PkgError::unsupported_protocol(&self.name, &self.raw));
        }
        Ok(())
    }
}

fn is_git_spec(spec: &str) -> bool {
    spec.starts_with("git+")
        || spec.starts_with("git:")
        || spec.starts_with("ssh://")
        || spec.starts_with("git@")
}

fn is_tarball_url(spec: &str) -> bool {
    let path = spec.split(['?', '#']).next().unwrap_or(spec);
    (spec.starts_with("https://") || spec.starts_with("http://"))
        && (path.ends_with(".tgz") || path.ends_with(".tar.gz"))
}

fn split_ref(spec: &str) -> (&str, Option<String>) {
    match spec.split_once('#') {
        Some((base, reference)) if !reference.is_empty() => (base, Some(reference.to_string())),
        Some((base, _)) => (base, None),
        None => (spec, None),
    }
}

fn parse_github(spec: &str) -> Option<GithubRef> {
    let url_path = spec
        .strip_prefix("https://github.com/")
        .or_else(|| spec.strip_prefix("http://github.com/"))
        .or_else(|| spec.strip_prefix("https://www.github.com/"));

    if let Some(rest) = url_path {
        let (rest, reference) = split_ref(rest);
        let parts: Vec<&str> = rest.trim_end_matches('/').split('/').collect();
        if parts.len() < 2 || parts[0].is_empty() || parts[1].is_empty() {
            return None;
        }
        let owner = parts[0].to_string();
        let repo = parts[1].trim_end_matches(".git").to_string();

        if parts.len() >= 4 && matches!(parts[2], "tree" | "blob") {
            let tail = &parts[4..];
            // a blob URL points at a file; install its directory
            let dir_parts = if parts[2] == "blob" && !tail.is_empty() {
                &tail[..tail.len() - 1]
            } else {
                tail
            };
            let subdir = dir_parts.join("/");
            return Some(GithubRef {
                owner,
                repo,
                reference: Some(parts[3].to_string()),
                subdir: (!subdir.is_empty()).then_some(subdir),
            });
        }
        return Some(GithubRef {
            owner,
            repo,
            reference,
            subdir: None,
        });
    }

    let shorthand = spec.strip_prefix("github:").unwrap_or(spec);
    let explicit = spec.starts_with("github:");
    let (base, reference) = split_ref(shorthand);
    let (owner, repo) = base.split_once('/')?;
    let valid = |s: &str| {
        !s.is_empty()
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    if !valid(owner) || !valid(repo) || owner.starts_with('.') {
        return None;
    }
    if !explicit && (owner.starts_with('@') || spec.contains(':')) {
        return None;
    }
    Some(GithubRef {
        owner: owner.to_string(),
        repo: repo.trim_end_matches(".git").to_string(),
        reference,
        subdir: None,
    })
}

/// Parse `npm:<name>[@<range>]`.
fn parse_alias(name: &str, raw: &str, rest: &str) -> Result<ParsedDependencySpec, PkgError> {
    let target = PackageSpec::parse(rest).map_err(|e| {
        PkgError::alias_invalid(format!("Invalid npm alias for {name}: {raw} ({})", e.message()))
    })?;
    let mut parsed = ParsedDependencySpec::new(name, DepProtocol::NpmAlias, raw);
    parsed.range = Some(target.spec_or_latest().to_string());
    parsed.target = Some(target.name);
    Ok(parsed)
}

/// Classify a dependency value by protocol.
pub fn parse_dependency_spec(name: &str, raw: &str) -> Result<ParsedDependencySpec, PkgError> {
    let spec = raw.trim();

    if let Some(range) = spec.strip_prefix("workspace:") {
        let mut parsed = ParsedDependencySpec::new(name, DepProtocol::Workspace, raw);
        parsed.range = Some(if range.is_empty() { "*" } else { range }.to_string());
        return Ok(parsed);
    }
    if let Some(rest) = spec.strip_prefix("npm:") {
        return parse_alias(name, raw, rest);
    }
    for (prefix, protocol) in [("file:", DepProtocol::File), ("link:", DepProtocol::Link)] {
        if let Some(path) = spec.strip_prefix(prefix) {
            if path.is_empty() {
                return Err(PkgError::spec_invalid(format!("Empty path for {name}: {raw}")));
            }
            let mut parsed = ParsedDependencySpec::new(name, protocol, raw);
            parsed.target = Some(path.to_string());
            return Ok(parsed);
        }
    }
    if is_git_spec(spec) {
        return Ok(ParsedDependencySpec::new(name, DepProtocol::Git, raw));
    }
    // before GitHub: release archives live under github.com too
    if is_tarball_url(spec) {
        let mut parsed = ParsedDependencySpec::new(name, DepProtocol::Tarball, raw);
        parsed.target = Some(spec.to_string());
        return Ok(parsed);
    }
    if let Some(github) = parse_github(spec) {
        let mut parsed = ParsedDependencySpec::new(name, DepProtocol::Github, raw);
        parsed.target = Some(github.tarball_url());
        parsed.github = Some(github);
        return Ok(parsed);
    }
    if spec.starts_with("http://") || spec.starts_with("https://") {
        // A non-archive URL is most likely a git remote
        return Ok(ParsedDependencySpec::new(name, DepProtocol::Git, raw));
    }

    let mut parsed = ParsedDependencySpec::new(name, DepProtocol::Registry, raw);
    parsed.range = Some(if spec.is_empty() { "*" } else { spec }.to_string());
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_spec() {
        let s = PackageSpec::parse("react@^18.0.0").unwrap();
        assert_eq!((s.name.as_str(), s.range.as_deref()), ("react", Some("^18.0.0")));
        let s = PackageSpec::parse("@types/node@20").unwrap();
        assert_eq!((s.name.as_str(), s.range.as_deref()), ("@types/node", Some("20")));
        let s = PackageSpec::parse("@types/node").unwrap();
        assert_eq!(s.range, None);
        assert_eq!(s.spec_or_latest(), "latest");
        let s = PackageSpec::parse("alias@npm:real@1").unwrap();
        assert_eq!(s.range.as_deref(), Some("npm:real@1"));

        assert!(PackageSpec::parse("").is_err());
        assert!(PackageSpec::parse("react@").is_err());
        assert!(PackageSpec::parse("@scope").is_err());
        assert!(PackageSpec::parse("has space").is_err());
    }

    #[test]
    fn test_classify_registry_and_alias() {
        let p = parse_dependency_spec("react", "^18.2.0").unwrap();
        assert_eq!(p.protocol, DepProtocol::Registry);
        assert_eq!(p.range.as_deref(), Some("^18.2.0"));

        let p = parse_dependency_spec("my-react", "npm:react@^18").unwrap();
        assert_eq!(p.protocol, DepProtocol::NpmAlias);
        assert_eq!(p.target.as_deref(), Some("react"));
        assert_eq!(p.range.as_deref(), Some("^18"));

        let p = parse_dependency_spec("types", "npm:@types/node").unwrap();
        assert_eq!(p.target.as_deref(), Some("@types/node"));
        assert_eq!(p.range.as_deref(), Some("latest"));

        let err = parse_dependency_spec("bad", "npm:").unwrap_err();
        assert_eq!(err.code(), crate::pkg::error::codes::PKG_ALIAS_INVALID);
    }

    #[test]
    fn test_classify_local_and_workspace() {
        let p = parse_dependency_spec("a", "workspace:*").unwrap();
        assert_eq!((p.protocol, p.range.as_deref()), (DepProtocol::Workspace, Some("*")));
        let p = parse_dependency_spec("a", "workspace:^1.2.0").unwrap();
        assert_eq!(p.range.as_deref(), Some("^1.2.0"));
        let p = parse_dependency_spec("b", "file:../b").unwrap();
        assert_eq!((p.protocol, p.target.as_deref()), (DepProtocol::File, Some("../b")));
        let p = parse_dependency_spec("c", "link:./vendor/c").unwrap();
        assert_eq!(p.protocol, DepProtocol::Link);
    }

    #[test]
    fn test_classify_github_forms() {
        let p = parse_dependency_spec("x", "github:owner/repo#v1.2.0").unwrap();
        let gh = p.github.unwrap();
        assert_eq!((gh.owner.as_str(), gh.repo.as_str()), ("owner", "repo"));
        assert_eq!(gh.reference.as_deref(), Some("v1.2.0"));
        assert_eq!(gh.tarball_url(), "https://codeload.github.com/owner/repo/tar.gz/v1.2.0");

        let p = parse_dependency_spec("x", "owner/repo").unwrap();
        assert_eq!(p.protocol, DepProtocol::Github);
        assert_eq!(p.github.unwrap().tarball_url(), "https://codeload.github.com/owner/repo/tar.gz/HEAD");

        let p = parse_dependency_spec("x", "https://github.com/org/mono/tree/main/packages/ui").unwrap();
        let gh = p.github.unwrap();
        assert_eq!(gh.reference.as_deref(), Some("main"));
        assert_eq!(gh.subdir.as_deref(), Some("packages/ui"));

        let p = parse_dependency_spec("x", "https://github.com/org/mono/blob/dev/packages/ui/package.json").unwrap();
        assert_eq!(p.github.unwrap().subdir.as_deref(), Some("packages/ui"));
    }

    #[test]
    fn test_classify_tarball_and_git() {
        let p = parse_dependency_spec("t", "https://example.com/pkgs/t-1.0.0.tgz").unwrap();
        assert_eq!(p.protocol, DepProtocol::Tarball);
        let p = parse_dependency_spec("t", "https://example.com/t.tar.gz?token=1").unwrap();
        assert_eq!(p.protocol, DepProtocol::Tarball);
        let archive = "https://github.com/o/r/archive/v1.2.0.tar.gz";
        let p = parse_dependency_spec("r", archive).unwrap();
        assert_eq!(p.protocol, DepProtocol::Tarball);
        assert_eq!(p.target.as_deref(), Some(archive));
        assert!(p.github.is_none());

        for raw in [
            "git+https://github.com/a/b.git",
            "git://github.com/a/b.git",
            "ssh://git@github.com/a/b.git",
            "git@github.com:a/b.git",
        ] {
            let p = parse_dependency_spec("g", raw).unwrap();
            assert_eq!(p.protocol, DepProtocol::Git, "{raw}");
            let err = p.ensure_supported().unwrap_err();
            assert_eq!(err.code(), crate::pkg::error::codes::PKG_UNSUPPORTED_PROTOCOL);
        }
    }
}
