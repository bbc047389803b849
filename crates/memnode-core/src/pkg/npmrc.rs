//! `.npmrc` support, read from the virtual filesystem.
//!
//! Recognized directives:
//! - `registry=URL` (default registry)
//! - `@scope:registry=URL` (per-scope registry)
//! - `//host[/path]/:_authToken=TOKEN` with `${ENV_VAR}` expansion
//!
//! Files are read from the project directory up to `/`; the nearest file
//! wins for every key.

use crate::vfs::{path as vpath, Vfs};
use std::collections::HashMap;
use url::Url;

/// Merged `.npmrc` settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Npmrc {
    pub registry: Option<Url>,
    pub scoped_registries: HashMap<String, Url>,
    /// Keyed by `host` or `host/path` without trailing slash.
    pub auth_tokens: HashMap<String, String>,
}

fn registry_url(value: &str) -> Option<Url> {
    let value = value.trim().trim_matches('"');
    if value.ends_with('/') {
        Url::parse(value).ok()
    } else {
        Url::parse(&format!("{value}/")).ok()
    }
}

impl Npmrc {
    /// Parse one file's content.
    #[must_use]
    pub fn parse(content: &str) -> Self {
        let mut out = Self::default();

        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            if key == "registry" {
                out.registry = registry_url(value);
            } else if let Some(scope) = key.strip_suffix(":registry") {
                if scope.starts_with('@') {
                    if let Some(url) = registry_url(value) {
                        out.scoped_registries.insert(scope.to_string(), url);
                    }
                }
            } else if let Some(host) = key
                .strip_prefix("//")
                .and_then(|k| k.strip_suffix(":_authToken"))
            {
                let token = expand_env_vars(value);
                if !token.is_empty() {
                    out.auth_tokens
                        .insert(host.trim_end_matches('/').to_string(), token);
                }
            }
        }

        out
    }

    /// Load and merge every `.npmrc` from `project_dir` up to the root.
    #[must_use]
    pub fn load(vfs: &Vfs, project_dir: &str) -> Self {
        let mut merged = Self::default();
        let mut dir = vpath::normalize(project_dir);
        loop {
            if let Ok(content) = vfs.read_to_string(&vpath::join(&dir, ".npmrc")) {
                merged.merge_missing(Self::parse(&content));
            }
            if dir == "/" {
                break;
            }
            dir = vpath::dirname(&dir);
        }
        merged
    }

    fn merge_missing(&mut self, other: Self) {
        if self.registry.is_none() {
            self.registry = other.registry;
        }
        for (scope, url) in other.scoped_registries {
            self.scoped_registries.entry(scope).or_insert(url);
        }
        for (host, token) in other.auth_tokens {
            self.auth_tokens.entry(host).or_insert(token);
        }
    }

    /// Registry configured for a package's scope, if any.
    #[must_use]
    pub fn scoped_registry(&self, package: &str) -> Option<&Url> {
        let (scope, _) = package.split_once('/')?;
        self.scoped_registries.get(scope)
    }

    /// Auth token for a registry URL: `host/path` first, then bare host.
    #[must_use]
    pub fn token_for(&self, url: &Url) -> Option<&str> {
        let host = url.host_str()?;
        let path = url.path().trim_end_matches('/');
        let mut candidate = format!("{host}{path}");
        loop {
            if let Some(token) = self.auth_tokens.get(&candidate) {
                return Some(token);
            }
            match candidate.rfind('/') {
                Some(idx) => candidate.truncate(idx),
                None => return None,
            }
        }
    }
}

/// Expand `${ENV_VAR}` references; unknown variables expand to nothing.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                if let Ok(val) = std::env::var(&after[..end]) {
                    result.push_str(&val);
                }
                rest = &after[end + 1..];
            }
            None => {
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_parse_all_directives() {
        let rc = Npmrc::parse(
            "\
# comment
; another
registry=https://mirror.example.com
@acme:registry=https://npm.acme.dev/
//npm.acme.dev/:_authToken=secret
",
        );
        assert_eq!(
            rc.registry.as_ref().map(Url::as_str),
            Some("https://mirror.example.com/")
        );
        assert_eq!(
            rc.scoped_registry("@acme/widgets").map(Url::as_str),
            Some("https://npm.acme.dev/")
        );
        assert!(rc.scoped_registry("lodash").is_none());
        assert_eq!(rc.auth_tokens["npm.acme.dev"], "secret");
    }

    #[test]
    fn test_token_lookup_prefers_longest_path() {
        let rc = Npmrc::parse(
            "\
//pkgs.example.com/:_authToken=host-token
//pkgs.example.com/npm/private/:_authToken=path-token
",
        );
        let private = Url::parse("https://pkgs.example.com/npm/private/").unwrap();
        let public = Url::parse("https://pkgs.example.com/npm/public/").unwrap();
        assert_eq!(rc.token_for(&private), Some("path-token"));
        assert_eq!(rc.token_for(&public), Some("host-token"));
    }

    #[test]
    #[serial]
    fn test_env_var_expansion() {
        std::env::set_var("MEMNODE_TEST_NPM_TOKEN", "from-env");
        assert_eq!(expand_env_vars("${MEMNODE_TEST_NPM_TOKEN}"), "from-env");
        assert_eq!(expand_env_vars("pre-${MEMNODE_TEST_NPM_TOKEN}-post"), "pre-from-env-post");
        std::env::remove_var("MEMNODE_TEST_NPM_TOKEN");
        assert_eq!(expand_env_vars("${MEMNODE_TEST_NPM_TOKEN}"), "");
    }

    #[test]
    fn test_load_nearest_file_wins() {
        let vfs = Vfs::new();
        vfs.create_dir_all("/repo/app").unwrap();
        vfs.write_file("/.npmrc", "registry=https://root.example.com/\n@a:registry=https://a-root.example.com/\n")
            .unwrap();
        vfs.write_file("/repo/app/.npmrc", "@a:registry=https://a-app.example.com/\n")
            .unwrap();

        let rc = Npmrc::load(&vfs, "/repo/app");
        assert_eq!(
            rc.scoped_registries["@a"].as_str(),
            "https://a-app.example.com/"
        );
        assert_eq!(
            rc.registry.as_ref().map(Url::as_str),
            Some("https://root.example.com/")
        );
    }
}
