//! Translation between local source paths and the debuggee's filesystem.
//!
//! Rules are plain `(local prefix, remote prefix)` pairs tried in order. The
//! local side is compared by path components after lexical normalization, so
//! `src` never matches `src2/foo.php`. The remote side is always treated as a
//! `/`-separated path (containers and remote hosts are POSIX).

use std::{
    ffi::OsString,
    path::{Component, Path, PathBuf},
};

use dbgp_config::PathMapping;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Rule {
    local: PathBuf,
    remote: Vec<String>,
    remote_absolute: bool,
}

#[derive(Debug, Clone)]
pub struct PathMapper {
    root: PathBuf,
    rules: Vec<Rule>,
}

impl PathMapper {
    pub fn new(project_root: impl Into<PathBuf>, mappings: &[PathMapping]) -> Self {
        let root = normalize_local_path(&project_root.into());
        let rules = mappings
            .iter()
            .map(|mapping| Rule {
                local: normalize_local_path(&root.join(&mapping.local)),
                remote: remote_segments(&mapping.remote),
                remote_absolute: mapping.remote.starts_with('/'),
            })
            .collect();
        Self { root, rules }
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }

    pub fn has_rules(&self) -> bool {
        !self.rules.is_empty()
    }

    /// Resolve `local` (absolute, or relative to the project root).
    pub fn resolve_local(&self, local: &str) -> PathBuf {
        normalize_local_path(&self.root.join(local))
    }

    /// Remote path for `local`, or `None` when no rule covers it.
    pub fn to_remote(&self, local: &str) -> Option<String> {
        let path = self.resolve_local(local);
        self.rules.iter().find_map(|rule| {
            let rest = path.strip_prefix(&rule.local).ok()?;
            let mut segments = rule.remote.clone();
            for component in rest.components() {
                if let Component::Normal(segment) = component {
                    segments.push(segment.to_string_lossy().into_owned());
                }
            }
            Some(join_remote(&segments, rule.remote_absolute))
        })
    }

    /// Local path for a path reported by the debuggee, using the first rule
    /// whose remote prefix covers it.
    pub fn to_local(&self, remote: &str) -> Option<PathBuf> {
        let segments = remote_segments(remote);
        let absolute = remote.starts_with('/');
        self.rules.iter().find_map(|rule| {
            if rule.remote_absolute != absolute || !segments.starts_with(&rule.remote) {
                return None;
            }
            let mut local = rule.local.clone();
            local.extend(&segments[rule.remote.len()..]);
            Some(local)
        })
    }
}

fn remote_segments(remote: &str) -> Vec<String> {
    let mut segments: Vec<String> = Vec::new();
    for segment in remote.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other.to_string()),
        }
    }
    segments
}

fn join_remote(segments: &[String], absolute: bool) -> String {
    let joined = segments.join("/");
    if absolute {
        format!("/{joined}")
    } else {
        joined
    }
}

pub(crate) fn normalize_local_path(path: &Path) -> PathBuf {
    let mut prefix: Option<OsString> = None;
    let mut has_root = false;
    let mut stack: Vec<OsString> = Vec::new();

    for component in path.components() {
        match component {
            Component::Prefix(prefix_component) => {
                prefix = Some(prefix_component.as_os_str().to_owned());
            }
            Component::RootDir => has_root = true,
            Component::CurDir => {}
            Component::ParentDir => {
                if let Some(last) = stack.last() {
                    if last != ".." {
                        stack.pop();
                        continue;
                    }
                }
                if !has_root {
                    stack.push(OsString::from(".."));
                }
            }
            Component::Normal(segment) => stack.push(segment.to_owned()),
        }
    }

    let mut out = PathBuf::new();
    if let Some(prefix) = prefix {
        out.push(prefix);
    }
    if has_root {
        out.push(std::path::MAIN_SEPARATOR.to_string());
    }
    out.extend(stack);
    out
}
