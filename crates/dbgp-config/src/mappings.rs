use std::{
    collections::BTreeMap,
    path::{Component, Path},
};

use serde::Deserialize;
use serde_json::Value;

use crate::PathMapping;

/// Parse a `{"<remote prefix>": "<local prefix>", ...}` object, the shape
/// shared by `XDEBUG_MCP_PATH_MAPPINGS` and launch.json `pathMappings`.
pub fn parse_mapping_object(raw: &str) -> Result<Vec<PathMapping>, String> {
    let value: Value =
        serde_json::from_str(raw).map_err(|err| format!("expected a JSON object: {err}"))?;
    mapping_rules(&value, None)
}

fn mapping_rules(value: &Value, workspace: Option<&str>) -> Result<Vec<PathMapping>, String> {
    let Some(object) = value.as_object() else {
        return Err("expected a JSON object of remote -> local prefixes".to_string());
    };

    let mut rules = Vec::with_capacity(object.len());
    for (remote, local) in object {
        let Some(local) = local.as_str() else {
            return Err(format!("mapping for {remote:?} must be a string"));
        };
        let local = match workspace {
            Some(root) => local.replace("${workspaceFolder}", root),
            None => local.to_string(),
        };
        rules.push(PathMapping {
            local,
            remote: remote.clone(),
        });
    }
    Ok(rules)
}

/// Put the most specific local prefix first.
///
/// Specificity is the number of path components of the local side once
/// resolved against `root`, so `vendor` under a root of `/home/dev/shop`
/// outranks the root itself however either is spelled. Rules of equal depth
/// keep their order.
pub fn order_by_specificity(rules: &mut [PathMapping], root: &Path) {
    rules.sort_by_key(|rule| std::cmp::Reverse(local_depth(&root.join(&rule.local))));
}

fn local_depth(path: &Path) -> usize {
    path.components().fold(0, |depth, component| match component {
        Component::Normal(_) => depth + 1,
        Component::ParentDir => depth.saturating_sub(1),
        _ => depth,
    })
}

/// Read `pathMappings` from the first PHP configuration in
/// `<root>/.vscode/launch.json`. Returns `None` when the file is missing,
/// unparsable, or declares no mappings.
pub fn mappings_from_launch_json(root: &Path) -> Option<Vec<PathMapping>> {
    let path = root.join(".vscode").join("launch.json");
    let text = std::fs::read_to_string(&path).ok()?;
    let value: Value = match serde_json::from_str(&strip_jsonc(&text)) {
        Ok(value) => value,
        Err(err) => {
            tracing::debug!(
                target = "dbgp.config",
                path = %path.display(),
                error = %err,
                "ignoring unparsable launch.json"
            );
            return None;
        }
    };

    let workspace = root.to_string_lossy();
    let configurations = value.get("configurations")?.as_array()?;
    configurations
        .iter()
        .filter(|config| {
            config
                .get("type")
                .and_then(Value::as_str)
                .map_or(true, |kind| kind == "php")
        })
        .find_map(|config| {
            let rules = mapping_rules(config.get("pathMappings")?, Some(&workspace)).ok()?;
            (!rules.is_empty()).then_some(rules)
        })
}

const COMPOSE_FILES: [&str; 4] = [
    "docker-compose.yml",
    "docker-compose.yaml",
    "compose.yml",
    "compose.yaml",
];

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
}

#[derive(Debug, Deserialize)]
struct ComposeService {
    #[serde(default)]
    volumes: Vec<ComposeVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ComposeVolume {
    /// `./src:/var/www/html[:ro]`
    Short(String),
    Long {
        #[serde(rename = "type")]
        kind: Option<String>,
        source: Option<String>,
        target: Option<String>,
    },
}

impl ComposeVolume {
    /// `(host path, container path)` for bind mounts; named volumes and
    /// anonymous volumes have no local side.
    fn bind_mount(&self) -> Option<(&str, &str)> {
        let (source, target) = match self {
            ComposeVolume::Short(spec) => {
                let mut parts = spec.split(':');
                (parts.next()?, parts.next()?)
            }
            ComposeVolume::Long {
                kind,
                source,
                target,
            } => {
                if kind.as_deref().is_some_and(|kind| kind != "bind") {
                    return None;
                }
                (source.as_deref()?, target.as_deref()?)
            }
        };
        let is_host_path = source.starts_with('.') || source.starts_with('/');
        (is_host_path && target.starts_with('/')).then_some((source, target))
    }
}

/// Infer rules from the bind mounts of every service in the project's
/// compose file (`docker-compose.yml` and its spelling variants). Relative
/// host paths stay relative, which resolves them against the project root,
/// where the compose file lives. Returns `None` when there is no compose
/// file, it does not parse, or it declares no bind mounts.
pub fn mappings_from_docker_compose(root: &Path) -> Option<Vec<PathMapping>> {
    let (path, text) = COMPOSE_FILES.iter().find_map(|name| {
        let path = root.join(name);
        let text = std::fs::read_to_string(&path).ok()?;
        Some((path, text))
    })?;
    let compose: ComposeFile = match serde_yaml::from_str(&text) {
        Ok(compose) => compose,
        Err(err) => {
            tracing::debug!(
                target = "dbgp.config",
                path = %path.display(),
                error = %err,
                "ignoring unparsable compose file"
            );
            return None;
        }
    };

    let mut rules: Vec<PathMapping> = Vec::new();
    for service in compose.services.values() {
        for (local, remote) in service.volumes.iter().filter_map(ComposeVolume::bind_mount) {
            let rule = PathMapping {
                local: local.to_string(),
                remote: remote.to_string(),
            };
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
    }
    (!rules.is_empty()).then_some(rules)
}

/// Strip `//` and `/* */` comments plus trailing commas so JSON-with-comments
/// (as written by editors) can be handed to `serde_json`. String contents are
/// preserved.
pub fn strip_jsonc(contents: &str) -> String {
    let bytes = contents.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());

    let mut i = 0;
    let mut in_string = false;
    let mut in_line_comment = false;
    let mut in_block_comment = false;

    while i < bytes.len() {
        let b = bytes[i];

        if in_line_comment {
            if b == b'\n' {
                in_line_comment = false;
                out.push(b'\n');
            }
            i += 1;
            continue;
        }

        if in_block_comment {
            if b == b'*' && bytes.get(i + 1) == Some(&b'/') {
                in_block_comment = false;
                i += 2;
                continue;
            }
            i += 1;
            continue;
        }

        if in_string {
            out.push(b);
            if b == b'\\' {
                if let Some(next) = bytes.get(i + 1) {
                    out.push(*next);
                    i += 2;
                    continue;
                }
            } else if b == b'"' {
                in_string = false;
            }
            i += 1;
            continue;
        }

        match b {
            b'/' if bytes.get(i + 1) == Some(&b'/') => {
                in_line_comment = true;
                i += 2;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                in_block_comment = true;
                i += 2;
            }
            b'"' => {
                in_string = true;
                out.push(b);
                i += 1;
            }
            b'}' | b']' => {
                // Drop a trailing comma (and the whitespace after it).
                let mut end = out.len();
                while end > 0 && out[end - 1].is_ascii_whitespace() {
                    end -= 1;
                }
                if end > 0 && out[end - 1] == b',' {
                    out.remove(end - 1);
                }
                out.push(b);
                i += 1;
            }
            _ => {
                out.push(b);
                i += 1;
            }
        }
    }

    // Only ASCII bytes were removed, so the output stays valid UTF-8.
    String::from_utf8(out).unwrap_or_default()
}
