//! Shaping of DBGp property trees into JSON.
//!
//! Two views are produced from the same [`Property`]: the full value (what
//! the history recorder stores and what path filters run against), and a
//! structure-only view with keys and types but no scalar values.

use dbgp_wire::Property;
use serde_json::{Map, Number, Value};

pub fn property_to_json(property: &Property) -> Value {
    let raw = property.value.as_deref();
    match property.kind.as_str() {
        "null" | "uninitialized" => Value::Null,
        "bool" => Value::Bool(matches!(raw.map(str::trim), Some("1" | "true"))),
        "int" => raw
            .and_then(|v| v.trim().parse::<i64>().ok())
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|| Value::String(raw.unwrap_or_default().to_string())),
        "float" => raw
            .and_then(|v| v.trim().parse::<f64>().ok())
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(raw.unwrap_or_default().to_string())),
        "string" => Value::String(raw.unwrap_or_default().to_string()),
        "array" | "object" | "hash" => {
            if is_truncated(property) {
                return Value::String(summary(property));
            }
            container(property, property_to_json)
        }
        _ => match raw {
            Some(raw) => Value::String(raw.to_string()),
            None => Value::String(property.kind.clone()),
        },
    }
}

/// Keys and types only. Scalars become their type name, unexpanded
/// containers a short summary such as `array(3)` or `object(App\User)`.
pub fn structure_view(property: &Property) -> Value {
    match property.kind.as_str() {
        "array" | "object" | "hash" if !is_truncated(property) => {
            let mut value = container(property, structure_view);
            if let (Value::Object(map), Some(class)) = (&mut value, &property.classname) {
                map.insert("__class".to_string(), Value::String(class.clone()));
            }
            value
        }
        "array" | "object" | "hash" => Value::String(summary(property)),
        kind => Value::String(kind.to_string()),
    }
}

fn is_truncated(property: &Property) -> bool {
    property.num_children > 0 && property.children.is_empty()
}

fn summary(property: &Property) -> String {
    match (&property.classname, property.kind.as_str()) {
        (Some(class), _) => format!("object({class})"),
        (None, "object") => "object".to_string(),
        (None, kind) => format!("{kind}({})", property.num_children),
    }
}

fn container(property: &Property, convert: fn(&Property) -> Value) -> Value {
    let is_list = property.kind == "array"
        && property
            .children
            .iter()
            .enumerate()
            .all(|(index, child)| child.name == index.to_string());
    if is_list {
        return Value::Array(property.children.iter().map(convert).collect());
    }
    let map: Map<String, Value> = property
        .children
        .iter()
        .map(|child| (child.name.clone(), convert(child)))
        .collect();
    Value::Object(map)
}

/// One step of a filter path.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
    /// `[*]` or `.*`: every element or field.
    Wildcard,
}

/// Select a sub-value with a simple path: `$`, `$.a.b`, `$.items[0]`,
/// `$['odd key']`, `$.items[*].sku`. Returns `Ok(None)` when nothing
/// matches. A path with a wildcard yields an array of every match.
pub fn apply_filter(value: &Value, filter: &str) -> Result<Option<Value>, String> {
    let segments = parse_filter(filter)?;
    let mut matches = vec![value];
    for segment in &segments {
        matches = matches
            .into_iter()
            .flat_map(|current| select(current, segment))
            .collect();
        if matches.is_empty() {
            return Ok(None);
        }
    }
    if segments.contains(&Segment::Wildcard) {
        return Ok(Some(Value::Array(matches.into_iter().cloned().collect())));
    }
    Ok(matches.first().map(|value| (*value).clone()))
}

fn select<'a>(current: &'a Value, segment: &Segment) -> Vec<&'a Value> {
    match (segment, current) {
        (Segment::Wildcard, Value::Array(items)) => items.iter().collect(),
        (Segment::Wildcard, Value::Object(map)) => map.values().collect(),
        (Segment::Key(key), Value::Object(map)) => map.get(key).into_iter().collect(),
        (Segment::Index(index), Value::Array(items)) => items.get(*index).into_iter().collect(),
        // PHP arrays with non-sequential keys are objects here.
        (Segment::Index(index), Value::Object(map)) => {
            map.get(&index.to_string()).into_iter().collect()
        }
        (Segment::Key(key), Value::Array(items)) => key
            .parse::<usize>()
            .ok()
            .and_then(|index| items.get(index))
            .into_iter()
            .collect(),
        _ => Vec::new(),
    }
}

fn parse_filter(filter: &str) -> Result<Vec<Segment>, String> {
    let filter = filter.trim();
    if filter.contains("..") || filter.contains("?(") {
        return Err(format!(
            "unsupported filter {filter:?}: recursive descent and predicates are not supported; use a path such as $.items[0].id or $.items[*].id"
        ));
    }
    let Some(mut rest) = filter.strip_prefix('$') else {
        return Err(format!("filter {filter:?} must start with `$`"));
    };

    let mut segments = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('.') {
            let end = after.find(['.', '[']).unwrap_or(after.len());
            let key = &after[..end];
            match key {
                "" => return Err(format!("empty key in filter {filter:?}")),
                "*" => segments.push(Segment::Wildcard),
                _ if key.contains('*') => {
                    return Err(format!("partial wildcard {key:?} in filter {filter:?}"))
                }
                _ => segments.push(Segment::Key(key.to_string())),
            }
            rest = &after[end..];
        } else if let Some(after) = rest.strip_prefix('[') {
            let Some(end) = after.find(']') else {
                return Err(format!("unclosed `[` in filter {filter:?}"));
            };
            let inner = after[..end].trim();
            let quoted = inner
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .or_else(|| inner.strip_prefix('"').and_then(|s| s.strip_suffix('"')));
            match quoted {
                Some(key) => segments.push(Segment::Key(key.to_string())),
                None if inner == "*" => segments.push(Segment::Wildcard),
                None => {
                    let index = inner
                        .parse::<usize>()
                        .map_err(|_| format!("invalid index {inner:?} in filter {filter:?}"))?;
                    segments.push(Segment::Index(index));
                }
            }
            rest = &after[end + 1..];
        } else {
            return Err(format!("unexpected {rest:?} in filter {filter:?}"));
        }
    }
    Ok(segments)
}
