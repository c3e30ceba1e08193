use std::collections::{BTreeMap, HashMap};

use serde::Deserialize;
use serde_json::Value;

use crate::response::Response;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
}

impl Method {
    pub fn as_reqwest(&self) -> reqwest::Method {
        match self {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
            Method::Put => reqwest::Method::PUT,
            Method::Delete => reqwest::Method::DELETE,
            Method::Patch => reqwest::Method::PATCH,
            Method::Head => reqwest::Method::HEAD,
        }
    }
}

/// One scripted HTTP operation. A virtual user executes the script's
/// operations strictly in order within each iteration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Operation {
    pub name: String,
    #[serde(default)]
    pub method: Method,
    pub path: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub checks: Vec<Check>,
    #[serde(default)]
    pub extract: Option<Extract>,
    #[serde(default)]
    pub on_fail: FailAction,
    #[serde(default = "default_think_time_ms")]
    pub think_time_ms: u64,
}

fn default_think_time_ms() -> u64 {
    1000
}

/// What a failed operation does to the rest of the current iteration.
/// `AbortIteration` is meant for login steps: the remaining operations are
/// skipped and the next iteration retries from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailAction {
    #[default]
    Continue,
    AbortIteration,
}

/// Captures a value from a successful response body into a session
/// variable, e.g. the auth token out of a login response.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Extract {
    /// Dotted path into the JSON body ("token", "data.session.id").
    pub field: String,
    pub var: String,
}

impl Extract {
    pub fn apply(&self, response: &Response) -> Option<String> {
        let value = response.json().ok()?;
        match lookup(&value, &self.field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Check {
    StatusIs(u16),
    StatusIn(Vec<u16>),
    BodyContains(String),
    JsonHas(String),
}

impl Check {
    pub fn passes(&self, response: &Response) -> bool {
        match self {
            Check::StatusIs(code) => response.status() == *code,
            Check::StatusIn(codes) => codes.contains(&response.status()),
            Check::BodyContains(needle) => response.text().contains(needle.as_str()),
            Check::JsonHas(path) => response
                .json()
                .map(|v| lookup(&v, path).is_some())
                .unwrap_or(false),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Check::StatusIs(code) => format!("status is {}", code),
            Check::StatusIn(codes) => format!("status in {:?}", codes),
            Check::BodyContains(needle) => format!("body contains {:?}", needle),
            Check::JsonHas(path) => format!("json has {:?}", path),
        }
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Replaces `${name}` placeholders with session variables. A reference to
/// a variable the session does not hold fails the operation locally.
pub fn substitute(template: &str, vars: &HashMap<String, String>) -> Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in {:?}", template))?;
        let name = &after[..end];
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => return Err(format!("missing session variable `{}`", name)),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

/// `substitute` applied to every string inside a JSON body template.
pub fn substitute_value(template: &Value, vars: &HashMap<String, String>) -> Result<Value, String> {
    match template {
        Value::String(s) => Ok(Value::String(substitute(s, vars)?)),
        Value::Array(items) => items
            .iter()
            .map(|v| substitute_value(v, vars))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                out.insert(k.clone(), substitute_value(v, vars)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}
