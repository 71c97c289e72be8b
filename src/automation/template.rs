//! `{{ path }}` interpolation of action payloads.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;

use super::value::Value;

static TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("token pattern is valid")
});

static LONE_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}\s*$").expect("token pattern is valid")
});

/// Fallback variables available to every template.
#[derive(Debug, Clone, Default)]
pub struct SystemVariables {
    vars: BTreeMap<String, Value>,
}

impl SystemVariables {
    /// `now`, `today` and `timestamp` derived from `now`.
    pub fn new(now: DateTime<Utc>) -> Self {
        let mut vars = BTreeMap::new();
        vars.insert("now".to_string(), Value::DateTime(now));
        vars.insert(
            "today".to_string(),
            Value::String(now.date_naive().format("%Y-%m-%d").to_string()),
        );
        vars.insert("timestamp".to_string(), Value::from(now.timestamp()));
        Self { vars }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.vars.get(key)
    }
}

/// Renders JSON templates against a context.
pub struct TemplateRenderer<'a> {
    context: &'a Value,
    system: &'a SystemVariables,
}

impl<'a> TemplateRenderer<'a> {
    pub fn new(context: &'a Value, system: &'a SystemVariables) -> Self {
        Self { context, system }
    }

    /// Render a template tree. Map keys are left as written.
    pub fn render(&self, template: &serde_json::Value) -> Value {
        match template {
            serde_json::Value::String(s) => self.render_str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(|item| self.render(item)).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.render(v)))
                    .collect(),
            ),
            other => Value::from(other),
        }
    }

    fn render_str(&self, text: &str) -> Value {
        if let Some(caps) = LONE_TOKEN.captures(text) {
            return self.resolve(&caps[1]).cloned().unwrap_or(Value::Null);
        }
        if !text.contains("{{") {
            return Value::String(text.to_string());
        }

        let rendered = TOKEN.replace_all(text, |caps: &regex::Captures<'_>| {
            self.resolve(&caps[1])
                .map(Value::to_display_string)
                .unwrap_or_default()
        });
        Value::String(rendered.into_owned())
    }

    fn resolve(&self, path: &str) -> Option<&Value> {
        self.context
            .get_path(path)
            .or_else(|| self.system.get(path))
    }
}
