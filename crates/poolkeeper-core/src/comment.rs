//! Query attribution comments.
//!
//! Every statement sent through a managed connection is prefixed with a
//! `/* key='value',... */` comment so that server-side activity views can
//! attribute it back to the collecting service.

use std::collections::BTreeMap;

/// Prefixes statements with a structured tag comment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueryCommenter {
    tags: BTreeMap<String, String>,
}

impl QueryCommenter {
    pub fn new(service: &str) -> Self {
        let mut tags = BTreeMap::new();
        tags.insert("service".to_string(), service.to_string());
        Self { tags }
    }

    /// Builder method: add or replace a tag.
    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn service(&self) -> Option<&str> {
        self.tags.get("service").map(String::as_str)
    }

    /// The rendered comment body, e.g. `service='agent'`.
    pub fn comment_body(&self) -> String {
        self.tags
            .iter()
            .map(|(key, value)| format!("{key}='{}'", escape(value)))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Prefix `sql` with the tag comment.
    ///
    /// Blank statements and statements already carrying a leading comment
    /// are returned trimmed but otherwise untouched.
    pub fn comment(&self, sql: &str) -> String {
        let sql = sql.trim();
        if sql.is_empty() || sql.starts_with("/*") {
            return sql.to_string();
        }
        format!("/* {} */ {sql}", self.comment_body())
    }
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
