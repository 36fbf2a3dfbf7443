//! Include/exclude filtering of tables by schema and table name.

use regex::Regex;

use crate::dbtable::Name;
use crate::error::{MoltError, Result};

/// Regex filter over `(schema, table)` names.
///
/// A table passes when it matches at least one include pattern on each axis
/// (or that axis has no includes) and matches no exclude pattern.
#[derive(Debug, Default, Clone)]
pub struct TableFilter {
    schema_include: Vec<Regex>,
    table_include: Vec<Regex>,
    schema_exclude: Vec<Regex>,
    table_exclude: Vec<Regex>,
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| {
            Regex::new(p).map_err(|e| MoltError::Config(format!("invalid filter {:?}: {}", p, e)))
        })
        .collect()
}

impl TableFilter {
    pub fn new(
        schema_include: &[String],
        table_include: &[String],
        schema_exclude: &[String],
        table_exclude: &[String],
    ) -> Result<Self> {
        Ok(Self {
            schema_include: compile(schema_include)?,
            table_include: compile(table_include)?,
            schema_exclude: compile(schema_exclude)?,
            table_exclude: compile(table_exclude)?,
        })
    }

    pub fn matches(&self, name: &Name) -> bool {
        let include = |patterns: &[Regex], s: &str| {
            patterns.is_empty() || patterns.iter().any(|r| r.is_match(s))
        };
        let exclude = |patterns: &[Regex], s: &str| patterns.iter().any(|r| r.is_match(s));

        include(&self.schema_include, &name.schema)
            && include(&self.table_include, &name.table)
            && !exclude(&self.schema_exclude, &name.schema)
            && !exclude(&self.table_exclude, &name.table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(schema: &str, table: &str) -> Name {
        Name::new(schema, table)
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let f = TableFilter::default();
        assert!(f.matches(&name("public", "users")));
    }

    #[test]
    fn test_include_filters() {
        let f = TableFilter::new(
            &["^public$".to_string()],
            &["^users|orders$".to_string()],
            &[],
            &[],
        )
        .unwrap();
        assert!(f.matches(&name("public", "users")));
        assert!(!f.matches(&name("internal", "users")));
        assert!(!f.matches(&name("public", "sessions")));
    }

    #[test]
    fn test_exclude_wins_over_include() {
        let f = TableFilter::new(&[], &["users".to_string()], &[], &["^users_tmp$".to_string()])
            .unwrap();
        assert!(f.matches(&name("public", "users")));
        assert!(!f.matches(&name("public", "users_tmp")));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        assert!(TableFilter::new(&["(".to_string()], &[], &[], &[]).is_err());
    }
}
