//! `${{ ... }}` expression handling.
//!
//! Only dotted context lookups are supported (`secrets.NAME`, `env.NAME`,
//! `inputs.NAME`, `github.event_name`, `runner.os`). Anything else is an
//! unknown expression and interpolates to the empty string.

use std::fmt;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

static EXPR_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{\s*(.*?)\s*\}\}").expect("expression pattern is valid"));

static REFERENCE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z0-9_\-]+)|\[\s*'([^']+)'\s*\])$"#)
        .expect("reference pattern is valid")
});

/// A parsed `${{ namespace.key }}` reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reference {
    /// Context namespace (`secrets`, `env`, ...)
    pub namespace: String,

    /// Key within the namespace
    pub key: String,
}

impl Reference {
    /// Parse the inside of `${{ }}`.
    pub fn parse(expr: &str) -> Option<Self> {
        let caps = REFERENCE_PATTERN.captures(expr.trim())?;
        let key = caps.get(2).or_else(|| caps.get(3))?.as_str().to_string();
        Some(Self { namespace: caps[1].to_string(), key })
    }

    /// Whether this reference points into the secret store.
    pub fn is_secret(&self) -> bool {
        self.namespace == "secrets"
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.namespace, self.key)
    }
}

/// How an expression resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A value was found
    Value(String),
    /// The namespace is known but the key has no value
    Missing,
    /// The namespace is not supported
    Unknown,
}

/// Something that can answer context lookups.
pub trait ExpressionContext {
    /// Resolve a single reference.
    fn resolve(&self, reference: &Reference) -> Resolution;
}

/// An expression that did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unresolved {
    /// The raw text inside `${{ }}`
    pub expression: String,

    /// Whether it referenced a known namespace with no value (vs. unsupported syntax)
    pub missing: bool,
}

/// Result of interpolating a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpolated {
    /// Resulting text
    pub text: String,

    /// Expressions that resolved to the empty string
    pub unresolved: Vec<Unresolved>,
}

/// Replace every `${{ }}` expression in `template`.
pub fn interpolate(template: &str, ctx: &dyn ExpressionContext) -> Interpolated {
    let mut unresolved = Vec::new();

    let text = EXPR_PATTERN
        .replace_all(template, |caps: &Captures| {
            let expression = caps[1].to_string();
            let resolution = Reference::parse(&expression)
                .map_or(Resolution::Unknown, |reference| ctx.resolve(&reference));

            match resolution {
                Resolution::Value(value) => value,
                Resolution::Missing => {
                    unresolved.push(Unresolved { expression, missing: true });
                    String::new()
                }
                Resolution::Unknown => {
                    unresolved.push(Unresolved { expression, missing: false });
                    String::new()
                }
            }
        })
        .into_owned();

    Interpolated { text, unresolved }
}

/// Every well-formed reference in `template`, in order of appearance.
pub fn references(template: &str) -> Vec<Reference> {
    EXPR_PATTERN.captures_iter(template).filter_map(|caps| Reference::parse(&caps[1])).collect()
}

/// Raw expressions in `template` that are not plain references.
pub fn unsupported_expressions(template: &str) -> Vec<String> {
    EXPR_PATTERN
        .captures_iter(template)
        .filter(|caps| Reference::parse(&caps[1]).is_none())
        .map(|caps| caps[1].to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    struct MapContext(HashMap<(String, String), String>);

    impl ExpressionContext for MapContext {
        fn resolve(&self, reference: &Reference) -> Resolution {
            match reference.namespace.as_str() {
                "secrets" | "env" => self
                    .0
                    .get(&(reference.namespace.clone(), reference.key.clone()))
                    .cloned()
                    .map_or(Resolution::Missing, Resolution::Value),
                _ => Resolution::Unknown,
            }
        }
    }

    fn ctx() -> MapContext {
        let mut values = HashMap::new();
        values.insert(("secrets".into(), "API_KEY".into()), "s3cr3t".into());
        values.insert(("env".into(), "MODE".into()), "daily".into());
        MapContext(values)
    }

    #[test]
    fn test_interpolate_secret_and_env() {
        let out = interpolate("key=${{ secrets.API_KEY }} mode=${{env.MODE}}", &ctx());
        assert_eq!(out.text, "key=s3cr3t mode=daily");
        assert!(out.unresolved.is_empty());
    }

    #[test]
    fn test_missing_secret_becomes_empty() {
        let out = interpolate("${{ secrets.NOPE }}", &ctx());
        assert_eq!(out.text, "");
        assert_eq!(out.unresolved, vec![Unresolved { expression: "secrets.NOPE".into(), missing: true }]);
    }

    #[test]
    fn test_unknown_expression_becomes_empty() {
        let out = interpolate("a${{ matrix.os }}b${{ 1 + 2 }}c", &ctx());
        assert_eq!(out.text, "abc");
        assert_eq!(out.unresolved.len(), 2);
        assert!(out.unresolved.iter().all(|u| !u.missing));
    }

    #[test]
    fn test_text_without_expressions_is_untouched() {
        let out = interpolate("python auto_gen_news.py", &ctx());
        assert_eq!(out.text, "python auto_gen_news.py");
    }

    #[test]
    fn test_reference_parse_forms() {
        let dotted = Reference::parse("secrets.WP_BLOG_ID").unwrap();
        assert_eq!(dotted.namespace, "secrets");
        assert_eq!(dotted.key, "WP_BLOG_ID");
        assert!(dotted.is_secret());

        let indexed = Reference::parse("secrets['NEWS_API_KEY']").unwrap();
        assert_eq!(indexed.key, "NEWS_API_KEY");

        assert!(Reference::parse("github.event_name == 'schedule'").is_none());
    }

    #[test]
    fn test_references_and_unsupported() {
        let template = "${{ secrets.A }} ${{ env.B }} ${{ a && b }}";
        let refs = references(template);
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].to_string(), "secrets.A");
        assert_eq!(unsupported_expressions(template), vec!["a && b".to_string()]);
    }
}
