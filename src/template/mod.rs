//! Template Renderer (C1, spec.md §4.1).
//!
//! Expands `{{ .Field }}` variable references and `{{ fn arg1 arg2 }}` helper
//! calls against a variable context built from job vars, object `inputVars`,
//! process environment, and the built-ins in `helpers`.

pub mod helpers;

use std::collections::HashMap;

use crate::error::RenderError;

/// How a reference to an undefined key is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MissingKeyPolicy {
    #[default]
    Error,
    Zero,
}

/// The merged variable context for one render: job-level vars, object
/// `inputVars`, process environment, and the per-replica `{Iteration, Replica,
/// JobName}` triple — in that precedence order (later entries win).
#[derive(Debug, Clone, Default)]
pub struct RenderContext {
    vars: HashMap<String, String>,
}

impl RenderContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_env(mut self) -> Self {
        for (k, v) in std::env::vars() {
            self.vars.insert(k, v);
        }
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.vars.insert(key.into(), value.into());
        self
    }

    pub fn extend(&mut self, other: &HashMap<String, String>) -> &mut Self {
        for (k, v) in other {
            self.vars.insert(k.clone(), v.clone());
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }
}

/// One `{{ ... }}` expression, already split into tokens.
enum Expr<'a> {
    /// `.Field`
    Field(&'a str),
    /// `fn arg1 arg2 ...` — args may themselves be `.Field` references or literals.
    Helper(&'a str, Vec<&'a str>),
}

fn parse_expr(body: &str) -> Expr<'_> {
    let body = body.trim();
    let mut parts = body.split_whitespace();
    let first = parts.next().unwrap_or("");
    if first.starts_with('.') && parts.clone().next().is_none() {
        Expr::Field(&first[1..])
    } else if first.starts_with('.') {
        // `.Field` can't take further arguments in this grammar; treat whole thing as malformed helper-looking field.
        Expr::Field(&first[1..])
    } else {
        Expr::Helper(first, parts.collect())
    }
}

fn resolve_token(token: &str, ctx: &RenderContext, policy: MissingKeyPolicy) -> Result<String, RenderError> {
    if let Some(field) = token.strip_prefix('.') {
        resolve_field(field, ctx, policy)
    } else {
        Ok(token.to_string())
    }
}

fn resolve_field(field: &str, ctx: &RenderContext, policy: MissingKeyPolicy) -> Result<String, RenderError> {
    match ctx.get(field) {
        Some(v) => Ok(v.to_string()),
        None => match policy {
            MissingKeyPolicy::Error => Err(RenderError::MissingKey(field.to_string())),
            MissingKeyPolicy::Zero => Ok(String::new()),
        },
    }
}

/// Expand every `{{ ... }}` expression in `doc` against `ctx`.
pub fn render(doc: &str, ctx: &RenderContext, policy: MissingKeyPolicy) -> Result<String, RenderError> {
    let mut out = String::with_capacity(doc.len());
    let mut rest = doc;

    loop {
        let Some(start) = rest.find("{{") else {
            out.push_str(rest);
            break;
        };
        let Some(end_rel) = rest[start..].find("}}") else {
            return Err(RenderError::Malformed("unterminated '{{' expression".to_string()));
        };
        let end = start + end_rel;
        out.push_str(&rest[..start]);

        let body = &rest[start + 2..end];
        let value = match parse_expr(body) {
            Expr::Field(field) => resolve_field(field, ctx, policy)?,
            Expr::Helper(name, args) => {
                let mut resolved_args = Vec::with_capacity(args.len());
                for a in args {
                    resolved_args.push(resolve_token(a, ctx, policy)?);
                }
                helpers::call(name, &resolved_args)?
            }
        };
        out.push_str(&value);

        rest = &rest[end + 2..];
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx_with(pairs: &[(&str, &str)]) -> RenderContext {
        let mut ctx = RenderContext::new();
        for (k, v) in pairs {
            ctx.set(*k, *v);
        }
        ctx
    }

    #[test]
    fn renders_plain_field_reference() {
        let ctx = ctx_with(&[("JobName", "create-pods")]);
        let out = render("name: {{ .JobName }}-0", &ctx, MissingKeyPolicy::Error).unwrap();
        assert_eq!(out, "name: create-pods-0");
    }

    #[test]
    fn renders_helper_call_with_literal_args() {
        let ctx = RenderContext::new();
        let out = render("label: {{ toUpper prod }}", &ctx, MissingKeyPolicy::Error).unwrap();
        assert_eq!(out, "label: PROD");
    }

    #[test]
    fn renders_helper_call_with_field_arg() {
        let ctx = ctx_with(&[("Iteration", "3")]);
        let out = render("subnet: {{ subnetFor24 .Iteration }}", &ctx, MissingKeyPolicy::Error).unwrap();
        assert_eq!(out, "subnet: 1.0.3.0/24");
    }

    #[test]
    fn strict_policy_errors_on_missing_key() {
        let ctx = RenderContext::new();
        let err = render("{{ .UNSET }}", &ctx, MissingKeyPolicy::Error).unwrap_err();
        assert!(matches!(err, RenderError::MissingKey(k) if k == "UNSET"));
    }

    #[test]
    fn zero_policy_substitutes_empty_string() {
        let ctx = RenderContext::new();
        let out = render("value: [{{ .UNSET }}]", &ctx, MissingKeyPolicy::Zero).unwrap();
        assert_eq!(out, "value: []");
    }

    #[test]
    fn unterminated_expression_is_malformed() {
        let ctx = RenderContext::new();
        let err = render("name: {{ .JobName", &ctx, MissingKeyPolicy::Error).unwrap_err();
        assert!(matches!(err, RenderError::Malformed(_)));
    }

    #[test]
    fn render_is_pure_and_reproducible() {
        let ctx = ctx_with(&[("Replica", "2"), ("JobName", "j")]);
        let doc = "n-{{ .JobName }}-{{ .Replica }}: {{ add .Replica 1 }}";
        let a = render(doc, &ctx, MissingKeyPolicy::Error).unwrap();
        let b = render(doc, &ctx, MissingKeyPolicy::Error).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, "n-j-2: 3");
    }

    #[test]
    fn renders_multiple_expressions_in_one_document() {
        let ctx = ctx_with(&[("Iteration", "1"), ("Replica", "0")]);
        let out = render(
            "metadata:\n  name: pod-{{ .Iteration }}-{{ .Replica }}\n  labels:\n    tier: {{ toLower BACKEND }}",
            &ctx,
            MissingKeyPolicy::Error,
        )
        .unwrap();
        assert_eq!(out, "metadata:\n  name: pod-1-0\n  labels:\n    tier: backend");
    }
}
