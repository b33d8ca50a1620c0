//! `${{ scope.key }}` placeholder handling shared by matrix and trigger
//! substitution.

use std::sync::OnceLock;

use regex::{Captures, Regex};

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z0-9_\-]+)\s*\}\}")
            .expect("placeholder regex is valid")
    })
}

/// Replace every placeholder of `scope` using `lookup`.
///
/// Placeholders of other scopes are preserved verbatim. Returns the first
/// key `lookup` could not resolve as the error.
pub(crate) fn replace_scope<F>(input: &str, scope: &str, lookup: F) -> Result<String, String>
where
    F: Fn(&str) -> Option<String>,
{
    let mut missing: Option<String> = None;
    let out = placeholder_re().replace_all(input, |caps: &Captures<'_>| {
        if &caps[1] != scope {
            return caps[0].to_string();
        }
        match lookup(&caps[2]) {
            Some(value) => value,
            None => {
                if missing.is_none() {
                    missing = Some(caps[2].to_string());
                }
                caps[0].to_string()
            }
        }
    });
    match missing {
        Some(key) => Err(key),
        None => Ok(out.into_owned()),
    }
}

/// All `(scope, key)` pairs referenced by `input`.
pub fn placeholders(input: &str) -> Vec<(String, String)> {
    placeholder_re()
        .captures_iter(input)
        .map(|caps| (caps[1].to_string(), caps[2].to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_scope_only_touches_scope() {
        let out = replace_scope("${{ matrix.python }}-${{ trigger.ref }}", "matrix", |k| {
            (k == "python").then(|| "3.10".to_string())
        })
        .unwrap();
        assert_eq!(out, "3.10-${{ trigger.ref }}");
    }

    #[test]
    fn test_replace_scope_reports_missing_key() {
        let err = replace_scope("${{ matrix.os }}", "matrix", |_| None).unwrap_err();
        assert_eq!(err, "os");
    }

    #[test]
    fn test_placeholders_lists_pairs() {
        let found = placeholders("pytest ${{matrix.group}} --ref ${{ trigger.ref }}");
        assert_eq!(
            found,
            vec![
                ("matrix".to_string(), "group".to_string()),
                ("trigger".to_string(), "ref".to_string())
            ]
        );
    }
}
