use anyhow::{bail, Result};
use std::collections::HashMap;

/// Template expansion for domain XML and cloud-init vendor data.
///
/// `mustache`'s default behavior renders a missing key as empty text, which
/// would silently produce a broken domain XML or vendor-data document. This
/// renderer scans the template for `{{variable}}` references first and
/// fails fast if any of them aren't present in `vars`, rather than letting
/// a typo or a forgotten field through as silent empty output.
pub struct Renderer;

impl Renderer {
    pub fn render(template: &str, vars: &HashMap<String, String>) -> Result<String> {
        for var in referenced_variables(template) {
            if !vars.contains_key(&var) {
                bail!("template references unbound variable `{var}`");
            }
        }
        let compiled = mustache::compile_str(template)?;
        Ok(compiled.render_to_string(vars)?)
    }
}

/// Extract the set of `{{name}}` / `{{{name}}}` references from a mustache
/// template, ignoring section/partial/comment sigils (`#`, `/`, `^`, `>`, `!`).
fn referenced_variables(template: &str) -> Vec<String> {
    let mut vars = Vec::new();
    let mut push = |name: &str| {
        if !name.is_empty() && !vars.contains(&name.to_string()) {
            vars.push(name.to_string());
        }
    };
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        let after = &rest[start + 2..];
        if let Some(unescaped) = after.strip_prefix('{') {
            if let Some(end) = unescaped.find("}}}") {
                push(unescaped[..end].trim());
                rest = &unescaped[end + 3..];
                continue;
            }
        }
        let Some(end) = after.find("}}") else { break };
        let raw = after[..end].trim();
        let name = raw.trim_start_matches(['#', '/', '^', '>', '!', '&']).trim();
        push(name);
        rest = &after[end + 2..];
    }
    vars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_with_all_variables_bound() {
        let mut vars = HashMap::new();
        vars.insert("name".to_string(), "vm1".to_string());
        let out = Renderer::render("hello {{name}}", &vars).unwrap();
        assert_eq!(out, "hello vm1");
    }

    #[test]
    fn fails_fast_on_unbound_variable() {
        let vars = HashMap::new();
        let err = Renderer::render("hello {{name}}", &vars).unwrap_err();
        assert!(err.to_string().contains("name"));
    }

    #[test]
    fn ignores_section_markers() {
        assert_eq!(
            referenced_variables("{{#networks}}{{br_name}}{{/networks}}"),
            vec!["networks".to_string(), "br_name".to_string()]
        );
    }
}
