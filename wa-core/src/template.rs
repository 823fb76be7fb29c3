use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateDef {
    pub template: String,
    #[serde(default)]
    pub defaults: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TemplateSet(pub HashMap<String, TemplateDef>);

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\{\{\s*([^{}]+)\s*\}\}").unwrap());

impl TemplateSet {
    pub fn load_str(yaml: &str) -> anyhow::Result<Self> {
        let map: HashMap<String, TemplateDef> = serde_yaml::from_str(yaml)?;
        Ok(TemplateSet(map))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Substitutes `{{ key }}` placeholders, merging `defaults` under the
    /// caller-provided variables and accepting accented-key variants
    /// (`último_assunto` ⇄ `ultimo_assunto`), matching `render_template`.
    pub fn render(&self, name: &str, variables: &HashMap<String, String>) -> String {
        let default_body = "{{resposta}}".to_string();
        let (body, defaults) = match self.0.get(name) {
            Some(def) => (def.template.clone(), &def.defaults),
            None => (default_body, &EMPTY_DEFAULTS),
        };

        PLACEHOLDER
            .replace_all(&body, |caps: &regex::Captures| {
                let key = caps[1].trim();
                lookup(key, variables, defaults)
            })
            .into_owned()
    }

    /// Renders `name`; if the result is empty, falls back to the
    /// `fallback` template and reports that the fallback fired, matching
    /// `render_template`'s empty-output guard in §4.7.
    pub fn render_or_fallback(&self, name: &str, variables: &HashMap<String, String>) -> (String, bool) {
        let rendered = self.render(name, variables);
        if rendered.trim().is_empty() {
            (self.render("fallback", variables), true)
        } else {
            (rendered, false)
        }
    }
}

static EMPTY_DEFAULTS: Lazy<HashMap<String, String>> = Lazy::new(HashMap::new);

fn lookup(key: &str, variables: &HashMap<String, String>, defaults: &HashMap<String, String>) -> String {
    if let Some(v) = variables.get(key).or_else(|| defaults.get(key)) {
        return v.clone();
    }
    let lowered = key.to_lowercase();
    if let Some(v) = variables.get(&lowered).or_else(|| defaults.get(&lowered)) {
        return v.clone();
    }
    let deaccented = key.replace('ú', "u").replace('é', "e").replace('ã', "a");
    if let Some(v) = variables.get(&deaccented).or_else(|| defaults.get(&deaccented)) {
        return v.clone();
    }
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set() -> TemplateSet {
        TemplateSet::load_str(
            r#"
default:
  template: "{{resposta}}"
fallback:
  template: "{{transferencia}}"
greeting:
  template: "{{saudacao}}, {{nome}}!"
"#,
        )
        .unwrap()
    }

    #[test]
    fn renders_default_with_resposta() {
        let templates = set();
        let mut vars = HashMap::new();
        vars.insert("resposta".to_string(), "Oi, como posso ajudar?".to_string());
        assert_eq!(templates.render("default", &vars), "Oi, como posso ajudar?");
    }

    #[test]
    fn falls_back_to_default_body_for_unknown_template() {
        let templates = TemplateSet::load_str("default:\n  template: \"{{resposta}}\"\n").unwrap();
        let mut vars = HashMap::new();
        vars.insert("resposta".to_string(), "oi".to_string());
        assert_eq!(templates.render("does_not_exist", &vars), "oi");
    }

    #[test]
    fn accepts_accented_key_variant() {
        let templates = TemplateSet::load_str("x:\n  template: \"{{último_assunto}}\"\n").unwrap();
        let mut vars = HashMap::new();
        vars.insert("ultimo_assunto".to_string(), "pedido 123".to_string());
        assert_eq!(templates.render("x", &vars), "pedido 123");
    }

    #[test]
    fn merges_defaults_under_caller_variables() {
        let templates = TemplateSet::load_str(
            "greet:\n  template: \"{{saudacao}}\"\n  defaults:\n    saudacao: \"Olá\"\n",
        )
        .unwrap();
        let empty = HashMap::new();
        assert_eq!(templates.render("greet", &empty), "Olá");
    }

    #[test]
    fn falls_back_when_rendered_output_is_empty() {
        let templates = TemplateSet::load_str(
            "acknowledgement:\n  template: \"{{resposta}}\"\nfallback:\n  template: \"{{transferencia}}\"\n",
        )
        .unwrap();
        let mut vars = HashMap::new();
        vars.insert("resposta".to_string(), "".to_string());
        vars.insert("transferencia".to_string(), "Transferindo para um atendente.".to_string());
        let (body, used_fallback) = templates.render_or_fallback("acknowledgement", &vars);
        assert!(used_fallback);
        assert_eq!(body, "Transferindo para um atendente.");
    }

    #[test]
    fn multi_variable_template_renders_all_placeholders() {
        let templates = set();
        let mut vars = HashMap::new();
        vars.insert("saudacao".to_string(), "Olá".to_string());
        vars.insert("nome".to_string(), "Maria".to_string());
        assert_eq!(templates.render("greeting", &vars), "Olá, Maria!");
    }
}
