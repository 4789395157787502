//! `{{placeholder}}` substitution for message templates.
//!
//! Rendering is a single pass over the template text. Substituted values are
//! never scanned again, so a value containing `{{x}}` is inserted literally.

use std::collections::HashMap;

use herald_core::Template;
use serde_json::Value;

/// Renders the template body with `data`.
pub fn render(template: &Template, data: &HashMap<String, Value>) -> String {
    render_str(&template.body, data)
}

/// Renders the template subject with `data`, if the template has one.
pub fn render_subject(template: &Template, data: &HashMap<String, Value>) -> Option<String> {
    template.subject.as_deref().map(|subject| render_str(subject, data))
}

/// Replaces every `{{ key }}` in `text` whose trimmed key is present in
/// `data`. Unknown keys and an unterminated `{{` are left untouched.
pub fn render_str(text: &str, data: &HashMap<String, Value>) -> String {
    let mut output = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(open) = rest.find("{{") {
        output.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];

        let Some(close) = after_open.find("}}") else {
            output.push_str(&rest[open..]);
            return output;
        };

        let key = after_open[..close].trim();
        match data.get(key) {
            Some(value) => output.push_str(&value_text(value)),
            None => output.push_str(&rest[open..open + 2 + close + 2]),
        }
        rest = &after_open[close + 2..];
    }

    output.push_str(rest);
    output
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use herald_core::ChannelKind;
    use serde_json::json;

    use super::*;

    fn data(pairs: &[(&str, Value)]) -> HashMap<String, Value> {
        pairs.iter().map(|(k, v)| ((*k).to_string(), v.clone())).collect()
    }

    #[test]
    fn substitutes_known_keys_with_whitespace() {
        let rendered = render_str("Hi {{name}}, code {{ code }}", &data(&[
            ("name", json!("Ada")),
            ("code", json!(1234)),
        ]));

        assert_eq!(rendered, "Hi Ada, code 1234");
    }

    #[test]
    fn unknown_keys_are_preserved() {
        let rendered = render_str("Hi {{ name }}, {{missing}}", &data(&[("name", json!("Ada"))]));
        assert_eq!(rendered, "Hi Ada, {{missing}}");
    }

    #[test]
    fn unterminated_placeholder_is_preserved() {
        let rendered = render_str("Hi {{name", &data(&[("name", json!("Ada"))]));
        assert_eq!(rendered, "Hi {{name");
    }

    #[test]
    fn values_are_not_rescanned() {
        let rendered = render_str("{{a}}", &data(&[("a", json!("{{b}}")), ("b", json!("x"))]));
        assert_eq!(rendered, "{{b}}");
    }

    #[test]
    fn non_string_values_use_json_text() {
        let rendered = render_str("{{flag}} {{items}} {{nothing}}", &data(&[
            ("flag", json!(true)),
            ("items", json!([1, 2])),
            ("nothing", Value::Null),
        ]));
        assert_eq!(rendered, "true [1,2] null");
    }

    #[test]
    fn subject_rendered_only_when_present() {
        let now = Utc::now();
        let with_subject = Template::new(
            "welcome",
            ChannelKind::Email,
            Some("Welcome {{name}}".to_string()),
            "Hello {{name}}",
            now,
        );
        let without_subject = Template::new("otp", ChannelKind::Sms, None, "{{code}}", now);
        let values = data(&[("name", json!("Ada"))]);

        assert_eq!(render_subject(&with_subject, &values).as_deref(), Some("Welcome Ada"));
        assert_eq!(render(&with_subject, &values), "Hello Ada");
        assert!(render_subject(&without_subject, &values).is_none());
    }
}
