use serde::de::DeserializeOwned;
use serde_json::Value;

pub fn strip_markdown_fence(input: &str) -> String {
    let trimmed = input.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut body = Vec::new();
    for line in trimmed.lines().skip(1) {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// First balanced `{...}` block in `text`, ignoring braces inside strings.
pub fn first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + ch.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parses the first object block into `T`. `None` means the reply did not
/// have the expected shape.
pub fn parse_first_object<T: DeserializeOwned>(text: &str) -> Option<T> {
    let block = first_json_object(text)?;
    let value: Value = serde_json::from_str(block).ok()?;
    if !value.is_object() {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[test]
    fn finds_block_inside_prose_and_fences() {
        let text = "Claro! Aqui está:\n```json\n{\"a\": {\"b\": 1}, \"c\": \"}\"}\n```\nobrigado {x}";
        assert_eq!(first_json_object(text), Some("{\"a\": {\"b\": 1}, \"c\": \"}\"}"));
    }

    #[test]
    fn escaped_quotes_do_not_end_strings() {
        let text = r#"{"nome": "Chave \"inglesa\" {12mm}"} resto"#;
        assert_eq!(first_json_object(text), Some(r#"{"nome": "Chave \"inglesa\" {12mm}"}"#));
    }

    #[test]
    fn unbalanced_yields_none() {
        assert_eq!(first_json_object("{\"a\": 1"), None);
        assert_eq!(first_json_object("sem json"), None);
    }

    #[test]
    fn typed_parse_rejects_wrong_shape() {
        #[derive(Deserialize)]
        struct Verdict {
            #[allow(dead_code)]
            approved: bool,
        }
        assert!(parse_first_object::<Verdict>("{\"approved\": true}").is_some());
        assert!(parse_first_object::<Verdict>("{\"approved\": \"talvez\"}").is_none());
    }

    #[test]
    fn strips_fences() {
        assert_eq!(strip_markdown_fence("```\ntexto\n```"), "texto");
        assert_eq!(strip_markdown_fence("  texto  "), "texto");
    }
}
