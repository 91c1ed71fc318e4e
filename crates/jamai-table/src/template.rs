//! Cell template interpolation
//!
//! Prompts reference sibling cells as `${col}`. `\${...}` survives as the
//! literal `${...}`. File-typed references split the prompt into multimodal
//! content parts; everything else substitutes as text, with null cells
//! becoming the empty string.

use crate::schema::ColumnDtype;
use jamai_llm::{ContentPart, ImageUrl, InputAudio};

/// One parsed piece of a template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Literal text
    Text(String),
    /// A `${col}` reference
    Ref(String),
}

/// Parse a template into text and reference segments.
#[must_use]
pub fn parse_template(input: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut text = String::new();
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\\' && chars.peek() == Some(&'$') {
            // `\${` escapes the reference; the braces stay literal.
            chars.next();
            text.push('$');
            continue;
        }
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut name = String::new();
            let mut closed = false;
            for inner in chars.by_ref() {
                if inner == '}' {
                    closed = true;
                    break;
                }
                name.push(inner);
            }
            if closed {
                if !text.is_empty() {
                    segments.push(Segment::Text(std::mem::take(&mut text)));
                }
                segments.push(Segment::Ref(name));
            } else {
                // Unterminated reference stays literal.
                text.push_str("${");
                text.push_str(&name);
            }
            continue;
        }
        text.push(c);
    }
    if !text.is_empty() {
        segments.push(Segment::Text(text));
    }
    segments
}

/// The distinct column IDs a template references, in first-seen order.
#[must_use]
pub fn template_references(input: &str) -> Vec<String> {
    let mut refs = Vec::new();
    for segment in parse_template(input) {
        if let Segment::Ref(name) = segment {
            if !refs.contains(&name) {
                refs.push(name);
            }
        }
    }
    refs
}

/// Interpolate a template to plain text. Missing or null references become
/// the empty string.
pub fn interpolate_text<F>(input: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::new();
    for segment in parse_template(input) {
        match segment {
            Segment::Text(text) => out.push_str(&text),
            Segment::Ref(name) => {
                if let Some(value) = lookup(&name) {
                    out.push_str(&value);
                }
            }
        }
    }
    out
}

/// Interpolate a template into provider-ready content parts. References to
/// file-typed columns whose cell holds a URI split the surrounding text and
/// emit an image / audio / file part in place.
pub fn interpolate_parts<F>(input: &str, lookup: F) -> Vec<ContentPart>
where
    F: Fn(&str) -> Option<(ColumnDtype, String)>,
{
    let mut parts: Vec<ContentPart> = Vec::new();
    let mut text = String::new();

    let mut flush = |text: &mut String, parts: &mut Vec<ContentPart>| {
        if !text.is_empty() {
            parts.push(ContentPart::text(std::mem::take(text)));
        }
    };

    for segment in parse_template(input) {
        match segment {
            Segment::Text(t) => text.push_str(&t),
            Segment::Ref(name) => {
                let Some((dtype, value)) = lookup(&name) else {
                    continue;
                };
                if value.is_empty() {
                    continue;
                }
                match dtype {
                    ColumnDtype::Image => {
                        flush(&mut text, &mut parts);
                        parts.push(ContentPart::ImageUrl {
                            image_url: ImageUrl { url: value },
                        });
                    }
                    ColumnDtype::Audio => {
                        flush(&mut text, &mut parts);
                        if let Some((mime, data)) = value
                            .strip_prefix("data:")
                            .and_then(|rest| rest.split_once(";base64,"))
                        {
                            let format = mime.strip_prefix("audio/").unwrap_or("wav");
                            parts.push(ContentPart::InputAudio {
                                input_audio: InputAudio {
                                    data: data.to_string(),
                                    format: format.to_string(),
                                },
                            });
                        } else {
                            parts.push(ContentPart::text(value));
                        }
                    }
                    ColumnDtype::Document => {
                        flush(&mut text, &mut parts);
                        parts.push(ContentPart::text(value));
                    }
                    _ => text.push_str(&value),
                }
            }
        }
    }
    if !text.is_empty() {
        parts.push(ContentPart::text(text));
    }
    parts
}

/// Rewrite the column references of a template after a rename. Escapes in
/// literal text are preserved.
#[must_use]
pub fn rename_references(
    template: &str,
    renames: &std::collections::HashMap<String, String>,
) -> String {
    let mut out = String::new();
    for segment in parse_template(template) {
        match segment {
            Segment::Text(text) => out.push_str(&text.replace("${", "\\${")),
            Segment::Ref(name) => {
                let name = renames.get(&name).unwrap_or(&name);
                out.push_str(&format!("${{{name}}}"));
            }
        }
    }
    out
}

/// Default system prompt boilerplate
const DEFAULT_SYSTEM: &str = "You are a versatile data generator. \
Your task is to process information from input data and generate appropriate \
responses based on the specified column name and input data.";

/// Default system prompt when the user leaves it empty. Chat `AI` columns
/// get the agent preamble naming the table.
#[must_use]
pub fn default_system_prompt(agent_table_id: Option<&str>) -> String {
    match agent_table_id {
        Some(table_id) => format!(
            "You are an agent named `{table_id}`. {DEFAULT_SYSTEM} \
Use the conversation so far as context and respond to the user naturally."
        ),
        None => DEFAULT_SYSTEM.to_string(),
    }
}

/// Default user prompt: a structured block naming every eligible prior
/// column, then the generation instruction. The caller passes the prior
/// columns already filtered of info and vector columns.
#[must_use]
pub fn default_user_prompt(target_column: &str, prior_columns: &[&str]) -> String {
    let mut prompt = String::new();
    for col in prior_columns {
        prompt.push_str(&format!("{col}: ${{{col}}}\n"));
    }
    prompt.push_str(&format!(
        "\nBased on the input data above, generate the value for the column \
\"{target_column}\". Respond with the value only, without explanations."
    ));
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_plain_text() {
        assert_eq!(
            parse_template("hello world"),
            vec![Segment::Text("hello world".to_string())]
        );
    }

    #[test]
    fn test_parse_references() {
        assert_eq!(
            parse_template("sum of ${a} and ${b}."),
            vec![
                Segment::Text("sum of ".to_string()),
                Segment::Ref("a".to_string()),
                Segment::Text(" and ".to_string()),
                Segment::Ref("b".to_string()),
                Segment::Text(".".to_string()),
            ]
        );
    }

    #[test]
    fn test_escaped_reference_survives_literally() {
        let segments = parse_template(r"literal \${a} but ${b}");
        assert_eq!(
            segments,
            vec![
                Segment::Text("literal ${a} but ".to_string()),
                Segment::Ref("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_unterminated_reference_is_literal() {
        assert_eq!(
            parse_template("${open"),
            vec![Segment::Text("${open".to_string())]
        );
    }

    #[test]
    fn test_references_deduplicated_in_order() {
        assert_eq!(
            template_references("${b} ${a} ${b}"),
            vec!["b".to_string(), "a".to_string()]
        );
    }

    #[test]
    fn test_interpolate_missing_is_empty() {
        let out = interpolate_text("x=${x}, y=${y}!", |name| {
            (name == "x").then(|| "1".to_string())
        });
        assert_eq!(out, "x=1, y=!");
    }

    #[test]
    fn test_interpolate_parts_splits_on_image() {
        let parts = interpolate_parts("look at ${img} closely", |name| match name {
            "img" => Some((ColumnDtype::Image, "s3://bucket/cat.png".to_string())),
            _ => None,
        });
        assert_eq!(parts.len(), 3);
        assert!(matches!(&parts[0], ContentPart::Text { text } if text == "look at "));
        assert!(matches!(&parts[1], ContentPart::ImageUrl { .. }));
        assert!(matches!(&parts[2], ContentPart::Text { text } if text == " closely"));
    }

    #[test]
    fn test_interpolate_parts_audio_data_uri() {
        let parts = interpolate_parts("${clip}", |_| {
            Some((ColumnDtype::Audio, "data:audio/mp3;base64,Zm9v".to_string()))
        });
        assert_eq!(parts.len(), 1);
        let ContentPart::InputAudio { input_audio } = &parts[0] else {
            panic!("expected audio part");
        };
        assert_eq!(input_audio.format, "mp3");
        assert_eq!(input_audio.data, "Zm9v");
    }

    #[test]
    fn test_interpolate_parts_text_stays_inline() {
        let parts = interpolate_parts("a=${a}", |_| {
            Some((ColumnDtype::Str, "1".to_string()))
        });
        assert_eq!(parts, vec![ContentPart::text("a=1")]);
    }

    #[test]
    fn test_rename_references_keeps_escapes() {
        let mut renames = std::collections::HashMap::new();
        renames.insert("old".to_string(), "new".to_string());
        assert_eq!(
            rename_references(r"v=${old}, literal \${old}", &renames),
            r"v=${new}, literal \${old}"
        );
        // Unmapped references pass through.
        assert_eq!(rename_references("${other}", &renames), "${other}");
    }

    #[test]
    fn test_default_prompts() {
        let system = default_system_prompt(None);
        assert!(system.starts_with("You are a versatile data generator."));

        let agent = default_system_prompt(Some("support-bot"));
        assert!(agent.starts_with("You are an agent named `support-bot`"));

        let user = default_user_prompt("out", &["a", "b"]);
        assert!(user.contains("a: ${a}"));
        assert!(user.contains("b: ${b}"));
        assert!(user.contains("\"out\""));
    }
}
