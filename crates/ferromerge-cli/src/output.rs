pub mod stream_writer;

use serde::Serialize;
use serde_json::Value;

use crate::cli::OutputFormat;
use crate::error::CliError;
use crate::metadata::Metadata;

/// Command result as printed on stdout.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub meta: Metadata,
    pub data: Value,
}

pub fn render(envelope: &Envelope, format: OutputFormat, pretty: bool) -> Result<(), CliError> {
    println!("{}", to_text(envelope, format, pretty)?);
    Ok(())
}

fn to_text(envelope: &Envelope, format: OutputFormat, pretty: bool) -> Result<String, CliError> {
    let text = match format {
        OutputFormat::Json if pretty => serde_json::to_string_pretty(envelope)?,
        OutputFormat::Json => serde_json::to_string(envelope)?,
        OutputFormat::Yaml => serde_yaml::to_string(envelope)?.trim_end().to_owned(),
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope() -> Envelope {
        Envelope {
            meta: Metadata::new("sources", 3),
            data: json!({"sources": ["price"]}),
        }
    }

    #[test]
    fn compact_json_is_a_single_line() {
        let text = to_text(&envelope(), OutputFormat::Json, false).expect("json");
        assert!(!text.contains('\n'));
        let parsed: Value = serde_json::from_str(&text).expect("parse");
        assert_eq!(parsed["meta"]["command"], "sources");
        assert_eq!(parsed["data"]["sources"][0], "price");
    }

    #[test]
    fn yaml_output_nests_meta_and_data() {
        let text = to_text(&envelope(), OutputFormat::Yaml, false).expect("yaml");
        assert!(text.starts_with("meta:"));
        assert!(text.contains("data:"));
        assert!(text.contains("- price"));
    }
}
