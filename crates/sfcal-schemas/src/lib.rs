use anyhow::{anyhow, Result};
use include_dir::{include_dir, Dir};
use jsonschema::JSONSchema;
use serde_json::Value;

static SCHEMAS: Dir<'_> = include_dir!("$CARGO_MANIFEST_DIR/schemas");

pub fn schema_names() -> Vec<&'static str> {
    SCHEMAS
        .files()
        .filter_map(|f| f.path().file_name().and_then(|s| s.to_str()))
        .collect()
}

pub fn compile_schema(name: &str) -> Result<JSONSchema> {
    let file = SCHEMAS
        .get_file(name)
        .ok_or_else(|| anyhow!("unknown schema: {}", name))?;
    let text = file
        .contents_utf8()
        .ok_or_else(|| anyhow!("schema is not utf-8: {}", name))?;
    let schema: Value = serde_json::from_str(text)?;
    JSONSchema::compile(&schema).map_err(|e| anyhow!("schema compile failed ({}): {}", name, e))
}

/// Validates `value`, collecting every violation into one message.
pub fn validate_against(name: &str, value: &Value) -> Result<()> {
    let compiled = compile_schema(name)?;
    if let Err(errors) = compiled.validate(value) {
        let msgs: Vec<String> = errors
            .map(|e| format!("{} at '{}'", e, e.instance_path))
            .collect();
        return Err(anyhow!("{} validation failed: {}", name, msgs.join("; ")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn settings_schema_is_embedded() {
        assert!(schema_names().contains(&"sf_settings_v1.jsonschema"));
        compile_schema("sf_settings_v1.jsonschema").expect("compiles");
        assert!(compile_schema("nope.jsonschema").is_err());
    }

    #[test]
    fn settings_schema_accepts_minimal_document() {
        let settings = json!({
            "partitions": { "A": ["p07-r007", "p07-r008"] },
            "data_path": "/data/ref",
            "survival_fractions": { "sf_TlDEP": ["results", "aoe", "low_side_sfs", "1592.5"] }
        });
        validate_against("sf_settings_v1.jsonschema", &settings).expect("valid");
    }

    #[test]
    fn settings_schema_reports_bad_run_ids_and_unknown_keys() {
        let settings = json!({
            "partitions": { "A": ["p07r007"] },
            "data_path": "/data/ref",
            "survival_fractions": { "sf_TlDEP": ["results"] },
            "extraction": { "error_source": "sigma" },
            "typo": true
        });
        let err = validate_against("sf_settings_v1.jsonschema", &settings).expect_err("invalid");
        let msg = err.to_string();
        assert!(msg.contains("p07r007"), "{}", msg);
        assert!(msg.contains("/extraction/error_source"), "{}", msg);
        assert!(msg.contains("typo"), "{}", msg);
    }
}
