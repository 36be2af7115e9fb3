//! JSON schema for `config.toml`, and default configs annotated from it.
//!
//! The schema is derived from [`AppConfig`] with schemars. The same schema
//! supplies the `# ...` line printed above each `[section]` of a generated
//! config, so the TOML and the schema never disagree about what a section is for.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use schemars::Schema;
use schemars::generate::SchemaSettings;
use serde_json::{Value, json};

use crate::config::AppConfig;

/// Generated schema filename.
pub const SCHEMA_FILENAME: &str = "config.schema.json";

/// Generated config filename.
pub const CONFIG_FILENAME: &str = "config.toml";

fn config_schema(project_name: &str, repo_url: &str) -> Schema {
    // Draft-07 is what taplo and most TOML editors understand.
    let mut schema = SchemaSettings::draft07()
        .into_generator()
        .into_root_schema_for::<AppConfig>();

    schema.insert(
        "$id".to_string(),
        json!(format!("{repo_url}/schemas/{SCHEMA_FILENAME}")),
    );
    schema.insert("title".to_string(), json!(format!("{project_name} configuration")));
    schema.insert(
        "description".to_string(),
        json!(format!("Configuration schema for {project_name}")),
    );

    // `$schema` is skipped on the struct but editors expect to be allowed to set it.
    if let Some(properties) = schema
        .get_mut("properties")
        .and_then(Value::as_object_mut)
    {
        properties.insert(
            "$schema".to_string(),
            json!({ "type": "string", "description": "JSON Schema reference for editor support" }),
        );
    }

    schema
}

/// Description of each top-level config section, keyed by section name.
///
/// Prefers the field's own doc comment and falls back to the description on
/// the referenced definition.
fn section_descriptions(schema: &Schema) -> BTreeMap<String, String> {
    let root = schema.as_value();
    let Some(properties) = root.get("properties").and_then(Value::as_object) else {
        return BTreeMap::new();
    };

    properties
        .iter()
        .filter(|(name, _)| !name.starts_with('$'))
        .filter_map(|(name, property)| {
            let description = property
                .get("description")
                .or_else(|| referenced(root, property)?.get("description"))
                .and_then(Value::as_str)?;
            Some((name.clone(), description.to_string()))
        })
        .collect()
}

/// Definition a property points at, directly or through a single-entry `allOf`.
fn referenced<'a>(root: &'a Value, property: &'a Value) -> Option<&'a Value> {
    let reference = property
        .get("$ref")
        .or_else(|| property.get("allOf")?.get(0)?.get("$ref"))
        .and_then(Value::as_str)?;
    let pointer = reference.strip_prefix('#')?;
    root.pointer(pointer)
}

/// The default config as TOML, each top-level section preceded by its
/// description.
///
/// # Errors
///
/// Returns an error if TOML serialization fails.
pub fn annotated_default_config() -> Result<String> {
    let toml_body = toml::to_string_pretty(&AppConfig::default())
        .context("serializing default config to TOML")?;
    let descriptions = section_descriptions(&config_schema("", ""));

    let mut output = String::with_capacity(toml_body.len() * 2);
    for line in toml_body.lines() {
        let section = line
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'));
        if let Some(description) = section.and_then(|name| descriptions.get(name)) {
            output.push_str("# ");
            output.push_str(description);
            output.push('\n');
        }
        output.push_str(line);
        output.push('\n');
    }
    Ok(output)
}

/// Generate the JSON schema for `AppConfig`.
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn generate_schema(project_name: &str, repo_url: &str) -> Result<String> {
    serde_json::to_string_pretty(&config_schema(project_name, repo_url))
        .context("serializing JSON schema")
}

/// Generate an example config that points editors at the sibling schema file.
///
/// # Errors
///
/// Returns an error if TOML serialization fails.
pub fn generate_example_config(project_name: &str) -> Result<String> {
    Ok(format!(
        "\"$schema\" = \"./{SCHEMA_FILENAME}\"\n\n\
         # Example configuration for {project_name}.\n\
         # Copy to $XDG_CONFIG_HOME/{project_name}/{CONFIG_FILENAME} and adjust.\n\n\
         {}",
        annotated_default_config()?
    ))
}

/// Write the schema and the example config into `output_dir`.
///
/// # Errors
///
/// Returns an error if directory creation or file writing fails.
pub fn write_generated_files(output_dir: &Path, project_name: &str, repo_url: &str) -> Result<()> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating output directory: {}", output_dir.display()))?;

    let files = [
        (SCHEMA_FILENAME, generate_schema(project_name, repo_url)?),
        (CONFIG_FILENAME, generate_example_config(project_name)?),
    ];
    for (name, content) in files {
        let path = output_dir.join(name);
        fs::write(&path, content).with_context(|| format!("writing {}", path.display()))?;
    }
    Ok(())
}
