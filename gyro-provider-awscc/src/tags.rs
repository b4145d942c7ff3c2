//! Conversion between tag sets and the CloudFormation `Tags` property

use std::collections::BTreeMap;

use gyro_core::tags::TagSet;
use serde_json::json;

/// Build the CloudFormation `Tags` array, sorted by key
pub fn tags_to_json(tags: &TagSet) -> Vec<serde_json::Value> {
    let sorted: BTreeMap<&String, &String> = tags.iter().collect();
    sorted
        .into_iter()
        .map(|(key, value)| json!({"Key": key, "Value": value}))
        .collect()
}

/// Read the `Tags` array of a resource's properties
///
/// Entries without a string `Key` and `Value` are skipped.
pub fn tags_from_json(props: &serde_json::Value) -> TagSet {
    let mut tags = TagSet::new();
    if let Some(tags_array) = props.get("Tags").and_then(|v| v.as_array()) {
        for tag in tags_array {
            if let (Some(key), Some(value)) = (
                tag.get("Key").and_then(|v| v.as_str()),
                tag.get("Value").and_then(|v| v.as_str()),
            ) {
                tags.insert(key.to_string(), value.to_string());
            }
        }
    }
    tags
}

/// JSON Patch that sets the whole `Tags` property
///
/// `add` replaces the member when it exists and creates it otherwise.
pub fn tags_patch(tags: &TagSet) -> Vec<serde_json::Value> {
    vec![json!({"op": "add", "path": "/Tags", "value": tags_to_json(tags)})]
}
