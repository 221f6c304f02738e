//! JSON Schema documents shipped inside the archive.
//!
//! Readers validate part records against these; they describe the required
//! core of each record and deliberately allow additional properties so the
//! format can grow without breaking old archives.

use serde_json::{json, Value};

pub fn schema_for(dataset: &str) -> Option<Value> {
    let schema = match dataset {
        "pages" => json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "atlas://schemas/pages",
            "title": "PageRecord",
            "type": "object",
            "required": [
                "urlKey", "url", "normalizedUrl", "finalUrl", "statusCode",
                "renderMode", "navEndReason", "rawHtmlHash", "domHash", "depth"
            ],
            "properties": {
                "urlKey": { "type": "string", "pattern": "^[0-9a-f]{40}$" },
                "url": { "type": "string" },
                "normalizedUrl": { "type": "string" },
                "finalUrl": { "type": "string" },
                "statusCode": { "type": "integer" },
                "renderMode": { "enum": ["raw", "prerender", "full"] },
                "navEndReason": { "enum": ["fetch", "load", "networkidle", "timeout", "error"] },
                "rawHtmlHash": { "type": "string", "pattern": "^[0-9a-f]{64}$" },
                "domHash": { "type": "string", "pattern": "^[0-9a-f]{64}$" },
                "depth": { "type": "integer", "minimum": 0 },
                "mediaAssetsCount": { "type": "integer", "maximum": 1000 },
                "mediaAssetsTruncated": { "type": "boolean" }
            },
            "additionalProperties": true
        }),
        "edges" => json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "atlas://schemas/edges",
            "title": "EdgeRecord",
            "type": "object",
            "required": ["sourceUrl", "targetUrl", "selectorHint", "external", "location"],
            "properties": {
                "sourceUrl": { "type": "string" },
                "targetUrl": { "type": "string" },
                "selectorHint": { "type": "string" },
                "external": { "type": "boolean" },
                "nofollow": { "type": "boolean" },
                "sponsored": { "type": "boolean" },
                "ugc": { "type": "boolean" },
                "location": {
                    "enum": ["nav", "header", "footer", "aside", "main", "body", "unknown"]
                }
            },
            "additionalProperties": true
        }),
        "assets" => json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "atlas://schemas/assets",
            "title": "AssetRecord",
            "type": "object",
            "required": ["pageUrl", "assetUrl", "kind", "hasAlt", "visible", "inViewport"],
            "properties": {
                "pageUrl": { "type": "string" },
                "assetUrl": { "type": "string" },
                "kind": { "enum": ["image", "video"] },
                "hasAlt": { "type": "boolean" },
                "visible": { "type": "boolean" },
                "inViewport": { "type": "boolean" }
            },
            "additionalProperties": true
        }),
        "errors" => json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "atlas://schemas/errors",
            "title": "ErrorRecord",
            "type": "object",
            "required": ["url", "origin", "host", "occurredAt", "phase", "code", "message"],
            "properties": {
                "url": { "type": "string" },
                "origin": { "type": "string" },
                "host": { "type": "string" },
                "occurredAt": { "type": "string", "format": "date-time" },
                "phase": { "enum": ["fetch", "render", "extract", "write"] },
                "code": { "type": "string" },
                "message": { "type": "string" }
            },
            "additionalProperties": true
        }),
        "accessibility" => json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "atlas://schemas/accessibility",
            "title": "AccessibilityRecord",
            "type": "object",
            "required": ["pageUrl", "missingAltCount", "headingSequence", "landmarks", "roleHistogram"],
            "properties": {
                "pageUrl": { "type": "string" },
                "missingAltCount": { "type": "integer", "minimum": 0 },
                "headingSequence": { "type": "array", "items": { "type": "integer" } },
                "landmarks": { "type": "object" },
                "roleHistogram": { "type": "object" }
            },
            "additionalProperties": true
        }),
        "console" => json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "atlas://schemas/console",
            "title": "ConsoleRecord",
            "type": "object",
            "required": ["pageUrl", "level", "text", "occurredAt"],
            "properties": {
                "pageUrl": { "type": "string" },
                "level": { "type": "string" },
                "text": { "type": "string" },
                "occurredAt": { "type": "string", "format": "date-time" }
            },
            "additionalProperties": true
        }),
        "styles" => json!({
            "$schema": "https://json-schema.org/draft/2020-12/schema",
            "$id": "atlas://schemas/styles",
            "title": "ComputedTextNodeRecord",
            "type": "object",
            "required": ["pageUrl", "selector", "text"],
            "properties": {
                "pageUrl": { "type": "string" },
                "selector": { "type": "string" },
                "text": { "type": "string" }
            },
            "additionalProperties": true
        }),
        _ => return None,
    };
    Some(schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_dataset_has_a_schema() {
        for dataset in ["pages", "edges", "assets", "errors", "accessibility", "console", "styles"]
        {
            let schema = schema_for(dataset).unwrap();
            assert_eq!(schema["$id"], format!("atlas://schemas/{dataset}"));
            assert!(schema["required"].is_array());
        }
        assert!(schema_for("nonsense").is_none());
    }
}
