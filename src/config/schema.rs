// src/config/schema.rs

use once_cell::sync::Lazy;
use serde_json::{json, Value};

const HOSTNAME_PATTERN: &str =
    "^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?(\\.[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?)*$";

static SETTINGS_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["cluster"],
        "properties": {
            "mode": {
                "type": "string",
                "enum": ["ephemeral", "standalone", "clustered"]
            },
            "cluster": {
                "type": "object",
                "required": ["name", "broker_nodes"],
                "properties": {
                    "name": {
                        "type": "string",
                        "minLength": 2,
                        "maxLength": 255,
                        "pattern": "^[A-Za-z0-9 _,.;:()-]+$"
                    },
                    "broker_nodes": {
                        "type": "array",
                        "minItems": 1,
                        "maxItems": 9,
                        "items": {
                            "type": "string",
                            "pattern": HOSTNAME_PATTERN
                        }
                    },
                    "flanking_nodes": {
                        "type": "array",
                        "maxItems": 36,
                        "items": {
                            "type": "string",
                            "pattern": HOSTNAME_PATTERN
                        }
                    },
                    "fqdn": {
                        "type": ["string", "null"],
                        "pattern": HOSTNAME_PATTERN
                    },
                    "leader": {
                        "type": ["string", "null"]
                    },
                    "fingerprints": {
                        "type": "object",
                        "additionalProperties": {
                            "type": "string",
                            "pattern": "^[0-9a-f]{64}$"
                        }
                    }
                }
            },
            "services": {
                "type": "object",
                "additionalProperties": {
                    "type": "object",
                    "properties": {
                        "image": {
                            "type": "string",
                            "minLength": 1
                        },
                        "desired": {
                            "type": "string",
                            "enum": ["running", "stopped", "paused"]
                        },
                        "certificate": {
                            "type": ["object", "null"],
                            "required": ["cn"],
                            "properties": {
                                "cn": { "type": "string", "minLength": 1 },
                                "c": { "type": "string", "minLength": 2, "maxLength": 2 },
                                "st": { "type": "string", "minLength": 1 },
                                "l": { "type": "string", "minLength": 1 },
                                "o": { "type": "string", "minLength": 1 },
                                "ou": { "type": "string", "minLength": 1 },
                                "san": {
                                    "type": "array",
                                    "items": { "type": "string" }
                                }
                            }
                        }
                    }
                }
            },
            "metadata": {
                "type": ["object", "null"],
                "properties": {
                    "comment": { "type": ["string", "null"] }
                }
            }
        }
    })
});

/// Get JSON schema for operator settings
pub fn settings_schema() -> &'static Value {
    &SETTINGS_SCHEMA
}

/// Validate settings against the JSON schema
pub fn validate_settings_against_schema(settings: &Value) -> Result<(), String> {
    let compiled = jsonschema::JSONSchema::compile(settings_schema())
        .map_err(|e| format!("Failed to compile schema: {}", e))?;

    compiled.validate(settings).map_err(|errors| {
        let error_msgs: Vec<String> = errors
            .map(|e| format!("{} at {}", e, e.instance_path))
            .collect();
        error_msgs.join(", ")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_settings_pass() {
        let settings = json!({
            "cluster": {
                "name": "Morio test",
                "broker_nodes": ["node-a.example.com"]
            }
        });
        assert!(validate_settings_against_schema(&settings).is_ok());
    }

    #[test]
    fn schema_errors_name_the_offending_path() {
        let settings = json!({
            "cluster": {
                "name": "x",
                "broker_nodes": ["node_a!"]
            }
        });
        let err = validate_settings_against_schema(&settings).unwrap_err();
        assert!(err.contains("/cluster/name"));
        assert!(err.contains("/cluster/broker_nodes/0"));
    }

    #[test]
    fn ten_broker_nodes_are_rejected() {
        let nodes: Vec<String> = (0..10).map(|i| format!("node-{i}.example.com")).collect();
        let settings = json!({
            "cluster": { "name": "big", "broker_nodes": nodes }
        });
        assert!(validate_settings_against_schema(&settings).is_err());
    }
}
