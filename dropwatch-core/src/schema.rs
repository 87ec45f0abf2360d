//! # Schema Registry
//!
//! SoundDrop nodes publish their Protobuf schema at `/messages` in the JSON layout produced by
//! protobuf.js (`Root.toJSON()`). This module turns that JSON into a regular
//! `prost_reflect::DescriptorPool` so messages can be decoded dynamically by name.
//!
//! * **[`SchemaRegistry`]:** Immutable, queryable view over the converted schema.
//! * **[`SchemaLoader`]:** One-shot retrieval of the schema JSON, over HTTP or from a file.
mod loader;
mod protobufjs;

pub use loader::{DEFAULT_SCHEMA_PATH, LoadError, SchemaLoader, SchemaSource};

use prost_reflect::{DescriptorError, DescriptorPool, MessageDescriptor};
use std::path::Path;

/// Errors that can occur while building a registry or looking up a type in it.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Schema is not a valid protobuf.js JSON description: '{0}'")]
    InvalidJson(#[from] serde_json::Error),
    #[error("Type '{name}' referenced from '{scope}' is not defined")]
    UnresolvedType { name: String, scope: String },
    #[error("Invalid definition at '{path}': {reason}")]
    InvalidDefinition { path: String, reason: String },
    #[error("Namespaces import each other: {0}")]
    ImportCycle(String),
    #[error("Failed to build descriptor pool: '{0}'")]
    Descriptor(#[from] DescriptorError),
    #[error("Message type '{0}' not found in schema")]
    MessageNotFound(String),
}

/// A registry of message layouts built from a protobuf.js JSON schema.
///
/// The registry is loaded once and never mutated afterwards. It is cheap to clone since the
/// underlying pool is reference counted.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    pool: DescriptorPool,
}

impl SchemaRegistry {
    /// Parses a protobuf.js JSON schema body and builds the registry.
    ///
    /// # Returns
    ///
    /// * `Ok(SchemaRegistry)` - The populated registry.
    /// * `Err(SchemaError)` - If the body is not valid JSON, references an unknown type, or
    ///   describes something protobuf itself rejects.
    pub fn from_json(body: &[u8]) -> Result<Self, SchemaError> {
        let root: protobufjs::Namespace = serde_json::from_slice(body)?;
        let fd_set = protobufjs::into_file_descriptor_set(root)?;
        let pool = DescriptorPool::from_file_descriptor_set(fd_set)?;
        Ok(Self { pool })
    }

    /// Reads a protobuf.js JSON schema from disk.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref();
        let body = tokio::fs::read(path).await.map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::from_json(&body)?)
    }

    /// Looks up a message type by its fully qualified name (e.g. `message.WSDeviceStatus`).
    pub fn lookup_message(&self, name: &str) -> Result<MessageDescriptor, SchemaError> {
        let name = name.strip_prefix('.').unwrap_or(name);
        self.pool
            .get_message_by_name(name)
            .ok_or_else(|| SchemaError::MessageNotFound(name.to_string()))
    }

    /// Lists the fully qualified names of every message type in the schema, sorted.
    ///
    /// Synthesized map entry messages are left out.
    pub fn message_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .pool
            .all_messages()
            .filter(|m| !m.is_map_entry())
            .map(|m| m.full_name().to_string())
            .collect();
        names.sort();
        names
    }

    /// The underlying descriptor pool.
    pub fn descriptor_pool(&self) -> &DescriptorPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost_reflect::{Cardinality, Kind};

    const DEVICE_STATUS_SCHEMA: &str = r#"{"nested":{"message":{"nested":{"WSDeviceStatus":{"fields":{"battery":{"type":"uint32","id":1}}}}}}}"#;

    #[test]
    fn test_lookup_device_status() {
        let registry = SchemaRegistry::from_json(DEVICE_STATUS_SCHEMA.as_bytes())
            .expect("Failed to build registry");

        let message = registry
            .lookup_message("message.WSDeviceStatus")
            .expect("WSDeviceStatus not found");

        assert_eq!(message.package_name(), "message");
        let battery = message.get_field_by_name("battery").expect("missing field");
        assert_eq!(battery.number(), 1);
        assert!(matches!(battery.kind(), Kind::Uint32));

        // A leading dot is accepted as well
        assert!(registry.lookup_message(".message.WSDeviceStatus").is_ok());
    }

    #[test]
    fn test_lookup_unknown_message() {
        let registry = SchemaRegistry::from_json(DEVICE_STATUS_SCHEMA.as_bytes()).unwrap();

        let err = registry.lookup_message("message.Ghost").unwrap_err();
        assert!(matches!(err, SchemaError::MessageNotFound(name) if name == "message.Ghost"));
    }

    #[test]
    fn test_nested_types_enums_and_maps() {
        let schema = serde_json::json!({
            "nested": {
                "message": {
                    "nested": {
                        "WSDeviceStatus": {
                            "fields": {
                                "name": { "type": "string", "id": 1 },
                                "state": { "type": "State", "id": 2 },
                                "peers": { "rule": "repeated", "type": "Peer", "id": 3 },
                                "volumes": { "keyType": "string", "type": "uint32", "id": 4 },
                                "levels": { "rule": "repeated", "type": "int32", "id": 5, "options": { "packed": true } }
                            },
                            "nested": {
                                "Peer": {
                                    "fields": {
                                        "id": { "type": "string", "id": 1 },
                                        "online": { "type": "bool", "id": 2 }
                                    }
                                }
                            }
                        },
                        "State": {
                            "values": { "PLAYING": 1, "IDLE": 0 }
                        }
                    }
                }
            }
        });

        let registry = SchemaRegistry::from_json(schema.to_string().as_bytes()).unwrap();
        let message = registry.lookup_message("message.WSDeviceStatus").unwrap();

        let state = message.get_field_by_name("state").unwrap();
        match state.kind() {
            Kind::Enum(e) => {
                assert_eq!(e.full_name(), "message.State");
                assert_eq!(e.default_value().name(), "IDLE");
            }
            other => panic!("Expected enum kind, got {other:?}"),
        }

        let peers = message.get_field_by_name("peers").unwrap();
        assert_eq!(peers.cardinality(), Cardinality::Repeated);
        match peers.kind() {
            Kind::Message(m) => assert_eq!(m.full_name(), "message.WSDeviceStatus.Peer"),
            other => panic!("Expected message kind, got {other:?}"),
        }

        let volumes = message.get_field_by_name("volumes").unwrap();
        assert!(volumes.is_map());

        let levels = message.get_field_by_name("levels").unwrap();
        assert!(levels.is_packed());

        assert_eq!(
            registry.message_names(),
            vec![
                "message.WSDeviceStatus".to_string(),
                "message.WSDeviceStatus.Peer".to_string(),
            ]
        );
    }

    #[test]
    fn test_cross_namespace_reference() {
        let schema = serde_json::json!({
            "nested": {
                "common": {
                    "nested": {
                        "Battery": { "fields": { "level": { "type": "uint32", "id": 1 } } }
                    }
                },
                "message": {
                    "nested": {
                        "WSDeviceStatus": {
                            "fields": { "battery": { "type": "common.Battery", "id": 1 } }
                        }
                    }
                }
            }
        });

        let registry = SchemaRegistry::from_json(schema.to_string().as_bytes()).unwrap();
        let message = registry.lookup_message("message.WSDeviceStatus").unwrap();
        let battery = message.get_field_by_name("battery").unwrap();

        match battery.kind() {
            Kind::Message(m) => assert_eq!(m.full_name(), "common.Battery"),
            other => panic!("Expected message kind, got {other:?}"),
        }
    }

    #[test]
    fn test_extension_inside_message() {
        let schema = r#"{"nested":{"message":{"nested":{"Base":{"fields":{}},"WSDeviceStatus":{"fields":{"battery":{"type":"uint32","id":1}},"nested":{"ext":{"type":"string","id":100,"extend":"Base"}}}}}}}"#;

        let registry = SchemaRegistry::from_json(schema.as_bytes()).unwrap();
        let message = registry.lookup_message("message.WSDeviceStatus").unwrap();
        assert_eq!(message.fields().count(), 1);
        assert!(message.get_field_by_name("battery").is_some());
    }

    #[test]
    fn test_unresolved_type() {
        let schema = r#"{"nested":{"message":{"nested":{"WSDeviceStatus":{"fields":{"peer":{"type":"Peer","id":1}}}}}}}"#;

        let err = SchemaRegistry::from_json(schema.as_bytes()).unwrap_err();
        assert!(
            matches!(&err, SchemaError::UnresolvedType { name, scope } if name == "Peer" && scope == "message.WSDeviceStatus"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn test_malformed_body() {
        let err = SchemaRegistry::from_json(b"<html>not json</html>").unwrap_err();
        assert!(matches!(err, SchemaError::InvalidJson(_)));

        // A field id that is not a number must not be mistaken for an empty namespace
        let schema = r#"{"nested":{"WSDeviceStatus":{"fields":{"battery":{"type":"uint32","id":"one"}}}}}"#;
        let err = SchemaRegistry::from_json(schema.as_bytes()).unwrap_err();
        assert!(matches!(err, SchemaError::InvalidJson(_)));
    }
}
