use anyhow::bail;
use rustc_hash::FxHashSet;
use serde_json::Value;

use crate::schema::registry::MessageTypeRegistry;

/// schema of the metadata block that precedes every frame's payload
pub const PACKET_HEAD_SCHEMA: &str = "PacketHead";

/// Encodes and decodes payload objects against a named schema
#[cfg_attr(test, mockall::automock)]
pub trait SchemaProvider: Send + Sync {
    fn encode(&self, schema: &str, object: &Value) -> anyhow::Result<Vec<u8>>;

    fn decode(&self, schema: &str, bytes: &[u8]) -> anyhow::Result<Value>;
}

/// Schema provider that represents payloads as JSON text. It knows the schemas of the message
///  types in a registry plus [PACKET_HEAD_SCHEMA], and checks nothing beyond the schema name and
///  the payload being a JSON object.
pub struct JsonSchemaProvider {
    schemas: FxHashSet<String>,
}

impl JsonSchemaProvider {
    pub fn new(registry: &MessageTypeRegistry) -> JsonSchemaProvider {
        let mut schemas = registry.names()
            .map(|name| name.to_string())
            .collect::<FxHashSet<_>>();
        schemas.insert(PACKET_HEAD_SCHEMA.to_string());
        JsonSchemaProvider { schemas }
    }

    fn check_schema(&self, schema: &str) -> anyhow::Result<()> {
        if !self.schemas.contains(schema) {
            bail!("unknown schema {}", schema);
        }
        Ok(())
    }
}

impl SchemaProvider for JsonSchemaProvider {
    fn encode(&self, schema: &str, object: &Value) -> anyhow::Result<Vec<u8>> {
        self.check_schema(schema)?;
        if !object.is_object() {
            bail!("payload for {} is not an object", schema);
        }
        Ok(serde_json::to_vec(object)?)
    }

    fn decode(&self, schema: &str, bytes: &[u8]) -> anyhow::Result<Value> {
        self.check_schema(schema)?;
        if bytes.is_empty() {
            // a message with all fields at their defaults
            return Ok(Value::Object(Default::default()));
        }
        let value: Value = serde_json::from_slice(bytes)?;
        if !value.is_object() {
            bail!("payload for {} is not an object", schema);
        }
        Ok(value)
    }
}
