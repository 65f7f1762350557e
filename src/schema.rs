//! Message types and their payload schemas. The registry maps numeric message-type ids to schema
//!  names; a [SchemaProvider] turns payload objects into bytes and back for a given schema name.

pub mod provider;
pub mod registry;

pub use provider::{JsonSchemaProvider, SchemaProvider, PACKET_HEAD_SCHEMA};
pub use registry::MessageTypeRegistry;
