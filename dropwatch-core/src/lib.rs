//! # Dropwatch Core
//!
//! `dropwatch-core` is the library behind the Dropwatch CLI. It watches the live device
//! status feed exposed by a SoundDrop node and decodes it without compile-time knowledge
//! of the Protobuf schema.
//!
//! ## Key Components
//!
//! * **[`SchemaRegistry`](schema::SchemaRegistry):** Built from the protobuf.js JSON schema
//!   served by the node at `/messages`. It is converted into a regular `DescriptorPool`, so
//!   any message type can be looked up by its fully qualified name.
//! * **[`SchemaLoader`](schema::SchemaLoader):** Retrieves that JSON, either over HTTP or
//!   from a local file.
//! * **[`FrameDecoder`](frame::FrameDecoder):** Strips the tag byte of a binary frame and
//!   decodes the remaining bytes into a `serde_json::Value`.
//! * **[`session`]:** Drives a WebSocket connection to `/ws`, holding back frames until the
//!   schema is ready and handing every decoded frame to a [`FrameSink`](session::FrameSink).
//!
//! ## Re-exports
//!
//! This crate re-exports `prost-reflect` so that consumers use a compatible version
//! when inspecting descriptors returned by the registry.
pub mod frame;
pub mod schema;
pub mod session;

// Re-exports
pub use prost_reflect;

/// Builds `<scheme>://<host><path>`, adding the leading slash to `path` when missing.
pub(crate) fn endpoint(scheme: &str, host: &str, path: &str) -> String {
    let host = host.trim_end_matches('/');
    if path.starts_with('/') {
        format!("{scheme}://{host}{path}")
    } else {
        format!("{scheme}://{host}/{path}")
    }
}
