use colored::*;
use dropwatch_core::{
    frame::{DecodedFrame, FrameError},
    prost_reflect::{FieldDescriptor, Kind, MessageDescriptor},
    schema::{LoadError, SchemaError},
    session::{SessionError, SessionSummary},
};

/// A wrapper struct for a formatted, colored string.
///
/// Implements `Display` so it can be printed directly.
pub struct FormattedString(pub String);

pub struct MessageList(pub Vec<String>);

impl std::fmt::Display for FormattedString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f)?;
        writeln!(f, "{}", self.0)?;
        Ok(())
    }
}

impl From<serde_json::Value> for FormattedString {
    fn from(value: serde_json::Value) -> Self {
        FormattedString(serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string()))
    }
}

impl From<DecodedFrame> for FormattedString {
    fn from(frame: DecodedFrame) -> Self {
        let FormattedString(body) = FormattedString::from(frame.message);
        FormattedString(format!(
            "{} {}\n{}",
            "Frame".green().bold(),
            format!("tag=0x{:02x}", frame.tag).dimmed(),
            body
        ))
    }
}

impl From<SessionSummary> for FormattedString {
    fn from(summary: SessionSummary) -> Self {
        FormattedString(format!(
            "{} decoded={} rejected={} skipped={}",
            "Socket closed:".yellow().bold(),
            summary.decoded.to_string().green(),
            summary.rejected.to_string().red(),
            summary.skipped.to_string().yellow()
        ))
    }
}

impl From<SessionError> for FormattedString {
    fn from(err: SessionError) -> Self {
        FormattedString(format!("{}\n\n'{}'", "Session Failed:".red().bold(), err))
    }
}

impl From<LoadError> for FormattedString {
    fn from(err: LoadError) -> Self {
        FormattedString(format!(
            "{}\n\n'{}'",
            "Failed to load schema:".red().bold(),
            err
        ))
    }
}

impl From<SchemaError> for FormattedString {
    fn from(err: SchemaError) -> Self {
        FormattedString(format!(
            "{}\n\n'{}'",
            "Symbol Lookup Failed:".red().bold(),
            err
        ))
    }
}

impl From<FrameError> for FormattedString {
    fn from(err: FrameError) -> Self {
        FormattedString(format!("{}\n\n'{}'", "Decode Failed:".red().bold(), err))
    }
}

impl From<MessageList> for FormattedString {
    fn from(MessageList(messages): MessageList) -> Self {
        if messages.is_empty() {
            return FormattedString("No message types found.".yellow().to_string());
        }

        let mut out = String::new();
        out.push_str("Message Types:\n");
        for message in messages {
            out.push_str(&format!("  - {}\n", message.green()));
        }
        FormattedString(out.trim_end().to_string())
    }
}

impl From<MessageDescriptor> for FormattedString {
    fn from(message: MessageDescriptor) -> Self {
        let mut out = String::new();
        out.push_str(&format!(
            "{} {} {{\n",
            "message".cyan(),
            message.full_name().green()
        ));

        for field in message.fields() {
            if field.is_map() {
                out.push_str(&format!(
                    "  {} {} = {};\n",
                    map_type_name(&field),
                    field.name(),
                    field.number()
                ));
                continue;
            }

            let label = if field.is_list() {
                format!("{} ", "repeated".cyan())
            } else {
                "".to_string()
            };

            out.push_str(&format!(
                "  {}{} {} = {};\n",
                label,
                kind_name(&field.kind()).yellow(),
                field.name(),
                field.number()
            ));
        }
        out.push('}');
        FormattedString(out)
    }
}

fn map_type_name(field: &FieldDescriptor) -> String {
    match field.kind() {
        Kind::Message(entry) => {
            let key = entry.map_entry_key_field().kind();
            let value = entry.map_entry_value_field().kind();
            format!(
                "{}<{}, {}>",
                "map".cyan(),
                kind_name(&key).yellow(),
                kind_name(&value).yellow()
            )
        }
        other => kind_name(&other),
    }
}

fn kind_name(kind: &Kind) -> String {
    match kind {
        Kind::Double => "double".to_string(),
        Kind::Float => "float".to_string(),
        Kind::Int32 => "int32".to_string(),
        Kind::Int64 => "int64".to_string(),
        Kind::Uint32 => "uint32".to_string(),
        Kind::Uint64 => "uint64".to_string(),
        Kind::Sint32 => "sint32".to_string(),
        Kind::Sint64 => "sint64".to_string(),
        Kind::Fixed32 => "fixed32".to_string(),
        Kind::Fixed64 => "fixed64".to_string(),
        Kind::Sfixed32 => "sfixed32".to_string(),
        Kind::Sfixed64 => "sfixed64".to_string(),
        Kind::Bool => "bool".to_string(),
        Kind::String => "string".to_string(),
        Kind::Bytes => "bytes".to_string(),
        Kind::Message(m) => m.full_name().to_string(),
        Kind::Enum(e) => e.full_name().to_string(),
    }
}
