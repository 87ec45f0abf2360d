//! # protobuf.js JSON descriptors
//!
//! protobuf.js serializes a schema as a tree of namespaces. Every node is a JSON object and
//! its kind is given by which keys it carries:
//!
//! * `fields` -> message type
//! * `values` -> enum
//! * `methods` -> service
//! * `extend` -> extension field
//! * anything else -> namespace (only `nested` is meaningful)
//!
//! Extension fields are skipped. Frames are decoded as their own message type, and an
//! extension on another type never changes how that type's fields decode.
//!
//! The conversion produces one `FileDescriptorProto` per namespace holding definitions, with
//! the namespace's dotted path as package. References across namespaces become imports.
//! The JSON does not record the syntax, so every file is emitted as proto2: fields only appear
//! in decoded output when they were present on the wire.
use super::SchemaError;
use prost_types::{
    DescriptorProto, EnumDescriptorProto, EnumValueDescriptorProto, FieldDescriptorProto,
    FieldOptions, FileDescriptorProto, FileDescriptorSet, MessageOptions, MethodDescriptorProto,
    OneofDescriptorProto, ServiceDescriptorProto,
    descriptor_proto::ReservedRange,
    field_descriptor_proto::{Label, Type},
};
use serde::{Deserialize, Deserializer, de::Error as _};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::debug;

/// File name used for definitions placed directly at the root, outside any package.
const ROOT_FILE_NAME: &str = "_root.proto";

#[derive(Debug)]
pub(crate) enum ReflectionObject {
    Type(TypeDef),
    Enum(EnumDef),
    Service(ServiceDef),
    Extension(ExtensionDef),
    Namespace(Namespace),
}

impl<'de> Deserialize<'de> for ReflectionObject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let object = serde_json::Map::<String, serde_json::Value>::deserialize(deserializer)?;

        let kind = ["fields", "values", "methods", "extend"]
            .into_iter()
            .find(|key| object.contains_key(*key));

        let value = serde_json::Value::Object(object);

        let parsed = match kind {
            Some("fields") => TypeDef::deserialize(value).map(Self::Type),
            Some("values") => EnumDef::deserialize(value).map(Self::Enum),
            Some("methods") => ServiceDef::deserialize(value).map(Self::Service),
            Some("extend") => ExtensionDef::deserialize(value).map(Self::Extension),
            _ => Namespace::deserialize(value).map(Self::Namespace),
        };

        parsed.map_err(D::Error::custom)
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct Namespace {
    #[serde(default)]
    nested: BTreeMap<String, ReflectionObject>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TypeDef {
    fields: BTreeMap<String, FieldDef>,
    #[serde(default)]
    oneofs: BTreeMap<String, OneofDef>,
    #[serde(default)]
    nested: BTreeMap<String, ReflectionObject>,
    #[serde(default)]
    reserved: Vec<Reserved>,
}

#[derive(Debug, Deserialize)]
struct FieldDef {
    #[serde(rename = "type")]
    type_name: String,
    id: i32,
    #[serde(default)]
    rule: Option<String>,
    #[serde(default, rename = "keyType")]
    key_type: Option<String>,
    #[serde(default)]
    options: FieldOptionsDef,
}

#[derive(Debug, Default, Deserialize)]
struct FieldOptionsDef {
    #[serde(default)]
    packed: Option<bool>,
    #[serde(default)]
    default: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OneofDef {
    oneof: Vec<String>,
}

/// `reserved` mixes inclusive `[start, end]` ranges and field names.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Reserved {
    Range(i32, i32),
    Name(String),
}

#[derive(Debug, Deserialize)]
pub(crate) struct EnumDef {
    values: BTreeMap<String, i32>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceDef {
    methods: BTreeMap<String, MethodDef>,
}

/// A field declared with `extend`, outside the type it extends.
#[derive(Debug, Deserialize)]
pub(crate) struct ExtensionDef {
    extend: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MethodDef {
    request_type: String,
    response_type: String,
    #[serde(default)]
    request_stream: bool,
    #[serde(default)]
    response_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SymbolKind {
    Message,
    Enum,
    Service,
}

#[derive(Debug)]
struct Symbol {
    kind: SymbolKind,
    /// Package of the file that will own the definition.
    package: String,
}

/// Converts a protobuf.js root namespace into a `FileDescriptorSet`.
pub(crate) fn into_file_descriptor_set(root: Namespace) -> Result<FileDescriptorSet, SchemaError> {
    let mut symbols = HashMap::new();
    collect_namespace(&root, "", &mut symbols);

    let mut builder = FileSetBuilder {
        resolver: Resolver { symbols },
        files: BTreeMap::new(),
        imports: BTreeMap::new(),
    };

    builder.namespace(root, "")?;
    builder.finish()
}

fn collect_namespace(namespace: &Namespace, path: &str, symbols: &mut HashMap<String, Symbol>) {
    for (name, object) in &namespace.nested {
        let full_name = join(path, name);
        match object {
            ReflectionObject::Namespace(inner) => collect_namespace(inner, &full_name, symbols),
            ReflectionObject::Type(def) => collect_type(def, full_name, path, symbols),
            ReflectionObject::Enum(_) => {
                symbols.insert(full_name, Symbol::new(SymbolKind::Enum, path));
            }
            ReflectionObject::Service(_) => {
                symbols.insert(full_name, Symbol::new(SymbolKind::Service, path));
            }
            ReflectionObject::Extension(_) => {}
        }
    }
}

fn collect_type(
    def: &TypeDef,
    full_name: String,
    package: &str,
    symbols: &mut HashMap<String, Symbol>,
) {
    for (name, object) in &def.nested {
        let nested_name = join(&full_name, name);
        match object {
            ReflectionObject::Type(inner) => collect_type(inner, nested_name, package, symbols),
            ReflectionObject::Enum(_) => {
                symbols.insert(nested_name, Symbol::new(SymbolKind::Enum, package));
            }
            // Rejected or skipped later on, when the type is built
            ReflectionObject::Service(_)
            | ReflectionObject::Namespace(_)
            | ReflectionObject::Extension(_) => {}
        }
    }
    symbols.insert(full_name, Symbol::new(SymbolKind::Message, package));
}

impl Symbol {
    fn new(kind: SymbolKind, package: &str) -> Self {
        Self {
            kind,
            package: package.to_string(),
        }
    }
}

/// Resolves protobuf.js type references to fully qualified names.
struct Resolver {
    symbols: HashMap<String, Symbol>,
}

impl Resolver {
    /// Resolves `reference` the protobuf way: absolute when it starts with a dot, otherwise
    /// searched from `scope` outwards up to the root.
    fn resolve(&self, reference: &str, scope: &str) -> Result<(String, &Symbol), SchemaError> {
        if let Some(absolute) = reference.strip_prefix('.') {
            return self
                .symbols
                .get(absolute)
                .map(|symbol| (absolute.to_string(), symbol))
                .ok_or_else(|| SchemaError::UnresolvedType {
                    name: reference.to_string(),
                    scope: scope.to_string(),
                });
        }

        let mut current = scope;
        loop {
            let candidate = join(current, reference);
            if let Some(symbol) = self.symbols.get(&candidate) {
                return Ok((candidate, symbol));
            }
            if current.is_empty() {
                break;
            }
            current = current.rsplit_once('.').map_or("", |(parent, _)| parent);
        }

        Err(SchemaError::UnresolvedType {
            name: reference.to_string(),
            scope: scope.to_string(),
        })
    }

    /// Resolves a field's type, which may be a scalar, a message or an enum.
    ///
    /// Packages of resolved definitions are added to `imports`.
    fn field_type(
        &self,
        reference: &str,
        scope: &str,
        imports: &mut BTreeSet<String>,
    ) -> Result<(Type, Option<String>), SchemaError> {
        if let Some(scalar) = scalar_type(reference) {
            return Ok((scalar, None));
        }

        let (full_name, symbol) = self.resolve(reference, scope)?;
        let ty = match symbol.kind {
            SymbolKind::Message => Type::Message,
            SymbolKind::Enum => Type::Enum,
            SymbolKind::Service => {
                return Err(SchemaError::InvalidDefinition {
                    path: scope.to_string(),
                    reason: format!("'{full_name}' is a service and cannot be used as a field type"),
                });
            }
        };

        imports.insert(symbol.package.clone());
        Ok((ty, Some(format!(".{full_name}"))))
    }

    /// Resolves a method's request or response type, which must be a message.
    fn message_type(
        &self,
        reference: &str,
        scope: &str,
        imports: &mut BTreeSet<String>,
    ) -> Result<String, SchemaError> {
        let (full_name, symbol) = self.resolve(reference, scope)?;
        if symbol.kind != SymbolKind::Message {
            return Err(SchemaError::InvalidDefinition {
                path: scope.to_string(),
                reason: format!("'{full_name}' is not a message type"),
            });
        }
        imports.insert(symbol.package.clone());
        Ok(format!(".{full_name}"))
    }
}

struct FileSetBuilder {
    resolver: Resolver,
    /// Files keyed by package.
    files: BTreeMap<String, FileDescriptorProto>,
    /// Packages each package depends on.
    imports: BTreeMap<String, BTreeSet<String>>,
}

impl FileSetBuilder {
    fn namespace(&mut self, namespace: Namespace, path: &str) -> Result<(), SchemaError> {
        for (name, object) in namespace.nested {
            let full_name = join(path, &name);
            let mut imports = BTreeSet::new();

            match object {
                ReflectionObject::Namespace(inner) => {
                    self.namespace(inner, &full_name)?;
                    continue;
                }
                ReflectionObject::Extension(def) => {
                    debug!(field = %full_name, extendee = %def.extend, "skipping extension field");
                    continue;
                }
                ReflectionObject::Type(def) => {
                    let message = self.message(name, &full_name, def, &mut imports)?;
                    self.file(path).message_type.push(message);
                }
                ReflectionObject::Enum(def) => {
                    let enum_type = build_enum(name, def);
                    self.file(path).enum_type.push(enum_type);
                }
                ReflectionObject::Service(def) => {
                    let service = self.service(name, &full_name, def, &mut imports)?;
                    self.file(path).service.push(service);
                }
            }

            imports.remove(path);
            self.imports
                .entry(path.to_string())
                .or_default()
                .extend(imports);
        }

        Ok(())
    }

    fn file(&mut self, package: &str) -> &mut FileDescriptorProto {
        self.files
            .entry(package.to_string())
            .or_insert_with(|| FileDescriptorProto {
                name: Some(file_name(package)),
                package: (!package.is_empty()).then(|| package.to_string()),
                syntax: Some("proto2".to_string()),
                ..Default::default()
            })
    }

    fn message(
        &self,
        name: String,
        full_name: &str,
        def: TypeDef,
        imports: &mut BTreeSet<String>,
    ) -> Result<DescriptorProto, SchemaError> {
        let mut message = DescriptorProto {
            name: Some(name),
            ..Default::default()
        };

        let mut fields: Vec<(String, FieldDef)> = def.fields.into_iter().collect();
        fields.sort_by_key(|(_, field)| field.id);

        for (field_name, field) in fields {
            let proto = self.field(field_name, field, full_name, &mut message, imports)?;
            message.field.push(proto);
        }

        for (index, (oneof_name, oneof)) in def.oneofs.into_iter().enumerate() {
            let index = index as i32;

            for member in &oneof.oneof {
                let field = message
                    .field
                    .iter_mut()
                    .find(|f| f.name.as_deref() == Some(member.as_str()))
                    .ok_or_else(|| SchemaError::InvalidDefinition {
                        path: full_name.to_string(),
                        reason: format!("oneof '{oneof_name}' lists unknown field '{member}'"),
                    })?;
                field.oneof_index = Some(index);
            }

            message.oneof_decl.push(OneofDescriptorProto {
                name: Some(oneof_name),
                options: None,
            });
        }

        for (nested_name, object) in def.nested {
            let nested_full_name = join(full_name, &nested_name);
            match object {
                ReflectionObject::Type(inner) => {
                    let nested = self.message(nested_name, &nested_full_name, inner, imports)?;
                    message.nested_type.push(nested);
                }
                ReflectionObject::Enum(inner) => {
                    message.enum_type.push(build_enum(nested_name, inner));
                }
                ReflectionObject::Extension(def) => {
                    debug!(
                        field = %nested_full_name,
                        extendee = %def.extend,
                        "skipping extension field"
                    );
                }
                ReflectionObject::Service(_) | ReflectionObject::Namespace(_) => {
                    return Err(SchemaError::InvalidDefinition {
                        path: nested_full_name,
                        reason: "only types and enums can be nested inside a type".to_string(),
                    });
                }
            }
        }

        for reserved in def.reserved {
            match reserved {
                Reserved::Range(start, end) => message.reserved_range.push(ReservedRange {
                    start: Some(start),
                    // protobuf.js ranges are inclusive, descriptor ranges are not
                    end: Some(end.saturating_add(1)),
                }),
                Reserved::Name(name) => message.reserved_name.push(name),
            }
        }

        Ok(message)
    }

    /// Builds a field. Map fields push their synthesized entry type into `message`.
    fn field(
        &self,
        name: String,
        def: FieldDef,
        scope: &str,
        message: &mut DescriptorProto,
        imports: &mut BTreeSet<String>,
    ) -> Result<FieldDescriptorProto, SchemaError> {
        let path = join(scope, &name);

        if let Some(key_type) = &def.key_type {
            let key = scalar_type(key_type).ok_or_else(|| SchemaError::InvalidDefinition {
                path: path.clone(),
                reason: format!("map key type '{key_type}' is not a scalar"),
            })?;
            let (value, value_type_name) = self.resolver.field_type(&def.type_name, scope, imports)?;

            let entry_name = format!("{}Entry", camel_case(&name));
            message.nested_type.push(DescriptorProto {
                name: Some(entry_name.clone()),
                field: vec![
                    map_entry_field("key", 1, key, None),
                    map_entry_field("value", 2, value, value_type_name),
                ],
                options: Some(MessageOptions {
                    map_entry: Some(true),
                    ..Default::default()
                }),
                ..Default::default()
            });

            return Ok(FieldDescriptorProto {
                json_name: Some(name.clone()),
                name: Some(name),
                number: Some(def.id),
                label: Some(Label::Repeated as i32),
                r#type: Some(Type::Message as i32),
                type_name: Some(format!(".{scope}.{entry_name}")),
                ..Default::default()
            });
        }

        let (ty, type_name) = self.resolver.field_type(&def.type_name, scope, imports)?;

        let label = match def.rule.as_deref() {
            Some("repeated") => Label::Repeated,
            Some("required") => Label::Required,
            _ => Label::Optional,
        };

        let default_value = def
            .options
            .default
            .as_ref()
            .map(|value| default_literal(value, &path))
            .transpose()?;

        let options = match (label, def.options.packed) {
            (Label::Repeated, Some(packed)) => Some(FieldOptions {
                packed: Some(packed),
                ..Default::default()
            }),
            _ => None,
        };

        Ok(FieldDescriptorProto {
            json_name: Some(name.clone()),
            name: Some(name),
            number: Some(def.id),
            label: Some(label as i32),
            r#type: Some(ty as i32),
            type_name,
            default_value,
            options,
            ..Default::default()
        })
    }

    fn service(
        &self,
        name: String,
        full_name: &str,
        def: ServiceDef,
        imports: &mut BTreeSet<String>,
    ) -> Result<ServiceDescriptorProto, SchemaError> {
        let method = def
            .methods
            .into_iter()
            .map(|(method_name, method)| -> Result<_, SchemaError> {
                Ok(MethodDescriptorProto {
                    name: Some(method_name),
                    input_type: Some(self.resolver.message_type(
                        &method.request_type,
                        full_name,
                        imports,
                    )?),
                    output_type: Some(self.resolver.message_type(
                        &method.response_type,
                        full_name,
                        imports,
                    )?),
                    client_streaming: Some(method.request_stream),
                    server_streaming: Some(method.response_stream),
                    options: None,
                })
            })
            .collect::<Result<_, SchemaError>>()?;

        Ok(ServiceDescriptorProto {
            name: Some(name),
            method,
            options: None,
        })
    }

    /// Wires imports between files and orders them so every file follows its dependencies.
    fn finish(mut self) -> Result<FileDescriptorSet, SchemaError> {
        let mut ordered = Vec::with_capacity(self.files.len());
        let mut visited = BTreeSet::new();
        let packages: Vec<String> = self.files.keys().cloned().collect();

        for package in &packages {
            let mut stack = Vec::new();
            visit(package, &self.imports, &mut visited, &mut stack, &mut ordered)?;
        }

        let file = ordered
            .into_iter()
            .filter_map(|package| {
                let mut file = self.files.remove(&package)?;
                file.dependency = self
                    .imports
                    .get(&package)
                    .into_iter()
                    .flatten()
                    .map(|dep| file_name(dep))
                    .collect();
                Some(file)
            })
            .collect();

        Ok(FileDescriptorSet { file })
    }
}

/// Depth-first walk over package imports, pushing each package after its dependencies.
fn visit(
    package: &str,
    imports: &BTreeMap<String, BTreeSet<String>>,
    visited: &mut BTreeSet<String>,
    stack: &mut Vec<String>,
    ordered: &mut Vec<String>,
) -> Result<(), SchemaError> {
    if visited.contains(package) {
        return Ok(());
    }

    if let Some(position) = stack.iter().position(|p| p == package) {
        let mut cycle: Vec<&str> = stack[position..].iter().map(|p| display_package(p)).collect();
        cycle.push(display_package(package));
        return Err(SchemaError::ImportCycle(cycle.join(" -> ")));
    }

    stack.push(package.to_string());
    for dep in imports.get(package).into_iter().flatten() {
        visit(dep, imports, visited, stack, ordered)?;
    }
    stack.pop();

    visited.insert(package.to_string());
    ordered.push(package.to_string());
    Ok(())
}

fn build_enum(name: String, def: EnumDef) -> EnumDescriptorProto {
    let mut values: Vec<(String, i32)> = def.values.into_iter().collect();
    // The first value is the default in proto2, keep zero there when it exists
    values.sort_by_key(|(_, number)| (*number != 0, *number));

    EnumDescriptorProto {
        name: Some(name),
        value: values
            .into_iter()
            .map(|(name, number)| EnumValueDescriptorProto {
                name: Some(name),
                number: Some(number),
                options: None,
            })
            .collect(),
        ..Default::default()
    }
}

fn map_entry_field(
    name: &str,
    number: i32,
    ty: Type,
    type_name: Option<String>,
) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_string()),
        json_name: Some(name.to_string()),
        number: Some(number),
        label: Some(Label::Optional as i32),
        r#type: Some(ty as i32),
        type_name,
        ..Default::default()
    }
}

fn scalar_type(name: &str) -> Option<Type> {
    let ty = match name {
        "double" => Type::Double,
        "float" => Type::Float,
        "int32" => Type::Int32,
        "int64" => Type::Int64,
        "uint32" => Type::Uint32,
        "uint64" => Type::Uint64,
        "sint32" => Type::Sint32,
        "sint64" => Type::Sint64,
        "fixed32" => Type::Fixed32,
        "fixed64" => Type::Fixed64,
        "sfixed32" => Type::Sfixed32,
        "sfixed64" => Type::Sfixed64,
        "bool" => Type::Bool,
        "string" => Type::String,
        "bytes" => Type::Bytes,
        _ => return None,
    };
    Some(ty)
}

fn default_literal(value: &serde_json::Value, path: &str) -> Result<String, SchemaError> {
    match value {
        serde_json::Value::String(s) => Ok(s.clone()),
        serde_json::Value::Bool(b) => Ok(b.to_string()),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(SchemaError::InvalidDefinition {
            path: path.to_string(),
            reason: format!("unsupported default value {other}"),
        }),
    }
}

/// Map entry naming used by protoc: `peer_volumes` -> `PeerVolumes`.
fn camel_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if c == '_' {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}

fn file_name(package: &str) -> String {
    if package.is_empty() {
        ROOT_FILE_NAME.to_string()
    } else {
        format!("{}.proto", package.replace('.', "/"))
    }
}

fn display_package(package: &str) -> &str {
    if package.is_empty() { "<root>" } else { package }
}

fn join(scope: &str, name: &str) -> String {
    if scope.is_empty() {
        name.to_string()
    } else {
        format!("{scope}.{name}")
    }
}
