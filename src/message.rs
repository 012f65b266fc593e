//! Message base: per-type descriptors and the contract every published
//! message implements (spec.md §4.8).

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result, ValidationError};
use crate::header::Header;

/// How a property's value is checked at `validate!()` time.
pub enum Validator {
    /// Arbitrary predicate over the property's JSON value.
    Predicate(Box<dyn Fn(&Value) -> bool + Send + Sync>),
    /// Allow-list of acceptable values.
    OneOf(Vec<Value>),
    /// Regex applied to the value's string form.
    Regex(Regex),
}

impl Validator {
    fn check(&self, value: &Value) -> bool {
        match self {
            Validator::Predicate(f) => f(value),
            Validator::OneOf(options) => options.contains(value),
            Validator::Regex(re) => value
                .as_str()
                .map(|s| re.is_match(s))
                .unwrap_or(false),
        }
    }
}

/// A single `property(name, constraints)` declaration (spec.md §4.8).
pub struct PropertyConstraint {
    pub name: String,
    pub required: bool,
    pub validator: Option<Validator>,
    pub default: Option<Value>,
    pub description: Option<String>,
}

impl PropertyConstraint {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            validator: None,
            default: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = Some(validator);
        self
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Builds a concrete `Message` instance from a decoded header + payload, so
/// the receive pipeline can hand transports a typed instance without any
/// runtime reflection (spec.md §4.6 "constructs an instance of the
/// identified message class").
pub type MessageConstructor =
    Arc<dyn Fn(Header, Value) -> Result<Arc<dyn Message>> + Send + Sync>;

/// Immutable per-message-type registry entry: class-level addressing
/// defaults, declared version, and property constraints (spec.md §4.8,
/// "class-level declarations").
pub struct MessageDescriptor {
    pub class_name: &'static str,
    pub version: u32,
    pub description: Option<String>,
    pub default_from: Option<String>,
    pub default_to: Option<String>,
    pub default_reply_to: Option<String>,
    pub properties: Vec<PropertyConstraint>,
    pub constructor: Option<MessageConstructor>,
}

impl MessageDescriptor {
    pub fn builder(class_name: &'static str) -> MessageDescriptorBuilder {
        MessageDescriptorBuilder::new(class_name)
    }

    /// Validate a JSON payload object against every declared property
    /// constraint (spec.md §4.8, `validate!`).
    pub fn validate_payload(&self, payload: &Value) -> std::result::Result<(), ValidationError> {
        for prop in &self.properties {
            let value = payload.get(&prop.name);
            match value {
                Some(v) => {
                    if let Some(validator) = &prop.validator {
                        if !validator.check(v) {
                            return Err(ValidationError::InvalidProperty {
                                field: prop.name.clone(),
                                reason: "failed validator".to_string(),
                            });
                        }
                    }
                }
                None => {
                    if prop.required && prop.default.is_none() {
                        return Err(ValidationError::MissingRequired(prop.name.clone()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply declared defaults to a payload object for any property the
    /// caller omitted.
    pub fn apply_defaults(&self, payload: &mut Value) {
        let Some(obj) = payload.as_object_mut() else {
            return;
        };
        for prop in &self.properties {
            if !obj.contains_key(&prop.name) {
                if let Some(default) = &prop.default {
                    obj.insert(prop.name.clone(), default.clone());
                }
            }
        }
    }
}

pub struct MessageDescriptorBuilder {
    descriptor: MessageDescriptor,
}

impl MessageDescriptorBuilder {
    fn new(class_name: &'static str) -> Self {
        Self {
            descriptor: MessageDescriptor {
                class_name,
                version: 1,
                description: None,
                default_from: None,
                default_to: None,
                default_reply_to: None,
                properties: Vec::new(),
                constructor: None,
            },
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.descriptor.version = version;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = Some(description.into());
        self
    }

    pub fn from(mut self, entity_id: impl Into<String>) -> Self {
        self.descriptor.default_from = Some(entity_id.into());
        self
    }

    pub fn to(mut self, entity_id: impl Into<String>) -> Self {
        self.descriptor.default_to = Some(entity_id.into());
        self
    }

    pub fn reply_to(mut self, entity_id: impl Into<String>) -> Self {
        self.descriptor.default_reply_to = Some(entity_id.into());
        self
    }

    pub fn property(mut self, constraint: PropertyConstraint) -> Self {
        self.descriptor.properties.push(constraint);
        self
    }

    pub fn constructor<F>(mut self, f: F) -> Self
    where
        F: Fn(Header, Value) -> Result<Arc<dyn Message>> + Send + Sync + 'static,
    {
        self.descriptor.constructor = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> Arc<MessageDescriptor> {
        Arc::new(self.descriptor)
    }
}

static REGISTRY: Lazy<DashMap<&'static str, Arc<MessageDescriptor>>> = Lazy::new(DashMap::new);

/// Register a descriptor once, at class-definition time. Re-registering the
/// same class name replaces the prior descriptor (useful in tests).
pub fn register(descriptor: Arc<MessageDescriptor>) {
    REGISTRY.insert(descriptor.class_name, descriptor);
}

/// Look up a previously registered descriptor by class name.
pub fn descriptor_for(class_name: &str) -> Result<Arc<MessageDescriptor>> {
    REGISTRY
        .get(class_name)
        .map(|e| e.clone())
        .ok_or_else(|| Error::UnknownMessageClass(class_name.to_string()))
}

/// Construct a concrete message instance for the receive pipeline, using
/// the class's registered constructor.
pub fn construct(header: Header, mut payload: Value) -> Result<Arc<dyn Message>> {
    let descriptor = descriptor_for(&header.message_class)?;
    let constructor = descriptor
        .constructor
        .as_ref()
        .ok_or(Error::NotImplemented("no constructor registered for class"))?;
    descriptor.apply_defaults(&mut payload);
    constructor(header, payload)
}

/// Contract every published message type implements (spec.md §4.8,
/// "Instance operations"). `payload()`/`payload_mut()` expose the message's
/// own fields as a JSON object so `validate!`/`pretty_print`/`to_hash` can
/// be generic over any concrete message type.
pub trait Message: Send + Sync {
    fn class_name(&self) -> &'static str;
    fn header(&self) -> &Header;
    fn header_mut(&mut self) -> &mut Header;
    fn payload(&self) -> Value;

    /// Required fields + per-property validators, plus the header version
    /// gate (spec.md §4.8 "Validation timing").
    fn validate(&self) -> Result<()> {
        self.header().validate().map_err(Error::Validation)?;
        let descriptor = descriptor_for(self.class_name())?;
        self.header()
            .check_version(descriptor.version)
            .map_err(Error::Validation)?;
        descriptor
            .validate_payload(&self.payload())
            .map_err(Error::Validation)?;
        Ok(())
    }

    /// Readable dump, optionally including the header (spec.md §4.8).
    fn pretty_print(&self, include_header: bool) -> String {
        let mut obj = serde_json::Map::new();
        obj.insert("class".to_string(), Value::String(self.class_name().to_string()));
        obj.insert("payload".to_string(), self.payload());
        if include_header {
            if let Ok(header_value) = serde_json::to_value(self.header()) {
                obj.insert("header".to_string(), header_value);
            }
        }
        serde_json::to_string_pretty(&Value::Object(obj)).unwrap_or_default()
    }

    fn to_hash(&self) -> Value {
        self.payload()
    }

    fn from_addr(&self) -> &str {
        &self.header().from
    }

    fn to_addr(&self) -> Option<&str> {
        self.header().to.as_deref()
    }

    fn reply_to_addr(&self) -> &str {
        self.header().effective_reply_to()
    }

    fn from_configured(&self) -> bool {
        !self.header().from.is_empty()
    }

    fn to_configured(&self) -> bool {
        self.header().to.is_some()
    }

    fn set_from(&mut self, entity_id: impl Into<String>) -> &mut Self
    where
        Self: Sized,
    {
        self.header_mut().from = entity_id.into();
        self
    }

    fn set_to(&mut self, entity_id: impl Into<String>) -> &mut Self
    where
        Self: Sized,
    {
        self.header_mut().to = Some(entity_id.into());
        self
    }

    fn reset_to(&mut self) -> &mut Self
    where
        Self: Sized,
    {
        self.header_mut().to = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Ping {
        header: Header,
        amount: u32,
    }

    impl Message for Ping {
        fn class_name(&self) -> &'static str {
            "Ping"
        }
        fn header(&self) -> &Header {
            &self.header
        }
        fn header_mut(&mut self) -> &mut Header {
            &mut self.header
        }
        fn payload(&self) -> Value {
            json!({ "amount": self.amount })
        }
    }

    fn register_ping() {
        register(
            MessageDescriptor::builder("Ping")
                .version(1)
                .property(
                    PropertyConstraint::new("amount")
                        .required()
                        .with_validator(Validator::Predicate(Box::new(|v| {
                            v.as_u64().map(|n| n > 0).unwrap_or(false)
                        }))),
                )
                .build(),
        );
    }

    #[test]
    fn validate_passes_for_well_formed_message() {
        register_ping();
        let msg = Ping {
            header: Header::new("Ping", "svc-a", 1),
            amount: 5,
        };
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn validate_fails_on_bad_property() {
        register_ping();
        let msg = Ping {
            header: Header::new("Ping", "svc-a", 1),
            amount: 0,
        };
        assert!(matches!(
            msg.validate(),
            Err(Error::Validation(ValidationError::InvalidProperty { .. }))
        ));
    }

    #[test]
    fn validate_fails_on_version_mismatch() {
        register_ping();
        let msg = Ping {
            header: Header::new("Ping", "svc-a", 2),
            amount: 1,
        };
        assert!(matches!(
            msg.validate(),
            Err(Error::Validation(ValidationError::VersionMismatch { .. }))
        ));
    }

    #[test]
    fn unknown_class_errors() {
        let msg = Ping {
            header: Header::new("NeverRegistered", "svc-a", 1),
            amount: 1,
        };
        assert!(matches!(msg.validate(), Err(Error::UnknownMessageClass(_))));
    }

    #[test]
    fn construct_applies_declared_defaults() {
        register(
            MessageDescriptor::builder("PingWithDefault")
                .version(1)
                .property(PropertyConstraint::new("amount").with_default(json!(7)))
                .constructor(|header, payload| {
                    let amount = payload.get("amount").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    Ok(Arc::new(Ping { header, amount }))
                })
                .build(),
        );
        let header = Header::new("PingWithDefault", "svc-a", 1);
        let msg = construct(header, json!({})).unwrap();
        assert_eq!(msg.payload()["amount"], json!(7));
    }
}
