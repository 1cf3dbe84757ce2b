//! Message model
//!
//! Only the parts of an AMQP message the transport core reasons about are
//! modelled: the properties section used for addressing and correlation,
//! the application properties used by management operations, and an opaque
//! body. Encoding is the engine's concern.

use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Application property value
#[derive(Debug, Clone, PartialEq)]
pub enum AmqpValue {
    /// `null`
    Null,
    /// `boolean`
    Bool(bool),
    /// `short`
    Short(i16),
    /// `int`
    Int(i32),
    /// `long`
    Long(i64),
    /// `uint`
    UInt(u32),
    /// `ulong`
    ULong(u64),
    /// `string`
    String(String),
    /// `symbol`
    Symbol(String),
    /// `binary`
    Binary(Vec<u8>),
    /// `timestamp`
    Timestamp(OffsetDateTime),
}

impl AmqpValue {
    /// Integer view of numeric values and numeric strings
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Short(v) => Some(i64::from(*v)),
            Self::Int(v) => Some(i64::from(*v)),
            Self::Long(v) => Some(*v),
            Self::UInt(v) => Some(i64::from(*v)),
            Self::ULong(v) => i64::try_from(*v).ok(),
            Self::String(s) | Self::Symbol(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// String view of textual values
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) | Self::Symbol(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AmqpValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AmqpValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i32> for AmqpValue {
    fn from(value: i32) -> Self {
        Self::Int(value)
    }
}

impl From<OffsetDateTime> for AmqpValue {
    fn from(value: OffsetDateTime) -> Self {
        Self::Timestamp(value)
    }
}

/// Message body
#[derive(Debug, Clone, PartialEq, Default)]
pub enum AmqpBody {
    /// No body section
    #[default]
    Empty,
    /// Opaque data section
    Data(Vec<u8>),
    /// Single typed value
    Value(AmqpValue),
}

/// Properties section
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MessageProperties {
    /// Message id
    pub message_id: Option<String>,
    /// Id of the message this one answers
    pub correlation_id: Option<String>,
    /// Destination address
    pub to: Option<String>,
    /// Address responses are sent to
    pub reply_to: Option<String>,
    /// Subject
    pub subject: Option<String>,
    /// MIME content type of the body
    pub content_type: Option<String>,
}

/// An AMQP message as seen by the transport core
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AmqpMessage {
    /// Properties section
    pub properties: MessageProperties,
    /// Application properties section
    pub application_properties: BTreeMap<String, AmqpValue>,
    /// Body
    pub body: AmqpBody,
}

impl AmqpMessage {
    /// Empty message
    pub fn new() -> Self {
        Self::default()
    }

    /// Message with a single value body
    pub fn with_value(value: impl Into<AmqpValue>) -> Self {
        Self {
            body: AmqpBody::Value(value.into()),
            ..Self::default()
        }
    }

    /// Message with a data body
    pub fn with_data(data: impl Into<Vec<u8>>) -> Self {
        Self {
            body: AmqpBody::Data(data.into()),
            ..Self::default()
        }
    }

    /// Set an application property
    pub fn set_application_property(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AmqpValue>,
    ) {
        self.application_properties.insert(key.into(), value.into());
    }

    /// Builder-style [`set_application_property`](Self::set_application_property)
    pub fn application_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<AmqpValue>,
    ) -> Self {
        self.set_application_property(key, value);
        self
    }

    /// Look up an application property
    pub fn get_application_property(&self, key: &str) -> Option<&AmqpValue> {
        self.application_properties.get(key)
    }

    /// Set the message id
    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.properties.message_id = Some(id.into());
        self
    }

    /// Set the correlation id
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.properties.correlation_id = Some(id.into());
        self
    }

    /// Set the destination address
    pub fn to(mut self, address: impl Into<String>) -> Self {
        self.properties.to = Some(address.into());
        self
    }
}
