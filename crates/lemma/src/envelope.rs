//! Envelope encoding
//!
//! An envelope is a JSON array whose first element is a string header
//! naming the message kind. The remaining fields are header-specific; see
//! [`crate::protocol`] for the typed view.

use serde_json::Value;

use crate::error::{Error, Result};

/// An ordered, header-tagged sequence of fields
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    fields: Vec<Value>,
}

impl Envelope {
    /// Start an envelope with the given header
    pub fn new(header: &str) -> Self {
        Self {
            fields: vec![Value::String(header.to_string())],
        }
    }

    /// Append a field
    pub fn push(mut self, field: impl Into<Value>) -> Self {
        self.fields.push(field.into());
        self
    }

    pub fn header(&self) -> &str {
        // decode() and new() both guarantee a string header
        self.fields.first().and_then(Value::as_str).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field(&self, index: usize) -> Option<&Value> {
        self.fields.get(index)
    }

    /// String field at `index`
    pub fn str_field(&self, index: usize) -> Result<&str> {
        self.field(index).and_then(Value::as_str).ok_or_else(|| {
            Error::MalformedPayload(format!(
                "{} field {} is not a string",
                self.header(),
                index
            ))
        })
    }

    /// Fail unless the envelope carries at least `required` fields
    pub fn require(&self, required: usize) -> Result<()> {
        if self.fields.len() < required {
            return Err(Error::MalformedPayload(format!(
                "{} expects {} fields, got {}",
                self.header(),
                required,
                self.fields.len()
            )));
        }
        Ok(())
    }

    pub fn into_fields(self) -> Vec<Value> {
        self.fields
    }

    /// Serialize to JSON bytes
    pub fn encode(&self) -> Vec<u8> {
        // An array of serde_json::Value always serializes
        serde_json::to_vec(&self.fields).unwrap_or_default()
    }

    /// Parse JSON bytes into an envelope
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        let Value::Array(fields) = value else {
            return Err(Error::MalformedPayload("envelope is not an array".into()));
        };
        match fields.first() {
            Some(Value::String(_)) => Ok(Self { fields }),
            Some(_) => Err(Error::MalformedPayload("header is not a string".into())),
            None => Err(Error::MalformedPayload("envelope is empty".into())),
        }
    }
}
