//! The wire format of a job.
//!
//! A message body is the JSON object
//!
//! ```json
//! {"Job": "SendEmail", "Properties": {"To": "someone@example.com"}}
//! ```
//!
//! optionally wrapped in the XML envelope used by external schedulers:
//!
//! ```xml
//! <?xml version="1.0" encoding="utf-8"?>
//! <StorageQueueMessage><Message>{"Job": "SendEmail"}</Message></StorageQueueMessage>
//! ```
use std::borrow::Cow;

use quick_xml::{events::Event, Reader};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

const XML_DECLARATION: &str = "<?xml";
const ENVELOPE_ROOT: &[u8] = b"StorageQueueMessage";
const ENVELOPE_MESSAGE: &[u8] = b"Message";

/// A job as it is carried in a queue message: the name of the job and its properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JobDescriptor {
    #[serde(rename = "Job")]
    pub job_name: String,
    #[serde(
        rename = "Properties",
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Map::is_empty"
    )]
    pub properties: Map<String, Value>,
    /// The id of the queue message this descriptor was decoded from.
    #[serde(skip)]
    pub queue_message_id: Option<String>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Map<String, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Map<String, Value>>::deserialize(deserializer).map(Option::unwrap_or_default)
}

#[derive(Debug, Error)]
pub enum DescriptorError {
    #[error("Job descriptor is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Job descriptor envelope is not valid: {0}")]
    Envelope(String),
    #[error("Job descriptor does not name a job")]
    BlankJobName,
}

impl JobDescriptor {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            properties: Map::new(),
            queue_message_id: None,
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    pub fn with_properties(mut self, properties: Map<String, Value>) -> Self {
        self.properties = properties;
        self
    }

    pub fn with_queue_message_id(mut self, queue_message_id: impl Into<String>) -> Self {
        self.queue_message_id = Some(queue_message_id.into());
        self
    }

    pub fn property(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    /// Decodes a message body, unwrapping the XML envelope when the body starts with an XML
    /// declaration.
    pub fn decode(body: &str) -> Result<Self, DescriptorError> {
        let json = match unwrap_envelope(body)? {
            Some(json) => Cow::Owned(json),
            None => Cow::Borrowed(body),
        };
        let descriptor: Self = serde_json::from_str(&json)?;
        descriptor.validate()?;
        Ok(descriptor)
    }

    pub fn encode(&self) -> Result<String, DescriptorError> {
        self.validate()?;
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), DescriptorError> {
        if self.job_name.trim().is_empty() {
            return Err(DescriptorError::BlankJobName);
        }
        Ok(())
    }
}

/// Extracts the text of `/StorageQueueMessage/Message`, or `None` if the body is not an XML
/// document.
fn unwrap_envelope(body: &str) -> Result<Option<String>, DescriptorError> {
    if !body.trim_start().starts_with(XML_DECLARATION) {
        return Ok(None);
    }

    let mut reader = Reader::from_str(body);
    let mut path: Vec<Vec<u8>> = Vec::new();
    let mut message: Option<String> = None;
    loop {
        match reader.read_event().map_err(envelope_error)? {
            Event::Start(start) => path.push(start.name().as_ref().to_vec()),
            Event::End(_) => {
                path.pop();
            }
            Event::Text(text) if is_message_path(&path) => {
                let text = text.unescape().map_err(envelope_error)?;
                message.get_or_insert_with(String::new).push_str(&text);
            }
            Event::CData(data) if is_message_path(&path) => {
                let data = std::str::from_utf8(&data).map_err(envelope_error)?;
                message.get_or_insert_with(String::new).push_str(data);
            }
            Event::Eof => break,
            _ => {}
        }
    }

    message.map(Some).ok_or_else(|| {
        DescriptorError::Envelope("missing /StorageQueueMessage/Message element".to_owned())
    })
}

fn is_message_path(path: &[Vec<u8>]) -> bool {
    matches!(path, [root, message] if root == ENVELOPE_ROOT && message == ENVELOPE_MESSAGE)
}

fn envelope_error(error: impl std::fmt::Display) -> DescriptorError {
    DescriptorError::Envelope(error.to_string())
}
