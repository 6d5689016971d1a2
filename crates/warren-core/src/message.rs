//! Application records carried as reassembled transport payloads.
//!
//! Every payload is a JSON `Envelope` whose `data` field holds the nested,
//! separately-encoded record for its `action`. The nesting is part of the
//! contract: peers decode the envelope first and the record second, so a
//! malformed record never prevents reading the action.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Envelope discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    RegisterClient,
    RegisterWorker,
    TaskRequest,
    TaskResult,
}

/// Wire envelope: `{action, data}` with `data` an encoded record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub data: String,
}

/// First message of a client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRegistration {
    pub id: String,
}

/// First message of a worker connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub id: String,
    /// Total cores the worker offers.
    pub cores: u32,
}

/// Job submission (client → broker) and job assignment (broker → worker).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub id: String,
    /// Job name, looked up in the worker's handler table.
    pub func: String,
    /// Encoded job input.
    pub data: String,
    /// Cores the job needs.
    pub cores: u32,
}

/// Job result (worker → broker → client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResult {
    pub id: String,
    /// Encoded job output.
    pub data: String,
    pub cores: u32,
}

/// A decoded envelope with its record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    RegisterClient(ClientRegistration),
    RegisterWorker(WorkerRegistration),
    TaskRequest(TaskRequest),
    TaskResult(TaskResult),
}

impl Envelope {
    /// Wrap a record, encoding it into `data`.
    pub fn wrap<T: Serialize>(action: Action, record: &T) -> Result<Self, MessageError> {
        Ok(Self {
            action,
            data: serde_json::to_string(record).map_err(MessageError::Encode)?,
        })
    }

    /// Decode the nested record.
    pub fn open<T: DeserializeOwned>(&self) -> Result<T, MessageError> {
        serde_json::from_str(&self.data).map_err(|source| MessageError::MalformedRecord {
            action: self.action,
            source,
        })
    }

    pub fn to_bytes(&self) -> Result<Bytes, MessageError> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(MessageError::Encode)
    }

    pub fn from_bytes(payload: &[u8]) -> Result<Self, MessageError> {
        serde_json::from_slice(payload).map_err(MessageError::MalformedEnvelope)
    }
}

impl Message {
    pub fn action(&self) -> Action {
        match self {
            Message::RegisterClient(_) => Action::RegisterClient,
            Message::RegisterWorker(_) => Action::RegisterWorker,
            Message::TaskRequest(_) => Action::TaskRequest,
            Message::TaskResult(_) => Action::TaskResult,
        }
    }

    /// Encode into a transport payload.
    pub fn encode(&self) -> Result<Bytes, MessageError> {
        let envelope = match self {
            Message::RegisterClient(r) => Envelope::wrap(Action::RegisterClient, r)?,
            Message::RegisterWorker(r) => Envelope::wrap(Action::RegisterWorker, r)?,
            Message::TaskRequest(r) => Envelope::wrap(Action::TaskRequest, r)?,
            Message::TaskResult(r) => Envelope::wrap(Action::TaskResult, r)?,
        };
        envelope.to_bytes()
    }

    /// Decode a transport payload: envelope first, then the nested record.
    pub fn decode(payload: &[u8]) -> Result<Self, MessageError> {
        let envelope = Envelope::from_bytes(payload)?;
        Ok(match envelope.action {
            Action::RegisterClient => Message::RegisterClient(envelope.open()?),
            Action::RegisterWorker => Message::RegisterWorker(envelope.open()?),
            Action::TaskRequest => Message::TaskRequest(envelope.open()?),
            Action::TaskResult => Message::TaskResult(envelope.open()?),
        })
    }
}

/// Envelope/record decoding failures. Receivers log and drop the message.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    #[error("malformed {action:?} record: {source}")]
    MalformedRecord {
        action: Action,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}
