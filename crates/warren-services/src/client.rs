//! Client runtime: submit jobs, stream results back.

use futures::stream::{self, Stream};
use rand::Rng;
use warren_core::config::{ClientConfig, TransportConfig};
use warren_core::message::{ClientRegistration, Message, TaskRequest, TaskResult};
use warren_transport::{Connection, Endpoint};

use crate::peer::{connect_and_register, send_message, RuntimeError};

/// Results longer than this many pretty-printed lines are shown compact.
pub const PRETTY_LINE_LIMIT: usize = 35;

pub struct Client {
    id: String,
    endpoint: Endpoint,
    conn: Connection,
}

impl Client {
    /// Connect to the configured broker and register.
    pub async fn connect(config: &ClientConfig, transport: TransportConfig) -> Result<Self, RuntimeError> {
        let registration = Message::RegisterClient(ClientRegistration {
            id: config.id.clone(),
        });
        let (endpoint, conn) = connect_and_register(&config.broker, transport, &registration).await?;
        Ok(Self {
            id: config.id.clone(),
            endpoint,
            conn,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Submit a job with a fresh task id. Returns the id.
    pub async fn submit(&self, func: &str, data: String, cores: u32) -> Result<String, RuntimeError> {
        let request = TaskRequest {
            id: new_task_id(&self.id),
            func: func.to_string(),
            data,
            cores,
        };
        let id = request.id.clone();
        self.submit_request(request).await?;
        Ok(id)
    }

    pub async fn submit_request(&self, request: TaskRequest) -> Result<(), RuntimeError> {
        tracing::info!(task_id = %request.id, job = %request.func, cores = request.cores, "submitting task");
        send_message(&self.conn, &Message::TaskRequest(request)).await
    }

    /// Wait for the next result. Malformed or unexpected messages are
    /// logged and skipped.
    pub async fn next_result(&self) -> Result<TaskResult, RuntimeError> {
        loop {
            let payload = self.conn.receive().await?;
            match Message::decode(&payload) {
                Ok(Message::TaskResult(result)) => return Ok(result),
                Ok(other) => {
                    tracing::warn!(action = ?other.action(), "unexpected message from broker");
                }
                Err(e) => tracing::warn!(error = %e, "malformed message dropped"),
            }
        }
    }

    /// Results as a stream. Ends after the first transport error.
    pub fn results(&self) -> impl Stream<Item = Result<TaskResult, RuntimeError>> + '_ {
        stream::unfold(Some(self), |client| async move {
            let client = client?;
            match client.next_result().await {
                Ok(result) => Some((Ok(result), Some(client))),
                Err(e) => Some((Err(e), None)),
            }
        })
    }

    /// Close the connection and stop the local endpoint.
    pub async fn close(self) {
        self.conn.close().await;
        self.endpoint.shutdown().await;
    }
}

/// A task id unique enough for one broker: client id plus 64 random bits.
pub fn new_task_id(client_id: &str) -> String {
    format!("{client_id}-{:016x}", rand::thread_rng().gen::<u64>())
}

/// Pretty-print a result payload, compact when the pretty form is longer
/// than [`PRETTY_LINE_LIMIT`] lines. Non-JSON payloads are returned as is.
pub fn format_result(data: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(data) else {
        return data.to_string();
    };
    match serde_json::to_string_pretty(&value) {
        Ok(pretty) if pretty.lines().count() <= PRETTY_LINE_LIMIT => pretty,
        _ => value.to_string(),
    }
}
