//! Inference collaborator interface.
//!
//! The engine makes exactly one [`InferenceClient::call`] per batch. Two
//! implementations ship with the crate: [`HttpInferenceClient`], which posts
//! the combined call to a remote inference function, and [`SimulatedClient`],
//! a scripted in-process stand-in used by the CLI and tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, instrument};

use crate::error::ClientError;
use crate::types::RequestType;

/// One combined call for a batch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceCall {
    /// Combined prompt with every payload tagged by position
    pub prompt: String,
    /// Batch metadata (id, type, size, request ids)
    pub context: Value,
    pub system_prompt: String,
    pub request_type: RequestType,
}

impl InferenceCall {
    /// Number of items in the batch, as recorded in the context
    pub fn batch_size(&self) -> usize {
        self.context.get("batchSize").and_then(Value::as_u64).unwrap_or(0) as usize
    }
}

/// Reply from the collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InferenceResponse {
    #[serde(alias = "responseText", alias = "text")]
    pub response: String,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub from_cache: bool,
}

/// External inference service, treated as a black box
#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn call(&self, call: InferenceCall) -> Result<InferenceResponse, ClientError>;
}

/// Client for an inference function reachable over HTTP
#[derive(Clone)]
pub struct HttpInferenceClient {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpInferenceClient {
    /// Create a client posting to `endpoint` with the given request timeout
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint: endpoint.into(), api_key: None })
    }

    /// Send `Authorization: Bearer <key>` with every call
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    #[instrument(skip(self, call), fields(request_type = %call.request_type, batch_size = call.batch_size()))]
    async fn call(&self, call: InferenceCall) -> Result<InferenceResponse, ClientError> {
        debug!(url = %self.endpoint, "Sending batch inference call");

        let mut request = self.client.post(&self.endpoint).json(&call);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                ClientError::transport(e.to_string())
            } else {
                ClientError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Inference service returned error");
            return Err(ClientError::service(status.as_u16(), body));
        }

        let body = response.text().await?;
        let parsed: InferenceResponse = serde_json::from_str(&body)?;
        debug!(model = %parsed.model, cost = parsed.cost, from_cache = parsed.from_cache, "Batch inference call complete");
        Ok(parsed)
    }
}

/// Scripted reply for [`SimulatedClient`]
#[derive(Debug, Clone, PartialEq)]
pub enum SimulatedReply {
    /// One `{"index": i, "result": {"echo": payload}}` entry per item
    Echo,
    /// Echo, but only the first `n` entries
    Truncated(usize),
    /// A response that is not JSON
    Malformed,
    /// Fail the call with a service error
    Fail(String),
}

/// In-process collaborator with scripted replies.
///
/// Replies are taken from the script in call order; once it runs out the
/// default reply is used. Every call is recorded.
pub struct SimulatedClient {
    script: Mutex<VecDeque<SimulatedReply>>,
    default_reply: SimulatedReply,
    latency: Duration,
    cost_per_item: f64,
    model: String,
    calls: Mutex<Vec<InferenceCall>>,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedClient {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_reply: SimulatedReply::Echo,
            latency: Duration::ZERO,
            cost_per_item: 0.01,
            model: "simulated-model".to_string(),
            calls: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_cost_per_item(mut self, cost: f64) -> Self {
        self.cost_per_item = cost;
        self
    }

    pub fn with_default_reply(mut self, reply: SimulatedReply) -> Self {
        self.default_reply = reply;
        self
    }

    /// Queue a reply for the next unscripted call
    pub fn push_reply(&self, reply: SimulatedReply) {
        self.script.lock().push_back(reply);
    }

    pub fn calls(&self) -> Vec<InferenceCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Sizes of the batches received so far, in call order
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.calls.lock().iter().map(InferenceCall::batch_size).collect()
    }

    /// Highest number of calls observed executing at the same time
    pub fn peak_concurrency(&self) -> usize {
        self.peak_active.load(Ordering::SeqCst)
    }

    fn echo(&self, call: &InferenceCall, keep: usize) -> String {
        let items = prompt_items(&call.prompt);
        let entries: Vec<Value> = items
            .into_iter()
            .take(keep)
            .enumerate()
            .map(|(index, payload)| json!({ "index": index, "result": { "echo": payload } }))
            .collect();
        Value::Array(entries).to_string()
    }
}

#[async_trait]
impl InferenceClient for SimulatedClient {
    async fn call(&self, call: InferenceCall) -> Result<InferenceResponse, ClientError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active.fetch_max(active, Ordering::SeqCst);
        self.calls.lock().push(call.clone());

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let reply = self.script.lock().pop_front().unwrap_or_else(|| self.default_reply.clone());
        let size = call.batch_size();
        let outcome = match reply {
            SimulatedReply::Echo => Ok(self.echo(&call, usize::MAX)),
            SimulatedReply::Truncated(n) => Ok(self.echo(&call, n)),
            SimulatedReply::Malformed => Ok("Sorry, I could not process these items.".to_string()),
            SimulatedReply::Fail(message) => Err(ClientError::service(503, message)),
        };

        self.active.fetch_sub(1, Ordering::SeqCst);

        outcome.map(|response| InferenceResponse {
            response,
            cost: self.cost_per_item * size as f64,
            model: self.model.clone(),
            from_cache: false,
        })
    }
}

/// Payloads embedded in a combined prompt, in position order
fn prompt_items(prompt: &str) -> Vec<Value> {
    let Some((_, items)) = prompt.rsplit_once("Items:\n") else {
        return Vec::new();
    };
    match serde_json::from_str::<Value>(items.trim()) {
        Ok(Value::Array(items)) => items
            .into_iter()
            .map(|mut item| item.get_mut("payload").map(Value::take).unwrap_or(Value::Null))
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::PromptTemplate;
    use crate::types::InferenceRequest;

    fn call_for(payloads: &[Value]) -> InferenceCall {
        let requests: Vec<InferenceRequest> = payloads
            .iter()
            .map(|p| InferenceRequest::new(RequestType::SCREENING, p.clone()))
            .collect();
        InferenceCall {
            prompt: PromptTemplate::new("sys", "Do it.").render(&requests),
            context: json!({ "batchSize": requests.len() }),
            system_prompt: "sys".to_string(),
            request_type: RequestType::SCREENING,
        }
    }

    #[tokio::test]
    async fn test_simulated_echo_preserves_order() {
        let client = SimulatedClient::new().with_cost_per_item(0.5);
        let response = client.call(call_for(&[json!("a"), json!("b")])).await.unwrap();

        let parsed: Value = serde_json::from_str(&response.response).unwrap();
        assert_eq!(parsed[0]["result"]["echo"], "a");
        assert_eq!(parsed[1]["result"]["echo"], "b");
        assert_eq!(response.cost, 1.0);
        assert_eq!(client.batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn test_simulated_script_then_default() {
        let client = SimulatedClient::new();
        client.push_reply(SimulatedReply::Fail("down".to_string()));
        client.push_reply(SimulatedReply::Truncated(1));

        let err = client.call(call_for(&[json!(1)])).await.unwrap_err();
        assert!(matches!(err, ClientError::Service { status: 503, .. }));

        let truncated = client.call(call_for(&[json!(1), json!(2)])).await.unwrap();
        let parsed: Value = serde_json::from_str(&truncated.response).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 1);

        let echoed = client.call(call_for(&[json!(1), json!(2)])).await.unwrap();
        let parsed: Value = serde_json::from_str(&echoed.response).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(client.call_count(), 3);
    }

    #[test]
    fn test_response_accepts_field_aliases() {
        let parsed: InferenceResponse =
            serde_json::from_str(r#"{"responseText": "[]", "cost": 0.2, "model": "m", "fromCache": true}"#)
                .unwrap();
        assert_eq!(parsed.response, "[]");
        assert!(parsed.from_cache);

        let minimal: InferenceResponse = serde_json::from_str(r#"{"response": "[]"}"#).unwrap();
        assert_eq!(minimal.cost, 0.0);
    }

    #[test]
    fn test_call_serializes_camel_case() {
        let call = call_for(&[json!({"x": 1})]);
        let value = serde_json::to_value(&call).unwrap();
        assert!(value.get("systemPrompt").is_some());
        assert_eq!(value["requestType"], "screening");
        assert_eq!(call.batch_size(), 1);
    }

    #[test]
    fn test_http_client_builds() {
        let client = HttpInferenceClient::new("http://localhost:54321/functions/v1/ai", Duration::from_secs(30))
            .unwrap()
            .with_api_key("secret");
        assert_eq!(client.endpoint(), "http://localhost:54321/functions/v1/ai");
    }
}
