//! JSON-RPC 2.0 envelopes used on the relay connection and inside encrypted
//! Sign/Pairing API payloads.
//!
//! https://specs.walletconnect.com/2.0/specs/servers/relay/relay-server-rpc

use {
    crate::domain::{MessageId, SubscriptionId, Topic},
    once_cell::sync::Lazy,
    serde::{de::DeserializeOwned, Deserialize, Serialize},
    serde_json::Value,
    std::{fmt, sync::Arc},
};

pub mod params;

pub const JSON_RPC_VERSION_STR: &str = "2.0";

pub static JSON_RPC_VERSION: Lazy<Arc<str>> = Lazy::new(|| Arc::from(JSON_RPC_VERSION_STR));

/// Errors covering relay payload validation.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid JSON-RPC version: {0}")]
    JsonRpcVersion(String),
    #[error("Invalid request ID")]
    RequestId,
    #[error("Topic must not be empty")]
    TopicEmpty,
    #[error("Batch must not be empty")]
    BatchEmpty,
    #[error("Batch size {0} exceeds limit of {1}")]
    BatchLimitExceeded(usize, usize),
}

/// The maximum number of topics allowed for a batch subscribe request.
pub const MAX_SUBSCRIPTION_BATCH_SIZE: usize = 500;

/// Enum representing a JSON RPC payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Request(Request),
    Response(Response),
}

impl From<Request> for Payload {
    fn from(value: Request) -> Self {
        Payload::Request(value)
    }
}

impl From<Response> for Payload {
    fn from(value: Response) -> Self {
        Payload::Response(value)
    }
}

impl Payload {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Request(req) => req.id,
            Self::Response(res) => res.id(),
        }
    }
}

/// Data structure representing a relay JSON RPC request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    #[serde(flatten)]
    pub params: Params,
}

impl Request {
    pub fn new(id: MessageId, params: Params) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            params,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.jsonrpc.as_ref() != JSON_RPC_VERSION_STR {
            return Err(ValidationError::JsonRpcVersion(self.jsonrpc.to_string()));
        }
        if self.id.value() == 0 {
            return Err(ValidationError::RequestId);
        }

        match &self.params {
            Params::Subscribe(Subscribe { topic })
            | Params::Unsubscribe(Unsubscribe { topic, .. })
            | Params::Publish(Publish { topic, .. }) => validate_topic(topic),
            Params::BatchSubscribe(BatchSubscribe { topics }) => {
                if topics.is_empty() {
                    return Err(ValidationError::BatchEmpty);
                }
                if topics.len() > MAX_SUBSCRIPTION_BATCH_SIZE {
                    return Err(ValidationError::BatchLimitExceeded(
                        topics.len(),
                        MAX_SUBSCRIPTION_BATCH_SIZE,
                    ));
                }
                topics.iter().try_for_each(validate_topic)
            }
            Params::Subscription(Subscription { data, .. }) => validate_topic(&data.topic),
        }
    }
}

fn validate_topic(topic: &Topic) -> Result<(), ValidationError> {
    if topic.as_str().is_empty() {
        Err(ValidationError::TopicEmpty)
    } else {
        Ok(())
    }
}

/// Relay methods. The relay answers with `irn_` prefixed names, aliases keep
/// the bare names readable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params")]
pub enum Params {
    #[serde(rename = "irn_subscribe", alias = "subscribe")]
    Subscribe(Subscribe),
    #[serde(rename = "irn_batchSubscribe", alias = "batchSubscribe")]
    BatchSubscribe(BatchSubscribe),
    #[serde(rename = "irn_unsubscribe", alias = "unsubscribe")]
    Unsubscribe(Unsubscribe),
    #[serde(rename = "irn_publish", alias = "publish")]
    Publish(Publish),
    #[serde(rename = "irn_subscription", alias = "subscription")]
    Subscription(Subscription),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscribe {
    pub topic: Topic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSubscribe {
    pub topics: Vec<Topic>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscribe {
    pub topic: Topic,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<SubscriptionId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publish {
    pub topic: Topic,
    pub message: Arc<str>,
    #[serde(rename = "ttl")]
    pub ttl_secs: u32,
    pub tag: u32,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub prompt: bool,
}

/// Inbound message delivered by the relay for a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub data: SubscriptionData,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionData {
    pub topic: Topic,
    pub message: Arc<str>,
    #[serde(default)]
    pub published_at: i64,
    #[serde(default)]
    pub tag: u32,
}

/// https://www.jsonrpc.org/specification#response_object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Success(SuccessfulResponse),
    Error(ErrorResponse),
}

impl Response {
    pub fn id(&self) -> MessageId {
        match self {
            Self::Success(response) => response.id,
            Self::Error(response) => response.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuccessfulResponse {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    pub result: Value,
}

impl SuccessfulResponse {
    pub fn new(id: MessageId, result: Value) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            result,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    pub error: ErrorData,
}

impl ErrorResponse {
    pub fn new(id: MessageId, error: ErrorData) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            error,
        }
    }
}

/// Data structure representing error response params.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ErrorData {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl ErrorData {
    pub const INVALID_PARAMS: i32 = -32602;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn method_not_found(method: &str) -> Self {
        Self {
            code: Self::METHOD_NOT_FOUND,
            message: "Method not found".to_owned(),
            data: Some(method.to_owned()),
        }
    }

    pub fn invalid_params(reason: impl ToString) -> Self {
        Self {
            code: Self::INVALID_PARAMS,
            message: "Invalid params".to_owned(),
            data: Some(reason.to_string()),
        }
    }

    pub fn internal(reason: impl ToString) -> Self {
        Self {
            code: Self::INTERNAL_ERROR,
            message: "Internal error".to_owned(),
            data: Some(reason.to_string()),
        }
    }
}

impl fmt::Display for ErrorData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code={} message={}", self.code, self.message)?;
        if let Some(data) = &self.data {
            write!(f, " data={data}")?;
        }
        Ok(())
    }
}

/// Typed JSON-RPC request carried inside an encrypted Sign/Pairing envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcRequest<T> {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    pub method: Arc<str>,
    pub params: T,
}

impl<T> JsonRpcRequest<T> {
    pub fn new(id: MessageId, method: impl Into<Arc<str>>, params: T) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            method: method.into(),
            params,
        }
    }
}

/// Typed JSON-RPC response carried inside an encrypted envelope. Exactly one
/// of `result` and `error` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonRpcResponse<R> {
    pub id: MessageId,
    pub jsonrpc: Arc<str>,
    #[serde(default = "Option::default", skip_serializing_if = "Option::is_none")]
    pub result: Option<R>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl<R> JsonRpcResponse<R> {
    pub fn result(id: MessageId, result: R) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: MessageId, error: ErrorData) -> Self {
        Self {
            id,
            jsonrpc: JSON_RPC_VERSION.clone(),
            result: None,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<R, ErrorData> {
        match (self.result, self.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ErrorData::internal("response carries neither result nor error")),
        }
    }
}

/// Decrypted envelope decoded just far enough to route it: requests carry a
/// `method`, responses a `result` or `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub id: MessageId,
    #[serde(default)]
    pub jsonrpc: Option<Arc<str>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorData>,
}

impl RawMessage {
    pub fn is_request(&self) -> bool {
        self.method.is_some()
    }

    pub fn is_response(&self) -> bool {
        self.method.is_none() && (self.result.is_some() || self.error.is_some())
    }

    /// Decodes the request params as `T`. Missing params decode as `null`.
    pub fn request_params<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.params.clone().unwrap_or(Value::Null))
    }

    /// Decodes the response as `R` or the carried error.
    pub fn response<R: DeserializeOwned>(&self) -> Result<Result<R, ErrorData>, serde_json::Error> {
        if let Some(error) = &self.error {
            return Ok(Err(error.clone()));
        }

        serde_json::from_value(self.result.clone().unwrap_or(Value::Null)).map(Ok)
    }
}
