use std::collections::VecDeque;
use std::fmt::Display;
use std::pin::Pin;
use std::sync::RwLock;
use std::time::Duration;

use bytes::Bytes;
use cadence_error::CadenceError;
use futures::{stream, Stream, StreamExt};
use reqwest::header::ACCEPT;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::sse::EventStreamDecoder;
use crate::types::{
    AgentInfo, CreateSessionRequest, ListSessionsQuery, Message, PermissionReply,
    PermissionReplyBody, PromptRequest, ProviderListing, ServerConfig, ServerEndpoint, Session,
    SummarizeRequest,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
// Prompt and summarize calls return only once the assistant turn finishes.
const GENERATION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Decoded event records from `/event`; ends on close, cancellation or error.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<Value, CadenceError>> + Send>>;

/// Request/response client for the agent server.
///
/// The endpoint can be changed in place; each call snapshots it when the call
/// starts, so calls already in flight keep their original target.
///
/// Every request-response call is bounded by a timeout; the `/event` stream
/// is bounded only while connecting.
#[derive(Debug)]
pub struct OpencodeClient {
    http: Client,
    endpoint: RwLock<ServerEndpoint>,
    request_timeout: Duration,
    generation_timeout: Duration,
}

impl OpencodeClient {
    pub fn new(base_url: &str, working_context: impl Into<String>) -> Self {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                tracing::warn!(error = %err, "failed to configure http client; using defaults");
                Client::new()
            });
        Self::with_http_client(http, ServerEndpoint::new(base_url, working_context))
    }

    pub fn with_http_client(http: Client, endpoint: ServerEndpoint) -> Self {
        Self {
            http,
            endpoint: RwLock::new(endpoint),
            request_timeout: REQUEST_TIMEOUT,
            generation_timeout: GENERATION_TIMEOUT,
        }
    }

    /// Caps ordinary calls at `timeout`. Prompt and summarize calls keep the
    /// longer generation timeout unless it is shorter than `timeout`.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self.generation_timeout = self.generation_timeout.max(timeout);
        self
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        match self.endpoint.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn base_url(&self) -> String {
        self.endpoint().base_url
    }

    pub fn set_base_url(&self, base_url: &str) {
        self.update_endpoint(|endpoint| endpoint.base_url = crate::normalize_base_url(base_url));
    }

    pub fn set_working_context(&self, working_context: impl Into<String>) {
        let working_context = working_context.into();
        self.update_endpoint(|endpoint| endpoint.working_context = working_context);
    }

    fn update_endpoint(&self, apply: impl FnOnce(&mut ServerEndpoint)) {
        let mut guard = match self.endpoint.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        apply(&mut guard);
    }

    fn url(&self, segments: &[&str]) -> Result<Url, CadenceError> {
        let endpoint = self.endpoint();
        let mut url = Url::parse(&endpoint.base_url).map_err(|err| CadenceError::InvalidRequest {
            message: format!("invalid server url `{}`: {err}", endpoint.base_url),
        })?;
        url.path_segments_mut()
            .map_err(|_| CadenceError::InvalidRequest {
                message: format!("server url `{}` cannot be a base", endpoint.base_url),
            })?
            .pop_if_empty()
            .extend(segments);
        url.query_pairs_mut()
            .append_pair("directory", &endpoint.working_context);
        Ok(url)
    }

    pub async fn get_config(&self) -> Result<ServerConfig, CadenceError> {
        self.send_json(self.http.get(self.url(&["config"])?)).await
    }

    pub async fn list_sessions(&self, query: &ListSessionsQuery) -> Result<Vec<Session>, CadenceError> {
        let mut url = self.url(&["session"])?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(search) = query.search.as_deref().filter(|search| !search.is_empty()) {
                pairs.append_pair("search", search);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(roots) = query.roots {
                pairs.append_pair("roots", &roots.to_string());
            }
        }
        self.send_json(self.http.get(url)).await
    }

    pub async fn create_session(&self, body: &CreateSessionRequest) -> Result<Session, CadenceError> {
        self.send_json(self.http.post(self.url(&["session"])?).json(body))
            .await
    }

    pub async fn session_messages(
        &self,
        session_id: &str,
        limit: Option<u32>,
    ) -> Result<Vec<Message>, CadenceError> {
        let mut url = self.url(&["session", session_id, "message"])?;
        if let Some(limit) = limit {
            url.query_pairs_mut().append_pair("limit", &limit.to_string());
        }
        self.send_json(self.http.get(url)).await
    }

    pub async fn prompt(&self, session_id: &str, body: &PromptRequest) -> Result<Value, CadenceError> {
        self.send_json(
            self.http
                .post(self.url(&["session", session_id, "message"])?)
                .timeout(self.generation_timeout)
                .json(body),
        )
        .await
    }

    pub async fn summarize(
        &self,
        session_id: &str,
        body: &SummarizeRequest,
    ) -> Result<bool, CadenceError> {
        self.send_json(
            self.http
                .post(self.url(&["session", session_id, "summarize"])?)
                .timeout(self.generation_timeout)
                .json(body),
        )
        .await
    }

    pub async fn list_agents(&self) -> Result<Vec<AgentInfo>, CadenceError> {
        self.send_json(self.http.get(self.url(&["agent"])?)).await
    }

    pub async fn list_providers(&self) -> Result<ProviderListing, CadenceError> {
        self.send_json(self.http.get(self.url(&["provider"])?)).await
    }

    pub async fn reply_permission(
        &self,
        request_id: &str,
        reply: PermissionReply,
        message: Option<&str>,
    ) -> Result<bool, CadenceError> {
        let body = PermissionReplyBody { reply, message };
        self.send_json(
            self.http
                .post(self.url(&["permission", request_id, "reply"])?)
                .json(&body),
        )
        .await
    }

    /// Opens `/event` and decodes it lazily.
    ///
    /// Cancelling `token` ends the stream without an item. A clean server close
    /// also ends it; a transport error mid-stream is yielded once as
    /// [`CadenceError::Subscription`] and then the stream ends.
    pub async fn subscribe_events(&self, token: CancellationToken) -> Result<EventStream, CadenceError> {
        let request = self
            .http
            .get(self.url(&["event"])?)
            .header(ACCEPT, "text/event-stream")
            .send();

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Box::pin(stream::empty())),
            response = request => response.map_err(connection_error)?,
        };
        let response = check_status(response).await?;
        tracing::debug!(url = %response.url(), "event stream opened");

        Ok(Box::pin(decode_event_stream(response.bytes_stream(), token)))
    }

    /// Sends with the ordinary request timeout unless the builder already set
    /// its own.
    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, CadenceError> {
        let (client, request) = request.build_split();
        let mut request = request.map_err(connection_error)?;
        request.timeout_mut().get_or_insert(self.request_timeout);
        let response = client.execute(request).await.map_err(connection_error)?;
        read_json(response).await
    }
}

/// Adapts a chunked byte stream into decoded event records.
pub fn decode_event_stream<S, E>(
    bytes: S,
    token: CancellationToken,
) -> impl Stream<Item = Result<Value, CadenceError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    struct DecodeState<S> {
        bytes: Pin<Box<S>>,
        decoder: EventStreamDecoder,
        ready: VecDeque<Value>,
        token: CancellationToken,
        finished: bool,
    }

    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: EventStreamDecoder::new(),
        ready: VecDeque::new(),
        token,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.finished || state.token.is_cancelled() {
                return None;
            }
            if let Some(event) = state.ready.pop_front() {
                return Some((Ok(event), state));
            }

            let next = tokio::select! {
                biased;
                _ = state.token.cancelled() => return None,
                next = state.bytes.next() => next,
            };

            match next {
                Some(Ok(chunk)) => {
                    let events = state.decoder.push(&chunk);
                    state.ready.extend(events);
                }
                Some(Err(err)) => {
                    state.finished = true;
                    let err = CadenceError::Subscription {
                        message: err.to_string(),
                    };
                    return Some((Err(err), state));
                }
                None => {
                    if state.decoder.pending_len() > 0 {
                        tracing::debug!(
                            bytes = state.decoder.pending_len(),
                            "event stream closed with a partial frame"
                        );
                    }
                    return None;
                }
            }
        }
    })
}

fn connection_error(err: reqwest::Error) -> CadenceError {
    CadenceError::Connection {
        message: err.to_string(),
    }
}

async fn check_status(response: Response) -> Result<Response, CadenceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let body = if body.is_empty() {
        status.canonical_reason().unwrap_or_default().to_string()
    } else {
        body
    };
    Err(CadenceError::Http {
        status: status.as_u16(),
        body,
    })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T, CadenceError> {
    let response = check_status(response).await?;
    let bytes = response.bytes().await.map_err(connection_error)?;
    serde_json::from_slice(&bytes).map_err(|err| CadenceError::InvalidResponse {
        message: err.to_string(),
    })
}
