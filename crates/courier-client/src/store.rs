use std::future::Future;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use courier_types::api::{
    ConversationSummary, Draft, ErrorBody, MarkReadResponse, SendMessageRequest, StoreError,
    StoredMessage,
};
use courier_types::{ConversationId, ParticipantId};

/// The store of record, as the client sees it. Calls act on behalf of the
/// authenticated participant.
pub trait ChatStore: Send + Sync + 'static {
    fn persist_message(
        &self,
        receiver_id: &ParticipantId,
        draft: &Draft,
    ) -> impl Future<Output = Result<StoredMessage, StoreError>> + Send;

    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationSummary>, StoreError>> + Send;

    fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> impl Future<Output = Result<Vec<StoredMessage>, StoreError>> + Send;

    fn mark_read(
        &self,
        conversation_id: &ConversationId,
    ) -> impl Future<Output = Result<u64, StoreError>> + Send;
}

/// [`ChatStore`] over the courier REST API.
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn call<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        let response = request
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        decode(response).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, StoreError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| StoreError::Unavailable(format!("malformed response: {e}")));
    }

    let message = response
        .json::<ErrorBody>()
        .await
        .map(|body| body.message)
        .unwrap_or_else(|_| status.to_string());
    debug!("Store call failed with {}: {}", status, message);
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => StoreError::Unauthorized(message),
        StatusCode::NOT_FOUND => StoreError::NotFound(message),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => StoreError::Invalid(message),
        _ => StoreError::Unavailable(message),
    })
}

impl ChatStore for HttpStore {
    async fn persist_message(
        &self,
        receiver_id: &ParticipantId,
        draft: &Draft,
    ) -> Result<StoredMessage, StoreError> {
        let body = SendMessageRequest {
            receiver_id: receiver_id.clone(),
            draft: draft.clone(),
        };
        self.call(self.client.post(self.url("/chat/send")).json(&body))
            .await
    }

    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>, StoreError> {
        self.call(self.client.get(self.url("/chat/conversations")))
            .await
    }

    async fn fetch_messages(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let path = format!("/chat/conversations/{conversation_id}/messages");
        self.call(self.client.get(self.url(&path))).await
    }

    async fn mark_read(&self, conversation_id: &ConversationId) -> Result<u64, StoreError> {
        let path = format!("/chat/conversations/{conversation_id}/mark-read");
        let response: MarkReadResponse = self.call(self.client.post(self.url(&path))).await?;
        Ok(response.modified_count)
    }
}
