use async_trait::async_trait;
use log::debug;
use reqwest::{
    header::{ HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE },
    Client as HttpClient,
    Response,
    StatusCode,
};
use serde::{ Deserialize, Serialize };
use serde_json::Value;
use url::Url;

use crate::error::ClientError;
use crate::models::chat::{ ConversationView, FunctionCall, Meta };

/// REST surface of the backend, as a trait so session logic can be
/// exercised against a stub in tests.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Bearer token, re-sent as the socket's first text frame (the socket
    /// protocol has no header auth).
    fn token(&self) -> &str;
    /// The socket endpoint for a conversation.
    fn websocket_url(&self, conversation_id: &str) -> Result<Url, ClientError>;
    async fn agents(&self) -> Result<Vec<String>, ClientError>;
    async fn conversation(&self, conversation_id: &str) -> Result<ConversationView, ClientError>;
    async fn root_by_agent(&self, agent: &str) -> Result<ConversationView, ClientError>;
    /// Starts a turn; returns the path of the conversation that answers it.
    async fn send_message(
        &self,
        query: &str,
        response_to: Option<&str>,
        agent: &str
    ) -> Result<Vec<String>, ClientError>;
    async fn update_meta(&self, id: &str, patch: Value) -> Result<(), ClientError>;
    async fn update_chat(&self, id: &str, function_call: &FunctionCall) -> Result<(), ClientError>;
    async fn fork(&self, path: &[String]) -> Result<ConversationView, ClientError>;
    async fn cancel(&self, conversation_id: &str) -> Result<(), ClientError>;
    async fn run_cell(
        &self,
        code: &str,
        cell_type: &str,
        insert_after: &[String]
    ) -> Result<(), ClientError>;
    async fn create_cell(&self, code: &str, insert_after: &[String]) -> Result<(), ClientError>;
    async fn share(&self, conversation_id: &str, share_type: &str) -> Result<String, ClientError>;
    async fn meta(&self, id: &str) -> Result<Meta, ClientError>;
}

#[derive(Serialize)]
struct MessageRequest<'a> {
    query: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_to: Option<&'a str>,
    agent: &'a str,
}

#[derive(Serialize)]
struct ChatUpdateRequest<'a> {
    function_call: &'a FunctionCall,
}

#[derive(Serialize)]
struct RunCellRequest<'a> {
    code: &'a str,
    #[serde(rename = "type")]
    cell_type: &'a str,
    insert_after: &'a [String],
}

#[derive(Serialize)]
struct CellRequest<'a> {
    code: &'a str,
    insert_after: &'a [String],
}

#[derive(Serialize)]
struct ShareRequest<'a> {
    conversation_id: &'a str,
    #[serde(rename = "type")]
    share_type: &'a str,
}

#[derive(Deserialize)]
struct PathResponse {
    path: Vec<String>,
}

#[derive(Deserialize)]
struct ShareResponse {
    token: String,
}

/// HTTP client for the backend, bearer-token authenticated. The websocket
/// handshake cannot carry headers, so the token is also exposed for the
/// first-frame handshake.
pub struct ApiClient {
    http: HttpClient,
    base: Url,
    token: String,
}

impl ApiClient {
    pub fn new(base: Url, token: String) -> Result<Self, ClientError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e|
                ClientError::Transport(format!("Invalid token for header: {}", e))
            )?
        );
        let http = HttpClient::builder()
            .default_headers(headers)
            .build()
            .map_err(ClientError::from)?;
        Ok(Self { http, base, token })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base.join(path)?)
    }

    /// 401-class responses become [`ClientError::Unauthorized`] so the shell
    /// can tell bad credentials apart from connectivity loss; other non-2xx
    /// carry the backend's message through.
    async fn check(response: Response) -> Result<Response, ClientError> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Unauthorized(message));
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ClientError::Backend { status: status.as_u16(), message });
        }
        Ok(response)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        debug!("GET {}", path);
        let response = self.http.get(self.endpoint(path)?).send().await?;
        Ok(Self::check(response).await?.json::<T>().await?)
    }
}

#[async_trait]
impl AgentBackend for ApiClient {
    fn token(&self) -> &str {
        &self.token
    }

    /// Derived from the REST base: http → ws, https → wss.
    fn websocket_url(&self, conversation_id: &str) -> Result<Url, ClientError> {
        let mut url = self.base.join(&format!("ws/{}", conversation_id))?;
        let scheme = if self.base.scheme() == "https" { "wss" } else { "ws" };
        url
            .set_scheme(scheme)
            .map_err(|_| {
                ClientError::Transport(format!("Cannot derive socket scheme from {}", self.base))
            })?;
        Ok(url)
    }

    async fn agents(&self) -> Result<Vec<String>, ClientError> {
        self.get_json("agents").await
    }

    async fn conversation(&self, conversation_id: &str) -> Result<ConversationView, ClientError> {
        self.get_json(&format!("messages/{}", conversation_id)).await
    }

    async fn root_by_agent(&self, agent: &str) -> Result<ConversationView, ClientError> {
        self.get_json(&format!("byagent/{}", agent)).await
    }

    async fn send_message(
        &self,
        query: &str,
        response_to: Option<&str>,
        agent: &str
    ) -> Result<Vec<String>, ClientError> {
        let body = MessageRequest { query, response_to, agent };
        let response = self.http.post(self.endpoint("message/")?).json(&body).send().await?;
        let parsed: PathResponse = Self::check(response).await?.json().await?;
        Ok(parsed.path)
    }

    async fn update_meta(&self, id: &str, patch: Value) -> Result<(), ClientError> {
        let response = self.http
            .put(self.endpoint(&format!("meta/{}", id))?)
            .json(&patch)
            .send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn update_chat(&self, id: &str, function_call: &FunctionCall) -> Result<(), ClientError> {
        let body = ChatUpdateRequest { function_call };
        let response = self.http
            .put(self.endpoint(&format!("chat/{}", id))?)
            .json(&body)
            .send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn fork(&self, path: &[String]) -> Result<ConversationView, ClientError> {
        self.get_json(&format!("fork/{}", path.join("/"))).await
    }

    async fn cancel(&self, conversation_id: &str) -> Result<(), ClientError> {
        let response = self.http
            .get(self.endpoint(&format!("cancel/{}", conversation_id))?)
            .send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn run_cell(
        &self,
        code: &str,
        cell_type: &str,
        insert_after: &[String]
    ) -> Result<(), ClientError> {
        let body = RunCellRequest { code, cell_type, insert_after };
        let response = self.http.post(self.endpoint("run/")?).json(&body).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn create_cell(&self, code: &str, insert_after: &[String]) -> Result<(), ClientError> {
        let body = CellRequest { code, insert_after };
        let response = self.http.post(self.endpoint("cell/")?).json(&body).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn share(&self, conversation_id: &str, share_type: &str) -> Result<String, ClientError> {
        let body = ShareRequest { conversation_id, share_type };
        let response = self.http.post(self.endpoint("share/")?).json(&body).send().await?;
        let parsed: ShareResponse = Self::check(response).await?.json().await?;
        Ok(parsed.token)
    }

    async fn meta(&self, id: &str) -> Result<Meta, ClientError> {
        self.get_json(&format!("meta/{}", id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn websocket_url_follows_base_scheme() {
        let client = ApiClient::new(
            Url::parse("http://localhost:8745/").unwrap(),
            "token".to_string()
        ).unwrap();
        assert_eq!(client.websocket_url("c1").unwrap().as_str(), "ws://localhost:8745/ws/c1");

        let secure = ApiClient::new(
            Url::parse("https://agents.example.com/").unwrap(),
            "token".to_string()
        ).unwrap();
        assert_eq!(
            secure.websocket_url("c1").unwrap().as_str(),
            "wss://agents.example.com/ws/c1"
        );
    }

    #[test]
    fn request_bodies_use_wire_names() {
        let run = RunCellRequest {
            code: "print(1)",
            cell_type: "python",
            insert_after: &["root".to_string(), "c1".to_string(), "m1".to_string()],
        };
        let raw = serde_json::to_value(&run).unwrap();
        assert_eq!(raw["type"], "python");
        assert_eq!(raw["insert_after"][2], "m1");

        let share = ShareRequest { conversation_id: "c1", share_type: "view" };
        let raw = serde_json::to_value(&share).unwrap();
        assert_eq!(raw["type"], "view");
    }
}
