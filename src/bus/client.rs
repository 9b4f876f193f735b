// Bus API client.
//
// Endpoints consumed:
//
//   POST   /agents                         -> Agent
//   PATCH  /agents/{id}/heartbeat          -> Agent
//   DELETE /agents/{id}
//   GET    /agents?machine_id=&session_id=&status=
//   POST   /messages                       -> Message
//   PATCH  /messages/{id}/claim  {agentId} -> Message (409 when already claimed)
//   PATCH  /messages/{id}/status {status}  -> Message
//   GET    /messages?thread_id=|channel_id=|target_agent_id=
//   POST/GET/DELETE /channels[/{id}]
//   POST/GET /pastes[/{id}]
//   GET    {stream_path}?machine_id=&last_event_id=   (long-lived event stream)
//
// Every request carries `Authorization: Bearer <project credential>`.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::error::{BusError, BusResult};
use super::types::{
    Agent, AgentQuery, Channel, ClaimOutcome, Message, MessageQuery, MessageStatus, NewChannel,
    NewMessage, NewPaste, Paste, RegisterAgent,
};
use super::{BusApi, EventByteStream};
use crate::config::BusConfig;

/// HTTP client for the bus.
pub struct BusClient {
    base_url: String,
    api_key: String,
    stream_path: String,
    http: Client,
    /// Separate client for the event stream: a whole-request timeout would
    /// cut a healthy long-lived stream.
    stream_http: Client,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ClaimRequest<'a> {
    agent_id: &'a str,
}

#[derive(Serialize)]
struct StatusRequest {
    status: MessageStatus,
}

impl BusClient {
    pub fn new(config: &BusConfig) -> BusResult<Self> {
        let build_err = |e: reqwest::Error| BusError::Transport {
            method: "BUILD",
            endpoint: config.base_url.clone(),
            source: e,
        };

        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(build_err)?;
        let stream_http = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(build_err)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            stream_path: config.stream_path.clone(),
            http,
            stream_http,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send(
        &self,
        method: &'static str,
        path: &str,
        request: RequestBuilder,
    ) -> BusResult<Response> {
        tracing::debug!(method, endpoint = path, "bus request");
        let response = request
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| BusError::Transport {
                method,
                endpoint: path.to_string(),
                source: e,
            })?;
        check_status(method, path, response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: &'static str,
        path: &str,
        request: RequestBuilder,
    ) -> BusResult<T> {
        let response = self.send(method, path, request).await?;
        decode(path, response).await
    }
}

async fn check_status(method: &'static str, path: &str, response: Response) -> BusResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(BusError::Unauthorized {
            method,
            endpoint: path.to_string(),
            status: status.as_u16(),
        });
    }
    let body = response.text().await.unwrap_or_default();
    Err(BusError::Http {
        method,
        endpoint: path.to_string(),
        status: status.as_u16(),
        body,
    })
}

async fn decode<T: DeserializeOwned>(path: &str, response: Response) -> BusResult<T> {
    let bytes = response.bytes().await.map_err(|e| BusError::Decode {
        endpoint: path.to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| BusError::Decode {
        endpoint: path.to_string(),
        reason: e.to_string(),
    })
}

#[async_trait]
impl BusApi for BusClient {
    async fn register_agent(&self, request: &RegisterAgent) -> BusResult<Agent> {
        let path = "/agents";
        self.send_json("POST", path, self.http.post(self.url(path)).json(request))
            .await
    }

    async fn heartbeat(&self, agent_id: &str) -> BusResult<Agent> {
        let path = format!("/agents/{}/heartbeat", agent_id);
        self.send_json("PATCH", &path, self.http.patch(self.url(&path)))
            .await
    }

    async fn deregister_agent(&self, agent_id: &str) -> BusResult<()> {
        let path = format!("/agents/{}", agent_id);
        self.send("DELETE", &path, self.http.delete(self.url(&path)))
            .await
            .map(|_| ())
    }

    async fn list_agents(&self, query: &AgentQuery) -> BusResult<Vec<Agent>> {
        let path = "/agents";
        let request = self.http.get(self.url(path)).query(&query.to_pairs());
        self.send_json("GET", path, request).await
    }

    async fn send_message(&self, message: &NewMessage) -> BusResult<Message> {
        let path = "/messages";
        self.send_json("POST", path, self.http.post(self.url(path)).json(message))
            .await
    }

    async fn claim_message(&self, message_id: &str, agent_id: &str) -> BusResult<ClaimOutcome> {
        let path = format!("/messages/{}/claim", message_id);
        let request = self
            .http
            .patch(self.url(&path))
            .json(&ClaimRequest { agent_id });
        match self.send_json::<Message>("PATCH", &path, request).await {
            Ok(message) => Ok(ClaimOutcome::Claimed(message)),
            Err(BusError::Http { status: 409, .. }) => Ok(ClaimOutcome::Lost),
            Err(e) => Err(e),
        }
    }

    async fn update_message_status(
        &self,
        message_id: &str,
        status: MessageStatus,
    ) -> BusResult<Message> {
        let path = format!("/messages/{}/status", message_id);
        let request = self
            .http
            .patch(self.url(&path))
            .json(&StatusRequest { status });
        self.send_json("PATCH", &path, request).await
    }

    async fn get_message(&self, message_id: &str) -> BusResult<Message> {
        let path = format!("/messages/{}", message_id);
        self.send_json("GET", &path, self.http.get(self.url(&path)))
            .await
    }

    async fn list_messages(&self, query: &MessageQuery) -> BusResult<Vec<Message>> {
        let path = "/messages";
        let request = self.http.get(self.url(path)).query(&query.to_pairs());
        self.send_json("GET", path, request).await
    }

    async fn create_channel(&self, channel: &NewChannel) -> BusResult<Channel> {
        let path = "/channels";
        self.send_json("POST", path, self.http.post(self.url(path)).json(channel))
            .await
    }

    async fn list_channels(&self) -> BusResult<Vec<Channel>> {
        let path = "/channels";
        self.send_json("GET", path, self.http.get(self.url(path)))
            .await
    }

    async fn get_channel(&self, channel_id: &str) -> BusResult<Channel> {
        let path = format!("/channels/{}", channel_id);
        self.send_json("GET", &path, self.http.get(self.url(&path)))
            .await
    }

    async fn delete_channel(&self, channel_id: &str) -> BusResult<()> {
        let path = format!("/channels/{}", channel_id);
        self.send("DELETE", &path, self.http.delete(self.url(&path)))
            .await
            .map(|_| ())
    }

    async fn create_paste(&self, paste: &NewPaste) -> BusResult<Paste> {
        let path = "/pastes";
        self.send_json("POST", path, self.http.post(self.url(path)).json(paste))
            .await
    }

    async fn get_paste(&self, paste_id: &str) -> BusResult<Paste> {
        let path = format!("/pastes/{}", paste_id);
        self.send_json("GET", &path, self.http.get(self.url(&path)))
            .await
    }

    async fn open_stream(
        &self,
        machine_id: &str,
        cursor: Option<&str>,
    ) -> BusResult<EventByteStream> {
        let path = self.stream_path.clone();
        let mut query = vec![("machine_id", machine_id.to_string())];
        let mut request = self
            .stream_http
            .get(self.url(&path))
            .header("accept", "text/event-stream");
        if let Some(cursor) = cursor {
            query.push(("last_event_id", cursor.to_string()));
            request = request.header("last-event-id", cursor);
        }
        let response = self.send("GET", &path, request.query(&query)).await?;

        let stream = response.bytes_stream().map(move |chunk| {
            chunk.map(|bytes| bytes.to_vec()).map_err(|e| BusError::Transport {
                method: "GET",
                endpoint: path.clone(),
                source: e,
            })
        });
        Ok(stream.boxed())
    }
}
