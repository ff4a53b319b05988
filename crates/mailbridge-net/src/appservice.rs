//! Chat transport over the Matrix client-server API, authenticated as an
//! application service.
//!
//! Ghost intents use the appservice token with `?user_id=` masquerading;
//! double puppets use the user's own access token.

use std::sync::Arc;

use async_trait::async_trait;
use mailbridge_shared::event::MessageContent;
use mailbridge_shared::types::{EventId, RoomId, UserId};
use reqwest::{Method, StatusCode, Url};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::IntentError;
use crate::intent::{ChatTransport, CreateRoom, Intent};

const CLIENT_PREFIX: [&str; 3] = ["_matrix", "client", "v3"];
const MEDIA_PREFIX: [&str; 3] = ["_matrix", "media", "v3"];

#[derive(Clone)]
pub struct AppServiceTransport {
    http: reqwest::Client,
    homeserver: Url,
    as_token: String,
    bot: UserId,
}

impl AppServiceTransport {
    pub fn new(homeserver_url: &str, as_token: &str, bot: UserId) -> Result<Self, IntentError> {
        let homeserver = Url::parse(homeserver_url)
            .map_err(|e| IntentError::InvalidResponse(format!("bad homeserver url: {e}")))?;
        Ok(Self {
            http: reqwest::Client::new(),
            homeserver,
            as_token: as_token.to_string(),
            bot,
        })
    }

    fn intent(&self, user: UserId, token: String, masquerade: bool, appservice: bool) -> Arc<dyn Intent> {
        Arc::new(HttpIntent {
            http: self.http.clone(),
            homeserver: self.homeserver.clone(),
            token,
            user_id: user,
            masquerade,
            appservice,
        })
    }
}

impl ChatTransport for AppServiceTransport {
    fn bot(&self) -> Arc<dyn Intent> {
        self.intent(self.bot.clone(), self.as_token.clone(), false, true)
    }

    fn intent_for(&self, user: &UserId) -> Arc<dyn Intent> {
        self.intent(user.clone(), self.as_token.clone(), true, true)
    }

    fn double_puppet(&self, user: &UserId, access_token: &str) -> Arc<dyn Intent> {
        self.intent(user.clone(), access_token.to_string(), false, false)
    }
}

struct HttpIntent {
    http: reqwest::Client,
    homeserver: Url,
    token: String,
    user_id: UserId,
    masquerade: bool,
    /// Account lives in the appservice namespace and can be registered by it.
    appservice: bool,
}

impl HttpIntent {
    fn url(&self, prefix: &[&str], segments: &[&str]) -> Result<Url, IntentError> {
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| IntentError::InvalidResponse("homeserver url cannot be a base".into()))?
            .pop_if_empty()
            .extend(prefix)
            .extend(segments);
        if self.masquerade {
            url.query_pairs_mut()
                .append_pair("user_id", self.user_id.as_str());
        }
        Ok(url)
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, IntentError> {
        debug!(%method, path = url.path(), user = %self.user_id, "homeserver request");

        let mut request = self.http.request(method, url).bearer_auth(&self.token);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        decode(response).await
    }

    async fn client_call(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&Value>,
    ) -> Result<Value, IntentError> {
        let url = self.url(&CLIENT_PREFIX, segments)?;
        self.call(method, url, body).await
    }
}

async fn decode(response: reqwest::Response) -> Result<Value, IntentError> {
    let status = response.status();
    let body: Value = response.json().await.unwrap_or(Value::Null);
    if status.is_success() {
        return Ok(body);
    }

    let errcode = body
        .get("errcode")
        .and_then(Value::as_str)
        .unwrap_or("M_UNKNOWN")
        .to_string();
    let message = body
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Err(match (status, errcode.as_str()) {
        (StatusCode::FORBIDDEN, _) if message.contains("already in the room") => {
            IntentError::AlreadyInRoom
        }
        (StatusCode::FORBIDDEN, _) => IntentError::Forbidden(message),
        (StatusCode::NOT_FOUND, _) | (_, "M_NOT_FOUND") => IntentError::NotFound(message),
        _ => IntentError::Api {
            status: status.as_u16(),
            errcode,
            message,
        },
    })
}

fn txn_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn event_id_of(body: &Value) -> Result<EventId, IntentError> {
    body.get("event_id")
        .and_then(Value::as_str)
        .map(EventId::new)
        .ok_or_else(|| IntentError::InvalidResponse("missing event_id".into()))
}

#[async_trait]
impl Intent for HttpIntent {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    async fn ensure_registered(&self) -> Result<(), IntentError> {
        if !self.appservice {
            return Ok(());
        }
        let mut url = self.homeserver.clone();
        url.path_segments_mut()
            .map_err(|_| IntentError::InvalidResponse("homeserver url cannot be a base".into()))?
            .pop_if_empty()
            .extend(CLIENT_PREFIX)
            .push("register");
        let body = json!({
            "type": "m.login.application_service",
            "username": self.user_id.localpart(),
        });
        match self.call(Method::POST, url, Some(&body)).await {
            Ok(_) => Ok(()),
            Err(IntentError::Api { errcode, .. }) if errcode == "M_USER_IN_USE" => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn whoami(&self) -> Result<UserId, IntentError> {
        let body = self
            .client_call(Method::GET, &["account", "whoami"], None)
            .await?;
        let raw = body
            .get("user_id")
            .and_then(Value::as_str)
            .ok_or_else(|| IntentError::InvalidResponse("missing user_id".into()))?;
        UserId::parse(raw).map_err(|e| IntentError::InvalidResponse(e.to_string()))
    }

    async fn send_message(
        &self,
        room: &RoomId,
        content: &MessageContent,
    ) -> Result<EventId, IntentError> {
        self.send_event(room, "m.room.message", &content.to_event_content())
            .await
    }

    async fn send_event(
        &self,
        room: &RoomId,
        event_type: &str,
        content: &Value,
    ) -> Result<EventId, IntentError> {
        let txn = txn_id();
        let body = self
            .client_call(
                Method::PUT,
                &["rooms", room.as_str(), "send", event_type, &txn],
                Some(content),
            )
            .await?;
        event_id_of(&body)
    }

    async fn send_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
        content: &Value,
    ) -> Result<EventId, IntentError> {
        let body = self
            .client_call(
                Method::PUT,
                &["rooms", room.as_str(), "state", event_type, state_key],
                Some(content),
            )
            .await?;
        event_id_of(&body)
    }

    async fn get_state(
        &self,
        room: &RoomId,
        event_type: &str,
        state_key: &str,
    ) -> Result<Option<Value>, IntentError> {
        match self
            .client_call(
                Method::GET,
                &["rooms", room.as_str(), "state", event_type, state_key],
                None,
            )
            .await
        {
            Ok(content) => Ok(Some(content)),
            Err(IntentError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn invite(&self, room: &RoomId, user: &UserId) -> Result<(), IntentError> {
        let body = json!({ "user_id": user });
        self.client_call(Method::POST, &["rooms", room.as_str(), "invite"], Some(&body))
            .await
            .map(|_| ())
    }

    async fn join(&self, room: &RoomId) -> Result<(), IntentError> {
        self.client_call(Method::POST, &["join", room.as_str()], Some(&json!({})))
            .await
            .map(|_| ())
    }

    async fn leave(&self, room: &RoomId) -> Result<(), IntentError> {
        self.client_call(
            Method::POST,
            &["rooms", room.as_str(), "leave"],
            Some(&json!({})),
        )
        .await
        .map(|_| ())
    }

    async fn create_room(&self, request: &CreateRoom) -> Result<RoomId, IntentError> {
        let mut body = json!({
            "preset": "private_chat",
            "visibility": "private",
            "is_direct": request.is_direct,
            "invite": request.invite,
            "initial_state": request
                .initial_state
                .iter()
                .map(|s| json!({ "type": s.event_type, "state_key": s.state_key, "content": s.content }))
                .collect::<Vec<_>>(),
        });
        if let Some(name) = &request.name {
            body["name"] = json!(name);
        }
        if let Some(topic) = &request.topic {
            body["topic"] = json!(topic);
        }
        if let Some(room_type) = &request.room_type {
            body["creation_content"] = json!({ "type": room_type });
        }

        let response = self
            .client_call(Method::POST, &["createRoom"], Some(&body))
            .await?;
        response
            .get("room_id")
            .and_then(Value::as_str)
            .map(RoomId::new)
            .ok_or_else(|| IntentError::InvalidResponse("missing room_id".into()))
    }

    async fn set_display_name(&self, name: &str) -> Result<(), IntentError> {
        let body = json!({ "displayname": name });
        self.client_call(
            Method::PUT,
            &["profile", self.user_id.as_str(), "displayname"],
            Some(&body),
        )
        .await
        .map(|_| ())
    }

    async fn redact(
        &self,
        room: &RoomId,
        event: &EventId,
        reason: Option<&str>,
    ) -> Result<EventId, IntentError> {
        let txn = txn_id();
        let body = match reason {
            Some(reason) => json!({ "reason": reason }),
            None => json!({}),
        };
        let response = self
            .client_call(
                Method::PUT,
                &["rooms", room.as_str(), "redact", event.as_str(), &txn],
                Some(&body),
            )
            .await?;
        event_id_of(&response)
    }

    async fn upload(
        &self,
        data: Vec<u8>,
        content_type: &str,
        filename: &str,
    ) -> Result<String, IntentError> {
        let mut url = self.url(&MEDIA_PREFIX, &["upload"])?;
        url.query_pairs_mut().append_pair("filename", filename);

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(data)
            .send()
            .await?;
        let body = decode(response).await?;
        body.get("content_uri")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| IntentError::InvalidResponse("missing content_uri".into()))
    }

    async fn download(&self, mxc: &str) -> Result<Vec<u8>, IntentError> {
        let (server, media_id) = mxc
            .strip_prefix("mxc://")
            .and_then(|rest| rest.split_once('/'))
            .ok_or_else(|| IntentError::InvalidResponse(format!("not an mxc uri: {mxc}")))?;
        let url = self.url(&MEDIA_PREFIX, &["download", server, media_id])?;

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(decode(response).await.err().unwrap_or_else(|| {
                IntentError::InvalidResponse("download failed".into())
            }));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn intent(masquerade: bool) -> HttpIntent {
        HttpIntent {
            http: reqwest::Client::new(),
            homeserver: Url::parse("https://hs.example.org/").unwrap(),
            token: "as_token".into(),
            user_id: UserId::new("email_alice@example.com", "example.org"),
            masquerade,
            appservice: true,
        }
    }

    #[test]
    fn path_segments_are_escaped() {
        let url = intent(false)
            .url(&CLIENT_PREFIX, &["rooms", "!abc:example.org", "send", "m.room.message", "t1"])
            .unwrap();
        assert_eq!(
            url.path(),
            "/_matrix/client/v3/rooms/!abc:example.org/send/m.room.message/t1"
        );
        assert!(url.query().is_none());

        let url = intent(false).url(&CLIENT_PREFIX, &["rooms", "a/b"]).unwrap();
        assert_eq!(url.path(), "/_matrix/client/v3/rooms/a%2Fb");
    }

    #[test]
    fn ghosts_masquerade() {
        let url = intent(true).url(&CLIENT_PREFIX, &["join", "!r:hs"]).unwrap();
        let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(
            query,
            vec![(
                "user_id".to_string(),
                "@email_alice@example.com:example.org".to_string()
            )]
        );
    }

    #[test]
    fn transport_hands_out_identities() {
        let bot = UserId::new("emailbot", "example.org");
        let transport = AppServiceTransport::new("https://hs.example.org", "tok", bot.clone()).unwrap();
        assert_eq!(transport.bot().user_id(), &bot);

        let ghost = UserId::new("email_a@b.com", "example.org");
        assert_eq!(transport.intent_for(&ghost).user_id(), &ghost);
        assert!(AppServiceTransport::new("not a url", "tok", bot).is_err());
    }
}
