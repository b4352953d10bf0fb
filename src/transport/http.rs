// =============================================================================
// Harmony Matrix Client - HTTP Transport Module
// =============================================================================
//
// Project: Harmony - Multi-account Matrix chat client
// Contributors: Harmony Development Team
// Date: 2024-12-11
// Version: 0.1.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   MatrixSession over the client-server API (v3) with reqwest: password
//   login, long-poll sync, HTML message sending, backward pagination and
//   logout.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc, time::Duration, time::Instant};

use async_trait::async_trait;
use harmony_core::{
    config::SyncConfig, Direction, HarmonyError, InvitedRoom, JoinedRoom, MatrixSession, MessagesPage, RawEvent,
    Result, SessionFactory, SyncBatch,
};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use ruma::{OwnedEventId, OwnedRoomId, OwnedUserId, RoomId, UserId};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, instrument};
use url::Url;

const CLIENT_API: [&str; 3] = ["_matrix", "client", "v3"];

/// Extra time on top of the long-poll timeout before a sync request fails.
const SYNC_GRACE: Duration = Duration::from_secs(15);

fn request_error(e: reqwest::Error) -> HarmonyError {
    if e.is_connect() || e.is_timeout() {
        HarmonyError::Unreachable(e.to_string())
    } else {
        HarmonyError::Network(e.to_string())
    }
}

/// Map a non-success response to the error taxonomy.
async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body: Value = response.json().await.unwrap_or(Value::Null);
    let errcode = body.get("errcode").and_then(Value::as_str).unwrap_or("M_UNKNOWN");
    let message = body.get("error").and_then(Value::as_str).unwrap_or_default();
    let detail = format!("{status} {errcode} {message}").trim_end().to_owned();

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => HarmonyError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => HarmonyError::Network(detail),
        s if s.is_server_error() => HarmonyError::Network(detail),
        _ => HarmonyError::Protocol(detail),
    })
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| HarmonyError::Config(format!("{base} cannot be a base url")))?
        .pop_if_empty()
        .extend(CLIENT_API)
        .extend(segments);
    Ok(url)
}

fn parse_base(server_url: &str) -> Result<Url> {
    Url::parse(server_url.trim()).map_err(|e| HarmonyError::Config(format!("invalid server url {server_url:?}: {e}")))
}

/// Logs in over HTTP.
#[derive(Debug, Clone)]
pub struct HttpSessionFactory {
    client: Client,
    sync: SyncConfig,
}

impl HttpSessionFactory {
    pub fn new(sync: SyncConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("harmony/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| HarmonyError::Internal(format!("cannot build HTTP client: {e}")))?;
        Ok(Self { client, sync })
    }
}

#[derive(Deserialize)]
struct LoginResponse {
    user_id: OwnedUserId,
    access_token: String,
    #[serde(default)]
    device_id: Option<String>,
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    #[instrument(level = "debug", skip(self, password))]
    async fn login(
        &self,
        server_url: &str,
        user_id: &UserId,
        password: &str,
        device_name: &str,
    ) -> Result<Arc<dyn MatrixSession>> {
        let start = Instant::now();
        let base = parse_base(server_url)?;
        let body = json!({
            "type": "m.login.password",
            "identifier": { "type": "m.id.user", "user": user_id.as_str() },
            "password": password,
            "initial_device_display_name": device_name,
        });

        let response = self
            .client
            .post(endpoint(&base, &["login"])?)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;
        let login: LoginResponse = check(response)
            .await?
            .json()
            .await
            .map_err(|e| HarmonyError::Protocol(format!("bad login response: {e}")))?;

        info!(
            "✅ Logged in {} (device {}) in {:?}",
            login.user_id,
            login.device_id.as_deref().unwrap_or("?"),
            start.elapsed()
        );
        Ok(Arc::new(HttpSession {
            client: self.client.clone(),
            base,
            homeserver: server_url.trim().to_owned(),
            user_id: login.user_id,
            access_token: login.access_token,
            sync: self.sync.clone(),
        }))
    }
}

/// Authenticated client-server API session.
pub struct HttpSession {
    client: Client,
    base: Url,
    homeserver: String,
    user_id: OwnedUserId,
    access_token: String,
    sync: SyncConfig,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("homeserver", &self.homeserver)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

impl HttpSession {
    fn request(&self, method: Method, segments: &[&str]) -> Result<RequestBuilder> {
        Ok(self
            .client
            .request(method, endpoint(&self.base, segments)?)
            .bearer_auth(&self.access_token))
    }
}

#[derive(Default, Deserialize)]
struct Events {
    #[serde(default)]
    events: Vec<RawEvent>,
}

#[derive(Default, Deserialize)]
struct Timeline {
    #[serde(default)]
    events: Vec<RawEvent>,
    #[serde(default)]
    prev_batch: Option<String>,
}

#[derive(Deserialize)]
struct JoinedRoomResponse {
    #[serde(default)]
    state: Events,
    #[serde(default)]
    timeline: Timeline,
    #[serde(default)]
    ephemeral: Events,
}

#[derive(Deserialize)]
struct InvitedRoomResponse {
    #[serde(default)]
    invite_state: Events,
}

#[derive(Default, Deserialize)]
struct Rooms {
    #[serde(default)]
    join: BTreeMap<OwnedRoomId, JoinedRoomResponse>,
    #[serde(default)]
    invite: BTreeMap<OwnedRoomId, InvitedRoomResponse>,
    #[serde(default)]
    leave: BTreeMap<OwnedRoomId, Value>,
}

#[derive(Deserialize)]
struct SyncResponse {
    next_batch: String,
    #[serde(default)]
    rooms: Rooms,
    #[serde(default)]
    presence: Events,
}

impl From<SyncResponse> for SyncBatch {
    fn from(response: SyncResponse) -> Self {
        SyncBatch {
            next_batch: response.next_batch,
            joined: response
                .rooms
                .join
                .into_iter()
                .map(|(room_id, room)| JoinedRoom {
                    room_id,
                    prev_batch: room.timeline.prev_batch,
                    state: room.state.events,
                    timeline: room.timeline.events,
                    ephemeral: room.ephemeral.events,
                })
                .collect(),
            invited: response
                .rooms
                .invite
                .into_iter()
                .map(|(room_id, room)| InvitedRoom {
                    room_id,
                    state: room.invite_state.events,
                })
                .collect(),
            left: response.rooms.leave.into_keys().collect(),
            presence: response.presence.events,
        }
    }
}

#[derive(Deserialize)]
struct SendResponse {
    event_id: OwnedEventId,
}

#[async_trait]
impl MatrixSession for HttpSession {
    fn user_id(&self) -> &UserId {
        &self.user_id
    }

    fn homeserver(&self) -> &str {
        &self.homeserver
    }

    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    async fn sync(&self, since: Option<&str>, timeout: Duration) -> Result<SyncBatch> {
        let filter = json!({ "room": { "timeline": { "limit": self.sync.timeline_limit } } }).to_string();
        let timeout_ms = timeout.as_millis().to_string();
        let mut query = vec![("timeout", timeout_ms.as_str()), ("filter", filter.as_str())];
        if let Some(since) = since {
            query.push(("since", since));
        }

        let response = self
            .request(Method::GET, &["sync"])?
            .query(&query)
            .timeout(timeout + SYNC_GRACE)
            .send()
            .await
            .map_err(request_error)?;
        let sync: SyncResponse = check(response)
            .await?
            .json()
            .await
            .map_err(|e| HarmonyError::Protocol(format!("bad sync response: {e}")))?;
        debug!(
            "🔧 Sync for {}: {} joined, {} invited, {} left",
            self.user_id,
            sync.rooms.join.len(),
            sync.rooms.invite.len(),
            sync.rooms.leave.len()
        );
        Ok(sync.into())
    }

    #[instrument(level = "debug", skip(self, html, body))]
    async fn send_html(&self, room_id: &RoomId, html: &str, body: &str, txn_id: &str) -> Result<OwnedEventId> {
        let content = json!({
            "msgtype": "m.text",
            "body": body,
            "format": "org.matrix.custom.html",
            "formatted_body": html,
        });
        let response = self
            .request(
                Method::PUT,
                &["rooms", room_id.as_str(), "send", "m.room.message", txn_id],
            )?
            .json(&content)
            .send()
            .await
            .map_err(request_error)?;
        let sent: SendResponse = check(response)
            .await?
            .json()
            .await
            .map_err(|e| HarmonyError::Protocol(format!("bad send response: {e}")))?;
        Ok(sent.event_id)
    }

    #[instrument(level = "debug", skip(self))]
    async fn room_messages(
        &self,
        room_id: &RoomId,
        from: Option<&str>,
        dir: Direction,
        limit: u16,
    ) -> Result<MessagesPage> {
        let limit = limit.to_string();
        let mut query = vec![("dir", dir.as_str()), ("limit", limit.as_str())];
        if let Some(from) = from {
            query.push(("from", from));
        }
        let response = self
            .request(Method::GET, &["rooms", room_id.as_str(), "messages"])?
            .query(&query)
            .send()
            .await
            .map_err(request_error)?;
        check(response)
            .await?
            .json()
            .await
            .map_err(|e| HarmonyError::Protocol(format!("bad messages response: {e}")))
    }

    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    async fn set_display_name(&self, name: &str, room_id: Option<&RoomId>) -> Result<()> {
        let user = self.user_id.as_str();
        let request = match room_id {
            None => self
                .request(Method::PUT, &["profile", user, "displayname"])?
                .json(&json!({ "displayname": name })),
            Some(room_id) => {
                let path = ["rooms", room_id.as_str(), "state", "m.room.member", user];
                let response = self.request(Method::GET, &path)?.send().await.map_err(request_error)?;
                let mut member: Value = check(response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| HarmonyError::Protocol(format!("bad member state: {e}")))?;
                let Some(content) = member.as_object_mut() else {
                    return Err(HarmonyError::Protocol("member state is not an object".into()));
                };
                content.insert("membership".into(), json!("join"));
                content.insert("displayname".into(), json!(name));
                self.request(Method::PUT, &path)?.json(&member)
            }
        };
        check(request.send().await.map_err(request_error)?).await?;
        debug!("✅ Display name of {} set to {:?}", self.user_id, name);
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(user_id = %self.user_id))]
    async fn logout(&self) -> Result<()> {
        let response = self
            .request(Method::POST, &["logout"])?
            .json(&json!({}))
            .send()
            .await
            .map_err(request_error)?;
        check(response).await?;
        info!("✅ Session of {} closed", self.user_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn endpoints_escape_room_ids() {
        let base = parse_base("https://matrix.example.org").unwrap();
        let url = endpoint(&base, &["rooms", "!abc:example.org", "messages"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://matrix.example.org/_matrix/client/v3/rooms/!abc:example.org/messages"
        );

        let prefixed = parse_base("https://example.org/matrix/").unwrap();
        let url = endpoint(&prefixed, &["rooms", "#a/b:example.org", "send", "m.room.message", "t1"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.org/matrix/_matrix/client/v3/rooms/%23a%2Fb:example.org/send/m.room.message/t1"
        );
    }

    #[test]
    fn sync_response_maps_to_batch() {
        let response: SyncResponse = serde_json::from_value(json!({
            "next_batch": "s2",
            "rooms": {
                "join": {
                    "!r:example.org": {
                        "timeline": {
                            "prev_batch": "p1",
                            "events": [{"type": "m.room.message", "event_id": "$1", "content": {"body": "hi"}}]
                        },
                        "state": {"events": [{"type": "m.room.name", "state_key": "", "content": {"name": "Lobby"}}]}
                    }
                },
                "invite": {"!i:example.org": {"invite_state": {"events": []}}},
                "leave": {"!l:example.org": {}}
            },
            "presence": {"events": [{"type": "m.presence", "sender": "@a:example.org", "content": {"presence": "online"}}]}
        }))
        .unwrap();

        let batch = SyncBatch::from(response);
        assert_eq!(batch.next_batch, "s2");
        assert_eq!(batch.joined.len(), 1);
        assert_eq!(batch.joined[0].prev_batch.as_deref(), Some("p1"));
        assert_eq!(batch.joined[0].timeline.len(), 1);
        assert_eq!(batch.joined[0].state.len(), 1);
        assert_eq!(batch.invited[0].room_id.as_str(), "!i:example.org");
        assert_eq!(batch.left[0].as_str(), "!l:example.org");
        assert_eq!(batch.presence.len(), 1);
    }
}
