//! HTTP client for the segmentation service
//!
//! Session, point and tracklet operations go through the service's GraphQL
//! endpoint. Mask propagation is a long-lived `POST /propagate_in_video`
//! whose multipart body yields one [`MaskBatch`] per frame.

use std::pin::Pin;

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::mask::{Mask, MaskBatch, ObjectId, RleMask, Tracklet};

use super::multipart::{boundary_from_content_type, MultipartError, MultipartParser};

const DEFAULT_BOUNDARY: &str = "frame";

#[derive(Debug, Error)]
pub enum MaskStreamError {
    #[error("mask service request failed")]
    Request(#[from] reqwest::Error),
    #[error("mask service returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("mask service reported: {0}")]
    Graphql(String),
    #[error("mask service response has no '{0}'")]
    MissingField(&'static str),
    #[error("malformed mask payload")]
    Payload(#[from] serde_json::Error),
    #[error("malformed mask stream")]
    Multipart(#[from] MultipartError),
    #[error("mask stream was aborted")]
    Aborted,
    #[error("mask stream task failed: {0}")]
    Task(String),
}

/// Mask batches in arrival order
pub type MaskStream = Pin<Box<dyn Stream<Item = Result<MaskBatch, MaskStreamError>> + Send>>;

/// Server-side session plus locally allocated tracklet ids
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MaskSession {
    pub id: String,
    next_object_id: u32,
}

impl MaskSession {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            next_object_id: 0,
        }
    }

    /// Tracklets exist on the service once points are added to them.
    pub fn create_tracklet(&mut self) -> Tracklet {
        let tracklet = Tracklet::new(ObjectId(self.next_object_id));
        self.next_object_id += 1;
        tracklet
    }
}

/// Clicks on one object in one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PointsUpdate {
    pub frame_index: usize,
    pub object_id: ObjectId,
    /// Normalized `[x, y]`
    pub points: Vec<[f32; 2]>,
    /// 1 = include, 0 = exclude
    pub labels: Vec<i32>,
    pub clear_old_points: bool,
}

#[derive(Debug, Serialize)]
struct PropagateRequest<'a> {
    session_id: &'a str,
    start_frame_index: usize,
    quick_test_mode: bool,
}

#[derive(Debug, Deserialize)]
struct GraphqlResponse {
    data: Option<Value>,
    #[serde(default)]
    errors: Vec<GraphqlError>,
}

#[derive(Debug, Deserialize)]
struct GraphqlError {
    message: String,
}

/// Masks as the GraphQL schema names them
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RleMaskListOnFrame {
    frame_index: usize,
    rle_mask_list: Vec<RleMaskForObject>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RleMaskForObject {
    object_id: ObjectId,
    rle_mask: RleMask,
}

impl From<RleMaskListOnFrame> for MaskBatch {
    fn from(frame: RleMaskListOnFrame) -> Self {
        MaskBatch {
            frame_index: frame.frame_index,
            masks: frame
                .rle_mask_list
                .into_iter()
                .map(|entry| Mask {
                    object_id: entry.object_id,
                    rle: entry.rle_mask,
                    bbox: None,
                })
                .collect(),
        }
    }
}

const RLE_MASK_FIELDS: &str = "frameIndex rleMaskList { objectId rleMask { size counts } }";

#[derive(Debug, Clone)]
pub struct MaskServiceClient {
    http: reqwest::Client,
    base_url: String,
}

impl MaskServiceClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Readiness probe; any transport failure counts as not ready.
    pub async fn healthy(&self) -> bool {
        match self.http.get(self.url("healthy")).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(error = %e, "mask service not reachable");
                false
            }
        }
    }

    async fn graphql<T: DeserializeOwned>(
        &self,
        query: &str,
        variables: Value,
        field: &'static str,
    ) -> Result<T, MaskStreamError> {
        let response = self
            .http
            .post(self.url("graphql"))
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        let response = check_status(response).await?;
        let body: GraphqlResponse = response.json().await?;
        extract_field(body, field)
    }

    pub async fn start_session(&self, source_path: &str) -> Result<MaskSession, MaskStreamError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Started {
            session_id: String,
        }

        let started: Started = self
            .graphql(
                "mutation StartSession($input: StartSessionInput!) { startSession(input: $input) { sessionId } }",
                json!({ "input": { "path": source_path } }),
                "startSession",
            )
            .await?;
        info!(session = %started.session_id, source = source_path, "mask session started");
        Ok(MaskSession::new(started.session_id))
    }

    pub async fn close_session(&self, session: &MaskSession) -> Result<bool, MaskStreamError> {
        let closed: Success = self
            .graphql(
                "mutation CloseSession($input: CloseSessionInput!) { closeSession(input: $input) { success } }",
                json!({ "input": { "sessionId": session.id } }),
                "closeSession",
            )
            .await?;
        info!(session = %session.id, success = closed.success, "mask session closed");
        Ok(closed.success)
    }

    /// Add clicks to a tracklet; returns the masks of that frame.
    pub async fn update_points(
        &self,
        session: &MaskSession,
        update: &PointsUpdate,
    ) -> Result<MaskBatch, MaskStreamError> {
        let mut input = serde_json::to_value(update)?;
        input["sessionId"] = json!(session.id);
        let frame: RleMaskListOnFrame = self
            .graphql(
                &format!("mutation AddPoints($input: AddPointsInput!) {{ addPoints(input: $input) {{ {RLE_MASK_FIELDS} }} }}"),
                json!({ "input": input }),
                "addPoints",
            )
            .await?;
        Ok(frame.into())
    }

    /// Drop a tracklet's clicks in one frame.
    pub async fn clear_points(
        &self,
        session: &MaskSession,
        frame_index: usize,
        object_id: ObjectId,
    ) -> Result<MaskBatch, MaskStreamError> {
        let frame: RleMaskListOnFrame = self
            .graphql(
                &format!(
                    "mutation ClearPointsInFrame($input: ClearPointsInFrameInput!) {{ clearPointsInFrame(input: $input) {{ {RLE_MASK_FIELDS} }} }}"
                ),
                json!({ "input": { "sessionId": session.id, "frameIndex": frame_index, "objectId": object_id } }),
                "clearPointsInFrame",
            )
            .await?;
        Ok(frame.into())
    }

    /// Drop every click of every tracklet.
    pub async fn clear_all_points(&self, session: &MaskSession) -> Result<bool, MaskStreamError> {
        let cleared: Success = self
            .graphql(
                "mutation ClearPointsInVideo($input: ClearPointsInVideoInput!) { clearPointsInVideo(input: $input) { success } }",
                json!({ "input": { "sessionId": session.id } }),
                "clearPointsInVideo",
            )
            .await?;
        Ok(cleared.success)
    }

    /// Remove a tracklet; returns the updated masks of every frame it was in.
    pub async fn delete_tracklet(
        &self,
        session: &MaskSession,
        object_id: ObjectId,
    ) -> Result<Vec<MaskBatch>, MaskStreamError> {
        let frames: Vec<RleMaskListOnFrame> = self
            .graphql(
                &format!(
                    "mutation RemoveObject($input: RemoveObjectInput!) {{ removeObject(input: $input) {{ {RLE_MASK_FIELDS} }} }}"
                ),
                json!({ "input": { "sessionId": session.id, "objectId": object_id } }),
                "removeObject",
            )
            .await?;
        info!(session = %session.id, object = %object_id, frames = frames.len(), "tracklet removed");
        Ok(frames.into_iter().map(MaskBatch::from).collect())
    }

    /// Ask the service to stop a running propagation.
    pub async fn cancel_propagation(&self, session: &MaskSession) -> Result<bool, MaskStreamError> {
        let cancelled: Success = self
            .graphql(
                "mutation CancelPropagateInVideo($input: CancelPropagateInVideoInput!) { cancelPropagateInVideo(input: $input) { success } }",
                json!({ "input": { "sessionId": session.id } }),
                "cancelPropagateInVideo",
            )
            .await?;
        Ok(cancelled.success)
    }

    /// Propagate every tracklet from `start_frame_index`. `fast_mode`
    /// trades mask quality for speed on the service side.
    pub async fn stream_masks(
        &self,
        session: &MaskSession,
        start_frame_index: usize,
        fast_mode: bool,
    ) -> Result<MaskStream, MaskStreamError> {
        let response = self
            .http
            .post(self.url("propagate_in_video"))
            .json(&PropagateRequest {
                session_id: &session.id,
                start_frame_index,
                quick_test_mode: fast_mode,
            })
            .send()
            .await?;
        let response = check_status(response).await?;

        let boundary = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .and_then(boundary_from_content_type)
            .unwrap_or_else(|| DEFAULT_BOUNDARY.to_string());
        info!(session = %session.id, start_frame_index, fast_mode, %boundary, "mask propagation started");

        Ok(parse_mask_stream(response.bytes_stream(), &boundary))
    }
}

#[derive(Deserialize)]
struct Success {
    success: bool,
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, MaskStreamError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(status = status.as_u16(), "mask service request rejected");
    Err(MaskStreamError::Status {
        status: status.as_u16(),
        body,
    })
}

fn extract_field<T: DeserializeOwned>(body: GraphqlResponse, field: &'static str) -> Result<T, MaskStreamError> {
    if !body.errors.is_empty() {
        let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
        return Err(MaskStreamError::Graphql(messages.join("; ")));
    }
    let value = body
        .data
        .and_then(|mut data| data.get_mut(field).map(Value::take))
        .filter(|value| !value.is_null())
        .ok_or(MaskStreamError::MissingField(field))?;
    Ok(serde_json::from_value(value)?)
}

struct StreamState<S> {
    chunks: Pin<Box<S>>,
    parser: MultipartParser,
    done: bool,
}

/// Turn raw multipart chunks into mask batches. A part whose JSON does not
/// parse yields an `Err` item and the stream continues; a transport or
/// framing error ends it.
pub fn parse_mask_stream<S, E>(chunks: S, boundary: &str) -> MaskStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<MaskStreamError>,
{
    let state = StreamState {
        chunks: Box::pin(chunks),
        parser: MultipartParser::new(boundary),
        done: false,
    };

    Box::pin(stream::unfold(state, |mut state| async move {
        loop {
            match state.parser.next_part() {
                Ok(Some(part)) => {
                    let batch = serde_json::from_slice::<MaskBatch>(&part.body).map_err(MaskStreamError::from);
                    return Some((batch, state));
                }
                Ok(None) => {}
                Err(e) => {
                    state.done = true;
                    state.parser.finish();
                    return Some((Err(e.into()), state));
                }
            }
            if state.done || state.parser.is_closed() {
                return None;
            }
            match state.chunks.next().await {
                Some(Ok(bytes)) => state.parser.push(&bytes),
                Some(Err(e)) => {
                    state.done = true;
                    return Some((Err(e.into()), state));
                }
                None => {
                    state.done = true;
                    state.parser.finish();
                }
            }
        }
    }))
}
