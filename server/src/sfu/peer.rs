//! SFU Peer
//!
//! Wraps one `RTCPeerConnection` per room member: remote-description latch,
//! pending ICE buffer, received-track bookkeeping and the debounced
//! renegotiation timer.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::error::SfuError;
use super::room::SfuRoom;

/// Which side of an SDP exchange a description belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    /// Remote offer.
    Offer,
    /// Remote answer.
    Answer,
}

/// Signaling-side state, guarded together so candidate buffering observes a
/// consistent remote-description flag.
#[derive(Default, Debug)]
struct SignalingState {
    /// Flips false→true exactly once, when the first remote description
    /// applies successfully.
    remote_description_set: bool,
    /// Candidates received before the remote description, in arrival order.
    pending_candidates: Vec<RTCIceCandidateInit>,
    /// Track ids this peer has been wired to receive.
    received: HashSet<String>,
}

/// A member's WebRTC connection to the SFU.
#[derive(Debug)]
pub struct SfuPeer {
    id: String,
    connection: Arc<RTCPeerConnection>,
    state: RwLock<SignalingState>,
    /// Single-shot debounce timer; re-arming aborts the pending firing.
    renegotiation_timer: Mutex<Option<JoinHandle<()>>>,
}

impl SfuPeer {
    pub(crate) fn new(id: String, connection: Arc<RTCPeerConnection>) -> Self {
        Self {
            id,
            connection,
            state: RwLock::new(SignalingState::default()),
            renegotiation_timer: Mutex::new(None),
        }
    }

    /// SFU peer id (distinct from the member's user id).
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn connection(&self) -> &Arc<RTCPeerConnection> {
        &self.connection
    }

    /// Apply a remote description. On success the pending ICE candidates are
    /// drained in arrival order; individual candidate failures are logged
    /// without aborting the drain.
    pub async fn set_remote_description(&self, sdp: &str, kind: SdpKind) -> Result<(), SfuError> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
        }
        .map_err(|e| SfuError::BadSdp(e.to_string()))?;

        self.connection
            .set_remote_description(description)
            .await
            .map_err(|e| SfuError::BadSdp(e.to_string()))?;

        let pending = {
            let mut state = self.state.write().await;
            state.remote_description_set = true;
            std::mem::take(&mut state.pending_candidates)
        };

        if !pending.is_empty() {
            debug!(peer = %self.id, count = pending.len(), "Applying buffered ICE candidates");
        }
        for candidate in pending {
            if let Err(e) = self.connection.add_ice_candidate(candidate).await {
                warn!(peer = %self.id, error = %e, "Failed to apply buffered ICE candidate");
            }
        }

        Ok(())
    }

    /// Create an offer and gather ICE to completion, so the returned SDP
    /// carries every candidate.
    pub async fn create_offer(&self) -> Result<String, SfuError> {
        let offer = self.connection.create_offer(None).await?;
        self.gather_complete_sdp(offer).await
    }

    /// Create an answer and gather ICE to completion.
    pub async fn create_answer(&self) -> Result<String, SfuError> {
        let answer = self.connection.create_answer(None).await?;
        self.gather_complete_sdp(answer).await
    }

    async fn gather_complete_sdp(
        &self,
        description: RTCSessionDescription,
    ) -> Result<String, SfuError> {
        let mut gather_complete = self.connection.gathering_complete_promise().await;
        self.connection.set_local_description(description).await?;
        let _ = gather_complete.recv().await;

        let local = self.connection.local_description().await.ok_or_else(|| {
            SfuError::WebRtc("local description missing after ICE gathering".into())
        })?;
        Ok(local.sdp)
    }

    /// Add a remote ICE candidate. Buffered until the remote description is
    /// set, then applied directly.
    pub async fn add_ice_candidate(&self, candidate: RTCIceCandidateInit) -> Result<(), SfuError> {
        {
            let mut state = self.state.write().await;
            if !state.remote_description_set {
                debug!(peer = %self.id, "Buffering ICE candidate until remote description is set");
                state.pending_candidates.push(candidate);
                return Ok(());
            }
        }

        self.connection
            .add_ice_candidate(candidate)
            .await
            .map_err(|e| SfuError::BadCandidate(e.to_string()))
    }

    /// Register a handler for locally gathered candidates (trickle delivery
    /// to the client; the gathered SDP already carries them inline).
    pub fn on_ice_candidate<F>(&self, handler: F)
    where
        F: Fn(RTCIceCandidateInit) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>>
            + Send
            + Sync
            + 'static,
    {
        self.connection
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let Some(candidate) = candidate else {
                    return Box::pin(async {});
                };
                match candidate.to_json() {
                    Ok(init) => handler(init),
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize local ICE candidate");
                        Box::pin(async {})
                    }
                }
            }));
    }

    /// Whether the first remote description has been applied.
    pub async fn remote_description_set(&self) -> bool {
        self.state.read().await.remote_description_set
    }

    /// True while ICE is Connected or Completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        matches!(
            self.connection.ice_connection_state(),
            RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
        )
    }

    /// Record a track id as wired to this peer. Returns false when it was
    /// already present.
    pub(crate) async fn mark_received(&self, track_id: &str) -> bool {
        self.state.write().await.received.insert(track_id.to_string())
    }

    /// Drop a track id from the received set (after `remove_track`).
    pub(crate) async fn forget_received(&self, track_id: &str) {
        self.state.write().await.received.remove(track_id);
    }

    /// Snapshot of the received track ids.
    pub(crate) async fn received_tracks(&self) -> HashSet<String> {
        self.state.read().await.received.clone()
    }

    /// (Re)arm the renegotiation debounce timer: the previous pending firing
    /// is aborted, so back-to-back track attachments coalesce into one offer.
    pub(crate) async fn schedule_renegotiation(
        self: &Arc<Self>,
        room: &Arc<SfuRoom>,
        delay: Duration,
    ) {
        let mut timer = self.renegotiation_timer.lock().await;
        if let Some(pending) = timer.take() {
            pending.abort();
        }

        let peer = Arc::downgrade(self);
        let room = Arc::downgrade(room);
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let (Some(peer), Some(room)) = (peer.upgrade(), room.upgrade()) else {
                return;
            };
            room.create_and_send_offer(&peer).await;
        }));
    }

    /// Close the underlying connection and cancel any pending renegotiation.
    pub async fn close(&self) -> Result<(), SfuError> {
        if let Some(pending) = self.renegotiation_timer.lock().await.take() {
            pending.abort();
        }
        self.connection.close().await?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn pending_candidates(&self) -> Vec<RTCIceCandidateInit> {
        self.state.read().await.pending_candidates.clone()
    }
}
