//! SFU Room
//!
//! Per-room media plane: the peer table, the forwarded-track table, RTP
//! copy loops and the renegotiation protocol. Lock ordering is
//! room tables → peer; the copy loop never runs under the room lock.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice::udp_network::{EphemeralUDP, UDPNetwork};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use super::error::SfuError;
use super::peer::{SdpKind, SfuPeer};
use crate::config::Config;
use crate::signal::{IceCandidate, SessionDescription, SignalKind, SignalMessage};

/// MTU-sized buffer for RTP reads and RTCP drains.
const RTP_BUFFER_SIZE: usize = 1500;

/// Debounce window coalescing back-to-back track attachments (audio and
/// video from one publisher typically arrive within tens of milliseconds).
const RENEGOTIATION_DEBOUNCE: Duration = Duration::from_millis(300);

/// Grace period after ICE connects, letting the remote description settle
/// before the catch-up renegotiation check.
const ICE_CONNECTED_SETTLE: Duration = Duration::from_millis(500);

/// Callback delivering a renegotiation offer to the signaling plane,
/// identified by sfu-peer-id.
pub type RenegotiationHandler = Box<
    dyn Fn(String, String) -> Pin<Box<dyn Future<Output = ()> + Send + 'static>> + Send + Sync,
>;

/// One forwarded inbound track.
struct TrackForward {
    /// Local track receiving the RTP copies; attached to every receiver.
    local_track: Arc<TrackLocalStaticRTP>,
    /// Originating sfu-peer-id, excluded from the fan-out.
    origin: String,
    /// Stops the copy loop.
    stop: CancellationToken,
    /// Receiver sfu-peer-id → sender handle returned by `add_track`.
    senders: HashMap<String, Arc<RTCRtpSender>>,
}

/// Peer table and forward table, guarded together: fan-out and signaling
/// both walk the two in lockstep.
#[derive(Default)]
struct Tables {
    peers: HashMap<String, Arc<SfuPeer>>,
    forwards: HashMap<String, TrackForward>,
}

/// Media plane for one room.
pub struct SfuRoom {
    id: String,
    api: API,
    tables: RwLock<Tables>,
    /// Write-once: the first caller wins, guarding against double wiring
    /// when successive members join the same room.
    renegotiation: OnceLock<RenegotiationHandler>,
}

impl SfuRoom {
    /// Build the media plane: default codecs, default interceptors, the
    /// configured UDP ephemeral port range and optional NAT 1:1 mapping.
    pub fn new(id: String, config: &Config) -> Result<Arc<Self>, SfuError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| SfuError::WebRtc(e.to_string()))?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| SfuError::WebRtc(e.to_string()))?;

        let mut setting_engine = SettingEngine::default();
        if config.udp_port_min > 0 && config.udp_port_max > 0 {
            let ephemeral = EphemeralUDP::new(config.udp_port_min, config.udp_port_max)
                .map_err(|e| SfuError::WebRtc(format!("invalid UDP port range: {e}")))?;
            setting_engine.set_udp_network(UDPNetwork::Ephemeral(ephemeral));
            debug!(
                min = config.udp_port_min,
                max = config.udp_port_max,
                "SFU UDP port range configured"
            );
        }
        if !config.public_ip.is_empty() {
            setting_engine
                .set_nat_1to1_ips(vec![config.public_ip.clone()], RTCIceCandidateType::Host);
            debug!(ip = %config.public_ip, "NAT 1:1 host candidate IP configured");
        }

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build();

        info!(room = %id, "SFU room created");

        Ok(Arc::new(Self {
            id,
            api,
            tables: RwLock::default(),
            renegotiation: OnceLock::new(),
        }))
    }

    /// Room id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Create a peer connection for a new member and install its inbound
    /// track and ICE-state callbacks.
    pub async fn add_peer(self: &Arc<Self>, peer_id: &str) -> Result<Arc<SfuPeer>, SfuError> {
        let mut tables = self.tables.write().await;
        if tables.peers.contains_key(peer_id) {
            return Err(SfuError::AlreadyExists(peer_id.to_string()));
        }

        let connection = Arc::new(
            self.api
                .new_peer_connection(RTCConfiguration::default())
                .await
                .map_err(|e| SfuError::WebRtc(e.to_string()))?,
        );
        let peer = Arc::new(SfuPeer::new(peer_id.to_string(), connection.clone()));

        let room = Arc::downgrade(self);
        let origin = peer_id.to_string();
        connection.on_track(Box::new(move |track, _receiver, _transceiver| {
            let room = room.clone();
            let origin = origin.clone();
            Box::pin(async move {
                let Some(room) = room.upgrade() else { return };
                info!(
                    peer = %origin,
                    track = %track.id(),
                    stream = %track.stream_id(),
                    kind = ?track.kind(),
                    "Inbound track received"
                );
                room.broadcast_track(track, &origin).await;
            })
        }));

        let room = Arc::downgrade(self);
        let watched = peer_id.to_string();
        connection.on_ice_connection_state_change(Box::new(move |state| {
            let room = room.clone();
            let peer_id = watched.clone();
            Box::pin(async move {
                debug!(peer = %peer_id, state = ?state, "ICE connection state changed");
                if matches!(
                    state,
                    RTCIceConnectionState::Connected | RTCIceConnectionState::Completed
                ) {
                    tokio::spawn(async move {
                        tokio::time::sleep(ICE_CONNECTED_SETTLE).await;
                        if let Some(room) = room.upgrade() {
                            room.offer_missing_forwards(&peer_id).await;
                        }
                    });
                }
            })
        }));

        tables.peers.insert(peer_id.to_string(), peer.clone());
        Ok(peer)
    }

    /// Close and remove a peer. Idempotent; forwards originated by the peer
    /// are reaped by their copy loops ending.
    pub async fn remove_peer(&self, peer_id: &str) {
        let peer = self.tables.write().await.peers.remove(peer_id);
        if let Some(peer) = peer {
            if let Err(e) = peer.close().await {
                warn!(peer = %peer_id, error = %e, "Error closing peer connection");
            }
            info!(peer = %peer_id, "Peer removed");
        }
    }

    /// Look up a peer by sfu-peer-id.
    pub async fn get_peer(&self, peer_id: &str) -> Option<Arc<SfuPeer>> {
        self.tables.read().await.peers.get(peer_id).cloned()
    }

    /// Number of registered peers.
    pub async fn peer_count(&self) -> usize {
        self.tables.read().await.peers.len()
    }

    /// Fan an inbound track out to every other peer and start its copy
    /// loop. Idempotent per track id: duplicate inbound-track callbacks for
    /// the same track leave exactly one forward.
    pub(crate) async fn broadcast_track(self: &Arc<Self>, remote_track: Arc<TrackRemote>, origin: &str) {
        let track_id = remote_track.id();

        let mut tables = self.tables.write().await;
        if tables.forwards.contains_key(&track_id) {
            debug!(track = %track_id, "Forward already exists, skipping");
            return;
        }

        // Same codec, track id and stream id as the source, so the client
        // keeps its stream grouping.
        let local_track = Arc::new(TrackLocalStaticRTP::new(
            remote_track.codec().capability.clone(),
            remote_track.id(),
            remote_track.stream_id(),
        ));

        let receivers: Vec<Arc<SfuPeer>> = tables
            .peers
            .values()
            .filter(|peer| peer.id() != origin)
            .cloned()
            .collect();

        let mut senders = HashMap::new();
        for receiver in receivers {
            match self
                .attach_track_to_peer(&receiver, &local_track, &track_id)
                .await
            {
                Ok(Some(sender)) => {
                    senders.insert(receiver.id().to_string(), sender);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        peer = %receiver.id(),
                        track = %track_id,
                        error = %e,
                        "Failed to attach forwarded track"
                    );
                }
            }
        }

        let stop = CancellationToken::new();
        tables.forwards.insert(
            track_id.clone(),
            TrackForward {
                local_track: local_track.clone(),
                origin: origin.to_string(),
                stop: stop.clone(),
                senders,
            },
        );
        drop(tables);

        info!(track = %track_id, origin = %origin, "Starting RTP forward");

        let room = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTP_BUFFER_SIZE];
            loop {
                tokio::select! {
                    () = stop.cancelled() => {
                        debug!(track = %track_id, "RTP forward stopped");
                        break;
                    }
                    read = remote_track.read(&mut buf) => match read {
                        Ok((packet, _attributes)) => {
                            // A slow receiver must not stall the fan-out.
                            if let Err(e) = local_track.write_rtp(&packet).await {
                                warn!(track = %track_id, error = %e, "RTP write failed");
                            }
                        }
                        Err(e) => {
                            debug!(track = %track_id, error = %e, "Remote track ended");
                            break;
                        }
                    }
                }
            }

            if let Some(room) = room.upgrade() {
                room.cleanup_track(&track_id).await;
            }
        });
    }

    /// Attach a forwarded track to one receiver: `add_track`, record the
    /// track id, drain the sender's RTCP so the interceptor buffers keep
    /// flowing, and arm the debounced renegotiation.
    async fn attach_track_to_peer(
        self: &Arc<Self>,
        peer: &Arc<SfuPeer>,
        local_track: &Arc<TrackLocalStaticRTP>,
        track_id: &str,
    ) -> Result<Option<Arc<RTCRtpSender>>, SfuError> {
        if !peer.mark_received(track_id).await {
            return Ok(None);
        }

        let sender = match peer
            .connection()
            .add_track(local_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            Ok(sender) => sender,
            Err(e) => {
                peer.forget_received(track_id).await;
                return Err(SfuError::AddTrackFailed(e.to_string()));
            }
        };

        debug!(peer = %peer.id(), track = %track_id, "Track attached");

        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; RTP_BUFFER_SIZE];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        peer.schedule_renegotiation(self, RENEGOTIATION_DEBOUNCE)
            .await;

        Ok(Some(sender))
    }

    /// Tear down a forward: remove it from the table, stop the copy loop,
    /// and detach the track from every receiver. No renegotiation is issued
    /// here; the next client-initiated exchange carries the shrunken SDP.
    pub(crate) async fn cleanup_track(&self, track_id: &str) {
        let mut tables = self.tables.write().await;
        let Some(forward) = tables.forwards.remove(track_id) else {
            return;
        };
        forward.stop.cancel();

        for (peer_id, sender) in &forward.senders {
            if let Some(peer) = tables.peers.get(peer_id) {
                if let Err(e) = peer.connection().remove_track(sender).await {
                    warn!(peer = %peer_id, track = %track_id, error = %e, "Failed to remove forwarded track");
                } else {
                    debug!(peer = %peer_id, track = %track_id, "Forwarded track removed");
                }
                peer.forget_received(track_id).await;
            }
        }

        info!(track = %track_id, "Forward cleaned up");
    }

    /// Dispatch an offer/answer/candidate from the signaling plane. An
    /// inbound offer answers with a gathered SDP; the other types return no
    /// response.
    pub async fn handle_signal(
        self: &Arc<Self>,
        peer_id: &str,
        message: &SignalMessage,
    ) -> Result<Option<SignalMessage>, SfuError> {
        let peer = self
            .get_peer(peer_id)
            .await
            .ok_or_else(|| SfuError::PeerNotFound(peer_id.to_string()))?;

        match message.kind {
            SignalKind::Offer => {
                let description: SessionDescription = message.parse_data()?;
                peer.set_remote_description(&description.sdp, SdpKind::Offer)
                    .await?;

                // Deliver every existing forward to this receiver before
                // answering, so a late joiner's very first exchange covers
                // the room's current tracks.
                self.attach_missing_forwards(&peer).await;

                let answer = peer.create_answer().await?;
                Ok(Some(SignalMessage::answer(answer)))
            }
            SignalKind::Answer => {
                let description: SessionDescription = message.parse_data()?;
                peer.set_remote_description(&description.sdp, SdpKind::Answer)
                    .await?;
                Ok(None)
            }
            SignalKind::Candidate => {
                let candidate: IceCandidate = message.parse_data()?;
                peer.add_ice_candidate(candidate.into()).await?;
                Ok(None)
            }
            other => Err(SfuError::UnknownMessageType(format!("{other:?}"))),
        }
    }

    /// Attach every forward this peer does not yet receive, recording the
    /// new senders in the forward table.
    async fn attach_missing_forwards(self: &Arc<Self>, peer: &Arc<SfuPeer>) {
        let mut tables = self.tables.write().await;
        let candidates: Vec<(String, Arc<TrackLocalStaticRTP>)> = tables
            .forwards
            .iter()
            .filter(|(_, forward)| forward.origin != peer.id())
            .map(|(track_id, forward)| (track_id.clone(), forward.local_track.clone()))
            .collect();

        for (track_id, local_track) in candidates {
            match self.attach_track_to_peer(peer, &local_track, &track_id).await {
                Ok(Some(sender)) => {
                    if let Some(forward) = tables.forwards.get_mut(&track_id) {
                        forward.senders.insert(peer.id().to_string(), sender);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        peer = %peer.id(),
                        track = %track_id,
                        error = %e,
                        "Failed to attach existing forward"
                    );
                }
            }
        }
    }

    /// Renegotiation check run after ICE connects: when forwards exist that
    /// this peer has not been wired to, send it a fresh offer.
    async fn offer_missing_forwards(self: &Arc<Self>, peer_id: &str) {
        let Some(peer) = self.get_peer(peer_id).await else {
            return;
        };
        if !peer.remote_description_set().await {
            return;
        }

        let missing = {
            let tables = self.tables.read().await;
            let received = peer.received_tracks().await;
            tables
                .forwards
                .iter()
                .any(|(track_id, forward)| forward.origin != peer_id && !received.contains(track_id))
        };

        if missing {
            info!(peer = %peer_id, "ICE connected with unattached forwards, renegotiating");
            self.create_and_send_offer(&peer).await;
        }
    }

    /// Create and deliver a renegotiation offer for one peer. Aborts
    /// silently unless the remote description is set, signaling is Stable
    /// (avoids glare with an in-flight exchange) and ICE is connected.
    pub(crate) async fn create_and_send_offer(&self, peer: &Arc<SfuPeer>) {
        if !peer.remote_description_set().await {
            return;
        }

        let signaling = peer.connection().signaling_state();
        if signaling != RTCSignalingState::Stable {
            debug!(peer = %peer.id(), state = ?signaling, "Skipping renegotiation, signaling not stable");
            return;
        }
        if !peer.is_connected() {
            debug!(
                peer = %peer.id(),
                state = ?peer.connection().ice_connection_state(),
                "Skipping renegotiation, ICE not connected"
            );
            return;
        }

        let offer = match peer.create_offer().await {
            Ok(sdp) => sdp,
            Err(e) => {
                warn!(peer = %peer.id(), error = %e, "Failed to create renegotiation offer");
                return;
            }
        };

        info!(peer = %peer.id(), "Sending renegotiation offer");
        if let Some(handler) = self.renegotiation.get() {
            handler(peer.id().to_string(), offer).await;
        }
    }

    /// Install the renegotiation delivery callback. Write-once: the first
    /// caller wins and later calls are ignored.
    pub fn set_renegotiation_callback(&self, handler: RenegotiationHandler) {
        if self.renegotiation.set(handler).is_err() {
            debug!(room = %self.id, "Renegotiation callback already installed");
        }
    }

    /// Close every peer connection and empty the peer table.
    pub async fn close(&self) {
        let peers: Vec<Arc<SfuPeer>> = {
            let mut tables = self.tables.write().await;
            tables.peers.drain().map(|(_, peer)| peer).collect()
        };
        for peer in peers {
            if let Err(e) = peer.close().await {
                warn!(peer = %peer.id(), error = %e, "Error closing peer connection");
            }
        }
        info!(room = %self.id, "SFU room closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use webrtc::api::media_engine::MIME_TYPE_OPUS;
    use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;

    fn test_room() -> Arc<SfuRoom> {
        SfuRoom::new("test-room".into(), &Config::default()).unwrap()
    }

    fn opus_track(track_id: &str) -> Arc<TrackLocalStaticRTP> {
        Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48_000,
                channels: 2,
                ..Default::default()
            },
            track_id.to_string(),
            "test-stream".to_string(),
        ))
    }

    fn candidate_message(candidate: &str) -> SignalMessage {
        SignalMessage::candidate(IceCandidate {
            candidate: candidate.into(),
            sdp_mline_index: None,
            sdp_mid: None,
        })
    }

    #[tokio::test]
    async fn add_peer_rejects_duplicate_ids() {
        let room = test_room();
        room.add_peer("p1").await.unwrap();

        let err = room.add_peer("p1").await.unwrap_err();
        assert!(matches!(err, SfuError::AlreadyExists(id) if id == "p1"));
    }

    #[tokio::test]
    async fn add_then_remove_peer_restores_empty_table() {
        let room = test_room();
        room.add_peer("p1").await.unwrap();
        assert_eq!(room.peer_count().await, 1);

        room.remove_peer("p1").await;
        assert_eq!(room.peer_count().await, 0);
        assert!(room.get_peer("p1").await.is_none());

        // Removing again is a no-op.
        room.remove_peer("p1").await;
        assert_eq!(room.peer_count().await, 0);
    }

    #[tokio::test]
    async fn candidates_buffer_in_arrival_order_before_remote_description() {
        let room = test_room();
        let peer = room.add_peer("p1").await.unwrap();

        room.handle_signal("p1", &candidate_message("candidate:1"))
            .await
            .unwrap();
        room.handle_signal("p1", &candidate_message("candidate:2"))
            .await
            .unwrap();

        assert!(!peer.remote_description_set().await);
        let pending = peer.pending_candidates().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].candidate, "candidate:1");
        assert_eq!(pending[1].candidate, "candidate:2");
    }

    #[tokio::test]
    async fn handle_signal_requires_known_peer() {
        let room = test_room();
        let err = room
            .handle_signal("ghost", &candidate_message("candidate:1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SfuError::PeerNotFound(id) if id == "ghost"));
    }

    #[tokio::test]
    async fn handle_signal_rejects_non_media_types() {
        let room = test_room();
        room.add_peer("p1").await.unwrap();

        let chat = SignalMessage {
            data: Some(serde_json::json!({ "content": "hi" })),
            ..SignalMessage::join("u1", "Alice")
        };
        let err = room.handle_signal("p1", &chat).await.unwrap_err();
        assert!(matches!(err, SfuError::UnknownMessageType(_)));
    }

    #[tokio::test]
    async fn attach_is_idempotent_per_track() {
        let room = test_room();
        let peer = room.add_peer("p1").await.unwrap();
        let track = opus_track("t1");

        let first = room
            .attach_track_to_peer(&peer, &track, "t1")
            .await
            .unwrap();
        assert!(first.is_some());

        let second = room
            .attach_track_to_peer(&peer, &track, "t1")
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn renegotiation_callback_is_write_once() {
        let room = test_room();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<&'static str>();

        let first_tx = tx.clone();
        room.set_renegotiation_callback(Box::new(move |_, _| {
            let tx = first_tx.clone();
            Box::pin(async move {
                let _ = tx.send("first");
            })
        }));
        room.set_renegotiation_callback(Box::new(move |_, _| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send("second");
            })
        }));

        let handler = room.renegotiation.get().unwrap();
        handler("p1".into(), "sdp".into()).await;
        assert_eq!(rx.recv().await, Some("first"));
    }

    #[tokio::test]
    async fn no_offer_is_sent_before_remote_description() {
        let room = test_room();
        let peer = room.add_peer("p1").await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
        room.set_renegotiation_callback(Box::new(move |peer_id, _| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(peer_id);
            })
        }));

        // Guards must drop the offer: no remote description, ICE new.
        room.create_and_send_offer(&peer).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_empties_the_peer_table() {
        let room = test_room();
        room.add_peer("p1").await.unwrap();
        room.add_peer("p2").await.unwrap();

        room.close().await;
        assert_eq!(room.peer_count().await, 0);
    }
}
