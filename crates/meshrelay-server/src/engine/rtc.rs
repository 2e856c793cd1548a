//! webrtc-rs backed media engine
//!
//! Each endpoint is one `RTCPeerConnection`; a pipeline is just the set of
//! endpoints that may be linked together. `connect(source, sink)` dedicates an
//! audio and a video track on the sink to the source and feeds them through a
//! [`TrackRouter`] as soon as the source publishes media. Tracks added to or
//! removed from a sink that already negotiated raise `RenegotiationNeeded`, and
//! [`MediaEngine::renegotiate`] produces the follow-up offer.

use super::{
    EndpointEvents, EndpointHandle, EngineError, MediaEngine, PipelineHandle, TrackRouter,
};
use async_trait::async_trait;
use meshrelay_protocol::IceCandidateData;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;
use uuid::Uuid;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as CodecRegistry;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::api::API;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

fn h264_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "video/H264".to_string(),
        clock_rate: 90000,
        channels: 0,
        // Baseline profile, level 3.1; packetization-mode=1 for FU-A
        sdp_fmtp_line: "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f"
            .to_string(),
        rtcp_feedback: vec![],
    }
}

fn opus_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: "audio/opus".to_string(),
        clock_rate: 48000,
        channels: 2,
        sdp_fmtp_line: "minptime=10;useinbandfec=1".to_string(),
        rtcp_feedback: vec![],
    }
}

/// Outbound tracks a sink dedicates to one source
struct SinkTracks {
    audio: Arc<TrackLocalStaticRTP>,
    video: Arc<TrackLocalStaticRTP>,
    senders: Vec<Arc<RTCRtpSender>>,
}

impl SinkTracks {
    fn for_kind(&self, kind: RTPCodecType) -> Option<Arc<TrackLocalStaticRTP>> {
        match kind {
            RTPCodecType::Audio => Some(self.audio.clone()),
            RTPCodecType::Video => Some(self.video.clone()),
            _ => None,
        }
    }
}

struct RtcEndpoint {
    handle: EndpointHandle,
    pipeline: PipelineHandle,
    peer_connection: Arc<RTCPeerConnection>,
    events: EndpointEvents,
    /// Routers for the tracks this endpoint publishes
    routers: RwLock<Vec<Arc<TrackRouter>>>,
    /// Sinks this endpoint's media is relayed to
    sinks: RwLock<HashMap<EndpointHandle, SinkTracks>>,
}

impl RtcEndpoint {
    async fn publish_track(self: Arc<Self>, track: Arc<TrackRemote>) {
        let kind = track.kind();
        let router = Arc::new(TrackRouter::new(track, self.handle.clone()));

        for (sink, tracks) in self.sinks.read().await.iter() {
            if let Some(local) = tracks.for_kind(kind) {
                router.add_sink(sink.clone(), local).await;
            }
        }
        self.routers.write().await.push(router.clone());

        tracing::info!(
            "Endpoint {} published {:?} track {}",
            self.handle,
            kind,
            router.track_id()
        );

        tokio::spawn(async move {
            router.start_forwarding().await;
        });
    }

    async fn stop_routers(&self) {
        for router in self.routers.write().await.drain(..) {
            router.stop().await;
        }
    }

    /// Relay tracks changed; ask for a new offer once the client has answered
    async fn media_changed(&self) {
        if self.peer_connection.remote_description().await.is_some() {
            tracing::debug!("Endpoint {} needs renegotiation", self.handle);
            self.events.renegotiation_needed();
        }
    }
}

pub struct WebRtcEngine {
    /// WebRTC API (shared for all connections)
    api: Arc<API>,
    ice_servers: Vec<RTCIceServer>,
    pipelines: RwLock<HashMap<PipelineHandle, HashSet<EndpointHandle>>>,
    endpoints: RwLock<HashMap<EndpointHandle, Arc<RtcEndpoint>>>,
}

impl WebRtcEngine {
    pub fn new(
        stun_servers: Vec<String>,
        turn_servers: Vec<(String, String, String)>,
    ) -> Result<Self, EngineError> {
        let mut codecs = CodecRegistry::default();

        codecs.register_codec(
            RTCRtpCodecParameters {
                capability: h264_capability(),
                payload_type: 96,
                ..Default::default()
            },
            RTPCodecType::Video,
        )?;

        codecs.register_codec(
            RTCRtpCodecParameters {
                capability: opus_capability(),
                payload_type: 111,
                ..Default::default()
            },
            RTPCodecType::Audio,
        )?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut codecs)?;

        let api = APIBuilder::new()
            .with_media_engine(codecs)
            .with_interceptor_registry(registry)
            .with_setting_engine(SettingEngine::default())
            .build();

        let mut ice_servers = vec![];

        for stun_url in stun_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![stun_url],
                ..Default::default()
            });
        }

        for (url, username, credential) in turn_servers {
            ice_servers.push(RTCIceServer {
                urls: vec![url],
                username,
                credential,
                ..Default::default()
            });
        }

        Ok(Self {
            api: Arc::new(api),
            ice_servers,
            pipelines: RwLock::new(HashMap::new()),
            endpoints: RwLock::new(HashMap::new()),
        })
    }

    async fn endpoint(&self, handle: &EndpointHandle) -> Result<Arc<RtcEndpoint>, EngineError> {
        self.endpoints
            .read()
            .await
            .get(handle)
            .cloned()
            .ok_or_else(|| EngineError::UnknownEndpoint(handle.clone()))
    }

    fn register_handlers(endpoint: &Arc<RtcEndpoint>) {
        let pc = &endpoint.peer_connection;

        let candidate_events = endpoint.events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.ice_candidate(IceCandidateData {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    }),
                    Err(e) => tracing::error!("Failed to serialize ICE candidate: {}", e),
                }
            })
        }));

        let state_events = endpoint.events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state| {
            let events = state_events.clone();
            Box::pin(async move {
                tracing::debug!(
                    "Peer connection for {} is now {}",
                    events.session_id(),
                    state
                );
                if state == RTCPeerConnectionState::Connected {
                    events.connected();
                }
            })
        }));

        let weak: Weak<RtcEndpoint> = Arc::downgrade(endpoint);
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(endpoint) = weak.upgrade() {
                    endpoint.publish_track(track).await;
                }
            })
        }));
    }

    async fn unlink(source: &RtcEndpoint, sink: Option<&RtcEndpoint>, sink_handle: &EndpointHandle) {
        let Some(tracks) = source.sinks.write().await.remove(sink_handle) else {
            return;
        };

        for router in source.routers.read().await.iter() {
            router.remove_sink(sink_handle).await;
        }

        if let Some(sink) = sink {
            for sender in &tracks.senders {
                if let Err(e) = sink.peer_connection.remove_track(sender).await {
                    tracing::debug!("Failed to remove relay track from {}: {}", sink.handle, e);
                }
            }
            sink.media_changed().await;
        }
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    fn name(&self) -> &'static str {
        "webrtc"
    }

    async fn create_pipeline(&self) -> Result<PipelineHandle, EngineError> {
        let pipeline = PipelineHandle::new(format!("pipeline-{}", Uuid::new_v4()));
        self.pipelines
            .write()
            .await
            .insert(pipeline.clone(), HashSet::new());
        tracing::info!("Created pipeline {}", pipeline);
        Ok(pipeline)
    }

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> Result<(), EngineError> {
        let members = self
            .pipelines
            .write()
            .await
            .remove(pipeline)
            .ok_or_else(|| EngineError::UnknownPipeline(pipeline.clone()))?;

        for endpoint in members {
            tracing::warn!(
                "Pipeline {} released with live endpoint {}",
                pipeline,
                endpoint
            );
            if let Err(e) = self.release_endpoint(&endpoint).await {
                tracing::warn!("Failed to release endpoint {}: {}", endpoint, e);
            }
        }

        tracing::info!("Released pipeline {}", pipeline);
        Ok(())
    }

    async fn create_endpoint(
        &self,
        pipeline: &PipelineHandle,
        events: EndpointEvents,
    ) -> Result<EndpointHandle, EngineError> {
        if !self.pipelines.read().await.contains_key(pipeline) {
            return Err(EngineError::UnknownPipeline(pipeline.clone()));
        }

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let peer_connection = Arc::new(self.api.new_peer_connection(config).await?);

        let handle = EndpointHandle::new(format!("endpoint-{}", Uuid::new_v4()));
        let endpoint = Arc::new(RtcEndpoint {
            handle: handle.clone(),
            pipeline: pipeline.clone(),
            peer_connection,
            events,
            routers: RwLock::new(Vec::new()),
            sinks: RwLock::new(HashMap::new()),
        });
        Self::register_handlers(&endpoint);

        // Pipeline may have been released while the peer connection was built
        let registered = match self.pipelines.write().await.get_mut(pipeline) {
            Some(members) => members.insert(handle.clone()),
            None => false,
        };
        if !registered {
            if let Err(e) = endpoint.peer_connection.close().await {
                tracing::warn!("Error closing peer connection: {}", e);
            }
            return Err(EngineError::UnknownPipeline(pipeline.clone()));
        }
        self.endpoints.write().await.insert(handle.clone(), endpoint);

        tracing::info!("Created endpoint {} in pipeline {}", handle, pipeline);
        Ok(handle)
    }

    async fn release_endpoint(&self, handle: &EndpointHandle) -> Result<(), EngineError> {
        let endpoint = self
            .endpoints
            .write()
            .await
            .remove(handle)
            .ok_or_else(|| EngineError::UnknownEndpoint(handle.clone()))?;

        if let Some(members) = self.pipelines.write().await.get_mut(&endpoint.pipeline) {
            members.remove(handle);
        }

        // Relays into and out of this endpoint die with it
        let others: Vec<Arc<RtcEndpoint>> =
            self.endpoints.read().await.values().cloned().collect();
        for other in &others {
            Self::unlink(other, None, handle).await;
        }
        endpoint.sinks.write().await.clear();
        endpoint.stop_routers().await;

        endpoint.peer_connection.close().await?;
        tracing::info!("Released endpoint {}", handle);
        Ok(())
    }

    async fn generate_offer(&self, handle: &EndpointHandle) -> Result<String, EngineError> {
        let endpoint = self.endpoint(handle).await?;
        let pc = &endpoint.peer_connection;

        // Receive the participant's own media
        for kind in [RTPCodecType::Audio, RTPCodecType::Video] {
            pc.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn process_offer(
        &self,
        handle: &EndpointHandle,
        sdp_offer: &str,
    ) -> Result<String, EngineError> {
        let endpoint = self.endpoint(handle).await?;
        let pc = &endpoint.peer_connection;

        let offer = RTCSessionDescription::offer(sdp_offer.to_string())
            .map_err(|e| EngineError::InvalidSdp(e.to_string()))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| EngineError::InvalidSdp(e.to_string()))?;

        let answer = pc.create_answer(None).await?;
        pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn process_answer(
        &self,
        handle: &EndpointHandle,
        sdp_answer: &str,
    ) -> Result<(), EngineError> {
        let endpoint = self.endpoint(handle).await?;

        let answer = RTCSessionDescription::answer(sdp_answer.to_string())
            .map_err(|e| EngineError::InvalidSdp(e.to_string()))?;
        endpoint
            .peer_connection
            .set_remote_description(answer)
            .await
            .map_err(|e| EngineError::InvalidSdp(e.to_string()))
    }

    async fn renegotiate(&self, handle: &EndpointHandle) -> Result<String, EngineError> {
        let endpoint = self.endpoint(handle).await?;
        let pc = &endpoint.peer_connection;

        let offer = pc.create_offer(None).await?;
        pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn gather_ice_candidates(&self, handle: &EndpointHandle) -> Result<(), EngineError> {
        // webrtc-rs starts gathering with set_local_description
        let endpoint = self.endpoint(handle).await?;
        let pc = &endpoint.peer_connection;
        tracing::debug!("ICE gathering for {} is {}", handle, pc.ice_gathering_state());

        // A renegotiation keeps the transport up, so no state change follows
        if pc.connection_state() == RTCPeerConnectionState::Connected {
            endpoint.events.connected();
        }
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        handle: &EndpointHandle,
        candidate: &IceCandidateData,
    ) -> Result<(), EngineError> {
        let endpoint = self.endpoint(handle).await?;
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate.clone(),
            sdp_mid: candidate.sdp_mid.clone(),
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        endpoint
            .peer_connection
            .add_ice_candidate(init)
            .await
            .map_err(|e| EngineError::InvalidCandidate(e.to_string()))
    }

    async fn connect(
        &self,
        source_handle: &EndpointHandle,
        sink_handle: &EndpointHandle,
    ) -> Result<(), EngineError> {
        let source = self.endpoint(source_handle).await?;
        let sink = self.endpoint(sink_handle).await?;

        if source.pipeline != sink.pipeline {
            return Err(EngineError::Call(format!(
                "{} and {} live in different pipelines",
                source_handle, sink_handle
            )));
        }
        if source.sinks.read().await.contains_key(sink_handle) {
            return Ok(());
        }

        // Stream id names the source so clients can tell relayed streams apart
        let stream_id = source_handle.to_string();
        let audio = Arc::new(TrackLocalStaticRTP::new(
            opus_capability(),
            format!("audio-{}", source_handle),
            stream_id.clone(),
        ));
        let video = Arc::new(TrackLocalStaticRTP::new(
            h264_capability(),
            format!("video-{}", source_handle),
            stream_id,
        ));

        let mut senders = Vec::with_capacity(2);
        for track in [audio.clone(), video.clone()] {
            let track: Arc<dyn TrackLocal + Send + Sync> = track;
            senders.push(sink.peer_connection.add_track(track).await?);
        }

        let tracks = SinkTracks {
            audio,
            video,
            senders,
        };
        for router in source.routers.read().await.iter() {
            if let Some(local) = tracks.for_kind(router.kind()) {
                router.add_sink(sink_handle.clone(), local).await;
            }
        }
        source.sinks.write().await.insert(sink_handle.clone(), tracks);
        sink.media_changed().await;

        tracing::info!("Relaying {} -> {}", source_handle, sink_handle);
        Ok(())
    }

    async fn disconnect(
        &self,
        source_handle: &EndpointHandle,
        sink_handle: &EndpointHandle,
    ) -> Result<(), EngineError> {
        let source = self.endpoint(source_handle).await?;
        let sink = self.endpoints.read().await.get(sink_handle).cloned();
        Self::unlink(&source, sink.as_deref(), sink_handle).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineEvent;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: WebRtcEngine,
        pipeline: PipelineHandle,
        events: mpsc::UnboundedReceiver<EngineEvent>,
        tx: mpsc::UnboundedSender<EngineEvent>,
    }

    async fn fixture() -> Fixture {
        let engine = WebRtcEngine::new(vec![], vec![]).unwrap();
        let pipeline = engine.create_pipeline().await.unwrap();
        let (tx, events) = mpsc::unbounded_channel();
        Fixture {
            engine,
            pipeline,
            events,
            tx,
        }
    }

    impl Fixture {
        async fn endpoint(&self, session: &str) -> EndpointHandle {
            self.engine
                .create_endpoint(&self.pipeline, EndpointEvents::new(session.into(), self.tx.clone()))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn offer_carries_registered_codecs() {
        let f = fixture().await;
        let endpoint = f.endpoint("a").await;

        let offer = f.engine.generate_offer(&endpoint).await.unwrap();
        assert!(offer.contains("m=audio"));
        assert!(offer.contains("m=video"));
        assert!(offer.contains("opus/48000"));
        assert!(offer.contains("H264/90000"));
    }

    #[tokio::test]
    async fn endpoint_needs_known_pipeline() {
        let f = fixture().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        let result = f
            .engine
            .create_endpoint(
                &PipelineHandle::new("pipeline-missing"),
                EndpointEvents::new("a".into(), tx),
            )
            .await;
        assert!(matches!(result, Err(EngineError::UnknownPipeline(_))));
    }

    #[tokio::test]
    async fn garbage_sdp_is_rejected() {
        let f = fixture().await;
        let endpoint = f.endpoint("a").await;

        f.engine.generate_offer(&endpoint).await.unwrap();
        assert!(matches!(
            f.engine.process_answer(&endpoint, "garbage").await,
            Err(EngineError::InvalidSdp(_))
        ));
        assert!(matches!(
            f.engine.process_offer(&endpoint, "garbage").await,
            Err(EngineError::InvalidSdp(_))
        ));
    }

    #[tokio::test]
    async fn offer_from_one_endpoint_is_answered_by_another() {
        let f = fixture().await;
        let offerer = f.endpoint("a").await;
        let answerer = f.endpoint("b").await;

        let offer = f.engine.generate_offer(&offerer).await.unwrap();
        let answer = f.engine.process_offer(&answerer, &offer).await.unwrap();
        assert!(answer.contains("m=audio"));
        f.engine.process_answer(&offerer, &answer).await.unwrap();
    }

    #[tokio::test]
    async fn connect_is_idempotent_and_pipeline_scoped() {
        let f = fixture().await;
        let a = f.endpoint("a").await;
        let b = f.endpoint("b").await;

        f.engine.connect(&a, &b).await.unwrap();
        f.engine.connect(&a, &b).await.unwrap();
        let sink = f.engine.endpoint(&b).await.unwrap();
        assert_eq!(sink.peer_connection.get_senders().await.len(), 2);

        let other_pipeline = f.engine.create_pipeline().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let outsider = f
            .engine
            .create_endpoint(&other_pipeline, EndpointEvents::new("c".into(), tx))
            .await
            .unwrap();
        assert!(matches!(
            f.engine.connect(&a, &outsider).await,
            Err(EngineError::Call(_))
        ));
    }

    #[tokio::test]
    async fn link_after_negotiation_asks_sink_to_renegotiate() {
        let mut f = fixture().await;
        let a = f.endpoint("a").await;
        let b = f.endpoint("b").await;
        let client = f.endpoint("client").await;

        // `client` stands in for the browser answering a's offer
        let offer = f.engine.generate_offer(&a).await.unwrap();
        let answer = f.engine.process_offer(&client, &offer).await.unwrap();
        f.engine.process_answer(&a, &answer).await.unwrap();
        while f.events.try_recv().is_ok() {}

        f.engine.connect(&b, &a).await.unwrap();
        let renegotiation = tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                match f.events.recv().await {
                    Some(EngineEvent::RenegotiationNeeded { session_id }) => break session_id,
                    Some(_) => continue,
                    None => panic!("event channel closed"),
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(renegotiation.as_str(), "a");

        let offer = f.engine.renegotiate(&a).await.unwrap();
        assert!(offer.contains("m=video"));
    }

    #[tokio::test]
    async fn release_drops_links_and_pipeline_membership() {
        let f = fixture().await;
        let a = f.endpoint("a").await;
        let b = f.endpoint("b").await;
        f.engine.connect(&a, &b).await.unwrap();
        f.engine.connect(&b, &a).await.unwrap();

        f.engine.release_endpoint(&b).await.unwrap();
        let source = f.engine.endpoint(&a).await.unwrap();
        assert!(source.sinks.read().await.is_empty());
        assert!(matches!(
            f.engine.connect(&a, &b).await,
            Err(EngineError::UnknownEndpoint(_))
        ));

        f.engine.release_pipeline(&f.pipeline).await.unwrap();
        assert!(f.engine.endpoints.read().await.is_empty());
    }
}
