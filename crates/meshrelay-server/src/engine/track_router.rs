//! Track Router for RTP forwarding
//!
//! Routes RTP packets from one endpoint's inbound track to the outbound tracks
//! other endpoints have dedicated to it. Packets are forwarded untouched so the
//! payload packetization survives the hop.

use super::EndpointHandle;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocalWriter;
use webrtc::track::track_remote::TrackRemote;

/// Gives up on a source that never delivers a first packet
const MAX_FIRST_PACKET_TIMEOUTS: u32 = 30;

/// Routes RTP packets from a source track to every linked sink
pub struct TrackRouter {
    source_track: Arc<TrackRemote>,
    /// Endpoint that published the track
    source: EndpointHandle,
    track_id: String,
    /// Outbound track per sink endpoint
    sink_tracks: RwLock<HashMap<EndpointHandle, Arc<TrackLocalStaticRTP>>>,
    active: Arc<RwLock<bool>>,
}

impl TrackRouter {
    pub fn new(source_track: Arc<TrackRemote>, source: EndpointHandle) -> Self {
        let track_id = source_track.id().to_string();
        Self {
            source_track,
            source,
            track_id,
            sink_tracks: RwLock::new(HashMap::new()),
            active: Arc::new(RwLock::new(true)),
        }
    }

    pub fn track_id(&self) -> &str {
        &self.track_id
    }

    pub fn kind(&self) -> RTPCodecType {
        self.source_track.kind()
    }

    /// Start the forwarding loop; returns when the source closes or the router
    /// is stopped
    pub async fn start_forwarding(self: Arc<Self>) {
        tracing::info!(
            "Starting RTP forwarding for track {} from endpoint {}",
            self.track_id,
            self.source
        );

        let mut timeouts = 0u32;
        let mut packet_count = 0u64;

        loop {
            if !*self.active.read().await {
                tracing::info!("Track router {} stopped", self.track_id);
                break;
            }

            let read_result = tokio::time::timeout(
                tokio::time::Duration::from_secs(2),
                self.source_track.read_rtp(),
            )
            .await;

            match read_result {
                Err(_) => {
                    if packet_count > 0 {
                        continue;
                    }
                    timeouts += 1;
                    if timeouts > MAX_FIRST_PACKET_TIMEOUTS {
                        tracing::error!(
                            "Track {} never received packets after {} timeouts",
                            self.track_id,
                            timeouts
                        );
                        break;
                    }
                }
                Ok(Ok((rtp_packet, _attributes))) => {
                    packet_count += 1;
                    if packet_count == 1 {
                        tracing::info!(
                            "Track {} ready - received first RTP packet ({} bytes)",
                            self.track_id,
                            rtp_packet.payload.len()
                        );
                    }
                    self.forward_packet(&rtp_packet).await;
                }
                Ok(Err(e)) => {
                    let error_msg = e.to_string();
                    if error_msg.contains("closed") || error_msg.contains("EOF") {
                        tracing::info!("Source track closed for {}", self.track_id);
                        break;
                    }

                    // RTPReceiver not attached yet
                    if error_msg.contains("RTPReceiver must not be nil") {
                        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                        continue;
                    }

                    if packet_count % 100 <= 1 {
                        tracing::warn!("Error reading RTP from track {}: {}", self.track_id, e);
                    }
                    tokio::time::sleep(tokio::time::Duration::from_millis(10)).await;
                }
            }
        }

        *self.active.write().await = false;
    }

    async fn forward_packet(&self, rtp_packet: &webrtc::rtp::packet::Packet) {
        let sinks = self.sink_tracks.read().await;
        for (sink, local_track) in sinks.iter() {
            if let Err(e) = local_track.write_rtp(rtp_packet).await {
                tracing::debug!("Failed to forward RTP to endpoint {}: {}", sink, e);
            }
        }
    }

    /// Start forwarding into `track`, which belongs to `sink`
    pub async fn add_sink(&self, sink: EndpointHandle, track: Arc<TrackLocalStaticRTP>) {
        self.sink_tracks.write().await.insert(sink.clone(), track);
        tracing::debug!("Track {} now forwards to endpoint {}", self.track_id, sink);
    }

    pub async fn remove_sink(&self, sink: &EndpointHandle) -> bool {
        self.sink_tracks.write().await.remove(sink).is_some()
    }

    pub async fn stop(&self) {
        *self.active.write().await = false;
        tracing::debug!("Track router {} marked for stop", self.track_id);
    }
}
