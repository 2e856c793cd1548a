//! In-process loopback engine
//!
//! Produces well-formed but synthetic SDP, reports one host candidate and an
//! immediate connection once gathering starts, asks for renegotiation when a
//! negotiated endpoint gains or loses a relay, and keeps counters of every
//! resource call. Used for local development without a media stack and as the
//! engine behind the test suite, where its fault switches stand in for a
//! misbehaving media server.

use super::{EndpointEvents, EndpointHandle, EngineError, MediaEngine, PipelineHandle};
use async_trait::async_trait;
use meshrelay_protocol::{IceCandidateData, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

/// Snapshot of the resource calls an engine has served
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryEngineStats {
    pub pipelines_created: usize,
    pub pipelines_released: usize,
    pub endpoints_created: usize,
    pub endpoints_released: usize,
    pub connects: usize,
    pub disconnects: usize,
}

struct MemoryEndpoint {
    pipeline: PipelineHandle,
    events: EndpointEvents,
    remote_candidates: usize,
    /// A remote description has been applied
    negotiated: bool,
}

#[derive(Default)]
struct Counters {
    pipelines_created: AtomicUsize,
    pipelines_released: AtomicUsize,
    endpoints_created: AtomicUsize,
    endpoints_released: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

pub struct MemoryEngine {
    next_id: AtomicU64,
    pipelines: RwLock<HashSet<PipelineHandle>>,
    endpoints: RwLock<HashMap<EndpointHandle, MemoryEndpoint>>,
    links: RwLock<HashSet<(EndpointHandle, EndpointHandle)>>,
    counters: Counters,
    fail_pipelines: AtomicBool,
    fail_endpoints: AtomicBool,
    /// Links touching any of these endpoints fail
    broken_endpoints: RwLock<HashSet<EndpointHandle>>,
    /// Endpoint creation for these sessions takes this long
    slow_sessions: RwLock<HashMap<SessionId, Duration>>,
    explicit_unlink: bool,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pipelines: RwLock::new(HashSet::new()),
            endpoints: RwLock::new(HashMap::new()),
            links: RwLock::new(HashSet::new()),
            counters: Counters::default(),
            fail_pipelines: AtomicBool::new(false),
            fail_endpoints: AtomicBool::new(false),
            broken_endpoints: RwLock::new(HashSet::new()),
            slow_sessions: RwLock::new(HashMap::new()),
            explicit_unlink: false,
        }
    }

    /// Variant that asks callers to tear links down before releasing endpoints
    pub fn with_explicit_unlink() -> Self {
        Self {
            explicit_unlink: true,
            ..Self::new()
        }
    }

    pub fn stats(&self) -> MemoryEngineStats {
        let c = &self.counters;
        MemoryEngineStats {
            pipelines_created: c.pipelines_created.load(Ordering::SeqCst),
            pipelines_released: c.pipelines_released.load(Ordering::SeqCst),
            endpoints_created: c.endpoints_created.load(Ordering::SeqCst),
            endpoints_released: c.endpoints_released.load(Ordering::SeqCst),
            connects: c.connects.load(Ordering::SeqCst),
            disconnects: c.disconnects.load(Ordering::SeqCst),
        }
    }

    /// Make every subsequent `create_pipeline` fail
    pub fn fail_pipeline_creation(&self, fail: bool) {
        self.fail_pipelines.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `create_endpoint` fail
    pub fn fail_endpoint_creation(&self, fail: bool) {
        self.fail_endpoints.store(fail, Ordering::SeqCst);
    }

    /// Make every `connect` touching `endpoint` fail
    pub async fn break_links_with(&self, endpoint: &EndpointHandle) {
        self.broken_endpoints.write().await.insert(endpoint.clone());
    }

    /// Delay every `create_endpoint` made on behalf of `session_id`
    pub async fn delay_endpoint_creation(&self, session_id: SessionId, delay: Duration) {
        self.slow_sessions.write().await.insert(session_id, delay);
    }

    pub async fn has_link(&self, source: &EndpointHandle, sink: &EndpointHandle) -> bool {
        self.links
            .read()
            .await
            .contains(&(source.clone(), sink.clone()))
    }

    pub async fn link_count(&self) -> usize {
        self.links.read().await.len()
    }

    pub async fn live_pipelines(&self) -> usize {
        self.pipelines.read().await.len()
    }

    pub async fn live_endpoints(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Number of remote candidates accepted for `endpoint`
    pub async fn remote_candidates(&self, endpoint: &EndpointHandle) -> usize {
        self.endpoints
            .read()
            .await
            .get(endpoint)
            .map(|e| e.remote_candidates)
            .unwrap_or(0)
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    fn session_description(&self, kind: &str) -> String {
        format!(
            "v=0\r\no=- {} 2 IN IP4 127.0.0.1\r\ns=meshrelay-{}\r\nt=0 0\r\na=group:BUNDLE 0 1\r\n\
             m=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\na=rtpmap:111 opus/48000/2\r\n\
             m=video 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:1\r\na=rtpmap:96 H264/90000\r\n",
            self.next_id(),
            kind
        )
    }

    fn check_sdp(sdp: &str) -> Result<(), EngineError> {
        if sdp.trim_start().starts_with("v=0") {
            Ok(())
        } else {
            Err(EngineError::InvalidSdp(
                "session description must start with v=0".to_string(),
            ))
        }
    }

    async fn require_endpoint(&self, endpoint: &EndpointHandle) -> Result<(), EngineError> {
        if self.endpoints.read().await.contains_key(endpoint) {
            Ok(())
        } else {
            Err(EngineError::UnknownEndpoint(endpoint.clone()))
        }
    }

    async fn mark_negotiated(&self, endpoint: &EndpointHandle) -> Result<(), EngineError> {
        let mut endpoints = self.endpoints.write().await;
        let entry = endpoints
            .get_mut(endpoint)
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.clone()))?;
        entry.negotiated = true;
        Ok(())
    }

    /// Ask `sink` for renegotiation if it has negotiated before
    async fn media_changed(&self, sink: &EndpointHandle) {
        if let Some(entry) = self.endpoints.read().await.get(sink) {
            if entry.negotiated {
                entry.events.renegotiation_needed();
            }
        }
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for MemoryEngine {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_pipeline(&self) -> Result<PipelineHandle, EngineError> {
        if self.fail_pipelines.load(Ordering::SeqCst) {
            return Err(EngineError::Unavailable(
                "pipeline creation disabled".to_string(),
            ));
        }

        let pipeline = PipelineHandle::new(format!("pipeline-{}", self.next_id()));
        self.pipelines.write().await.insert(pipeline.clone());
        self.counters.pipelines_created.fetch_add(1, Ordering::SeqCst);
        Ok(pipeline)
    }

    async fn release_pipeline(&self, pipeline: &PipelineHandle) -> Result<(), EngineError> {
        if !self.pipelines.write().await.remove(pipeline) {
            return Err(EngineError::UnknownPipeline(pipeline.clone()));
        }
        self.counters
            .pipelines_released
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn create_endpoint(
        &self,
        pipeline: &PipelineHandle,
        events: EndpointEvents,
    ) -> Result<EndpointHandle, EngineError> {
        if self.fail_endpoints.load(Ordering::SeqCst) {
            return Err(EngineError::Call("endpoint creation disabled".to_string()));
        }
        if !self.pipelines.read().await.contains(pipeline) {
            return Err(EngineError::UnknownPipeline(pipeline.clone()));
        }

        let delay = self
            .slow_sessions
            .read()
            .await
            .get(events.session_id())
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let endpoint = EndpointHandle::new(format!("endpoint-{}", self.next_id()));
        self.endpoints.write().await.insert(
            endpoint.clone(),
            MemoryEndpoint {
                pipeline: pipeline.clone(),
                events,
                remote_candidates: 0,
                negotiated: false,
            },
        );
        self.counters.endpoints_created.fetch_add(1, Ordering::SeqCst);
        Ok(endpoint)
    }

    async fn release_endpoint(&self, endpoint: &EndpointHandle) -> Result<(), EngineError> {
        if self.endpoints.write().await.remove(endpoint).is_none() {
            return Err(EngineError::UnknownEndpoint(endpoint.clone()));
        }
        self.links
            .write()
            .await
            .retain(|(source, sink)| source != endpoint && sink != endpoint);
        self.counters
            .endpoints_released
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn generate_offer(&self, endpoint: &EndpointHandle) -> Result<String, EngineError> {
        self.require_endpoint(endpoint).await?;
        Ok(self.session_description("offer"))
    }

    async fn process_offer(
        &self,
        endpoint: &EndpointHandle,
        sdp_offer: &str,
    ) -> Result<String, EngineError> {
        Self::check_sdp(sdp_offer)?;
        self.mark_negotiated(endpoint).await?;
        Ok(self.session_description("answer"))
    }

    async fn process_answer(
        &self,
        endpoint: &EndpointHandle,
        sdp_answer: &str,
    ) -> Result<(), EngineError> {
        Self::check_sdp(sdp_answer)?;
        self.mark_negotiated(endpoint).await
    }

    async fn renegotiate(&self, endpoint: &EndpointHandle) -> Result<String, EngineError> {
        self.require_endpoint(endpoint).await?;
        Ok(self.session_description("offer"))
    }

    async fn gather_ice_candidates(&self, endpoint: &EndpointHandle) -> Result<(), EngineError> {
        let events = self
            .endpoints
            .read()
            .await
            .get(endpoint)
            .map(|e| e.events.clone())
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.clone()))?;

        let port = 40000 + (self.next_id() % 20000);
        events.ice_candidate(IceCandidateData {
            candidate: format!("candidate:1 1 udp 2122260223 127.0.0.1 {} typ host", port),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        });
        // Loopback: connectivity is immediate
        events.connected();
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &EndpointHandle,
        candidate: &IceCandidateData,
    ) -> Result<(), EngineError> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(EngineError::InvalidCandidate(candidate.candidate.clone()));
        }

        let mut endpoints = self.endpoints.write().await;
        let entry = endpoints
            .get_mut(endpoint)
            .ok_or_else(|| EngineError::UnknownEndpoint(endpoint.clone()))?;
        entry.remote_candidates += 1;
        Ok(())
    }

    async fn connect(
        &self,
        source: &EndpointHandle,
        sink: &EndpointHandle,
    ) -> Result<(), EngineError> {
        {
            let broken = self.broken_endpoints.read().await;
            if broken.contains(source) || broken.contains(sink) {
                return Err(EngineError::Call(format!(
                    "link {} -> {} refused",
                    source, sink
                )));
            }
        }

        {
            let endpoints = self.endpoints.read().await;
            let source_pipeline = &endpoints
                .get(source)
                .ok_or_else(|| EngineError::UnknownEndpoint(source.clone()))?
                .pipeline;
            let sink_pipeline = &endpoints
                .get(sink)
                .ok_or_else(|| EngineError::UnknownEndpoint(sink.clone()))?
                .pipeline;
            if source_pipeline != sink_pipeline {
                return Err(EngineError::Call(format!(
                    "{} and {} live in different pipelines",
                    source, sink
                )));
            }
        }

        let added = self
            .links
            .write()
            .await
            .insert((source.clone(), sink.clone()));
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if added {
            self.media_changed(sink).await;
        }
        Ok(())
    }

    async fn disconnect(
        &self,
        source: &EndpointHandle,
        sink: &EndpointHandle,
    ) -> Result<(), EngineError> {
        let removed = self
            .links
            .write()
            .await
            .remove(&(source.clone(), sink.clone()));
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        if removed {
            self.media_changed(sink).await;
        }
        Ok(())
    }

    fn requires_explicit_unlink(&self) -> bool {
        self.explicit_unlink
    }
}
