//! Room bookkeeping
//!
//! One map from room id to an `Arc<Room>` record; each record guards its
//! member set and pipeline handle with its own lock, so unrelated rooms never
//! wait on each other. Lock order is always room record first, then the
//! shared maps.

use crate::engine::{MediaEngine, PipelineHandle};
use crate::error::{CallError, Result};
use meshrelay_protocol::{RoomId, SessionId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub room_id: RoomId,
    pub pipeline: PipelineHandle,
    /// Other members at the instant this session was inserted
    pub existing_members: Vec<SessionId>,
    /// The session was already a member; nothing changed
    pub rejoined: bool,
}

#[derive(Default)]
struct RoomState {
    pipeline: Option<PipelineHandle>,
    members: HashSet<SessionId>,
    /// Set once the room emptied; a joiner holding a stale record retries
    closed: bool,
}

struct Room {
    room_id: RoomId,
    state: Mutex<RoomState>,
}

pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    rooms: RwLock<HashMap<RoomId, Arc<Room>>>,
    session_rooms: RwLock<HashMap<SessionId, RoomId>>,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            rooms: RwLock::new(HashMap::new()),
            session_rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Add `session_id` to `room_id`, creating the room and its pipeline on
    /// first join. The returned snapshot never contains `session_id`.
    pub async fn join_room(&self, session_id: &SessionId, room_id: &RoomId) -> Result<JoinedRoom> {
        if let Some(current) = self.session_rooms.read().await.get(session_id) {
            if current != room_id {
                return Err(CallError::AlreadyInRoom {
                    session_id: session_id.clone(),
                    room_id: current.clone(),
                });
            }
        }

        loop {
            let room = self
                .rooms
                .write()
                .await
                .entry(room_id.clone())
                .or_insert_with(|| {
                    Arc::new(Room {
                        room_id: room_id.clone(),
                        state: Mutex::new(RoomState::default()),
                    })
                })
                .clone();

            let mut state = room.state.lock().await;
            if state.closed {
                continue;
            }

            let pipeline = match state.pipeline.clone() {
                Some(pipeline) => pipeline,
                None => match self.engine.create_pipeline().await {
                    Ok(pipeline) => {
                        tracing::info!("Created pipeline {} for room {}", pipeline, room_id);
                        state.pipeline = Some(pipeline.clone());
                        pipeline
                    }
                    Err(e) => {
                        tracing::error!("Failed to create pipeline for room {}: {}", room_id, e);
                        if state.members.is_empty() {
                            state.closed = true;
                            self.forget_room(&room).await;
                        }
                        return Err(CallError::EngineUnavailable(e));
                    }
                },
            };

            let rejoined = state.members.contains(session_id);
            let existing_members: Vec<SessionId> = state
                .members
                .iter()
                .filter(|member| *member != session_id)
                .cloned()
                .collect();
            state.members.insert(session_id.clone());
            self.session_rooms
                .write()
                .await
                .insert(session_id.clone(), room_id.clone());

            tracing::info!(
                "Session {} joined room {} ({} members)",
                session_id,
                room_id,
                state.members.len()
            );

            return Ok(JoinedRoom {
                room_id: room_id.clone(),
                pipeline,
                existing_members,
                rejoined,
            });
        }
    }

    /// Remove `session_id` from its room. Releases the pipeline when the room
    /// empties. Returns `None` when the session was in no room.
    pub async fn leave_room(&self, session_id: &SessionId) -> Option<RoomId> {
        let room_id = self.session_rooms.read().await.get(session_id).cloned()?;
        let Some(room) = self.rooms.read().await.get(&room_id).cloned() else {
            self.session_rooms.write().await.remove(session_id);
            return None;
        };

        let released = {
            let mut state = room.state.lock().await;
            if !state.members.remove(session_id) {
                return None;
            }
            self.session_rooms.write().await.remove(session_id);

            if state.members.is_empty() {
                state.closed = true;
                self.forget_room(&room).await;
                state.pipeline.take()
            } else {
                None
            }
        };

        tracing::info!("Session {} left room {}", session_id, room_id);

        if let Some(pipeline) = released {
            match self.engine.release_pipeline(&pipeline).await {
                Ok(()) => tracing::info!("Room {} is empty, released pipeline {}", room_id, pipeline),
                Err(e) => tracing::error!(
                    "Failed to release pipeline {} of room {}: {}",
                    pipeline,
                    room_id,
                    e
                ),
            }
        }

        Some(room_id)
    }

    pub async fn room_of(&self, session_id: &SessionId) -> Option<RoomId> {
        self.session_rooms.read().await.get(session_id).cloned()
    }

    pub async fn members(&self, room_id: &RoomId) -> Result<Vec<SessionId>> {
        let room = self
            .rooms
            .read()
            .await
            .get(room_id)
            .cloned()
            .ok_or_else(|| CallError::RoomNotFound(room_id.clone()))?;

        let state = room.state.lock().await;
        Ok(state.members.iter().cloned().collect())
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Drop every room and release every pipeline
    pub async fn shutdown(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.rooms.write().await.drain().map(|(_, r)| r).collect();
        self.session_rooms.write().await.clear();

        let mut released = 0;
        for room in rooms {
            let pipeline = {
                let mut state = room.state.lock().await;
                state.closed = true;
                state.members.clear();
                state.pipeline.take()
            };
            if let Some(pipeline) = pipeline {
                match self.engine.release_pipeline(&pipeline).await {
                    Ok(()) => released += 1,
                    Err(e) => tracing::warn!(
                        "Failed to release pipeline {} of room {}: {}",
                        pipeline,
                        room.room_id,
                        e
                    ),
                }
            }
        }
        released
    }

    async fn forget_room(&self, room: &Arc<Room>) {
        let mut rooms = self.rooms.write().await;
        if rooms
            .get(&room.room_id)
            .is_some_and(|current| Arc::ptr_eq(current, room))
        {
            rooms.remove(&room.room_id);
        }
    }
}
