//! Lobby Handlers
//!
//! `LobbyHandler` is the [`PacketHandler`] the server installs. It owns the
//! stage and semaphore registries and turns each [`ClientPacket`] into
//! registry/stage/semaphore operations plus acks and broadcasts.
//!
//! Every packet that carries an ack handle gets exactly one ack.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::lobby::object::Position;
use crate::lobby::registry::{SemaphoreRegistry, StageMap};
use crate::lobby::semaphore::{Semaphore, SemaphoreError};
use crate::lobby::stage::{BinaryKey, Stage, StageError, StageSummary};
use crate::network::packet::PacketWriter;
use crate::network::protocol::{self, CastTarget, ClientFilter, ClientPacket};
use crate::network::session::{PacketHandler, Session};

/// How a transfer resolves the target stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransferMode {
    /// Create the stage if it is unknown.
    Enter,
    /// The stage must already exist.
    Move,
}

/// Shared lobby state and opcode handling.
#[derive(Debug)]
pub struct LobbyHandler {
    stages: StageMap,
    semaphores: SemaphoreRegistry,
    default_max_players: u16,
}

impl LobbyHandler {
    /// Create empty registries using the capacities from `config`.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            stages: StageMap::new(),
            semaphores: SemaphoreRegistry::new(
                config.raid_semaphore_prefix.clone(),
                config.raid_semaphore_capacity,
            ),
            default_max_players: config.default_stage_max_players,
        }
    }

    /// Stage registry.
    pub fn stages(&self) -> &StageMap {
        &self.stages
    }

    /// Semaphore registry.
    pub fn semaphores(&self) -> &SemaphoreRegistry {
        &self.semaphores
    }

    // =========================================================================
    // STAGE TRANSFER
    // =========================================================================

    /// Leave the current stage, telling the others and remembering it for
    /// back-stage. Returns the stage that was left.
    fn leave_current_stage(&self, session: &Arc<Session>) -> Option<Arc<Stage>> {
        let stage = session.replace_stage(None)?;
        if let Some(departure) = stage.leave(session.id()) {
            stage.broadcast_message(&protocol::delete_user(departure.char_id), None);
            for object_id in &departure.removed_objects {
                debug!(stage = %stage.id(), object_id, "Removed departed client's object");
            }
            if let Some(host) = departure.new_host {
                debug!(stage = %stage.id(), host = %host, "Stage host handed off");
            }
        }
        session.set_previous_stage_id(Some(stage.id().to_string()));
        Some(stage)
    }

    /// Move `session` into `stage_id`. The flag is false when the session was
    /// already there and nothing changed.
    ///
    /// The session leaves its old stage before joining the new one, so it is
    /// never listed in two stages. Admission is prechecked first so an
    /// obviously refused transfer keeps the session where it is.
    fn transfer(
        &self,
        session: &Arc<Session>,
        stage_id: &str,
        mode: TransferMode,
    ) -> Result<(Arc<Stage>, bool), StageError> {
        let char_id = session.char_id();
        let mut left_stage = false;

        let joined = loop {
            let stage = match mode {
                TransferMode::Enter => {
                    self.stages
                        .get_or_create(stage_id, || Stage::new(stage_id, self.default_max_players))
                        .0
                }
                TransferMode::Move => match self.stages.get(stage_id) {
                    Some(stage) => stage,
                    None => break Err(StageError::NotFound),
                },
            };

            if session.stage().is_some_and(|current| Arc::ptr_eq(&current, &stage)) {
                return Ok((stage, false));
            }
            if let Err(e) = stage.check_admission(char_id) {
                break Err(e);
            }

            left_stage |= self.leave_current_stage(session).is_some();
            if let Err(e) = stage.try_join(session, char_id) {
                break Err(e);
            }

            // A sweep may have unlinked the stage between lookup and join.
            if self.stages.is_current(stage_id, &stage) {
                break Ok(stage);
            }
            stage.leave(session.id());
        };

        if let Ok(stage) = &joined {
            stage.claim_host(session.id());
            session.replace_stage(Some(Arc::clone(stage)));
        }
        if left_stage {
            self.stages.destruct_empty_stages();
        }
        joined.map(|stage| (stage, true))
    }

    async fn handle_transfer(&self, session: &Arc<Session>, ack_handle: u32, stage_id: &str, mode: TransferMode) {
        match self.transfer(session, stage_id, mode) {
            Ok((stage, false)) => {
                debug!(session = %session.id(), stage = %stage.id(), "Already in stage");
                session.ack_simple_succeed(ack_handle).await;
            }
            Ok((stage, true)) => {
                info!(
                    session = %session.id(),
                    char_id = session.char_id(),
                    stage = %stage.id(),
                    clients = stage.client_count(),
                    "Entered stage"
                );
                session.ack_simple_succeed(ack_handle).await;
                for object in stage.objects() {
                    if object.owner() == session.id() {
                        continue;
                    }
                    session
                        .queue_send(protocol::duplicate_object(
                            object.id(),
                            object.owner_char_id(),
                            object.position(),
                        ))
                        .await;
                }
                let name = session.name();
                stage.broadcast(
                    |_| protocol::insert_user(session.char_id(), &name),
                    Some(session.id()),
                );
            }
            Err(e) => {
                debug!(
                    session = %session.id(),
                    char_id = session.char_id(),
                    stage = %stage_id,
                    "Stage transfer refused: {}", e
                );
                session.ack_simple_fail(ack_handle).await;
            }
        }
    }

    async fn handle_create_stage(&self, session: &Arc<Session>, ack_handle: u32, max_players: u8, stage_id: &str) {
        let max_players = match max_players {
            0 => self.default_max_players,
            n => n as u16,
        };
        match self
            .stages
            .store_if_absent(stage_id, Stage::created_by(stage_id, max_players, session.id()))
        {
            Ok(_) => {
                debug!(session = %session.id(), stage = %stage_id, max_players, "Created stage");
                session.ack_simple_succeed(ack_handle).await;
            }
            Err(_) => {
                debug!(session = %session.id(), stage = %stage_id, "Stage already exists");
                session.ack_simple_fail(ack_handle).await;
            }
        }
    }

    async fn handle_back_stage(&self, session: &Arc<Session>, ack_handle: u32) {
        match session.previous_stage_id() {
            Some(stage_id) => {
                self.handle_transfer(session, ack_handle, &stage_id, TransferMode::Move)
                    .await
            }
            None => session.ack_simple_fail(ack_handle).await,
        }
    }

    // =========================================================================
    // RESERVATIONS, HOST CONTROLS, ECHO CACHE
    // =========================================================================

    fn reserve(&self, session: &Arc<Session>, ready: bool, stage_id: &str, password: &str) -> Result<(), StageError> {
        let stage = self.stages.get(stage_id).ok_or(StageError::NotFound)?;
        let char_id = session.char_id();
        stage.try_reserve(char_id, ready, password)?;
        if let Some(previous) = session.replace_reservation(Some(Arc::clone(&stage))) {
            if !Arc::ptr_eq(&previous, &stage) {
                previous.unreserve(char_id);
            }
        }
        Ok(())
    }

    fn unreserve(&self, session: &Arc<Session>) {
        if let Some(stage) = session.replace_reservation(None) {
            stage.unreserve(session.char_id());
        }
    }

    /// Current stage, if the session is its host.
    fn hosted_stage(&self, session: &Arc<Session>) -> Result<Arc<Stage>, StageError> {
        let stage = session.stage().ok_or(StageError::NotInStage)?;
        if !stage.is_host(session.id()) {
            return Err(StageError::NotHost);
        }
        Ok(stage)
    }

    async fn handle_get_stage_binary(&self, session: &Arc<Session>, ack_handle: u32, key: BinaryKey, stage_id: &str) {
        match self.stages.get(stage_id) {
            Some(stage) => {
                let data = stage.get_raw_binary(key).unwrap_or_default();
                session.ack_buf_succeed(ack_handle, &data).await;
            }
            None => session.ack_buf_fail(ack_handle, &[]).await,
        }
    }

    async fn handle_enumerate_stage(&self, session: &Arc<Session>, ack_handle: u32, prefix: &str) {
        let mut summaries: Vec<StageSummary> = Vec::new();
        self.stages.range(|id, stage| {
            if id.starts_with(prefix) {
                summaries.push(stage.summary());
            }
            true
        });
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        session
            .ack_buf_succeed(ack_handle, &encode_stage_list(&summaries))
            .await;
    }

    async fn handle_enumerate_client(&self, session: &Arc<Session>, ack_handle: u32, filter: ClientFilter, stage_id: &str) {
        match self.stages.get(stage_id) {
            Some(stage) => {
                let ids = stage.enumerate(filter);
                let payload = ids
                    .iter()
                    .fold(PacketWriter::payload().u16(ids.len() as u16), |w, id| w.u32(*id))
                    .finish();
                session.ack_buf_succeed(ack_handle, &payload).await;
            }
            None => session.ack_buf_fail(ack_handle, &[]).await,
        }
    }

    // =========================================================================
    // OBJECTS
    // =========================================================================

    async fn handle_create_object(&self, session: &Arc<Session>, ack_handle: u32, position: Position) {
        let Some(stage) = session.stage() else {
            session.ack_buf_fail(ack_handle, &[0; 4]).await;
            return;
        };
        let object = stage.spawn_object(session.id(), session.char_id(), position);
        session
            .ack_buf_succeed(ack_handle, &object.id().to_be_bytes())
            .await;
        stage.broadcast(
            |_| protocol::duplicate_object(object.id(), object.owner_char_id(), position),
            Some(session.id()),
        );
    }

    fn position_object(&self, session: &Arc<Session>, object_id: u32, position: Position) {
        let Some(stage) = session.stage() else { return };
        match stage.object(object_id) {
            Some(object) if object.owner() == session.id() => {
                object.set_position(position);
                stage.broadcast_message(&protocol::position_object(object_id, position), Some(session.id()));
            }
            Some(_) => warn!(
                session = %session.id(),
                char_id = session.char_id(),
                object_id,
                "Refused to move an object owned by another client"
            ),
            None => debug!(session = %session.id(), object_id, "Position for unknown object"),
        }
    }

    // =========================================================================
    // SEMAPHORES
    // =========================================================================

    /// Give up `semaphore`, handing host to the longest-held member if needed.
    fn leave_semaphore(&self, session: &Arc<Session>, semaphore: &Arc<Semaphore>) {
        let release = semaphore.release(session.id());
        if release.was_host && release.remaining > 0 {
            if let Some(next) = semaphore.first_member() {
                semaphore.set_host(next);
                debug!(semaphore = %semaphore.name(), host = %next, "Semaphore host handed off");
            }
        }
        if session
            .semaphore()
            .is_some_and(|held| Arc::ptr_eq(&held, semaphore))
        {
            session.replace_semaphore(None);
        }
        if release.remaining == 0 {
            self.semaphores.destruct_empty_semaphores();
        }
    }

    /// Ack an acquire. A success replaces the held semaphore and only then
    /// releases the old one; a failure leaves the session as it was.
    async fn finish_acquire(
        &self,
        session: &Arc<Session>,
        ack_handle: u32,
        name: &str,
        result: Result<Arc<Semaphore>, SemaphoreError>,
    ) {
        match result {
            Ok(semaphore) => {
                debug!(
                    session = %session.id(),
                    char_id = session.char_id(),
                    semaphore = %name,
                    clients = semaphore.client_count(),
                    "Acquired semaphore"
                );
                session
                    .ack_buf_succeed(ack_handle, &semaphore.id().to_be_bytes())
                    .await;
                if let Some(previous) = session.replace_semaphore(Some(Arc::clone(&semaphore))) {
                    if !Arc::ptr_eq(&previous, &semaphore) {
                        self.leave_semaphore(session, &previous);
                    }
                }
            }
            Err(e) => {
                debug!(
                    session = %session.id(),
                    char_id = session.char_id(),
                    semaphore = %name,
                    "Semaphore acquire failed: {}", e
                );
                session.ack_buf_fail(ack_handle, &[0; 4]).await;
            }
        }
    }

    fn release_semaphore(&self, session: &Arc<Session>, name: &str) {
        match self.semaphores.get(name) {
            Some(semaphore) if semaphore.contains(session.id()) => self.leave_semaphore(session, &semaphore),
            _ => debug!(session = %session.id(), semaphore = %name, "Release of unheld semaphore"),
        }
    }

    // =========================================================================
    // RELAY
    // =========================================================================

    fn cast_binary(&self, session: &Arc<Session>, target: CastTarget, message_type: u8, data: &[u8]) {
        let message = protocol::casted_binary(session.char_id(), message_type, data);
        let delivered = match target {
            CastTarget::Stage => session
                .stage()
                .map(|stage| stage.broadcast_message(&message, Some(session.id()))),
            CastTarget::Semaphore => session
                .semaphore()
                .map(|semaphore| semaphore.broadcast(|_| message.clone(), Some(session.id()))),
        };
        if delivered.is_none() {
            debug!(session = %session.id(), ?target, "Cast with no target");
        }
    }

    // =========================================================================
    // DEPARTURE
    // =========================================================================

    /// Remove the session from its stage, reservation and semaphore, drop
    /// its holds on stages it created, then sweep whatever became empty.
    pub fn depart(&self, session: &Arc<Session>) {
        self.leave_current_stage(session);
        self.stages.range(|_, stage| {
            stage.release_hold(session.id());
            true
        });
        self.unreserve(session);
        if let Some(semaphore) = session.replace_semaphore(None) {
            self.leave_semaphore(session, &semaphore);
        }
        self.stages.destruct_empty_stages();
        self.semaphores.destruct_empty_semaphores();
    }
}

/// `[count u16]` then per stage `[id][clients u16][reserved u16][max u16][flags u8]`.
fn encode_stage_list(summaries: &[StageSummary]) -> Vec<u8> {
    summaries
        .iter()
        .fold(PacketWriter::payload().u16(summaries.len() as u16), |w, s| {
            let flags = (s.locked as u8) | ((s.has_password as u8) << 1);
            w.string(&s.id)
                .u16(s.client_count as u16)
                .u16(s.reserved_count as u16)
                .u16(s.max_players)
                .u8(flags)
        })
        .finish()
}

impl PacketHandler for LobbyHandler {
    async fn handle(&self, session: &Arc<Session>, packet: ClientPacket) {
        match packet {
            ClientPacket::End | ClientPacket::Nop => {}
            ClientPacket::Ping { ack_handle } => session.ack_simple_succeed(ack_handle).await,
            ClientPacket::Login {
                ack_handle,
                char_id,
                name,
            } => {
                session.set_char_id(char_id);
                info!(session = %session.id(), char_id, name = %name, "Client logged in");
                session.set_name(name);
                session.ack_simple_succeed(ack_handle).await;
            }
            ClientPacket::Logout { log_key } => {
                debug!(session = %session.id(), log_key, "Logout requested");
                session.close();
            }
            ClientPacket::CreateStage {
                ack_handle,
                max_players,
                stage_id,
            } => {
                self.handle_create_stage(session, ack_handle, max_players, &stage_id)
                    .await
            }
            ClientPacket::EnterStage { ack_handle, stage_id } => {
                self.handle_transfer(session, ack_handle, &stage_id, TransferMode::Enter)
                    .await
            }
            ClientPacket::MoveStage { ack_handle, stage_id } => {
                self.handle_transfer(session, ack_handle, &stage_id, TransferMode::Move)
                    .await
            }
            ClientPacket::BackStage { ack_handle } => self.handle_back_stage(session, ack_handle).await,
            ClientPacket::ReserveStage {
                ack_handle,
                ready,
                stage_id,
                password,
            } => match self.reserve(session, ready, &stage_id, &password) {
                Ok(()) => session.ack_simple_succeed(ack_handle).await,
                Err(e) => {
                    debug!(session = %session.id(), stage = %stage_id, "Reservation refused: {}", e);
                    session.ack_simple_fail(ack_handle).await;
                }
            },
            ClientPacket::UnreserveStage => self.unreserve(session),
            ClientPacket::SetStagePass { password } => match self.hosted_stage(session) {
                Ok(stage) => stage.set_password(password),
                Err(e) => warn!(session = %session.id(), "Set stage password refused: {}", e),
            },
            ClientPacket::LockStage { ack_handle, locked } => match self.hosted_stage(session) {
                Ok(stage) => {
                    stage.set_locked(locked);
                    session.ack_simple_succeed(ack_handle).await;
                }
                Err(e) => {
                    debug!(session = %session.id(), "Lock stage refused: {}", e);
                    session.ack_simple_fail(ack_handle).await;
                }
            },
            ClientPacket::SetStageBinary {
                binary_type0,
                binary_type1,
                stage_id,
                data,
            } => match self.stages.get(&stage_id) {
                Some(stage) => stage.set_raw_binary(
                    BinaryKey {
                        id0: binary_type0,
                        id1: binary_type1,
                    },
                    data,
                ),
                None => debug!(session = %session.id(), stage = %stage_id, "Binary for unknown stage"),
            },
            ClientPacket::GetStageBinary {
                ack_handle,
                binary_type0,
                binary_type1,
                stage_id,
            } => {
                let key = BinaryKey {
                    id0: binary_type0,
                    id1: binary_type1,
                };
                self.handle_get_stage_binary(session, ack_handle, key, &stage_id)
                    .await
            }
            ClientPacket::EnumerateStage { ack_handle, prefix } => {
                self.handle_enumerate_stage(session, ack_handle, &prefix).await
            }
            ClientPacket::EnumerateClient {
                ack_handle,
                filter,
                stage_id,
            } => {
                self.handle_enumerate_client(session, ack_handle, filter, &stage_id)
                    .await
            }
            ClientPacket::CreateObject { ack_handle, position } => {
                self.handle_create_object(session, ack_handle, position).await
            }
            ClientPacket::PositionObject { object_id, position } => {
                self.position_object(session, object_id, position)
            }
            ClientPacket::CreateAcquireSemaphore {
                ack_handle,
                max_players,
                name,
            } => {
                let result = self
                    .semaphores
                    .acquire_or_create(session, &name, max_players as u16)
                    .map(|(semaphore, _)| semaphore);
                self.finish_acquire(session, ack_handle, &name, result).await;
            }
            ClientPacket::AcquireSemaphore { ack_handle, name } => {
                let result = self.semaphores.acquire(session, &name);
                self.finish_acquire(session, ack_handle, &name, result).await;
            }
            ClientPacket::ReleaseSemaphore { name } => self.release_semaphore(session, &name),
            ClientPacket::CheckSemaphore { ack_handle, name } => {
                if self.semaphores.get(&name).is_some() {
                    session.ack_simple_succeed(ack_handle).await;
                } else {
                    session.ack_simple_fail(ack_handle).await;
                }
            }
            ClientPacket::CastBinary {
                target,
                message_type,
                data,
            } => self.cast_binary(session, target, message_type, &data),
        }
    }

    async fn on_disconnect(&self, session: &Arc<Session>) {
        self.depart(session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::packet::{Opcode, PacketReader, ACK_FAILURE, ACK_SUCCESS};
    use crate::network::session::{OutboundQueue, SessionId};

    struct Ack {
        handle: u32,
        error: u8,
        data: Vec<u8>,
    }

    fn lobby() -> LobbyHandler {
        LobbyHandler::new(&ServerConfig::default())
    }

    fn drain(queue: &mut OutboundQueue) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| queue.try_recv()).collect()
    }

    fn opcode_of(message: &[u8]) -> Opcode {
        Opcode(u16::from_be_bytes([message[0], message[1]]))
    }

    fn parse_ack(message: &[u8]) -> Ack {
        let mut r = PacketReader::new(message);
        assert_eq!(Opcode(r.read_u16().unwrap()), Opcode::SYS_ACK);
        let handle = r.read_u32().unwrap();
        let _is_buffer = r.read_u8().unwrap();
        let error = r.read_u8().unwrap();
        let data = r.read_blob().unwrap();
        Ack { handle, error, data }
    }

    fn single_ack(queue: &mut OutboundQueue) -> Ack {
        let messages = drain(queue);
        let acks: Vec<_> = messages
            .iter()
            .filter(|m| opcode_of(m) == Opcode::SYS_ACK)
            .collect();
        assert_eq!(acks.len(), 1, "expected exactly one ack");
        parse_ack(acks[0])
    }

    async fn login(lobby: &LobbyHandler, id: u64, char_id: u32) -> (Arc<Session>, OutboundQueue) {
        let (session, mut queue) = Session::new(SessionId(id), &ServerConfig::default());
        lobby
            .handle(
                &session,
                ClientPacket::Login {
                    ack_handle: 1,
                    char_id,
                    name: format!("hunter{}", char_id),
                },
            )
            .await;
        drain(&mut queue);
        (session, queue)
    }

    async fn enter(lobby: &LobbyHandler, session: &Arc<Session>, stage_id: &str) {
        lobby
            .handle(
                session,
                ClientPacket::EnterStage {
                    ack_handle: 7,
                    stage_id: stage_id.to_string(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn test_semaphore_capacity_failure_ack() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;

        lobby
            .handle(
                &a,
                ClientPacket::CreateAcquireSemaphore {
                    ack_handle: 10,
                    max_players: 1,
                    name: "quest_1".into(),
                },
            )
            .await;
        let ack = single_ack(&mut qa);
        assert_eq!((ack.handle, ack.error), (10, ACK_SUCCESS));

        lobby
            .handle(
                &b,
                ClientPacket::AcquireSemaphore {
                    ack_handle: 11,
                    name: "quest_1".into(),
                },
            )
            .await;
        let ack = single_ack(&mut qb);
        assert_eq!((ack.handle, ack.error), (11, ACK_FAILURE));

        let semaphore = lobby.semaphores().get("quest_1").unwrap();
        assert_eq!(semaphore.client_count(), 1);
        assert!(b.semaphore().is_none());
    }

    #[tokio::test]
    async fn test_raid_prefix_overrides_capacity() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        lobby
            .handle(
                &a,
                ClientPacket::CreateAcquireSemaphore {
                    ack_handle: 3,
                    max_players: 32,
                    name: "raid_dragon".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qa).error, ACK_SUCCESS);
        assert_eq!(lobby.semaphores().get("raid_dragon").unwrap().max_players(), 127);
    }

    async fn create_acquire(lobby: &LobbyHandler, session: &Arc<Session>, name: &str, max_players: u8) {
        lobby
            .handle(
                session,
                ClientPacket::CreateAcquireSemaphore {
                    ack_handle: 20,
                    max_players,
                    name: name.to_string(),
                },
            )
            .await;
    }

    #[tokio::test]
    async fn test_zero_capacity_semaphore_keeps_creator_within_bounds() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;

        create_acquire(&lobby, &a, "q", 0).await;
        assert_eq!(single_ack(&mut qa).error, ACK_SUCCESS);
        let semaphore = lobby.semaphores().get("q").unwrap();
        assert!(semaphore.client_count() <= semaphore.max_players() as usize);

        create_acquire(&lobby, &b, "q", 0).await;
        assert_eq!(single_ack(&mut qb).error, ACK_FAILURE);
        assert_eq!(semaphore.client_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_acquire_keeps_held_semaphore() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;

        create_acquire(&lobby, &b, "mine", 4).await;
        create_acquire(&lobby, &a, "full", 1).await;
        drain(&mut qa);
        drain(&mut qb);

        lobby
            .handle(
                &b,
                ClientPacket::AcquireSemaphore {
                    ack_handle: 21,
                    name: "full".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qb).error, ACK_FAILURE);
        create_acquire(&lobby, &b, "full", 1).await;
        assert_eq!(single_ack(&mut qb).error, ACK_FAILURE);

        let mine = lobby.semaphores().get("mine").unwrap();
        assert!(mine.contains(b.id()));
        assert_eq!(b.semaphore().unwrap().name(), "mine");
    }

    #[tokio::test]
    async fn test_successful_acquire_releases_previous_semaphore() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;

        create_acquire(&lobby, &a, "old", 4).await;
        create_acquire(&lobby, &b, "old", 4).await;
        drain(&mut qa);
        create_acquire(&lobby, &a, "new", 4).await;
        assert_eq!(single_ack(&mut qa).error, ACK_SUCCESS);
        drain(&mut qb);

        assert_eq!(a.semaphore().unwrap().name(), "new");
        let old = lobby.semaphores().get("old").unwrap();
        assert!(!old.contains(a.id()));
        assert_eq!(old.host(), Some(b.id()));

        // Re-acquiring the held semaphore keeps it.
        create_acquire(&lobby, &a, "new", 4).await;
        assert_eq!(single_ack(&mut qa).error, ACK_SUCCESS);
        assert!(lobby.semaphores().get("new").unwrap().contains(a.id()));
        assert_eq!(a.semaphore().unwrap().name(), "new");
    }

    #[tokio::test]
    async fn test_objects_from_distant_session_ids_do_not_collide() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 65537, 200).await;
        enter(&lobby, &a, "town").await;
        enter(&lobby, &b, "town").await;
        drain(&mut qa);
        drain(&mut qb);

        let create = ClientPacket::CreateObject {
            ack_handle: 8,
            position: Position::default(),
        };
        lobby.handle(&a, create.clone()).await;
        let id_a = u32::from_be_bytes(single_ack(&mut qa).data[..4].try_into().unwrap());
        lobby.handle(&b, create).await;
        let id_b = u32::from_be_bytes(single_ack(&mut qb).data[..4].try_into().unwrap());

        assert_ne!(id_a, id_b);
        let stage = lobby.stages().get("town").unwrap();
        assert_eq!(stage.object_count(), 2);
        assert_eq!(stage.object(id_a).unwrap().owner(), a.id());
        assert_eq!(stage.object(id_b).unwrap().owner(), b.id());
    }

    #[tokio::test]
    async fn test_reentering_current_stage_only_acks() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;
        enter(&lobby, &a, "town").await;
        enter(&lobby, &b, "town").await;
        lobby
            .handle(
                &a,
                ClientPacket::CreateObject {
                    ack_handle: 8,
                    position: Position::default(),
                },
            )
            .await;
        drain(&mut qa);
        drain(&mut qb);

        enter(&lobby, &b, "town").await;
        let to_b = drain(&mut qb);
        assert_eq!(to_b.len(), 1);
        assert_eq!(parse_ack(&to_b[0]).error, ACK_SUCCESS);
        assert!(drain(&mut qa).is_empty());
        assert_eq!(lobby.stages().get("town").unwrap().client_count(), 2);
    }

    #[tokio::test]
    async fn test_created_stage_survives_unrelated_departure() {
        let lobby = lobby();
        let (creator, mut qc) = login(&lobby, 1, 100).await;
        let (guest, mut qg) = login(&lobby, 2, 200).await;
        let (passerby, _qp) = login(&lobby, 3, 300).await;

        lobby
            .handle(
                &creator,
                ClientPacket::CreateStage {
                    ack_handle: 2,
                    max_players: 4,
                    stage_id: "party".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qc).error, ACK_SUCCESS);

        enter(&lobby, &passerby, "town").await;
        lobby.on_disconnect(&passerby).await;
        assert!(lobby.stages().get("party").is_some());
        assert!(lobby.stages().get("town").is_none());

        lobby
            .handle(
                &guest,
                ClientPacket::ReserveStage {
                    ack_handle: 6,
                    ready: true,
                    stage_id: "party".into(),
                    password: String::new(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qg).error, ACK_SUCCESS);
        lobby
            .handle(
                &guest,
                ClientPacket::MoveStage {
                    ack_handle: 3,
                    stage_id: "party".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qg).error, ACK_SUCCESS);
        assert_eq!(lobby.stages().get("party").unwrap().host(), Some(creator.id()));
    }

    #[tokio::test]
    async fn test_created_stage_swept_after_creator_departs() {
        let lobby = lobby();
        let (creator, mut qc) = login(&lobby, 1, 100).await;
        lobby
            .handle(
                &creator,
                ClientPacket::CreateStage {
                    ack_handle: 2,
                    max_players: 0,
                    stage_id: "solo".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qc).error, ACK_SUCCESS);
        assert_eq!(lobby.stages().get("solo").unwrap().max_players(), 127);

        lobby.on_disconnect(&creator).await;
        assert!(lobby.stages().is_empty());
    }

    #[tokio::test]
    async fn test_enter_stage_notifies_and_replays_objects() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;

        enter(&lobby, &a, "town").await;
        assert_eq!(single_ack(&mut qa).error, ACK_SUCCESS);
        lobby
            .handle(
                &a,
                ClientPacket::CreateObject {
                    ack_handle: 8,
                    position: Position::new(1.0, 2.0, 3.0),
                },
            )
            .await;
        let object_id = u32::from_be_bytes(single_ack(&mut qa).data[..4].try_into().unwrap());

        enter(&lobby, &b, "town").await;
        let to_b = drain(&mut qb);
        assert_eq!(parse_ack(&to_b[0]).error, ACK_SUCCESS);
        assert_eq!(opcode_of(&to_b[1]), Opcode::SYS_DUPLICATE_OBJECT);
        assert_eq!(&to_b[1][2..6], &object_id.to_be_bytes());

        let to_a = drain(&mut qa);
        assert_eq!(to_a.len(), 1);
        assert_eq!(opcode_of(&to_a[0]), Opcode::SYS_INSERT_USER);
        assert_eq!(&to_a[0][2..6], &200u32.to_be_bytes());

        let stage = lobby.stages().get("town").unwrap();
        assert_eq!(stage.client_count(), 2);
        assert_eq!(stage.host(), Some(a.id()));
    }

    #[tokio::test]
    async fn test_move_to_missing_stage_fails() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        enter(&lobby, &a, "town").await;
        drain(&mut qa);

        lobby
            .handle(
                &a,
                ClientPacket::MoveStage {
                    ack_handle: 4,
                    stage_id: "nowhere".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qa).error, ACK_FAILURE);
        // Refused before leaving the old stage.
        assert_eq!(a.stage().unwrap().id(), "town");
        assert!(lobby.stages().get("nowhere").is_none());
    }

    #[tokio::test]
    async fn test_move_and_back_stage() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, _qb) = login(&lobby, 2, 200).await;
        enter(&lobby, &b, "town").await;
        enter(&lobby, &a, "town").await;
        enter(&lobby, &a, "quest_hall").await;
        drain(&mut qa);

        assert_eq!(a.previous_stage_id().as_deref(), Some("town"));
        lobby.handle(&a, ClientPacket::BackStage { ack_handle: 5 }).await;
        assert_eq!(single_ack(&mut qa).error, ACK_SUCCESS);
        assert_eq!(a.stage().unwrap().id(), "town");
        // Nobody is left in the hall, so it was swept.
        assert!(lobby.stages().get("quest_hall").is_none());
    }

    #[tokio::test]
    async fn test_locked_stage_admits_reserved_only() {
        let lobby = lobby();
        let (host, mut qh) = login(&lobby, 1, 100).await;
        let (guest, mut qg) = login(&lobby, 2, 200).await;
        let (stranger, mut qs) = login(&lobby, 3, 300).await;

        enter(&lobby, &host, "party").await;
        lobby
            .handle(
                &guest,
                ClientPacket::ReserveStage {
                    ack_handle: 6,
                    ready: false,
                    stage_id: "party".into(),
                    password: String::new(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qg).error, ACK_SUCCESS);

        lobby
            .handle(&guest, ClientPacket::LockStage { ack_handle: 9, locked: true })
            .await;
        assert_eq!(single_ack(&mut qg).error, ACK_FAILURE);
        drain(&mut qh);
        lobby
            .handle(&host, ClientPacket::LockStage { ack_handle: 9, locked: true })
            .await;
        assert_eq!(single_ack(&mut qh).error, ACK_SUCCESS);

        lobby
            .handle(
                &stranger,
                ClientPacket::MoveStage {
                    ack_handle: 2,
                    stage_id: "party".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qs).error, ACK_FAILURE);

        lobby
            .handle(
                &guest,
                ClientPacket::MoveStage {
                    ack_handle: 2,
                    stage_id: "party".into(),
                },
            )
            .await;
        assert_eq!(single_ack(&mut qg).error, ACK_SUCCESS);
        assert_eq!(
            lobby.stages().get("party").unwrap().enumerate(ClientFilter::NotReady),
            vec![200]
        );
    }

    #[tokio::test]
    async fn test_stage_binary_echo() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        enter(&lobby, &a, "town").await;
        drain(&mut qa);

        lobby
            .handle(
                &a,
                ClientPacket::SetStageBinary {
                    binary_type0: 1,
                    binary_type1: 2,
                    stage_id: "town".into(),
                    data: vec![0xCA, 0xFE],
                },
            )
            .await;
        let get = |id1: u8, stage_id: &str| ClientPacket::GetStageBinary {
            ack_handle: 12,
            binary_type0: 1,
            binary_type1: id1,
            stage_id: stage_id.to_string(),
        };

        lobby.handle(&a, get(2, "town")).await;
        let ack = single_ack(&mut qa);
        assert_eq!((ack.error, ack.data), (ACK_SUCCESS, vec![0xCA, 0xFE]));

        lobby.handle(&a, get(3, "town")).await;
        let ack = single_ack(&mut qa);
        assert_eq!((ack.error, ack.data.len()), (ACK_SUCCESS, 0));

        lobby.handle(&a, get(2, "nowhere")).await;
        assert_eq!(single_ack(&mut qa).error, ACK_FAILURE);
    }

    #[tokio::test]
    async fn test_enumerate_stage_by_prefix() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, _qb) = login(&lobby, 2, 200).await;
        enter(&lobby, &a, "sl1Qs210p0a0u0").await;
        enter(&lobby, &b, "sl1Ns200p0a0u0").await;
        drain(&mut qa);

        lobby
            .handle(
                &a,
                ClientPacket::EnumerateStage {
                    ack_handle: 13,
                    prefix: "sl1Q".into(),
                },
            )
            .await;
        let ack = single_ack(&mut qa);
        let mut r = PacketReader::new(&ack.data);
        assert_eq!(r.read_u16().unwrap(), 1);
        assert_eq!(r.read_string().unwrap(), "sl1Qs210p0a0u0");
        assert_eq!(r.read_u16().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_departure_cleans_up() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;

        enter(&lobby, &a, "town").await;
        enter(&lobby, &b, "town").await;
        lobby
            .handle(
                &a,
                ClientPacket::CreateObject {
                    ack_handle: 8,
                    position: Position::default(),
                },
            )
            .await;
        lobby
            .handle(
                &a,
                ClientPacket::CreateAcquireSemaphore {
                    ack_handle: 10,
                    max_players: 4,
                    name: "party".into(),
                },
            )
            .await;
        lobby
            .handle(
                &b,
                ClientPacket::AcquireSemaphore {
                    ack_handle: 11,
                    name: "party".into(),
                },
            )
            .await;
        drain(&mut qa);
        drain(&mut qb);

        lobby.on_disconnect(&a).await;

        let to_b = drain(&mut qb);
        assert_eq!(to_b.len(), 1);
        assert_eq!(opcode_of(&to_b[0]), Opcode::SYS_DELETE_USER);
        assert_eq!(&to_b[0][2..6], &100u32.to_be_bytes());

        let stage = lobby.stages().get("town").unwrap();
        assert_eq!(stage.object_count(), 0);
        assert_eq!(stage.host(), Some(b.id()));
        let semaphore = lobby.semaphores().get("party").unwrap();
        assert_eq!(semaphore.host(), Some(b.id()));
        assert!(a.stage().is_none() && a.semaphore().is_none());

        lobby.on_disconnect(&b).await;
        assert!(lobby.stages().is_empty());
        assert!(lobby.semaphores().is_empty());
    }

    #[tokio::test]
    async fn test_cast_binary_to_semaphore_members() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let (b, mut qb) = login(&lobby, 2, 200).await;
        for (session, handle) in [(&a, 1), (&b, 2)] {
            lobby
                .handle(
                    session,
                    ClientPacket::CreateAcquireSemaphore {
                        ack_handle: handle,
                        max_players: 4,
                        name: "party".into(),
                    },
                )
                .await;
        }
        drain(&mut qa);
        drain(&mut qb);

        lobby
            .handle(
                &a,
                ClientPacket::CastBinary {
                    target: CastTarget::Semaphore,
                    message_type: 2,
                    data: vec![0x55],
                },
            )
            .await;
        assert!(drain(&mut qa).is_empty());
        assert_eq!(drain(&mut qb), vec![protocol::casted_binary(100, 2, &[0x55])]);
    }

    #[tokio::test]
    async fn test_every_acked_packet_gets_one_ack() {
        let lobby = lobby();
        let (a, mut qa) = login(&lobby, 1, 100).await;
        let packets = vec![
            ClientPacket::Ping { ack_handle: 1 },
            ClientPacket::CreateStage {
                ack_handle: 2,
                max_players: 4,
                stage_id: "lobby_1".into(),
            },
            ClientPacket::CreateStage {
                ack_handle: 3,
                max_players: 4,
                stage_id: "lobby_1".into(),
            },
            ClientPacket::BackStage { ack_handle: 4 },
            ClientPacket::CheckSemaphore {
                ack_handle: 5,
                name: "missing".into(),
            },
            ClientPacket::EnumerateClient {
                ack_handle: 6,
                filter: ClientFilter::All,
                stage_id: "lobby_1".into(),
            },
            ClientPacket::CreateObject {
                ack_handle: 7,
                position: Position::default(),
            },
        ];
        for packet in packets {
            let expected = packet.ack_handle().unwrap();
            lobby.handle(&a, packet).await;
            assert_eq!(single_ack(&mut qa).handle, expected);
        }
    }
}
