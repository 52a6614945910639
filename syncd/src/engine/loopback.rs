//! In-process sync engine and simulated peer.
//!
//! The real SyncML codec is a black box this daemon only adapts to; for
//! local syncs and tests the exchange runs over a compact JSON framing
//! instead (`application/x-syncd+json`). The message flow mirrors the
//! protocol shape the callback surface was designed for: one init round
//! trip, one data round trip, one closing round trip, with change
//! detection, LUID/GUID mapping, admin tokens and per-item operations all
//! going through [`DataOps`].

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};
use sync_api::models::{SourceReport, SyncMode};
use sync_api::SyncStatus;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::memory::{MemoryBackend, MemoryStore};
use crate::engine::adapter::SourceAdapter;
use crate::engine::{DataOps, EngineEvent, ItemKey, MapItem, NextItemStatus};
use crate::transport::{TransportAgent, WaitResult, CONTENT_TYPE_LOOPBACK};

/// Cooperative cancellation shared between a session and its engine.
///
/// `abort` unwinds at the next safe point without applying further items;
/// `suspend` asks for a resume token instead.
#[derive(Clone, Default)]
pub struct EngineControl {
    abort: CancellationToken,
    suspend: Arc<AtomicBool>,
}

impl EngineControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_abort(&self) {
        self.abort.cancel();
    }

    pub fn request_suspend(&self) {
        self.suspend.store(true, Ordering::SeqCst);
    }

    pub fn aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    pub fn suspended(&self) -> bool {
        self.suspend.load(Ordering::SeqCst)
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemOp {
    Add,
    Update,
    Delete,
    /// Slow-sync item: full content, matched by the receiver.
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub op: ItemOp,
    /// Sender-local id: luid client->server, GUID server->client.
    pub id: String,
    /// The receiver's id for this item, when the sender knows it.
    pub remote_id: Option<String>,
    pub data: Option<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInit {
    pub name: String,
    pub mode: SyncMode,
    /// The peer's token from the previous sync with it.
    pub peer_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
    pub session_id: String,
    pub device_id: String,
    pub sources: Vec<SourceInit>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceInitAck {
    pub name: String,
    /// Mode the peer insists on (it may force a slow sync).
    pub mode: SyncMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitReply {
    pub session_id: String,
    pub sources: Vec<SourceInitAck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceChanges {
    pub name: String,
    pub entries: Vec<ChangeEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataRequest {
    pub session_id: String,
    pub sources: Vec<SourceChanges>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppliedItem {
    pub id: String,
    pub remote_id: String,
    pub status: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceDataAck {
    pub name: String,
    /// Dispositions of the items the sender submitted.
    pub applied: Vec<AppliedItem>,
    /// The peer's own changes for the receiver to apply.
    pub changes: Vec<ChangeEntry>,
    pub new_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataReply {
    pub session_id: String,
    pub sources: Vec<SourceDataAck>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Init(InitRequest),
    InitAck(InitReply),
    Data(DataRequest),
    DataAck(DataReply),
    Final { session_id: String },
    Done { session_id: String, status: u32 },
    Abort { reason: String },
}

impl Message {
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("loopback messages always serialize")
    }

    pub fn decode(data: &[u8]) -> Result<Message, SyncStatus> {
        serde_json::from_slice(data).map_err(|e| {
            warn!("undecodable loopback message: {e}");
            SyncStatus::FATAL
        })
    }
}

/// Engine-owned per-source admin blob, round-tripped through
/// `load_admin_data`/`save_admin_data`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct AdminData {
    #[serde(default)]
    last: String,
    #[serde(default)]
    peer: String,
    #[serde(default)]
    resume: String,
}

impl AdminData {
    fn parse(raw: &str) -> AdminData {
        if raw.is_empty() {
            AdminData::default()
        } else {
            serde_json::from_str(raw).unwrap_or_default()
        }
    }

    fn encode(&self) -> String {
        serde_json::to_string(self).expect("admin data always serializes")
    }
}

/// Result of one engine run.
#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub status: SyncStatus,
    pub per_source: BTreeMap<String, SourceReport>,
    pub resume_token: Option<String>,
}

impl SyncOutcome {
    fn failed(status: SyncStatus) -> Self {
        SyncOutcome {
            status,
            per_source: BTreeMap::new(),
            resume_token: None,
        }
    }
}

/// From the peer's point of view the direction of a mode flips.
pub fn mirror_mode(mode: SyncMode) -> SyncMode {
    match mode {
        SyncMode::TwoWay => SyncMode::TwoWay,
        SyncMode::Slow => SyncMode::Slow,
        SyncMode::RefreshFromClient => SyncMode::RefreshFromServer,
        SyncMode::RefreshFromServer => SyncMode::RefreshFromClient,
        SyncMode::OneWayFromClient => SyncMode::OneWayFromServer,
        SyncMode::OneWayFromServer => SyncMode::OneWayFromClient,
        SyncMode::Disabled => SyncMode::Disabled,
    }
}

fn emit(events: &tokio::sync::mpsc::UnboundedSender<EngineEvent>, event: EngineEvent) {
    // the receiving side may be gone during shutdown; that is fine
    let _ = events.send(event);
}

/// Client-side engine: drives the local sources' callbacks and exchanges
/// messages with the peer through a transport agent.
pub struct ClientEngine {
    session_id: String,
    device_id: String,
    control: EngineControl,
    events: tokio::sync::mpsc::UnboundedSender<EngineEvent>,
}

struct ClientSource<'a> {
    adapter: &'a mut SourceAdapter,
    admin: AdminData,
    report: SourceReport,
    /// local luid -> peer guid
    map: HashMap<String, String>,
}

impl<'a> ClientSource<'a> {
    fn load(adapter: &'a mut SourceAdapter) -> Result<Self, SyncStatus> {
        let raw = adapter.load_admin_data("local", "peer")?;
        let admin = AdminData::parse(&raw);
        let mut map = HashMap::new();
        let mut first = true;
        while let Some(item) = adapter.read_next_map_item(first)? {
            first = false;
            map.insert(item.local_id, item.remote_id);
        }
        Ok(ClientSource {
            adapter,
            admin,
            report: SourceReport::default(),
            map,
        })
    }

    /// Run change detection, downgrading to slow sync when the tokens do
    /// not line up.
    fn begin(&mut self) -> Result<(), SyncStatus> {
        match self
            .adapter
            .begin_data_read(&self.admin.last, &self.admin.resume)
        {
            Err(status) if status == SyncStatus::SLOW_SYNC_508 => {
                info!(source = %self.adapter.name(), "peer state unknown, running slow sync");
                self.adapter.set_sync_mode(SyncMode::Slow);
                self.adapter.begin_data_read("", "")
            }
            other => other,
        }
    }

    fn guid_of(&self, luid: &str) -> Option<&String> {
        self.map.get(luid)
    }

    fn luid_of(&self, guid: &str) -> Option<String> {
        self.map
            .iter()
            .find(|(_, g)| g.as_str() == guid)
            .map(|(l, _)| l.clone())
    }
}

impl ClientEngine {
    pub fn new(
        session_id: &str,
        device_id: &str,
        control: EngineControl,
        events: tokio::sync::mpsc::UnboundedSender<EngineEvent>,
    ) -> Self {
        ClientEngine {
            session_id: session_id.to_string(),
            device_id: device_id.to_string(),
            control,
            events,
        }
    }

    /// Run one sync over `transport`. Adapters carry the per-source modes.
    pub async fn run(
        &mut self,
        adapters: &mut [SourceAdapter],
        transport: &mut dyn TransportAgent,
    ) -> SyncOutcome {
        match self.run_inner(adapters, transport).await {
            Ok(outcome) => outcome,
            Err(status) => SyncOutcome::failed(status),
        }
    }

    async fn exchange(
        &mut self,
        transport: &mut dyn TransportAgent,
        message: &Message,
    ) -> Result<Message, SyncStatus> {
        self.checkpoint()?;
        emit(&self.events, EngineEvent::SendStart);
        transport.set_content_type(CONTENT_TYPE_LOOPBACK);
        transport
            .send(message.encode())
            .map_err(|_| SyncStatus::TRANSPORT_FAILURE)?;

        emit(&self.events, EngineEvent::Waiting(true));
        let abort = self.control.abort_token();
        let reply = loop {
            // abort must interrupt a blocked wait, not fire after the
            // transport timeout
            let wait = tokio::select! {
                _ = abort.cancelled() => {
                    emit(&self.events, EngineEvent::Waiting(false));
                    transport.cancel();
                    return Err(SyncStatus::USER_ABORT);
                }
                wait = transport.wait(true) => wait,
            };
            match wait {
                WaitResult::GotReply => {
                    break transport
                        .get_reply()
                        .ok_or(SyncStatus::TRANSPORT_FAILURE)?
                }
                WaitResult::Active => continue,
                WaitResult::Closed | WaitResult::Inactive | WaitResult::Failed => {
                    emit(&self.events, EngineEvent::Waiting(false));
                    // an abort surfacing as a dead transport is an abort
                    self.checkpoint()?;
                    return Err(SyncStatus::TRANSPORT_FAILURE);
                }
            }
        };
        emit(&self.events, EngineEvent::Waiting(false));
        emit(&self.events, EngineEvent::ReceiveEnd);
        self.checkpoint()?;

        match Message::decode(&reply.0)? {
            Message::Abort { reason } => {
                warn!(%reason, "peer aborted the session");
                Err(SyncStatus::FATAL)
            }
            message => Ok(message),
        }
    }

    /// Abort/suspend are honored between protocol steps; this is the safe
    /// point check.
    fn checkpoint(&self) -> Result<(), SyncStatus> {
        if self.control.aborted() {
            Err(SyncStatus::USER_ABORT)
        } else {
            Ok(())
        }
    }

    async fn run_inner(
        &mut self,
        adapters: &mut [SourceAdapter],
        transport: &mut dyn TransportAgent,
    ) -> Result<SyncOutcome, SyncStatus> {
        emit(&self.events, EngineEvent::Step(crate::progress::Step::Prepare));
        let mut sources = Vec::new();
        for adapter in adapters.iter_mut() {
            sources.push(ClientSource::load(adapter)?);
        }

        // ---- prepare: change detection for early-start sources
        for source in &mut sources {
            if source.adapter.early_start() {
                source.begin()?;
            }
        }

        // ---- init round trip
        emit(&self.events, EngineEvent::Step(crate::progress::Step::Init));
        let init = Message::Init(InitRequest {
            session_id: self.session_id.clone(),
            device_id: self.device_id.clone(),
            sources: sources
                .iter()
                .map(|s| SourceInit {
                    name: s.adapter.name().to_string(),
                    mode: s.adapter.sync_mode(),
                    peer_token: s.admin.peer.clone(),
                })
                .collect(),
        });
        let Message::InitAck(ack) = self.exchange(transport, &init).await? else {
            return Err(SyncStatus::FATAL);
        };

        for source in &mut sources {
            let agreed = ack
                .sources
                .iter()
                .find(|a| a.name == source.adapter.name())
                .map(|a| a.mode)
                .ok_or(SyncStatus::FATAL)?;
            if agreed != source.adapter.sync_mode() {
                debug!(
                    source = %source.adapter.name(),
                    ?agreed,
                    "peer changed the sync mode"
                );
                source.adapter.set_sync_mode(agreed);
                source.adapter.set_early_start(true);
                source.begin()?;
            } else if !source.adapter.early_start() {
                source.begin()?;
            }
        }
        emit(&self.events, EngineEvent::SyncStarted);

        // ---- data round trip
        emit(&self.events, EngineEvent::Step(crate::progress::Step::Data));
        let mut request_sources = Vec::new();
        for source in &mut sources {
            source.adapter.end_data_read()?;
            let entries = collect_outbound(source.adapter, &source.map, &mut source.report)?;
            if !entries.is_empty() {
                emit(
                    &self.events,
                    EngineEvent::ItemPrepare {
                        source: source.adapter.name().to_string(),
                    },
                );
            }
            request_sources.push(SourceChanges {
                name: source.adapter.name().to_string(),
                entries,
            });
        }

        let data = Message::Data(DataRequest {
            session_id: self.session_id.clone(),
            sources: request_sources,
        });
        let Message::DataAck(ack) = self.exchange(transport, &data).await? else {
            return Err(SyncStatus::FATAL);
        };

        // ---- apply phase
        emit(&self.events, EngineEvent::Step(crate::progress::Step::Uninit));
        let mut resume_token = None;
        let mut first_error = None;
        for source in &mut sources {
            let Some(source_ack) = ack
                .sources
                .iter()
                .find(|a| a.name == source.adapter.name())
            else {
                first_error.get_or_insert(SyncStatus::FATAL);
                continue;
            };

            source.adapter.start_data_write()?;

            // record the ids the peer assigned to what we sent
            for applied in &source_ack.applied {
                source.report.items_sent += 1;
                if applied.status >= 400 {
                    first_error.get_or_insert(SyncStatus(applied.status));
                    continue;
                }
                if applied.remote_id.is_empty() {
                    source.adapter.delete_map_item(&MapItem {
                        local_id: applied.id.clone(),
                        ..Default::default()
                    })?;
                    source.map.remove(&applied.id);
                } else {
                    source.adapter.insert_map_item(&MapItem {
                        local_id: applied.id.clone(),
                        remote_id: applied.remote_id.clone(),
                        flags: 0,
                    })?;
                    source
                        .map
                        .insert(applied.id.clone(), applied.remote_id.clone());
                }
            }

            if let Err(status) = self.apply_inbound(source, source_ack) {
                if status == SyncStatus::USER_ABORT {
                    return Err(status);
                }
                if status != SyncStatus::USER_SUSPEND {
                    // suspension commits the partial apply below; anything
                    // else is a real failure
                    first_error.get_or_insert(status);
                }
            }

            let success = first_error.is_none();
            if !success {
                // close the bracket, keep the old tokens so the next sync
                // falls back to a slow one
                let _ = source.adapter.end_data_write(false);
                continue;
            }
            let token = source.adapter.end_data_write(true)?;
            let mut admin = AdminData {
                last: token.clone(),
                peer: source_ack.new_token.clone(),
                resume: String::new(),
            };
            if self.control.suspended() {
                admin.resume = token.clone();
                resume_token = Some(token);
            }
            source.adapter.save_admin_data(&admin.encode())?;
        }

        // ---- closing round trip
        let done = self
            .exchange(
                transport,
                &Message::Final {
                    session_id: self.session_id.clone(),
                },
            )
            .await?;
        let Message::Done { status, .. } = done else {
            return Err(SyncStatus::FATAL);
        };
        if status != 0 && first_error.is_none() {
            first_error = Some(SyncStatus(status));
        }

        let mut per_source = BTreeMap::new();
        for source in &mut sources {
            let status = if first_error.is_none() {
                SyncStatus::OK
            } else {
                first_error.unwrap()
            };
            emit(
                &self.events,
                EngineEvent::SourceDone {
                    source: source.adapter.name().to_string(),
                    status,
                },
            );
            let mut report = source.report.clone();
            report.mode = source.adapter.sync_mode().to_string();
            report.status = status.0;
            per_source.insert(source.adapter.name().to_string(), report);
            // let coarse-revision backends settle before the session ends
            source.adapter.quiesce().await;
        }

        if self.control.suspended() {
            return Ok(SyncOutcome {
                status: SyncStatus::USER_SUSPEND,
                per_source,
                resume_token,
            });
        }

        Ok(SyncOutcome {
            status: first_error.unwrap_or(SyncStatus::OK),
            per_source,
            resume_token,
        })
    }

    fn apply_inbound(
        &mut self,
        source: &mut ClientSource<'_>,
        ack: &SourceDataAck,
    ) -> Result<(), SyncStatus> {
        if !source.adapter.sync_mode().receives_items() {
            return Ok(());
        }

        // a refresh replaces the local data wholesale
        if source.adapter.sync_mode() == SyncMode::RefreshFromServer {
            let current = source
                .adapter
                .backend_mut()
                .list_all()
                .map_err(|e| e.status())?;
            for luid in current.keys() {
                source.adapter.delete_item(luid)?;
                if let Some(guid) = source.guid_of(luid).cloned() {
                    source.adapter.delete_map_item(&MapItem {
                        local_id: luid.clone(),
                        remote_id: guid,
                        flags: 0,
                    })?;
                    source.map.remove(luid);
                }
            }
        }

        let total = ack.changes.len() as i32;
        for (count, entry) in ack.changes.iter().enumerate() {
            if self.control.aborted() {
                return Err(SyncStatus::USER_ABORT);
            }
            if self.control.suspended() {
                // safe point: stop applying, the rest comes after resume
                return Err(SyncStatus::USER_SUSPEND);
            }

            source.report.items_received += 1;
            emit(
                &self.events,
                EngineEvent::ItemReceive {
                    source: source.adapter.name().to_string(),
                    count: count as i32 + 1,
                    total,
                },
            );

            match entry.op {
                ItemOp::Add | ItemOp::Full => {
                    let data = entry.data.as_deref().ok_or(SyncStatus::FATAL)?;
                    let (luid, was_merge) = put_inbound(source.adapter, data, None)?;
                    if was_merge {
                        source.report.items_updated += 1;
                    } else {
                        source.report.items_added += 1;
                    }
                    source.adapter.insert_map_item(&MapItem {
                        local_id: luid.clone(),
                        remote_id: entry.id.clone(),
                        flags: 0,
                    })?;
                    source.map.insert(luid, entry.id.clone());
                }
                ItemOp::Update => {
                    let data = entry.data.as_deref().ok_or(SyncStatus::FATAL)?;
                    let luid = match source.luid_of(&entry.id) {
                        Some(luid) => luid,
                        None => {
                            warn!(guid = %entry.id, "update for unknown item, adding instead");
                            let (luid, was_merge) = put_inbound(source.adapter, data, None)?;
                            source.adapter.insert_map_item(&MapItem {
                                local_id: luid.clone(),
                                remote_id: entry.id.clone(),
                                flags: 0,
                            })?;
                            source.map.insert(luid, entry.id.clone());
                            if was_merge {
                                source.report.items_updated += 1;
                            } else {
                                source.report.items_added += 1;
                            }
                            continue;
                        }
                    };
                    let (final_luid, _) = put_inbound(source.adapter, data, Some(&luid))?;
                    if final_luid != luid {
                        // the data went into the merged item; move the
                        // mapping along
                        source.adapter.delete_map_item(&MapItem {
                            local_id: luid.clone(),
                            remote_id: entry.id.clone(),
                            flags: 0,
                        })?;
                        source.map.remove(&luid);
                        source.adapter.insert_map_item(&MapItem {
                            local_id: final_luid.clone(),
                            remote_id: entry.id.clone(),
                            flags: 0,
                        })?;
                        source.map.insert(final_luid, entry.id.clone());
                    }
                    source.report.items_updated += 1;
                }
                ItemOp::Delete => {
                    let Some(luid) = source.luid_of(&entry.id) else {
                        debug!(guid = %entry.id, "delete for unknown item ignored");
                        continue;
                    };
                    source.adapter.delete_item(&luid)?;
                    source.adapter.delete_map_item(&MapItem {
                        local_id: luid.clone(),
                        remote_id: entry.id.clone(),
                        flags: 0,
                    })?;
                    source.map.remove(&luid);
                    source.report.items_deleted += 1;
                }
            }
        }
        Ok(())
    }
}

/// Apply inbound item data, honoring the backend's conflict verdict: a
/// write refused with "needs merge" is redirected onto the named item, so
/// the merged item ends up carrying the incoming content. Returns the luid
/// the data finally landed under and whether a merge happened.
fn put_inbound(
    adapter: &mut SourceAdapter,
    data: &[u8],
    luid: Option<&str>,
) -> Result<(String, bool), SyncStatus> {
    let put = match luid {
        Some(luid) => adapter.update_item_as_key(
            &ItemKey {
                luid: luid.to_string(),
                data: data.to_vec(),
            },
            luid,
        )?,
        None => adapter.insert_item_as_key(&ItemKey {
            luid: String::new(),
            data: data.to_vec(),
        })?,
    };
    let Some(other) = put.needs_merge else {
        return Ok((put.luid, put.merged));
    };

    debug!(conflict = %other, "write conflicts with an existing item, merging into it");
    let merged = adapter.update_item_as_key(
        &ItemKey {
            luid: other.clone(),
            data: data.to_vec(),
        },
        &other,
    )?;
    Ok((merged.luid, true))
}

/// Walk the local change sets and turn them into wire entries.
fn collect_outbound(
    adapter: &mut SourceAdapter,
    map: &HashMap<String, String>,
    report: &mut SourceReport,
) -> Result<Vec<ChangeEntry>, SyncStatus> {
    let mut entries = Vec::new();
    if !adapter.sync_mode().sends_items() {
        // still drain the iterator so `done` semantics hold
        while adapter.read_next_item(entries.is_empty())?.is_some() {}
        return Ok(entries);
    }

    let mut first = true;
    while let Some((luid, status)) = adapter.read_next_item(first)? {
        first = false;
        let entry = match status {
            NextItemStatus::Unchanged => {
                let key = adapter.read_item_by_key(&luid)?;
                ChangeEntry {
                    op: ItemOp::Full,
                    id: luid,
                    remote_id: None,
                    data: Some(key.data),
                }
            }
            NextItemStatus::Added => {
                let key = adapter.read_item_by_key(&luid)?;
                ChangeEntry {
                    op: ItemOp::Add,
                    id: luid,
                    remote_id: None,
                    data: Some(key.data),
                }
            }
            NextItemStatus::Updated => {
                let key = adapter.read_item_by_key(&luid)?;
                ChangeEntry {
                    op: ItemOp::Update,
                    id: luid.clone(),
                    remote_id: map.get(&luid).cloned(),
                    data: Some(key.data),
                }
            }
            NextItemStatus::Deleted => ChangeEntry {
                op: ItemOp::Delete,
                id: luid.clone(),
                remote_id: map.get(&luid).cloned(),
                data: None,
            },
        };
        entries.push(entry);
    }
    Ok(entries)
}

enum ServerPhase {
    ExpectInit,
    ExpectData,
    ExpectFinal,
    Done,
}

/// Server-side engine: feeds inbound messages through the local sources'
/// callbacks and produces the reply for each.
pub struct ServerEngine {
    session_id: String,
    adapters: Vec<SourceAdapter>,
    phase: ServerPhase,
    /// Client-perspective mode per source, echoed in acks.
    agreed_modes: HashMap<String, SyncMode>,
    /// local luid -> guid handed to the client
    maps: HashMap<String, HashMap<String, String>>,
    guid_counter: u64,
}

impl ServerEngine {
    pub fn new(session_id: &str, adapters: Vec<SourceAdapter>) -> Self {
        ServerEngine {
            session_id: session_id.to_string(),
            adapters,
            phase: ServerPhase::ExpectInit,
            agreed_modes: HashMap::new(),
            maps: HashMap::new(),
            guid_counter: 0,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, ServerPhase::Done)
    }

    pub fn into_adapters(self) -> Vec<SourceAdapter> {
        self.adapters
    }

    fn next_guid(&mut self) -> String {
        self.guid_counter += 1;
        format!("g-{}", self.guid_counter)
    }

    /// Process one inbound message, returning the reply to send back.
    pub fn process_bytes(&mut self, data: &[u8]) -> Result<Message, SyncStatus> {
        let message = Message::decode(data)?;
        self.process(message)
    }

    pub fn process(&mut self, message: Message) -> Result<Message, SyncStatus> {
        match message {
            Message::Init(request) if matches!(self.phase, ServerPhase::ExpectInit) => {
                self.handle_init(request)
            }
            Message::Data(request) if matches!(self.phase, ServerPhase::ExpectData) => {
                self.handle_data(request)
            }
            Message::Final { session_id }
                if matches!(self.phase, ServerPhase::ExpectFinal) =>
            {
                if session_id != self.session_id {
                    return Err(SyncStatus::FATAL);
                }
                self.phase = ServerPhase::Done;
                Ok(Message::Done {
                    session_id,
                    status: 0,
                })
            }
            _ => Err(SyncStatus::FATAL),
        }
    }

    fn adapter_mut(&mut self, name: &str) -> Result<&mut SourceAdapter, SyncStatus> {
        self.adapters
            .iter_mut()
            .find(|a| a.name() == name)
            .ok_or(SyncStatus::NOT_FOUND)
    }

    fn handle_init(&mut self, request: InitRequest) -> Result<Message, SyncStatus> {
        if request.session_id != self.session_id {
            return Err(SyncStatus::FATAL);
        }

        let mut acks = Vec::new();
        for source in &request.sources {
            let adapter = self.adapter_mut(&source.name)?;
            adapter.set_sync_mode(mirror_mode(source.mode));

            let mut agreed = source.mode;
            match adapter.begin_data_read(&source.peer_token, "") {
                Ok(()) => {}
                Err(status) if status == SyncStatus::SLOW_SYNC_508 => {
                    info!(source = %source.name, "forcing client into slow sync");
                    adapter.set_sync_mode(SyncMode::Slow);
                    adapter.begin_data_read("", "")?;
                    agreed = SyncMode::Slow;
                }
                Err(status) => return Err(status),
            }
            self.agreed_modes.insert(source.name.clone(), agreed);

            // load the persisted luid<->guid map
            let adapter = self.adapter_mut(&source.name)?;
            let mut map = HashMap::new();
            let mut first = true;
            while let Some(item) = adapter.read_next_map_item(first)? {
                first = false;
                map.insert(item.local_id, item.remote_id);
            }
            self.maps.insert(source.name.clone(), map);
        }

        for source in &request.sources {
            acks.push(SourceInitAck {
                name: source.name.clone(),
                mode: self
                    .agreed_modes
                    .get(&source.name)
                    .copied()
                    .unwrap_or(source.mode),
            });
        }

        self.phase = ServerPhase::ExpectData;
        Ok(Message::InitAck(InitReply {
            session_id: self.session_id.clone(),
            sources: acks,
        }))
    }

    fn handle_data(&mut self, request: DataRequest) -> Result<Message, SyncStatus> {
        if request.session_id != self.session_id {
            return Err(SyncStatus::FATAL);
        }

        let mut replies = Vec::new();
        for source in &request.sources {
            let name = source.name.clone();
            self.adapter_mut(&name)?.end_data_read()?;

            // outbound delta from the frozen snapshot, before the client's
            // items land locally
            let outbound = self.collect_server_outbound(&name)?;

            self.adapter_mut(&name)?.start_data_write()?;

            // a client refresh replaces the server-side data wholesale
            let adapter = self.adapter_mut(&name)?;
            if adapter.sync_mode() == SyncMode::RefreshFromServer {
                let current = adapter.backend_mut().list_all().map_err(|e| e.status())?;
                for luid in current.keys() {
                    let adapter = self.adapter_mut(&name)?;
                    adapter.delete_item(luid)?;
                    let map = self.maps.entry(name.clone()).or_default();
                    if let Some(guid) = map.remove(luid) {
                        self.adapter_mut(&name)?.delete_map_item(&MapItem {
                            local_id: luid.clone(),
                            remote_id: guid,
                            flags: 0,
                        })?;
                    }
                }
            }

            let mut applied = Vec::new();
            for entry in &source.entries {
                applied.push(self.apply_client_entry(&name, entry)?);
            }

            let token = self.adapter_mut(&name)?.end_data_write(true)?;
            let adapter = self.adapter_mut(&name)?;
            let admin = AdminData {
                last: token.clone(),
                peer: String::new(),
                resume: String::new(),
            };
            adapter.save_admin_data(&admin.encode())?;

            replies.push(SourceDataAck {
                name,
                applied,
                changes: outbound,
                new_token: token,
            });
        }

        self.phase = ServerPhase::ExpectFinal;
        Ok(Message::DataAck(DataReply {
            session_id: self.session_id.clone(),
            sources: replies,
        }))
    }

    fn collect_server_outbound(&mut self, name: &str) -> Result<Vec<ChangeEntry>, SyncStatus> {
        let sends = {
            let adapter = self.adapter_mut(name)?;
            adapter.sync_mode().sends_items()
        };

        let mut entries = Vec::new();
        let mut pending = Vec::new();
        {
            let adapter = self.adapter_mut(name)?;
            let mut first = true;
            while let Some(next) = adapter.read_next_item(first)? {
                first = false;
                pending.push(next);
            }
        }
        if !sends {
            return Ok(entries);
        }

        let slow = {
            let adapter = self.adapter_mut(name)?;
            matches!(
                adapter.sync_mode(),
                SyncMode::Slow | SyncMode::RefreshFromClient
            )
        };

        for (luid, status) in pending {
            let guid = match self.maps.get(name).and_then(|m| m.get(&luid)).cloned() {
                Some(guid) => guid,
                None => {
                    let guid = self.next_guid();
                    self.adapter_mut(name)?.insert_map_item(&MapItem {
                        local_id: luid.clone(),
                        remote_id: guid.clone(),
                        flags: 0,
                    })?;
                    self.maps
                        .entry(name.to_string())
                        .or_default()
                        .insert(luid.clone(), guid.clone());
                    guid
                }
            };
            let entry = match status {
                NextItemStatus::Deleted => ChangeEntry {
                    op: ItemOp::Delete,
                    id: guid,
                    remote_id: None,
                    data: None,
                },
                NextItemStatus::Unchanged | NextItemStatus::Added | NextItemStatus::Updated => {
                    let data = self.adapter_mut(name)?.read_item_by_key(&luid)?.data;
                    ChangeEntry {
                        op: if slow {
                            ItemOp::Full
                        } else if status == NextItemStatus::Added {
                            ItemOp::Add
                        } else {
                            ItemOp::Update
                        },
                        id: guid,
                        remote_id: None,
                        data: Some(data),
                    }
                }
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    fn apply_client_entry(
        &mut self,
        name: &str,
        entry: &ChangeEntry,
    ) -> Result<AppliedItem, SyncStatus> {
        let receives = {
            let adapter = self.adapter_mut(name)?;
            adapter.sync_mode().receives_items()
        };
        if !receives {
            return Ok(AppliedItem {
                id: entry.id.clone(),
                remote_id: String::new(),
                status: SyncStatus::COMMAND_NOT_ALLOWED.0,
            });
        }

        match entry.op {
            ItemOp::Add | ItemOp::Full => {
                let Some(data) = entry.data.as_deref() else {
                    return Err(SyncStatus::FATAL);
                };
                let (luid, was_merge) = put_inbound(self.adapter_mut(name)?, data, None)?;
                // dedup during slow sync may land on an already-mapped item
                let existing = self.maps.get(name).and_then(|m| m.get(&luid)).cloned();
                let guid = match existing {
                    Some(guid) => guid,
                    None => {
                        let guid = self.next_guid();
                        self.adapter_mut(name)?.insert_map_item(&MapItem {
                            local_id: luid.clone(),
                            remote_id: guid.clone(),
                            flags: 0,
                        })?;
                        self.maps
                            .entry(name.to_string())
                            .or_default()
                            .insert(luid.clone(), guid.clone());
                        guid
                    }
                };
                Ok(AppliedItem {
                    id: entry.id.clone(),
                    remote_id: guid,
                    status: if was_merge {
                        SyncStatus::ITEM_MERGED.0
                    } else {
                        201
                    },
                })
            }
            ItemOp::Update => {
                let Some(data) = entry.data.as_deref() else {
                    return Err(SyncStatus::FATAL);
                };
                let guid = entry.remote_id.clone().unwrap_or_default();
                let luid = self
                    .maps
                    .get(name)
                    .and_then(|m| {
                        m.iter()
                            .find(|(_, g)| g.as_str() == guid)
                            .map(|(l, _)| l.clone())
                    });
                let Some(luid) = luid else {
                    return Ok(AppliedItem {
                        id: entry.id.clone(),
                        remote_id: guid,
                        status: SyncStatus::NOT_FOUND.0,
                    });
                };
                let (final_luid, was_merge) =
                    put_inbound(self.adapter_mut(name)?, data, Some(&luid))?;
                if final_luid != luid {
                    // the content moved into the merged item; keep the
                    // client's guid pointing at it
                    self.adapter_mut(name)?.delete_map_item(&MapItem {
                        local_id: luid.clone(),
                        remote_id: guid.clone(),
                        flags: 0,
                    })?;
                    self.adapter_mut(name)?.insert_map_item(&MapItem {
                        local_id: final_luid.clone(),
                        remote_id: guid.clone(),
                        flags: 0,
                    })?;
                    let map = self.maps.entry(name.to_string()).or_default();
                    map.remove(&luid);
                    map.insert(final_luid, guid.clone());
                }
                Ok(AppliedItem {
                    id: entry.id.clone(),
                    remote_id: guid,
                    status: if was_merge {
                        SyncStatus::ITEM_MERGED.0
                    } else {
                        200
                    },
                })
            }
            ItemOp::Delete => {
                let guid = entry.remote_id.clone().unwrap_or_default();
                let luid = self.maps.get(name).and_then(|m| {
                    m.iter()
                        .find(|(_, g)| g.as_str() == guid)
                        .map(|(l, _)| l.clone())
                });
                let Some(luid) = luid else {
                    return Ok(AppliedItem {
                        id: entry.id.clone(),
                        remote_id: guid,
                        status: SyncStatus::NOT_FOUND.0,
                    });
                };
                self.adapter_mut(name)?.delete_item(&luid)?;
                self.adapter_mut(name)?.delete_map_item(&MapItem {
                    local_id: luid.clone(),
                    remote_id: guid.clone(),
                    flags: 0,
                })?;
                self.maps.entry(name.to_string()).or_default().remove(&luid);
                Ok(AppliedItem {
                    id: entry.id.clone(),
                    remote_id: String::new(),
                    status: 200,
                })
            }
        }
    }
}

/// A standalone simulated peer holding its own per-source stores. Each
/// inbound session gets its own [`ServerEngine`] with per-device state
/// directories, so several clients can sync against the same data.
pub struct LoopbackPeer {
    base_dir: Utf8PathBuf,
    stores: BTreeMap<String, MemoryStore>,
    engines: HashMap<String, ServerEngine>,
}

impl LoopbackPeer {
    pub fn new(base_dir: &Utf8Path, source_names: &[&str]) -> Self {
        LoopbackPeer {
            base_dir: base_dir.to_path_buf(),
            stores: source_names
                .iter()
                .map(|name| (name.to_string(), MemoryStore::new()))
                .collect(),
            engines: HashMap::new(),
        }
    }

    /// Direct access to a source's store, for seeding and inspection.
    pub fn store(&self, name: &str) -> MemoryStore {
        self.stores[name].clone()
    }

    fn engine_for(&mut self, message: &Message) -> Result<&mut ServerEngine, SyncStatus> {
        let session_id = match message {
            Message::Init(request) => {
                let dir = self.base_dir.join(&request.device_id);
                let mut adapters = Vec::new();
                for (name, store) in &self.stores {
                    adapters.push(
                        SourceAdapter::open(
                            name,
                            Box::new(MemoryBackend::with_store(name, store.clone())),
                            &dir.join(name),
                            SyncMode::TwoWay,
                            std::time::Duration::ZERO,
                        )
                        .map_err(|_| SyncStatus::DATASTORE_FAILURE)?,
                    );
                }
                self.engines.insert(
                    request.session_id.clone(),
                    ServerEngine::new(&request.session_id, adapters),
                );
                request.session_id.clone()
            }
            Message::Data(request) => request.session_id.clone(),
            Message::Final { session_id } => session_id.clone(),
            _ => return Err(SyncStatus::FATAL),
        };
        self.engines
            .get_mut(&session_id)
            .ok_or(SyncStatus::FATAL)
    }

    /// Handle one wire message, producing the reply bytes.
    pub fn handle(&mut self, data: &[u8]) -> Vec<u8> {
        let reply = match Message::decode(data) {
            Ok(message) => match self.engine_for(&message) {
                Ok(engine) => engine
                    .process(message)
                    .unwrap_or_else(|status| Message::Abort {
                        reason: format!("peer error {status}"),
                    }),
                Err(status) => Message::Abort {
                    reason: format!("no session: {status}"),
                },
            },
            Err(status) => Message::Abort {
                reason: format!("undecodable: {status}"),
            },
        };
        reply.encode()
    }

    /// Pump messages between this peer and a transport endpoint until the
    /// other side goes away. Tests spawn this as the fake network.
    pub async fn serve(self, transport: crate::transport::ChannelTransport) {
        Self::serve_shared(Arc::new(Mutex::new(self)), transport).await
    }

    /// Like [`LoopbackPeer::serve`], but the peer outlives the transport —
    /// several consecutive client sessions can hit the same peer state.
    pub async fn serve_shared(
        peer: Arc<Mutex<LoopbackPeer>>,
        mut transport: crate::transport::ChannelTransport,
    ) {
        loop {
            match transport.wait(true).await {
                WaitResult::GotReply => {
                    let Some((data, _)) = transport.get_reply() else {
                        continue;
                    };
                    let reply = peer.lock().unwrap().handle(&data);
                    if transport.send(reply).is_err() {
                        break;
                    }
                }
                WaitResult::Active => continue,
                WaitResult::Closed | WaitResult::Inactive | WaitResult::Failed => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::JOHN_DOE;
    use crate::backend::SyncBackend;
    use crate::transport::ChannelTransport;

    fn client_adapter(dir: &Utf8Path, store: MemoryStore, mode: SyncMode) -> SourceAdapter {
        SourceAdapter::open(
            "addressbook",
            Box::new(MemoryBackend::with_store("addressbook", store)),
            dir,
            mode,
            std::time::Duration::ZERO,
        )
        .unwrap()
    }

    async fn run_sync(
        adapters: &mut [SourceAdapter],
        peer: LoopbackPeer,
        control: EngineControl,
    ) -> SyncOutcome {
        let (client_end, peer_end) = ChannelTransport::pair();
        let server = tokio::spawn(peer.serve(peer_end));

        let (events, _keepalive) = tokio::sync::mpsc::unbounded_channel();
        let mut engine = ClientEngine::new("sess-1", "client-dev", control, events);
        let mut transport = client_end;
        let outcome = engine.run(adapters, &mut transport).await;
        transport.shutdown().await;
        server.abort();
        outcome
    }

    #[tokio::test]
    async fn first_sync_uploads_local_items() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let mut seed = MemoryBackend::with_store("seed", store.clone());
        seed.open().unwrap();
        seed.insert(None, JOHN_DOE.as_bytes()).unwrap();

        let peer = LoopbackPeer::new(&dir.path().join("peer"), &["addressbook"]);
        let peer_store = peer.store("addressbook");
        let mut adapters = vec![client_adapter(
            &dir.path().join("client"),
            store,
            SyncMode::TwoWay,
        )];

        let outcome = run_sync(&mut adapters, peer, EngineControl::new()).await;
        assert_eq!(outcome.status, SyncStatus::OK);
        // first two-way is downgraded to a slow sync
        assert_eq!(outcome.per_source["addressbook"].mode, "slow");
        assert_eq!(peer_store.len(), 1);
    }

    #[tokio::test]
    async fn incremental_change_flows_both_ways() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let mut local = MemoryBackend::with_store("local", store.clone());
        local.open().unwrap();
        local.insert(None, JOHN_DOE.as_bytes()).unwrap();

        let peer_dir = dir.path().join("peer");
        let client_dir = dir.path().join("client");

        // first sync uploads
        let peer = LoopbackPeer::new(&peer_dir, &["addressbook"]);
        let peer_store = peer.store("addressbook");
        let mut adapters = vec![client_adapter(&client_dir, store.clone(), SyncMode::TwoWay)];
        let outcome = run_sync(&mut adapters, peer, EngineControl::new()).await;
        assert_eq!(outcome.status, SyncStatus::OK);
        drop(adapters);

        // second sync: a local add travels up, nothing comes down
        local
            .insert(None, b"BEGIN:VCARD\nVERSION:3.0\nFN:Jane Roe\nN:Roe;Jane\nEND:VCARD")
            .unwrap();
        let peer = LoopbackPeer::new(&peer_dir, &["addressbook"]);
        let peer = {
            // reuse the server-side store between the simulated runs
            let mut replacement = peer;
            replacement.stores.insert("addressbook".into(), peer_store.clone());
            replacement
        };
        let mut adapters = vec![client_adapter(&client_dir, store, SyncMode::TwoWay)];
        let outcome = run_sync(&mut adapters, peer, EngineControl::new()).await;
        assert_eq!(outcome.status, SyncStatus::OK);
        assert_eq!(outcome.per_source["addressbook"].mode, "two-way");
        assert_eq!(peer_store.len(), 2);
    }

    #[tokio::test]
    async fn inbound_conflict_merges_into_the_named_item() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut adapter = client_adapter(dir.path(), MemoryStore::new(), SyncMode::TwoWay);

        let john = adapter
            .insert_item_as_key(&ItemKey {
                luid: String::new(),
                data: JOHN_DOE.as_bytes().to_vec(),
            })
            .unwrap();
        let jane = adapter
            .insert_item_as_key(&ItemKey {
                luid: String::new(),
                data: b"BEGIN:VCARD\nVERSION:3.0\nFN:Jane Roe\nN:Roe;Jane\nEND:VCARD".to_vec(),
            })
            .unwrap();

        // an inbound update aimed at Jane's item but carrying John's
        // contact gets redirected onto John's item
        let (final_luid, was_merge) =
            put_inbound(&mut adapter, JOHN_DOE.as_bytes(), Some(&jane.luid)).unwrap();
        assert!(was_merge);
        assert_eq!(final_luid, john.luid);

        let data = adapter.read_item_by_key(&jane.luid).unwrap().data;
        assert!(String::from_utf8_lossy(&data).contains("Jane"));
    }

    #[tokio::test]
    async fn abort_during_wait_applies_nothing() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = MemoryStore::new();

        let peer = LoopbackPeer::new(&dir.path().join("peer"), &["addressbook"]);
        {
            let mut seed = MemoryBackend::with_store("seed", peer.store("addressbook"));
            seed.open().unwrap();
            seed.insert(None, JOHN_DOE.as_bytes()).unwrap();
        }

        let control = EngineControl::new();
        control.request_abort();
        let mut adapters = vec![client_adapter(
            &dir.path().join("client"),
            store.clone(),
            SyncMode::TwoWay,
        )];
        let outcome = run_sync(&mut adapters, peer, control).await;
        assert_eq!(outcome.status, SyncStatus::USER_ABORT);
        assert_eq!(store.len(), 0);
    }

    #[tokio::test]
    async fn refresh_from_server_mirrors_peer_state() {
        let dir = camino_tempfile::tempdir().unwrap();
        let store = MemoryStore::new();
        let mut local = MemoryBackend::with_store("local", store.clone());
        local.open().unwrap();
        local
            .insert(None, b"BEGIN:VCARD\nVERSION:3.0\nFN:Stale Local\nEND:VCARD")
            .unwrap();

        let peer = LoopbackPeer::new(&dir.path().join("peer"), &["addressbook"]);
        {
            let mut seed = MemoryBackend::with_store("seed", peer.store("addressbook"));
            seed.open().unwrap();
            seed.insert(None, JOHN_DOE.as_bytes()).unwrap();
        }

        let mut adapters = vec![client_adapter(
            &dir.path().join("client"),
            store.clone(),
            SyncMode::RefreshFromServer,
        )];
        let outcome = run_sync(&mut adapters, peer, EngineControl::new()).await;
        assert_eq!(outcome.status, SyncStatus::OK);
        assert_eq!(store.len(), 1);

        let mut check = MemoryBackend::with_store("check", store);
        check.open().unwrap();
        let all = check.list_all().unwrap();
        let data = check.read(all.keys().next().unwrap()).unwrap();
        assert_eq!(data, JOHN_DOE.as_bytes());
    }
}
