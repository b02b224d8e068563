//! Outbound message assembly.
//!
//! Outbound work is queued as packages (alerts, device info, local changes,
//! mappings) that write themselves into messages until complete. A package
//! that does not fit keeps its place at the front of the queue and continues
//! in the next message; oversized items are chunked with `MoreData`. Status
//! elements are never deferred: every inbound command's status goes out in
//! the corresponding response message, in arrival order.

use std::collections::VecDeque;

use tracing::debug;

use crate::proto::{
    AlertCode, ModificationType, StatusCode, CONTTYPE_DEVINF_XML, MAX_MSG_OVERHEAD_RATIO,
    MIN_MSG_OVERHEAD_BYTES, WBXML_COMPRESSION_RATE,
};
use crate::storage::SyncItemKey;
use crate::wire::{
    estimated_size, AlertParams, Challenge, CommandKind, CommandParams, Fragment, HeaderParams,
    ItemParams, MapItem, MapParams, MetaParams, OutgoingMessage, ResultsParams, StatusParams,
    SyncParams,
};

/// Smallest useful large-object chunk; below this the item is deferred to the
/// next message instead of being split.
const MIN_CHUNK_SIZE: u64 = 16;

/// Tracks one item we sent, so the peer's Status can be correlated back.
#[derive(Debug, Clone)]
pub struct ItemReference {
    pub msg_id: u32,
    pub cmd_id: u32,
    pub key: SyncItemKey,
    pub modification: ModificationType,
    pub local_database: String,
    pub remote_database: String,
    pub mime: String,
}

/// Tracks one Map command we sent.
#[derive(Debug, Clone)]
pub struct MapReference {
    pub msg_id: u32,
    pub cmd_id: u32,
    pub local_database: String,
    pub remote_database: String,
}

/// One modification queued for sending.
#[derive(Debug, Clone)]
pub struct OutboundItem {
    pub modification: ModificationType,
    /// Local key of the item.
    pub key: SyncItemKey,
    /// Peer's key, when a mapping exists (used for Replace/Delete targets).
    pub remote_key: Option<String>,
    pub parent_key: Option<String>,
    pub mime: String,
    pub format: Option<String>,
    pub version: Option<String>,
    pub data: Vec<u8>,
}

/// A large object partially sent; the remainder goes into following messages.
#[derive(Debug, Clone)]
struct OutboundLargeObject {
    item: OutboundItem,
    offset: usize,
}

/// Package of sync alerts and other one-shot commands for initialization.
#[derive(Debug, Clone)]
pub struct AlertPackage {
    pub code: u16,
    pub source_database: Option<String>,
    pub target_database: Option<String>,
    pub last_anchor: Option<String>,
    pub next_anchor: Option<String>,
    pub mime: Option<String>,
}

impl AlertPackage {
    /// Sync-initialization alert for a database pairing.
    pub fn sync_init(
        code: AlertCode,
        source_database: &str,
        target_database: &str,
        last_anchor: &str,
        next_anchor: &str,
    ) -> Self {
        AlertPackage {
            code: code.as_u16(),
            source_database: Some(source_database.to_string()),
            target_database: Some(target_database.to_string()),
            // Some peers reject an absent last anchor; send "0" instead.
            last_anchor: Some(if last_anchor.is_empty() { "0".to_string() } else { last_anchor.to_string() }),
            next_anchor: Some(next_anchor.to_string()),
            mime: None,
        }
    }

    /// Plain informative alert (222/224/225 and friends).
    pub fn informative(code: AlertCode) -> Self {
        AlertPackage {
            code: code.as_u16(),
            source_database: None,
            target_database: None,
            last_anchor: None,
            next_anchor: None,
            mime: None,
        }
    }
}

/// Local-changes package: one target's modifications, spanning as many
/// messages as needed.
#[derive(Debug, Clone)]
pub struct LocalChangesPackage {
    pub source_database: String,
    pub target_database: String,
    pub max_changes_per_message: u32,
    items: VecDeque<OutboundItem>,
    large_object: Option<OutboundLargeObject>,
    /// Total item count advertised as NumberOfChanges on the first message.
    number_of_changes: Option<u32>,
}

impl LocalChangesPackage {
    pub fn new(
        source_database: &str,
        target_database: &str,
        max_changes_per_message: u32,
        items: Vec<OutboundItem>,
    ) -> Self {
        let number_of_changes = Some(items.len() as u32);
        LocalChangesPackage {
            source_database: source_database.to_string(),
            target_database: target_database.to_string(),
            max_changes_per_message,
            items: items.into(),
            large_object: None,
            number_of_changes,
        }
    }
}

/// Mapping package for one target.
#[derive(Debug, Clone)]
pub struct MapPackage {
    pub source_database: String,
    pub target_database: String,
    pub map_items: Vec<MapItem>,
}

/// Device-info exchange commands.
#[derive(Debug, Clone)]
pub enum DevInfPackage {
    /// Push our device info.
    Put { path: String, payload: Vec<u8> },
    /// Request the peer's device info.
    Get { path: String },
    /// Answer a Get with our device info.
    Results { msg_ref: u32, cmd_ref: u32, path: String, payload: Vec<u8> },
}

/// Outbound work queued for upcoming messages.
#[derive(Debug, Clone)]
pub enum Package {
    Alert(AlertPackage),
    DevInf(DevInfPackage),
    LocalChanges(LocalChangesPackage),
    Map(MapPackage),
}

/// One generated message plus the references needed to correlate its
/// acknowledgements.
#[derive(Debug)]
pub struct GeneratedMessage {
    pub message: OutgoingMessage,
    pub item_refs: Vec<ItemReference>,
    pub map_refs: Vec<MapReference>,
}

/// Message under construction.
struct MessageBuilder {
    message: OutgoingMessage,
    next_cmd_id: u32,
    remaining: i64,
    item_refs: Vec<ItemReference>,
    map_refs: Vec<MapReference>,
}

impl MessageBuilder {
    fn new(header: HeaderParams, budget: u64) -> Self {
        let header_cost = estimated_size(&Fragment::Header(header.clone()));
        MessageBuilder {
            message: OutgoingMessage { header, body: Vec::new(), final_marker: false },
            next_cmd_id: 0,
            remaining: budget as i64 - header_cost as i64,
            item_refs: Vec::new(),
            map_refs: Vec::new(),
        }
    }

    fn msg_id(&self) -> u32 {
        self.message.header.msg_id
    }

    /// Command ids are strictly increasing within a message, starting at 1.
    fn next_cmd_id(&mut self) -> u32 {
        self.next_cmd_id += 1;
        self.next_cmd_id
    }

    fn push(&mut self, fragment: Fragment) {
        self.remaining -= estimated_size(&fragment) as i64;
        self.message.body.push(fragment);
    }

    fn remaining(&self) -> i64 {
        self.remaining
    }
}

/// Builds outbound messages from pending statuses and the package queue.
pub struct ResponseGenerator {
    local_header: HeaderParams,
    next_msg_id: u32,
    statuses: Vec<StatusParams>,
    packages: VecDeque<Package>,
    remote_max_msg_size: u64,
    use_wbxml: bool,
    ignore_statuses: bool,
}

impl ResponseGenerator {
    pub fn new() -> Self {
        ResponseGenerator {
            local_header: HeaderParams::default(),
            next_msg_id: 0,
            statuses: Vec::new(),
            packages: VecDeque::new(),
            remote_max_msg_size: crate::proto::DEFAULT_MAX_MESSAGE_SIZE,
            use_wbxml: false,
            ignore_statuses: false,
        }
    }

    pub fn local_header(&self) -> &HeaderParams {
        &self.local_header
    }

    pub fn local_header_mut(&mut self) -> &mut HeaderParams {
        &mut self.local_header
    }

    pub fn set_remote_max_msg_size(&mut self, size: u64) {
        self.remote_max_msg_size = size;
    }

    pub fn remote_max_msg_size(&self) -> u64 {
        self.remote_max_msg_size
    }

    pub fn set_use_wbxml(&mut self, use_wbxml: bool) {
        self.use_wbxml = use_wbxml;
    }

    /// Honor a peer `NoResp`: drop statuses instead of queueing them.
    pub fn set_ignore_statuses(&mut self, ignore: bool) {
        self.ignore_statuses = ignore;
    }

    pub fn next_msg_id(&self) -> u32 {
        self.next_msg_id
    }

    pub fn add_status(&mut self, status: StatusParams) {
        if !self.ignore_statuses {
            self.statuses.push(status);
        }
    }

    pub fn add_package(&mut self, package: Package) {
        self.packages.push_back(package);
    }

    pub fn clear_packages(&mut self) {
        self.packages.clear();
    }

    pub fn packages_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn has_pending_statuses(&self) -> bool {
        !self.statuses.is_empty()
    }

    /// Build the next outbound message: header, every pending status in
    /// arrival order, then as much of the package queue as the size budget
    /// allows. The `Final` marker is set when the queue drained completely.
    pub fn generate_next_message(&mut self) -> GeneratedMessage {
        self.next_msg_id += 1;

        let mut header = self.local_header.clone();
        header.msg_id = self.next_msg_id;

        let mut builder = MessageBuilder::new(header, self.message_budget());

        for mut status in self.statuses.drain(..) {
            status.cmd_id = builder.next_cmd_id();
            builder.push(Fragment::Status(status));
        }

        while let Some(package) = self.packages.front_mut() {
            let complete = write_package(package, &mut builder);
            if complete {
                self.packages.pop_front();
            } else {
                // Out of room; the package continues in the next message.
                break;
            }
            if builder.remaining() <= 0 {
                break;
            }
        }

        let final_marker = self.packages.is_empty();
        if !final_marker {
            // More of this package follows in the next message.
            let mut alert = alert_fragment(&AlertPackage::informative(AlertCode::NextMessage));
            if let Fragment::Alert(a) = &mut alert {
                a.cmd_id = builder.next_cmd_id();
            }
            builder.push(alert);
        }

        debug!(
            msg_id = builder.msg_id(),
            fragments = builder.message.body.len(),
            final_marker,
            "generated outbound message"
        );

        let MessageBuilder { mut message, item_refs, map_refs, .. } = builder;
        message.final_marker = final_marker;

        GeneratedMessage { message, item_refs, map_refs }
    }

    /// Usable payload budget for one message, accounting for envelope
    /// overhead and WbXML compression.
    fn message_budget(&self) -> u64 {
        let max = self.remote_max_msg_size;
        let overhead = ((max as f64 * MAX_MSG_OVERHEAD_RATIO) as u64).max(MIN_MSG_OVERHEAD_BYTES);
        let budget = max.saturating_sub(overhead);
        if self.use_wbxml {
            // The estimate models XML; WbXML output is denser.
            (budget as f64 / WBXML_COMPRESSION_RATE) as u64
        } else {
            budget
        }
    }
}

impl Default for ResponseGenerator {
    fn default() -> Self {
        ResponseGenerator::new()
    }
}

fn write_package(package: &mut Package, builder: &mut MessageBuilder) -> bool {
    match package {
        Package::Alert(alert) => {
            let mut fragment = alert_fragment(alert);
            if let Fragment::Alert(a) = &mut fragment {
                a.cmd_id = builder.next_cmd_id();
            }
            builder.push(fragment);
            true
        }
        Package::DevInf(devinf) => {
            write_devinf(devinf, builder);
            true
        }
        Package::Map(map) => {
            let cmd_id = builder.next_cmd_id();
            builder.map_refs.push(MapReference {
                msg_id: builder.msg_id(),
                cmd_id,
                local_database: map.source_database.clone(),
                remote_database: map.target_database.clone(),
            });
            builder.push(Fragment::Map(MapParams {
                cmd_id,
                target: map.target_database.clone(),
                source: map.source_database.clone(),
                map_items: map.map_items.clone(),
            }));
            true
        }
        Package::LocalChanges(changes) => write_local_changes(changes, builder),
    }
}

fn alert_fragment(alert: &AlertPackage) -> Fragment {
    Fragment::Alert(AlertParams {
        cmd_id: 0,
        no_resp: false,
        code: alert.code,
        cred: None,
        target_database: alert.target_database.clone(),
        source_database: alert.source_database.clone(),
        last_anchor: alert.last_anchor.clone(),
        next_anchor: alert.next_anchor.clone(),
        mime: alert.mime.clone(),
    })
}

fn write_devinf(devinf: &DevInfPackage, builder: &mut MessageBuilder) {
    match devinf {
        DevInfPackage::Put { path, payload } => {
            let cmd_id = builder.next_cmd_id();
            builder.push(Fragment::Command(CommandParams {
                kind: CommandKind::Put,
                cmd_id,
                no_resp: false,
                meta: MetaParams {
                    mime: Some(CONTTYPE_DEVINF_XML.to_string()),
                    ..Default::default()
                },
                items: vec![ItemParams {
                    source: Some(path.clone()),
                    data: payload.clone(),
                    ..Default::default()
                }],
            }));
        }
        DevInfPackage::Get { path } => {
            let cmd_id = builder.next_cmd_id();
            builder.push(Fragment::Command(CommandParams {
                kind: CommandKind::Get,
                cmd_id,
                no_resp: false,
                meta: MetaParams {
                    mime: Some(CONTTYPE_DEVINF_XML.to_string()),
                    ..Default::default()
                },
                items: vec![ItemParams {
                    target: Some(path.clone()),
                    ..Default::default()
                }],
            }));
        }
        DevInfPackage::Results { msg_ref, cmd_ref, path, payload } => {
            let cmd_id = builder.next_cmd_id();
            builder.push(Fragment::Results(ResultsParams {
                cmd_id,
                msg_ref: *msg_ref,
                cmd_ref: *cmd_ref,
                target_ref: None,
                source_ref: Some(path.clone()),
                meta: MetaParams {
                    mime: Some(CONTTYPE_DEVINF_XML.to_string()),
                    ..Default::default()
                },
                items: vec![ItemParams {
                    source: Some(path.clone()),
                    data: payload.clone(),
                    ..Default::default()
                }],
            }));
        }
    }
}

/// Write as much of a local-changes package as fits. Returns true when the
/// package is complete.
fn write_local_changes(changes: &mut LocalChangesPackage, builder: &mut MessageBuilder) -> bool {
    let sync_cmd_id = builder.next_cmd_id();
    let mut sync = SyncParams {
        cmd_id: sync_cmd_id,
        no_resp: false,
        target_database: changes.target_database.clone(),
        source_database: changes.source_database.clone(),
        number_of_changes: changes.number_of_changes.take(),
        meta: MetaParams::default(),
        commands: Vec::new(),
    };

    // Charge the container scaffolding up front.
    builder.remaining -= estimated_size(&Fragment::Sync(SyncParams {
        commands: Vec::new(),
        ..sync.clone()
    })) as i64;

    let mut written = 0u32;
    let mut complete = true;

    // Resume an in-flight large object first; its continuation must not be
    // interleaved with other items.
    if let Some(lo) = changes.large_object.take() {
        match write_large_object_chunk(lo, changes, builder, &mut sync) {
            LargeObjectWrite::Finished => {}
            LargeObjectWrite::MoreChunks => {
                complete = false;
                push_sync(builder, sync);
                return complete;
            }
        }
        written += 1;
    }

    while written < changes.max_changes_per_message {
        if builder.remaining() <= 0 {
            complete = false;
            break;
        }

        let Some(item) = changes.items.pop_front() else {
            break;
        };

        let item_cost = outbound_item_cost(&item);
        if item_cost as i64 > builder.remaining() {
            // Too big for the space left. If this message already carries
            // other work, carry the item over whole; a fresh message may fit
            // it. If the item is the first thing in the message it can never
            // fit whole, so chunk it.
            let can_defer = written > 0
                || builder.message.body.iter().any(|f| matches!(f, Fragment::Status(_)));
            if can_defer {
                changes.items.push_front(item);
                complete = false;
                break;
            }
            let lo = OutboundLargeObject { item, offset: 0 };
            match write_large_object_chunk(lo, changes, builder, &mut sync) {
                LargeObjectWrite::Finished => {
                    written += 1;
                    continue;
                }
                LargeObjectWrite::MoreChunks => {
                    complete = false;
                    break;
                }
            }
        }

        write_plain_item(item, changes, builder, &mut sync);
        written += 1;
    }

    if !changes.items.is_empty() || changes.large_object.is_some() {
        complete = false;
    }

    push_sync(builder, sync);
    complete
}

enum LargeObjectWrite {
    Finished,
    MoreChunks,
}

fn write_large_object_chunk(
    mut lo: OutboundLargeObject,
    changes: &mut LocalChangesPackage,
    builder: &mut MessageBuilder,
    sync: &mut SyncParams,
) -> LargeObjectWrite {
    let overhead = outbound_item_overhead(&lo.item);
    let available = (builder.remaining() - overhead as i64).max(0) as usize;
    let rest = lo.item.data.len() - lo.offset;
    // Always move at least a minimal chunk so a tight budget cannot stall
    // the package; the estimate overshooting the budget slightly is fine.
    let chunk_len = available.max(MIN_CHUNK_SIZE as usize).min(rest);

    let first_chunk = lo.offset == 0;
    let last_chunk = chunk_len == rest;
    let chunk = lo.item.data[lo.offset..lo.offset + chunk_len].to_vec();
    let total_size = lo.item.data.len() as u64;

    let cmd_id = register_item_command(&lo.item, changes, builder, sync, chunk, !last_chunk, first_chunk.then_some(total_size));
    builder.remaining -= chunk_len as i64 + overhead as i64;

    debug!(
        cmd_id,
        offset = lo.offset,
        chunk_len,
        last_chunk,
        "wrote large object chunk"
    );

    if last_chunk {
        LargeObjectWrite::Finished
    } else {
        lo.offset += chunk_len;
        changes.large_object = Some(lo);
        LargeObjectWrite::MoreChunks
    }
}

fn write_plain_item(
    item: OutboundItem,
    changes: &mut LocalChangesPackage,
    builder: &mut MessageBuilder,
    sync: &mut SyncParams,
) {
    let cost = outbound_item_cost(&item);
    let data = item.data.clone();
    register_item_command(&item, changes, builder, sync, data, false, None);
    builder.remaining -= cost as i64;
}

/// Append the wire command for one item (or chunk) and record its reference.
fn register_item_command(
    item: &OutboundItem,
    changes: &LocalChangesPackage,
    builder: &mut MessageBuilder,
    sync: &mut SyncParams,
    data: Vec<u8>,
    more_data: bool,
    declared_size: Option<u64>,
) -> u32 {
    let cmd_id = builder.next_cmd_id();

    let kind = match item.modification {
        ModificationType::Addition => CommandKind::Add,
        ModificationType::Modification => CommandKind::Replace,
        ModificationType::Deletion => CommandKind::Delete,
    };

    // Additions identify the item by our key (Source); replaces and deletes
    // address the peer's copy (Target) when a mapping exists.
    let (source, target) = match kind {
        CommandKind::Add => (Some(item.key.clone()), None),
        _ => match &item.remote_key {
            Some(remote) => (None, Some(remote.clone())),
            None => (Some(item.key.clone()), None),
        },
    };

    let wire_item = ItemParams {
        more_data,
        source,
        target,
        source_parent: item.parent_key.clone(),
        target_parent: None,
        data,
        meta: MetaParams {
            size: declared_size,
            ..Default::default()
        },
    };

    sync.commands.push(CommandParams {
        kind,
        cmd_id,
        no_resp: false,
        meta: MetaParams {
            mime: Some(item.mime.clone()),
            format: item.format.clone(),
            version: item.version.clone(),
            ..Default::default()
        },
        items: vec![wire_item],
    });

    builder.item_refs.push(ItemReference {
        msg_id: builder.msg_id(),
        cmd_id,
        key: item.key.clone(),
        modification: item.modification,
        local_database: changes.source_database.clone(),
        remote_database: changes.target_database.clone(),
        mime: item.mime.clone(),
    });

    cmd_id
}

fn push_sync(builder: &mut MessageBuilder, sync: SyncParams) {
    // Size was charged incrementally; push without double-charging.
    builder.message.body.push(Fragment::Sync(sync));
}

fn outbound_item_overhead(item: &OutboundItem) -> u64 {
    180 + item.key.len() as u64
        + item.remote_key.as_ref().map_or(0, |k| k.len() as u64)
        + item.mime.len() as u64
}

fn outbound_item_cost(item: &OutboundItem) -> u64 {
    outbound_item_overhead(item) + item.data.len() as u64
}

/// Status for an inbound header.
pub fn status_for_header(
    header: &HeaderParams,
    code: StatusCode,
    challenge: Option<Challenge>,
) -> StatusParams {
    StatusParams {
        cmd_id: 0,
        msg_ref: header.msg_id,
        cmd_ref: 0,
        cmd: "SyncHdr".to_string(),
        target_ref: Some(header.target_device.clone()),
        source_ref: Some(header.source_device.clone()),
        code: code.as_u16(),
        next_anchor: None,
        items: Vec::new(),
        chal: challenge,
    }
}

/// Status for an inbound command identified by (msg id, cmd id).
pub fn status_for_command(
    msg_ref: u32,
    cmd_ref: u32,
    cmd: &str,
    code: StatusCode,
) -> StatusParams {
    StatusParams {
        cmd_id: 0,
        msg_ref,
        cmd_ref,
        cmd: cmd.to_string(),
        target_ref: None,
        source_ref: None,
        code: code.as_u16(),
        next_anchor: None,
        items: Vec::new(),
        chal: None,
    }
}
