//! Wire-level message model.
//!
//! A parsed SyncML message is an ordered sequence of protocol fragments; the
//! engine dispatches over the `Fragment` tagged union in arrival order. The
//! actual XML/WbXML (de)serialization is behind the [`codec::MessageCodec`]
//! seam; everything here is codec-agnostic.

pub mod codec;

use serde::{Deserialize, Serialize};

use crate::proto::{AlertCode, StatusCode};

/// Last/Next anchor pair carried in item metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorParams {
    #[serde(default)]
    pub last: Option<String>,
    #[serde(default)]
    pub next: Option<String>,
}

/// Meta element contents attached to commands, items and credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaParams {
    /// Declared total size of the item (`Size`), required on the first chunk
    /// of a large object.
    #[serde(default)]
    pub size: Option<u64>,
    /// MIME type (`Type`).
    #[serde(default)]
    pub mime: Option<String>,
    /// Encoding or auth format (`Format`), e.g. `b64` or `syncml:auth-md5`.
    #[serde(default)]
    pub format: Option<String>,
    /// Item data version (`Version`).
    #[serde(default)]
    pub version: Option<String>,
    /// MD5 next-nonce carried in a challenge (`NextNonce`).
    #[serde(default)]
    pub next_nonce: Option<String>,
    #[serde(default)]
    pub anchor: AnchorParams,
    #[serde(default)]
    pub max_msg_size: Option<u64>,
    #[serde(default)]
    pub max_obj_size: Option<u64>,
}

/// One `Item` element.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemParams {
    #[serde(default)]
    pub more_data: bool,
    /// Source LocURI: the sender's key for the item.
    #[serde(default)]
    pub source: Option<String>,
    /// Target LocURI: the receiver's key for the item, when the sender knows it.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub source_parent: Option<String>,
    #[serde(default)]
    pub target_parent: Option<String>,
    #[serde(default)]
    pub data: Vec<u8>,
    #[serde(default)]
    pub meta: MetaParams,
}

/// `Cred` element: authentication data plus its meta (type and format).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub data: String,
    #[serde(default)]
    pub meta: MetaParams,
}

/// `Chal` element: a challenge issued inside a Status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    #[serde(default)]
    pub meta: MetaParams,
}

/// SyncML message header (`SyncHdr`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderParams {
    pub ver_dtd: String,
    pub ver_proto: String,
    pub session_id: String,
    pub msg_id: u32,
    /// `Target/LocURI`: the device the message is addressed to.
    pub target_device: String,
    /// `Source/LocURI`: the device the message originates from.
    pub source_device: String,
    #[serde(default)]
    pub max_msg_size: Option<u64>,
    #[serde(default)]
    pub max_obj_size: Option<u64>,
    #[serde(default)]
    pub resp_uri: Option<String>,
    #[serde(default)]
    pub cred: Option<Credentials>,
    #[serde(default)]
    pub no_resp: bool,
}

/// Item-carrying command kinds that may appear inside a Sync container or
/// standalone (Get/Put for device info).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandKind {
    Add,
    Replace,
    Delete,
    Get,
    Put,
}

impl CommandKind {
    /// The element name used in `Cmd` references of Status elements.
    pub fn element_name(&self) -> &'static str {
        match self {
            CommandKind::Add => "Add",
            CommandKind::Replace => "Replace",
            CommandKind::Delete => "Delete",
            CommandKind::Get => "Get",
            CommandKind::Put => "Put",
        }
    }
}

/// A generic item command (Add/Replace/Delete/Get/Put).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandParams {
    pub kind: CommandKind,
    pub cmd_id: u32,
    #[serde(default)]
    pub no_resp: bool,
    #[serde(default)]
    pub meta: MetaParams,
    #[serde(default)]
    pub items: Vec<ItemParams>,
}

/// `Alert` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertParams {
    pub cmd_id: u32,
    #[serde(default)]
    pub no_resp: bool,
    pub code: u16,
    #[serde(default)]
    pub cred: Option<Credentials>,
    /// Remote database URI (`Target/LocURI` of the alert item).
    #[serde(default)]
    pub target_database: Option<String>,
    /// Local database URI as the peer knows it (`Source/LocURI`).
    #[serde(default)]
    pub source_database: Option<String>,
    #[serde(default)]
    pub last_anchor: Option<String>,
    #[serde(default)]
    pub next_anchor: Option<String>,
    #[serde(default)]
    pub mime: Option<String>,
}

impl AlertParams {
    pub fn alert_code(&self) -> Option<AlertCode> {
        AlertCode::from_u16(self.code)
    }
}

/// `Status` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusParams {
    pub cmd_id: u32,
    /// `MsgRef`: message id of the command this status responds to.
    pub msg_ref: u32,
    /// `CmdRef`: command id of the command this status responds to.
    pub cmd_ref: u32,
    /// `Cmd`: element name of the referenced command.
    pub cmd: String,
    #[serde(default)]
    pub target_ref: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    pub code: u16,
    #[serde(default)]
    pub next_anchor: Option<String>,
    #[serde(default)]
    pub items: Vec<ItemParams>,
    #[serde(default)]
    pub chal: Option<Challenge>,
}

impl StatusParams {
    pub fn status_code(&self) -> Option<StatusCode> {
        StatusCode::from_u16(self.code)
    }
}

/// One `MapItem`: `target` is the key issued by the map receiver, `source`
/// the key of the map sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapItem {
    pub target: String,
    pub source: String,
}

/// `Map` element.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapParams {
    pub cmd_id: u32,
    /// Remote database URI.
    pub target: String,
    /// Local database URI.
    pub source: String,
    #[serde(default)]
    pub map_items: Vec<MapItem>,
}

/// `Results` element, currently only used for device-info responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultsParams {
    pub cmd_id: u32,
    pub msg_ref: u32,
    pub cmd_ref: u32,
    #[serde(default)]
    pub target_ref: Option<String>,
    #[serde(default)]
    pub source_ref: Option<String>,
    #[serde(default)]
    pub meta: MetaParams,
    #[serde(default)]
    pub items: Vec<ItemParams>,
}

/// `Sync` container: item commands scoped to one database pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncParams {
    pub cmd_id: u32,
    #[serde(default)]
    pub no_resp: bool,
    /// Receiver's database URI.
    pub target_database: String,
    /// Sender's database URI.
    pub source_database: String,
    #[serde(default)]
    pub number_of_changes: Option<u32>,
    #[serde(default)]
    pub meta: MetaParams,
    #[serde(default)]
    pub commands: Vec<CommandParams>,
}

/// A protocol fragment in message order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Fragment {
    Header(HeaderParams),
    Status(StatusParams),
    Alert(AlertParams),
    Sync(SyncParams),
    Map(MapParams),
    Results(ResultsParams),
    Command(CommandParams),
    Final,
}

/// A fully parsed inbound message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedMessage {
    pub fragments: Vec<Fragment>,
}

impl ParsedMessage {
    pub fn is_last_in_package(&self) -> bool {
        self.fragments.iter().any(|f| matches!(f, Fragment::Final))
    }

    pub fn header(&self) -> Option<&HeaderParams> {
        self.fragments.iter().find_map(|f| match f {
            Fragment::Header(h) => Some(h),
            _ => None,
        })
    }
}

/// An outbound message under construction or ready for encoding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub header: HeaderParams,
    pub body: Vec<Fragment>,
    /// Whether the message closes the current package (`Final` element).
    pub final_marker: bool,
}

/// Rough serialized-size estimate of a fragment, used for outbound message
/// size budgeting. Intentionally pessimistic: element scaffolding is charged
/// per field whether or not the codec ends up emitting it compactly.
pub fn estimated_size(fragment: &Fragment) -> u64 {
    match fragment {
        Fragment::Header(h) => {
            220
                + str_len(&h.ver_dtd)
                + str_len(&h.ver_proto)
                + str_len(&h.session_id)
                + str_len(&h.target_device)
                + str_len(&h.source_device)
                + h.cred.as_ref().map_or(0, cred_size)
        }
        Fragment::Status(s) => {
            120
                + str_len(&s.cmd)
                + opt_len(&s.target_ref)
                + opt_len(&s.source_ref)
                + opt_len(&s.next_anchor)
                + s.items.iter().map(item_size).sum::<u64>()
                + s.chal.as_ref().map_or(0, |c| meta_size(&c.meta) + 40)
        }
        Fragment::Alert(a) => {
            100
                + opt_len(&a.target_database)
                + opt_len(&a.source_database)
                + opt_len(&a.last_anchor)
                + opt_len(&a.next_anchor)
                + opt_len(&a.mime)
        }
        Fragment::Sync(s) => {
            110
                + str_len(&s.target_database)
                + str_len(&s.source_database)
                + s.commands.iter().map(command_size).sum::<u64>()
        }
        Fragment::Map(m) => {
            90
                + str_len(&m.target)
                + str_len(&m.source)
                + m.map_items
                    .iter()
                    .map(|mi| 60 + str_len(&mi.target) + str_len(&mi.source))
                    .sum::<u64>()
        }
        Fragment::Results(r) => {
            100
                + opt_len(&r.target_ref)
                + opt_len(&r.source_ref)
                + meta_size(&r.meta)
                + r.items.iter().map(item_size).sum::<u64>()
        }
        Fragment::Command(c) => command_size(c),
        Fragment::Final => 16,
    }
}

fn command_size(c: &CommandParams) -> u64 {
    70 + meta_size(&c.meta) + c.items.iter().map(item_size).sum::<u64>()
}

fn item_size(item: &ItemParams) -> u64 {
    60
        + opt_len(&item.source)
        + opt_len(&item.target)
        + opt_len(&item.source_parent)
        + opt_len(&item.target_parent)
        + item.data.len() as u64
        + meta_size(&item.meta)
}

fn meta_size(meta: &MetaParams) -> u64 {
    let mut size = 0;
    if meta.size.is_some() {
        size += 30;
    }
    size += opt_len(&meta.mime);
    size += opt_len(&meta.format);
    size += opt_len(&meta.version);
    size += opt_len(&meta.next_nonce);
    size += opt_len(&meta.anchor.last);
    size += opt_len(&meta.anchor.next);
    if size > 0 {
        size += 40;
    }
    size
}

fn cred_size(cred: &Credentials) -> u64 {
    60 + cred.data.len() as u64 + meta_size(&cred.meta)
}

fn str_len(s: &str) -> u64 {
    s.len() as u64 + 16
}

fn opt_len(s: &Option<String>) -> u64 {
    s.as_ref().map_or(0, |v| v.len() as u64 + 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn final_detection() {
        let msg = ParsedMessage {
            fragments: vec![Fragment::Final],
        };
        assert!(msg.is_last_in_package());

        let msg = ParsedMessage { fragments: vec![] };
        assert!(!msg.is_last_in_package());
    }

    #[test]
    fn item_payload_dominates_estimate() {
        let small = Fragment::Command(CommandParams {
            kind: CommandKind::Add,
            cmd_id: 1,
            no_resp: false,
            meta: MetaParams::default(),
            items: vec![ItemParams::default()],
        });
        let big = Fragment::Command(CommandParams {
            kind: CommandKind::Add,
            cmd_id: 1,
            no_resp: false,
            meta: MetaParams::default(),
            items: vec![ItemParams {
                data: vec![b'x'; 4096],
                ..Default::default()
            }],
        });
        assert!(estimated_size(&big) >= estimated_size(&small) + 4096);
    }
}
