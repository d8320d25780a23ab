//! Wire encoding of the seven message kinds multiplexed over the
//! replication stream, in the tag-byte-dispatched style of
//! `safekeeper::safekeeper::{ProposerAcceptorMessage, AcceptorProposerMessage}`.
//!
//! Every message carries a fixed prologue: channel tag `"bdr"`, a 32-bit
//! message kind, the origin `NodeId`, and a reserved `name` field (always
//! empty for now, carried for wire compatibility with a future named-lock
//! extension).

use bytes::{Buf, BufMut, BytesMut};
use utils::id::NodeId;
use utils::lsn::Lsn;

use crate::lock_state::LockKind;

pub const CHANNEL_TAG: &[u8; 3] = b"bdr";

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u32)]
enum Tag {
    Start = 0,
    Acquire = 1,
    Decline = 2,
    Confirm = 3,
    Release = 4,
    RequestReplay = 5,
    ReplayConfirm = 6,
}

impl Tag {
    fn from_u32(v: u32) -> Option<Tag> {
        Some(match v {
            0 => Tag::Start,
            1 => Tag::Acquire,
            2 => Tag::Decline,
            3 => Tag::Confirm,
            4 => Tag::Release,
            5 => Tag::RequestReplay,
            6 => Tag::ReplayConfirm,
            _ => return None,
        })
    }
}

/// A message as received off the replication stream: the origin that sent
/// it plus its decoded payload. `origin` is distinct from any `target`
/// field the payload itself carries (the node whose lock it refers to).
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct InboundMessage {
    pub origin: NodeId,
    pub payload: Payload,
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Payload {
    Start,
    Acquire { kind: LockKind },
    Decline { target: NodeId, kind: LockKind },
    Confirm { target: NodeId, kind: LockKind },
    Release { target: NodeId },
    RequestReplay { wait_lsn: Lsn },
    ReplayConfirm { request_lsn: Lsn },
}

impl Payload {
    /// Whether this message must be logged transactionally (crash-atomic
    /// with whatever journal update accompanies it). Only `CONFIRM` is;
    /// `START` is explicitly non-transactional and emitted before any
    /// other work at process start.
    pub fn is_transactional(&self) -> bool {
        matches!(self, Payload::Confirm { .. })
    }

    fn tag(&self) -> Tag {
        match self {
            Payload::Start => Tag::Start,
            Payload::Acquire { .. } => Tag::Acquire,
            Payload::Decline { .. } => Tag::Decline,
            Payload::Confirm { .. } => Tag::Confirm,
            Payload::Release { .. } => Tag::Release,
            Payload::RequestReplay { .. } => Tag::RequestReplay,
            Payload::ReplayConfirm { .. } => Tag::ReplayConfirm,
        }
    }
}

fn kind_to_wire(kind: LockKind) -> u32 {
    match kind {
        LockKind::None => 0,
        LockKind::Ddl => 1,
        LockKind::Write => 2,
    }
}

fn kind_from_wire(v: u32) -> Option<LockKind> {
    match v {
        0 => Some(LockKind::None),
        1 => Some(LockKind::Ddl),
        2 => Some(LockKind::Write),
        _ => None,
    }
}

fn put_node_id(buf: &mut BytesMut, id: NodeId) {
    buf.put_u64_le(id.sysid);
    buf.put_u32_le(id.timeline);
    buf.put_u32_le(id.dbid);
}

fn get_node_id(buf: &mut impl Buf) -> anyhow::Result<NodeId> {
    anyhow::ensure!(buf.remaining() >= 16, "truncated NodeId");
    let sysid = buf.get_u64_le();
    let timeline = buf.get_u32_le();
    let dbid = buf.get_u32_le();
    Ok(NodeId::new(sysid, timeline, dbid))
}

/// Serializes a message with its prologue. `origin` is this node's own
/// identity, stamped on every outgoing message.
pub fn serialize(origin: NodeId, payload: &Payload) -> BytesMut {
    let mut buf = BytesMut::new();
    buf.put_slice(CHANNEL_TAG);
    buf.put_u32_le(payload.tag() as u32);
    put_node_id(&mut buf, origin);
    // reserved `name` field: a length-prefixed empty string.
    buf.put_u32_le(0);

    match payload {
        Payload::Start => {}
        Payload::Acquire { kind } => buf.put_u32_le(kind_to_wire(*kind)),
        Payload::Decline { target, kind } | Payload::Confirm { target, kind } => {
            put_node_id(&mut buf, *target);
            buf.put_u32_le(kind_to_wire(*kind));
        }
        Payload::Release { target } => put_node_id(&mut buf, *target),
        Payload::RequestReplay { wait_lsn } => buf.put_u64_le(wait_lsn.0),
        Payload::ReplayConfirm { request_lsn } => buf.put_u64_le(request_lsn.0),
    }
    buf
}

/// Parses a message previously produced by [`serialize`]. Returns the
/// origin carried in the prologue and the decoded payload.
pub fn parse(mut buf: impl Buf) -> anyhow::Result<InboundMessage> {
    anyhow::ensure!(buf.remaining() >= 3, "truncated channel tag");
    let mut tag_buf = [0u8; 3];
    buf.copy_to_slice(&mut tag_buf);
    anyhow::ensure!(&tag_buf == CHANNEL_TAG, "unrecognized channel tag");

    anyhow::ensure!(buf.remaining() >= 4, "truncated message kind");
    let kind_tag = buf.get_u32_le();
    let tag = Tag::from_u32(kind_tag)
        .ok_or_else(|| anyhow::anyhow!("unrecognized message kind {kind_tag}"))?;

    let origin = get_node_id(&mut buf)?;

    anyhow::ensure!(buf.remaining() >= 4, "truncated name field");
    let name_len = buf.get_u32_le() as usize;
    anyhow::ensure!(buf.remaining() >= name_len, "truncated name payload");
    buf.advance(name_len);

    let payload = match tag {
        Tag::Start => Payload::Start,
        Tag::Acquire => {
            anyhow::ensure!(buf.remaining() >= 4, "truncated ACQUIRE payload");
            let kind = kind_from_wire(buf.get_u32_le())
                .ok_or_else(|| anyhow::anyhow!("unrecognized lock kind on wire"))?;
            Payload::Acquire { kind }
        }
        Tag::Decline | Tag::Confirm => {
            let target = get_node_id(&mut buf)?;
            anyhow::ensure!(buf.remaining() >= 4, "truncated kind field");
            let kind = kind_from_wire(buf.get_u32_le())
                .ok_or_else(|| anyhow::anyhow!("unrecognized lock kind on wire"))?;
            if tag == Tag::Decline {
                Payload::Decline { target, kind }
            } else {
                Payload::Confirm { target, kind }
            }
        }
        Tag::Release => {
            let target = get_node_id(&mut buf)?;
            Payload::Release { target }
        }
        Tag::RequestReplay => {
            anyhow::ensure!(buf.remaining() >= 8, "truncated REQUEST_REPLAY payload");
            Payload::RequestReplay {
                wait_lsn: Lsn::from(buf.get_u64_le()),
            }
        }
        Tag::ReplayConfirm => {
            anyhow::ensure!(buf.remaining() >= 8, "truncated REPLAY_CONFIRM payload");
            Payload::ReplayConfirm {
                request_lsn: Lsn::from(buf.get_u64_le()),
            }
        }
    };

    Ok(InboundMessage { origin, payload })
}

/// Convenience wrapper around [`parse`] for transports that hand us a
/// reader instead of an already-buffered frame.
pub fn parse_from_reader(mut r: impl std::io::Read) -> anyhow::Result<InboundMessage> {
    let mut buf = Vec::new();
    r.read_to_end(&mut buf)?;
    parse(&buf[..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(n: u64) -> NodeId {
        NodeId::new(n, 1, 5)
    }

    fn round_trip(origin: NodeId, payload: Payload) {
        let buf = serialize(origin, &payload);
        let parsed = parse(&buf[..]).expect("parse");
        assert_eq!(parsed.origin, origin);
        assert_eq!(parsed.payload, payload);
    }

    #[test]
    fn round_trips_all_seven_kinds() {
        let origin = node(1);
        round_trip(origin, Payload::Start);
        round_trip(
            origin,
            Payload::Acquire {
                kind: LockKind::Ddl,
            },
        );
        round_trip(
            origin,
            Payload::Decline {
                target: node(2),
                kind: LockKind::Write,
            },
        );
        round_trip(
            origin,
            Payload::Confirm {
                target: node(2),
                kind: LockKind::Ddl,
            },
        );
        round_trip(origin, Payload::Release { target: node(2) });
        round_trip(
            origin,
            Payload::RequestReplay {
                wait_lsn: Lsn::from(42),
            },
        );
        round_trip(
            origin,
            Payload::ReplayConfirm {
                request_lsn: Lsn::from(42),
            },
        );
    }

    #[test]
    fn confirm_is_the_only_transactional_kind() {
        assert!(Payload::Confirm {
            target: node(2),
            kind: LockKind::Ddl,
        }
        .is_transactional());
        assert!(!Payload::Start.is_transactional());
        assert!(!Payload::Release { target: node(2) }.is_transactional());
    }

    #[test]
    fn rejects_wrong_channel_tag() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"xyz");
        buf.put_u32_le(0);
        put_node_id(&mut buf, node(1));
        buf.put_u32_le(0);
        assert!(parse(&buf[..]).is_err());
    }
}
