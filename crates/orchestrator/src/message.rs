//! Wire messages of the zone-transfer / session-key protocol.
//!
//! Every message is prefixed by an 8-byte header: byte 1 is the subsystem
//! tag (this crate only ever emits and accepts [`MASTER_SUBSYSTEM`]), byte 3
//! is the [`MessageKind`]. The remaining header bytes are reserved and
//! written as zero. Payloads are bit-packed little-endian, decoded with
//! [`wire::Reader`] and encoded with [`wire::Writer`].

use anyhow::{bail, Context as _};
use bytes::{Bytes, BytesMut};
use wire::{Reader, Writer};

/// Subsystem tag this crate reads and writes at header byte 1.
pub const MASTER_SUBSYSTEM: u8 = 3;

/// Size of the fixed message header in bytes.
pub const HEADER_LEN: usize = 8;

/// Message kinds the orchestrator understands, matching header byte 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    RequestPersistentId = 1,
    PersistentIdResponse = 2,
    RequestZoneTransfer = 3,
    ZoneTransferResponse = 4,
    ServerInfo = 5,
    SetSessionKey = 6,
    NewSessionAlert = 7,
    RequestSessionKey = 8,
    SessionKeyResponse = 9,
    PlayerAdded = 10,
    PlayerRemoved = 11,
    CreatePrivateZone = 12,
    RequestPrivateZone = 13,
    WorldReady = 14,
    PrepZone = 15,
    AffirmTransferResponse = 16,
    Shutdown = 17,
    ShutdownResponse = 18,
    ShutdownUniverse = 19,
    ShutdownInstance = 20,
    GetInstances = 21,
    RespondInstances = 22,
}

impl TryFrom<u8> for MessageKind {
    type Error = anyhow::Error;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use MessageKind::*;
        Ok(match byte {
            1 => RequestPersistentId,
            2 => PersistentIdResponse,
            3 => RequestZoneTransfer,
            4 => ZoneTransferResponse,
            5 => ServerInfo,
            6 => SetSessionKey,
            7 => NewSessionAlert,
            8 => RequestSessionKey,
            9 => SessionKeyResponse,
            10 => PlayerAdded,
            11 => PlayerRemoved,
            12 => CreatePrivateZone,
            13 => RequestPrivateZone,
            14 => WorldReady,
            15 => PrepZone,
            16 => AffirmTransferResponse,
            17 => Shutdown,
            18 => ShutdownResponse,
            19 => ShutdownUniverse,
            20 => ShutdownInstance,
            21 => GetInstances,
            22 => RespondInstances,
            other => bail!("unknown message kind byte {other:#x}"),
        })
    }
}

/// The server kind carried by [`ServerInfo`]'s `serverType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerType {
    World,
    Chat,
    Unknown(u32),
}

impl From<u32> for ServerType {
    fn from(value: u32) -> Self {
        match value {
            0 => ServerType::World,
            1 => ServerType::Chat,
            other => ServerType::Unknown(other),
        }
    }
}

impl From<ServerType> for u32 {
    fn from(value: ServerType) -> Self {
        match value {
            ServerType::World => 0,
            ServerType::Chat => 1,
            ServerType::Unknown(v) => v,
        }
    }
}

/// A single `(mapID, cloneID, instanceID)` triple, as carried by
/// [`Message::RespondInstances`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceTriple {
    pub map_id: u16,
    pub clone_id: u32,
    pub instance_id: u16,
}

/// A fully decoded protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RequestPersistentId { request_id: u64 },
    PersistentIdResponse { request_id: u64, object_id: u32 },

    RequestZoneTransfer { request_id: u64, mythran_shift: bool, zone_id: u32, clone_id: u32 },
    ZoneTransferResponse {
        request_id: u64,
        mythran_shift: bool,
        map_id: u16,
        instance_id: u16,
        clone_id: u32,
        ip: String,
        port: u16,
    },

    ServerInfo { port: u32, zone_id: u32, instance_id: u32, server_type: ServerType, ip: String },

    SetSessionKey { session_key: u32, username: String },
    NewSessionAlert { session_key: u32, username: String },
    RequestSessionKey { username: String },
    SessionKeyResponse { session_key: u32, username: String },

    PlayerAdded { map_id: u16, instance_id: u16 },
    PlayerRemoved { map_id: u16, instance_id: u16 },

    CreatePrivateZone { map_id: u32, clone_id: u32, password: String },
    RequestPrivateZone { request_id: u64, mythran_shift: bool, password: String },

    WorldReady { zone_id: u16, instance_id: u16 },
    PrepZone { zone_id: i32 },
    AffirmTransferResponse { request_id: u64 },

    Shutdown,
    ShutdownResponse,
    ShutdownUniverse,
    ShutdownInstance { zone_id: u32, instance_id: u16 },

    GetInstances { object_id: u64, zone_id: Option<u16>, responding_zone_id: u16, responding_instance_id: u16 },
    RespondInstances { object_id: u64, instances: Vec<InstanceTriple> },
}

impl Message {
    /// The wire kind this message encodes as.
    pub fn kind(&self) -> MessageKind {
        use Message::*;
        match self {
            RequestPersistentId { .. } => MessageKind::RequestPersistentId,
            PersistentIdResponse { .. } => MessageKind::PersistentIdResponse,
            RequestZoneTransfer { .. } => MessageKind::RequestZoneTransfer,
            ZoneTransferResponse { .. } => MessageKind::ZoneTransferResponse,
            ServerInfo { .. } => MessageKind::ServerInfo,
            SetSessionKey { .. } => MessageKind::SetSessionKey,
            NewSessionAlert { .. } => MessageKind::NewSessionAlert,
            RequestSessionKey { .. } => MessageKind::RequestSessionKey,
            SessionKeyResponse { .. } => MessageKind::SessionKeyResponse,
            PlayerAdded { .. } => MessageKind::PlayerAdded,
            PlayerRemoved { .. } => MessageKind::PlayerRemoved,
            CreatePrivateZone { .. } => MessageKind::CreatePrivateZone,
            RequestPrivateZone { .. } => MessageKind::RequestPrivateZone,
            WorldReady { .. } => MessageKind::WorldReady,
            PrepZone { .. } => MessageKind::PrepZone,
            AffirmTransferResponse { .. } => MessageKind::AffirmTransferResponse,
            Shutdown => MessageKind::Shutdown,
            ShutdownResponse => MessageKind::ShutdownResponse,
            ShutdownUniverse => MessageKind::ShutdownUniverse,
            ShutdownInstance { .. } => MessageKind::ShutdownInstance,
            GetInstances { .. } => MessageKind::GetInstances,
            RespondInstances { .. } => MessageKind::RespondInstances,
        }
    }

    /// Prepends the 8-byte header and serializes the payload.
    pub fn encode(&self) -> Bytes {
        let mut w = Writer::new();
        self.encode_payload(&mut w);
        let payload = w.into_bytes();

        let mut header = BytesMut::with_capacity(HEADER_LEN + payload.len());
        header.extend_from_slice(&[0u8; HEADER_LEN]);
        header[1] = MASTER_SUBSYSTEM;
        header[3] = self.kind() as u8;
        header.extend_from_slice(&payload);

        header.freeze()
    }

    fn encode_payload(&self, w: &mut Writer) {
        use Message::*;
        match self {
            RequestPersistentId { request_id } => {
                w.write_u64(*request_id);
            }
            PersistentIdResponse { request_id, object_id } => {
                w.write_u64(*request_id).write_u32(*object_id);
            }
            RequestZoneTransfer { request_id, mythran_shift, zone_id, clone_id } => {
                w.write_u64(*request_id).write_u8(*mythran_shift as u8).write_u32(*zone_id).write_u32(*clone_id);
            }
            ZoneTransferResponse { request_id, mythran_shift, map_id, instance_id, clone_id, ip, port } => {
                w.write_u64(*request_id)
                    .write_u8(*mythran_shift as u8)
                    .write_u16(*map_id)
                    .write_u16(*instance_id)
                    .write_u32(*clone_id)
                    .write_fixed_string(ip, 24)
                    .write_u16(*port);
            }
            ServerInfo { port, zone_id, instance_id, server_type, ip } => {
                w.write_u32(*port)
                    .write_u32(*zone_id)
                    .write_u32(*instance_id)
                    .write_u32((*server_type).into())
                    .write_fixed_string(ip, 24);
            }
            SetSessionKey { session_key, username } => {
                w.write_u32(*session_key).write_fixed_string(username, 12);
            }
            NewSessionAlert { session_key, username } => {
                w.write_u32(*session_key).write_len_prefixed_string(username);
            }
            RequestSessionKey { username } => {
                w.write_fixed_string(username, 8);
            }
            SessionKeyResponse { session_key, username } => {
                w.write_u32(*session_key).write_fixed_string(username, 64);
            }
            PlayerAdded { map_id, instance_id } | PlayerRemoved { map_id, instance_id } => {
                w.write_u16(*map_id).write_u16(*instance_id);
            }
            CreatePrivateZone { map_id, clone_id, password } => {
                w.write_u32(*map_id).write_u32(*clone_id).write_len_prefixed_string(password);
            }
            RequestPrivateZone { request_id, mythran_shift, password } => {
                w.write_u64(*request_id).write_u8(*mythran_shift as u8).write_len_prefixed_string(password);
            }
            WorldReady { zone_id, instance_id } => {
                w.write_u16(*zone_id).write_u16(*instance_id);
            }
            PrepZone { zone_id } => {
                w.write_i32(*zone_id);
            }
            AffirmTransferResponse { request_id } => {
                w.write_u64(*request_id);
            }
            Shutdown | ShutdownResponse | ShutdownUniverse => {}
            ShutdownInstance { zone_id, instance_id } => {
                w.write_u32(*zone_id).write_u16(*instance_id);
            }
            GetInstances { object_id, zone_id, responding_zone_id, responding_instance_id } => {
                w.write_u64(*object_id);
                match zone_id {
                    Some(id) => {
                        w.write_u8(1).write_u16(*id);
                    }
                    None => {
                        w.write_u8(0);
                    }
                };
                w.write_u16(*responding_zone_id).write_u16(*responding_instance_id);
            }
            RespondInstances { object_id, instances } => {
                w.write_u64(*object_id).write_u32(instances.len() as u32);
                for triple in instances {
                    w.write_u16(triple.map_id).write_u32(triple.clone_id).write_u16(triple.instance_id);
                }
            }
        }
    }

    /// Decodes a payload given the kind already read from the header.
    pub fn decode(kind: MessageKind, body: &[u8]) -> anyhow::Result<Message> {
        let mut r = Reader::new(body);

        Ok(match kind {
            MessageKind::RequestPersistentId => Message::RequestPersistentId { request_id: r.read_u64()? },
            MessageKind::PersistentIdResponse => {
                Message::PersistentIdResponse { request_id: r.read_u64()?, object_id: r.read_u32()? }
            }
            MessageKind::RequestZoneTransfer => Message::RequestZoneTransfer {
                request_id: r.read_u64()?,
                mythran_shift: r.read_u8()? != 0,
                zone_id: r.read_u32()?,
                clone_id: r.read_u32()?,
            },
            MessageKind::ZoneTransferResponse => Message::ZoneTransferResponse {
                request_id: r.read_u64()?,
                mythran_shift: r.read_u8()? != 0,
                map_id: r.read_u16()?,
                instance_id: r.read_u16()?,
                clone_id: r.read_u32()?,
                ip: r.read_fixed_string(24)?,
                port: r.read_u16()?,
            },
            MessageKind::ServerInfo => Message::ServerInfo {
                port: r.read_u32()?,
                zone_id: r.read_u32()?,
                instance_id: r.read_u32()?,
                server_type: r.read_u32()?.into(),
                ip: r.read_fixed_string(24)?,
            },
            MessageKind::SetSessionKey => {
                Message::SetSessionKey { session_key: r.read_u32()?, username: r.read_fixed_string(12)? }
            }
            MessageKind::NewSessionAlert => {
                Message::NewSessionAlert { session_key: r.read_u32()?, username: r.read_len_prefixed_string()? }
            }
            MessageKind::RequestSessionKey => Message::RequestSessionKey { username: r.read_fixed_string(8)? },
            MessageKind::SessionKeyResponse => {
                Message::SessionKeyResponse { session_key: r.read_u32()?, username: r.read_fixed_string(64)? }
            }
            MessageKind::PlayerAdded => Message::PlayerAdded { map_id: r.read_u16()?, instance_id: r.read_u16()? },
            MessageKind::PlayerRemoved => Message::PlayerRemoved { map_id: r.read_u16()?, instance_id: r.read_u16()? },
            MessageKind::CreatePrivateZone => Message::CreatePrivateZone {
                map_id: r.read_u32()?,
                clone_id: r.read_u32()?,
                password: r.read_len_prefixed_string()?,
            },
            MessageKind::RequestPrivateZone => Message::RequestPrivateZone {
                request_id: r.read_u64()?,
                mythran_shift: r.read_u8()? != 0,
                password: r.read_len_prefixed_string()?,
            },
            MessageKind::WorldReady => Message::WorldReady { zone_id: r.read_u16()?, instance_id: r.read_u16()? },
            MessageKind::PrepZone => Message::PrepZone { zone_id: r.read_i32()? },
            MessageKind::AffirmTransferResponse => Message::AffirmTransferResponse { request_id: r.read_u64()? },
            MessageKind::Shutdown => Message::Shutdown,
            MessageKind::ShutdownResponse => Message::ShutdownResponse,
            MessageKind::ShutdownUniverse => Message::ShutdownUniverse,
            MessageKind::ShutdownInstance => {
                Message::ShutdownInstance { zone_id: r.read_u32()?, instance_id: r.read_u16()? }
            }
            MessageKind::GetInstances => {
                let object_id = r.read_u64()?;
                let has_zone = r.read_u8()? != 0;
                let zone_id = if has_zone { Some(r.read_u16()?) } else { None };
                let responding_zone_id = r.read_u16()?;
                let responding_instance_id = r.read_u16()?;

                Message::GetInstances { object_id, zone_id, responding_zone_id, responding_instance_id }
            }
            MessageKind::RespondInstances => {
                let object_id = r.read_u64()?;
                let count = r.read_u32()?;
                let mut instances = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    instances.push(InstanceTriple {
                        map_id: r.read_u16()?,
                        clone_id: r.read_u32()?,
                        instance_id: r.read_u16()?,
                    });
                }

                Message::RespondInstances { object_id, instances }
            }
        })
    }

    /// Splits a raw frame into its header and decodes the payload, rejecting
    /// frames addressed to a different subsystem.
    pub fn decode_frame(frame: &[u8]) -> anyhow::Result<Message> {
        if frame.len() < HEADER_LEN {
            bail!("frame shorter than header ({} bytes)", frame.len());
        }

        let subsystem = frame[1];
        if subsystem != MASTER_SUBSYSTEM {
            bail!("frame addressed to subsystem {subsystem:#x}, not the master");
        }

        let kind = MessageKind::try_from(frame[3]).context("decoding message kind")?;
        Message::decode(kind, &frame[HEADER_LEN..])
    }
}
