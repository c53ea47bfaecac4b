//! Fixed envelope encoding.
//!
//! # Layout
//!
//! All integers are big-endian. The envelope is always [`MESSAGE_SIZE`]
//! bytes; `size` records how much of it is used.
//!
//! ```text
//! +------+------+--------+------+------+-----------+------+--------------+-------+----------+
//! | type | size | sender | rank | dest | dest_rank | uuid | payload_size | flags | reserved |
//! |  u32 |  u32 |    i32 |  i32 |  i32 |       i32 |  16B |          u64 |   u32 |      u32 |
//! +------+------+--------+------+------+-----------+------+--------------+-------+----------+
//! | type-specific body, fixed width per type ...                      | zero padding        |
//! ```
//!
//! Strings occupy a fixed number of bytes, are NUL padded and always keep at
//! least one terminating NUL, so a string field of width `n` carries at most
//! `n - 1` bytes of UTF-8.

use bytes::{Buf, BufMut, BytesMut};
use uuid::Uuid;

use super::payload::*;
use super::{EnvelopeFlags, Header, Message, MessageType, HEADER_SIZE, MESSAGE_SIZE};
use crate::error::ProtocolError;
use crate::id::{Id, Identity};
use crate::object::{Meta, ObjectType};
use crate::parameter::{ParamType, ParamValue, ParamVector, Presentation, RangeType, MAX_DIMENSION};

// ── Field widths ────────────────────────────────────────────────────

pub const MODULE_NAME_LEN: usize = 50;
pub const PORT_NAME_LEN: usize = 32;
pub const PARAM_NAME_LEN: usize = 32;
pub const PARAM_VALUE_LEN: usize = 256;
pub const PARAM_CHOICE_LEN: usize = 50;
pub const OBJECT_NAME_LEN: usize = 32;
pub const TEXT_LEN: usize = 300;
pub const ADDRESS_LEN: usize = 200;
pub const DESCRIPTION_LEN: usize = 200;

/// Longest prefix of `s` that fits a field of `width` bytes.
pub fn truncate_to_field(s: &str, width: usize) -> &str {
    let max = width.saturating_sub(1);
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Writer ──────────────────────────────────────────────────────────

struct Writer {
    buf: BytesMut,
}

impl Writer {
    fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MESSAGE_SIZE),
        }
    }

    fn u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    fn bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    fn u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    fn u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    fn i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    fn i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    fn f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    fn id(&mut self, v: Id) {
        self.buf.put_i32(v.0);
    }

    fn uuid(&mut self, v: &Uuid) {
        self.buf.put_slice(v.as_bytes());
    }

    fn str(&mut self, s: &str, width: usize) {
        let s = truncate_to_field(s, width);
        self.buf.put_slice(s.as_bytes());
        self.buf.put_bytes(0, width - s.len());
    }

    fn meta(&mut self, m: &Meta) {
        for v in [
            m.block,
            m.num_blocks,
            m.timestep,
            m.num_timesteps,
            m.animation_step,
            m.num_animation_steps,
            m.iteration,
            m.execution_counter,
            m.creator,
        ] {
            self.i32(v);
        }
        self.f64(m.real_time);
        for v in m.transform {
            self.f64(v);
        }
    }

    fn message_type(&mut self, t: Option<MessageType>) {
        self.u32(t.map_or(0, MessageType::as_u32));
    }

    fn param_value(&mut self, v: &ParamValue) {
        self.u32(v.param_type().as_u32());
        let start = self.buf.len();
        match v {
            ParamValue::Integer(i) => {
                self.u32(1);
                self.i64(*i);
            }
            ParamValue::Float(f) => {
                self.u32(1);
                self.f64(*f);
            }
            ParamValue::Vector(vec) => {
                self.u32(vec.dim() as u32);
                vec.raw().iter().for_each(|c| self.f64(*c));
            }
            ParamValue::IntVector(vec) => {
                self.u32(vec.dim() as u32);
                vec.raw().iter().for_each(|c| self.i64(*c));
            }
            ParamValue::String(s) => {
                self.u32(0);
                self.str(s, PARAM_VALUE_LEN);
            }
        }
        // dim + union
        let used = self.buf.len() - start;
        self.buf.put_bytes(0, 4 + PARAM_VALUE_LEN - used);
    }

    fn port_info(&mut self, p: &PortInfo) {
        self.id(p.module);
        self.str(&p.name, PORT_NAME_LEN);
        self.u32(p.kind.as_u32());
        self.u32(p.flags);
        self.str(&p.description, DESCRIPTION_LEN);
    }

    fn link(&mut self, l: &Link) {
        self.id(l.module_a);
        self.str(&l.port_a, PORT_NAME_LEN);
        self.id(l.module_b);
        self.str(&l.port_b, PORT_NAME_LEN);
    }
}

// ── Reader ──────────────────────────────────────────────────────────

/// Bounds-checked cursor; every accessor fails with
/// [`ProtocolError::Truncated`] instead of panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ProtocolError> {
        let end = self.pos.checked_add(n).filter(|e| *e <= self.buf.len());
        match end {
            Some(end) => {
                let s = &self.buf[self.pos..end];
                self.pos = end;
                Ok(s)
            }
            None => Err(ProtocolError::Truncated {
                needed: self.pos.saturating_add(n),
                got: self.buf.len(),
            }),
        }
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take(1)?[0])
    }

    fn bool(&mut self) -> Result<bool, ProtocolError> {
        Ok(self.u8()? != 0)
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        Ok(self.take(2)?.get_u16())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(self.take(4)?.get_u32())
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        Ok(self.take(4)?.get_i32())
    }

    fn u64(&mut self) -> Result<u64, ProtocolError> {
        Ok(self.take(8)?.get_u64())
    }

    fn i64(&mut self) -> Result<i64, ProtocolError> {
        Ok(self.take(8)?.get_i64())
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        Ok(self.take(8)?.get_f64())
    }

    fn id(&mut self) -> Result<Id, ProtocolError> {
        self.i32().map(Id)
    }

    fn uuid(&mut self) -> Result<Uuid, ProtocolError> {
        let raw = self.take(16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(Uuid::from_bytes(bytes))
    }

    fn str(&mut self, width: usize, field: &'static str) -> Result<String, ProtocolError> {
        let raw = self.take(width)?;
        let len = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        std::str::from_utf8(&raw[..len])
            .map(str::to_owned)
            .map_err(|e| ProtocolError::BadField {
                field,
                value: e.valid_up_to() as i64,
            })
    }

    fn enum_u32<T>(
        &mut self,
        field: &'static str,
        conv: impl FnOnce(u32) -> Option<T>,
    ) -> Result<T, ProtocolError> {
        let v = self.u32()?;
        conv(v).ok_or(ProtocolError::BadField {
            field,
            value: v as i64,
        })
    }

    fn message_type(&mut self) -> Result<Option<MessageType>, ProtocolError> {
        match self.u32()? {
            0 => Ok(None),
            v => MessageType::from_u32(v)
                .map(Some)
                .ok_or(ProtocolError::UnknownType(v)),
        }
    }

    fn object_type(&mut self) -> Result<ObjectType, ProtocolError> {
        let v = self.i32()?;
        ObjectType::from_i32(v).ok_or(ProtocolError::BadField {
            field: "object_type",
            value: v as i64,
        })
    }

    fn meta(&mut self) -> Result<Meta, ProtocolError> {
        let mut m = Meta {
            block: self.i32()?,
            num_blocks: self.i32()?,
            timestep: self.i32()?,
            num_timesteps: self.i32()?,
            animation_step: self.i32()?,
            num_animation_steps: self.i32()?,
            iteration: self.i32()?,
            execution_counter: self.i32()?,
            creator: self.i32()?,
            real_time: self.f64()?,
            ..Meta::default()
        };
        for slot in m.transform.iter_mut() {
            *slot = self.f64()?;
        }
        Ok(m)
    }

    fn dim(&mut self) -> Result<usize, ProtocolError> {
        let dim = self.u32()?;
        if dim as usize > MAX_DIMENSION {
            return Err(ProtocolError::BadField {
                field: "dim",
                value: dim as i64,
            });
        }
        Ok(dim as usize)
    }

    fn param_value(&mut self) -> Result<ParamValue, ProtocolError> {
        let ty = self.enum_u32("param_type", ParamType::from_u32)?;
        let union = self.take(4 + PARAM_VALUE_LEN)?;
        let mut r = Reader::new(union);
        let value = match ty {
            ParamType::Integer => {
                r.u32()?;
                ParamValue::Integer(r.i64()?)
            }
            ParamType::Float => {
                r.u32()?;
                ParamValue::Float(r.f64()?)
            }
            ParamType::Vector => {
                let dim = r.dim()?;
                let mut raw = [0f64; MAX_DIMENSION];
                for slot in raw.iter_mut() {
                    *slot = r.f64()?;
                }
                ParamValue::Vector(ParamVector::from_raw(dim, raw))
            }
            ParamType::IntVector => {
                let dim = r.dim()?;
                let mut raw = [0i64; MAX_DIMENSION];
                for slot in raw.iter_mut() {
                    *slot = r.i64()?;
                }
                ParamValue::IntVector(ParamVector::from_raw(dim, raw))
            }
            ParamType::String => {
                r.u32()?;
                ParamValue::String(r.str(PARAM_VALUE_LEN, "param_value")?)
            }
            other => {
                return Err(ProtocolError::BadField {
                    field: "param_type",
                    value: other.as_u32() as i64,
                })
            }
        };
        Ok(value)
    }

    fn port_info(&mut self) -> Result<PortInfo, ProtocolError> {
        Ok(PortInfo {
            module: self.id()?,
            name: self.str(PORT_NAME_LEN, "port")?,
            kind: self.enum_u32("port_kind", PortKind::from_u32)?,
            flags: self.u32()?,
            description: self.str(DESCRIPTION_LEN, "description")?,
        })
    }

    fn link(&mut self) -> Result<Link, ProtocolError> {
        Ok(Link {
            module_a: self.id()?,
            port_a: self.str(PORT_NAME_LEN, "port_a")?,
            module_b: self.id()?,
            port_b: self.str(PORT_NAME_LEN, "port_b")?,
        })
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// Encode the envelope of `msg` into exactly [`MESSAGE_SIZE`] bytes.
///
/// The raw payload, if any, is not included; its length is written to the
/// header so the receiver knows how much follows.
pub fn encode(msg: &Message) -> Result<BytesMut, ProtocolError> {
    let mut w = Writer::new();
    let h = &msg.header;
    w.u32(msg.message_type().as_u32());
    w.u32(0); // patched below
    w.id(h.sender);
    w.i32(h.rank);
    w.id(h.dest);
    w.i32(h.dest_rank);
    w.uuid(&h.uuid);
    w.buf.put_u64(msg.raw_payload.as_ref().map_or(0, |p| p.len() as u64));
    w.u32(h.flags.bits());
    w.u32(0);
    debug_assert_eq!(w.buf.len(), HEADER_SIZE);

    encode_body(&mut w, &msg.payload);

    let size = w.buf.len();
    if size > MESSAGE_SIZE {
        return Err(ProtocolError::Oversized(msg.message_type()));
    }
    (&mut w.buf[4..8]).put_u32(size as u32);
    w.buf.put_bytes(0, MESSAGE_SIZE - size);
    Ok(w.buf)
}

/// Decode an envelope. `max_payload` caps the announced raw payload length.
///
/// Fails without side effects on any malformed input.
pub fn decode(buf: &[u8], max_payload: u64) -> Result<Message, ProtocolError> {
    let mut r = Reader::new(buf);
    let raw_type = r.u32()?;
    let message_type = MessageType::from_u32(raw_type).ok_or(ProtocolError::UnknownType(raw_type))?;
    let size = r.u32()? as usize;
    if !(HEADER_SIZE..=MESSAGE_SIZE).contains(&size) {
        return Err(ProtocolError::BadSize {
            size,
            min: HEADER_SIZE,
            max: MESSAGE_SIZE,
        });
    }
    if buf.len() < size {
        return Err(ProtocolError::Truncated {
            needed: size,
            got: buf.len(),
        });
    }
    let mut r = Reader {
        buf: &buf[..size],
        pos: r.pos,
    };

    let sender = r.id()?;
    let rank = r.i32()?;
    let dest = r.id()?;
    let dest_rank = r.i32()?;
    let uuid = r.uuid()?;
    let payload_size = r.u64()?;
    if payload_size > max_payload {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload_size,
            max: max_payload,
        });
    }
    let flags = EnvelopeFlags::from_bits_truncate(r.u32()?);
    r.u32()?;

    let payload = decode_body(&mut r, message_type)?;
    if r.pos != size {
        return Err(ProtocolError::BadSize {
            size,
            min: r.pos,
            max: r.pos,
        });
    }

    Ok(Message {
        header: Header {
            uuid,
            sender,
            rank,
            dest,
            dest_rank,
            payload_size,
            flags,
        },
        payload,
        raw_payload: None,
    })
}

fn encode_body(w: &mut Writer, payload: &Payload) {
    match payload {
        Payload::Identify { identity, name } => {
            w.u32(identity.as_u32());
            w.str(name, MODULE_NAME_LEN);
        }
        Payload::CloseConnection { reason } => w.str(reason, TEXT_LEN),
        Payload::AddHub {
            id,
            name,
            port,
            data_port,
            address,
        } => {
            w.id(*id);
            w.str(name, MODULE_NAME_LEN);
            w.u16(*port);
            w.u16(*data_port);
            w.str(address, ADDRESS_LEN);
        }
        Payload::RemoveHub { id } | Payload::SetId { id } => w.id(*id),
        Payload::ReplayFinished
        | Payload::Quit
        | Payload::Busy
        | Payload::Idle
        | Payload::Barrier
        | Payload::BarrierReached => {}
        Payload::Trace { traced, module, on } => {
            w.message_type(*traced);
            w.id(*module);
            w.bool(*on);
        }
        Payload::Spawn {
            hub,
            name,
            spawn_id,
            mpi_size,
            base_rank,
            rank_skip,
        } => {
            w.id(*hub);
            w.str(name, MODULE_NAME_LEN);
            w.id(*spawn_id);
            w.i32(*mpi_size);
            w.i32(*base_rank);
            w.i32(*rank_skip);
        }
        Payload::SpawnPrepared {
            hub,
            name,
            spawn_id,
        } => {
            w.id(*hub);
            w.str(name, MODULE_NAME_LEN);
            w.id(*spawn_id);
        }
        Payload::Kill { module } | Payload::CancelExecute { module } => w.id(*module),
        Payload::Started { name } => w.str(name, MODULE_NAME_LEN),
        Payload::ModuleExit { forwarded } => w.bool(*forwarded),
        Payload::Execute {
            what,
            module,
            execution_count,
            all_ranks,
            real_time,
            animation_step,
        } => {
            w.u32(what.as_u32());
            w.id(*module);
            w.i32(*execution_count);
            w.bool(*all_ranks);
            w.f64(*real_time);
            w.f64(*animation_step);
        }
        Payload::ExecutionProgress { stage } => w.u32(stage.as_u32()),
        Payload::AddObject {
            sender_port,
            dest_port,
            object_name,
            object_type,
            meta,
        } => {
            w.str(sender_port, PORT_NAME_LEN);
            w.str(dest_port, PORT_NAME_LEN);
            w.str(object_name, OBJECT_NAME_LEN);
            w.i32(object_type.as_i32());
            w.meta(meta);
        }
        Payload::AddObjectCompleted {
            object_name,
            origin,
        } => {
            w.str(object_name, OBJECT_NAME_LEN);
            w.id(*origin);
        }
        Payload::ObjectReceived {
            port,
            object_name,
            object_type,
        } => {
            w.str(port, PORT_NAME_LEN);
            w.str(object_name, OBJECT_NAME_LEN);
            w.i32(object_type.as_i32());
        }
        Payload::AddPort(p) | Payload::RemovePort(p) => w.port_info(p),
        Payload::Connect(l) | Payload::Disconnect(l) => w.link(l),
        Payload::AddParameter {
            module,
            name,
            description,
            group,
            param_type,
            presentation,
        } => {
            w.id(*module);
            w.str(name, PARAM_NAME_LEN);
            w.str(description, DESCRIPTION_LEN);
            w.str(group, PARAM_NAME_LEN);
            w.u32(param_type.as_u32());
            w.u32(presentation.as_u32());
        }
        Payload::RemoveParameter { module, name } => {
            w.id(*module);
            w.str(name, PARAM_NAME_LEN);
        }
        Payload::SetParameter {
            module,
            name,
            value,
            range,
            init,
            reply,
        } => {
            w.id(*module);
            w.str(name, PARAM_NAME_LEN);
            w.param_value(value);
            w.u32(range.as_u32());
            w.bool(*init);
            w.bool(*reply);
        }
        Payload::SetParameterChoices {
            module,
            name,
            choices,
        } => {
            w.id(*module);
            w.str(name, PARAM_NAME_LEN);
            let n = choices.len().min(MAX_CHOICES);
            w.u32(n as u32);
            for i in 0..MAX_CHOICES {
                w.str(choices.get(i).map_or("", String::as_str), PARAM_CHOICE_LEN);
            }
        }
        Payload::Ping { ch } => w.u8(*ch),
        Payload::Pong { ch, module } => {
            w.u8(*ch);
            w.id(*module);
        }
        Payload::SendText {
            text_type,
            reference_uuid,
            reference_type,
            truncated,
            text,
        } => {
            w.u32(text_type.as_u32());
            w.uuid(reference_uuid);
            w.message_type(*reference_type);
            w.bool(*truncated || truncate_to_field(text, TEXT_LEN).len() < text.len());
            w.str(text, TEXT_LEN);
        }
        Payload::ObjectReceivePolicy(p) => w.u32(p.as_u32()),
        Payload::SchedulingPolicy(p) => w.u32(p.as_u32()),
        Payload::ReducePolicy(p) => w.u32(p.as_u32()),
        Payload::ModuleAvailable { hub, name, path } => {
            w.id(*hub);
            w.str(name, MODULE_NAME_LEN);
            w.str(path, ADDRESS_LEN);
        }
        Payload::LockUi { locked } => w.bool(*locked),
        Payload::RequestTunnel {
            src_port,
            dest_host,
            dest_port,
            remove,
        } => {
            w.u16(*src_port);
            w.str(dest_host, ADDRESS_LEN);
            w.u16(*dest_port);
            w.bool(*remove);
        }
        Payload::RequestObject {
            object_name,
            referrer,
            array,
        }
        | Payload::SendObject {
            object_name,
            referrer,
            array,
        } => {
            w.str(object_name, OBJECT_NAME_LEN);
            w.str(referrer, OBJECT_NAME_LEN);
            w.bool(*array);
        }
    }
}

fn decode_body(r: &mut Reader<'_>, ty: MessageType) -> Result<Payload, ProtocolError> {
    let payload = match ty {
        MessageType::Identify => Payload::Identify {
            identity: r.enum_u32("identity", Identity::from_u32)?,
            name: r.str(MODULE_NAME_LEN, "name")?,
        },
        MessageType::CloseConnection => Payload::CloseConnection {
            reason: r.str(TEXT_LEN, "reason")?,
        },
        MessageType::AddHub => Payload::AddHub {
            id: r.id()?,
            name: r.str(MODULE_NAME_LEN, "name")?,
            port: r.u16()?,
            data_port: r.u16()?,
            address: r.str(ADDRESS_LEN, "address")?,
        },
        MessageType::RemoveHub => Payload::RemoveHub { id: r.id()? },
        MessageType::SetId => Payload::SetId { id: r.id()? },
        MessageType::ReplayFinished => Payload::ReplayFinished,
        MessageType::Trace => Payload::Trace {
            traced: r.message_type()?,
            module: r.id()?,
            on: r.bool()?,
        },
        MessageType::Spawn => Payload::Spawn {
            hub: r.id()?,
            name: r.str(MODULE_NAME_LEN, "name")?,
            spawn_id: r.id()?,
            mpi_size: r.i32()?,
            base_rank: r.i32()?,
            rank_skip: r.i32()?,
        },
        MessageType::SpawnPrepared => Payload::SpawnPrepared {
            hub: r.id()?,
            name: r.str(MODULE_NAME_LEN, "name")?,
            spawn_id: r.id()?,
        },
        MessageType::Kill => Payload::Kill { module: r.id()? },
        MessageType::Quit => Payload::Quit,
        MessageType::Started => Payload::Started {
            name: r.str(MODULE_NAME_LEN, "name")?,
        },
        MessageType::ModuleExit => Payload::ModuleExit {
            forwarded: r.bool()?,
        },
        MessageType::Busy => Payload::Busy,
        MessageType::Idle => Payload::Idle,
        MessageType::Execute => Payload::Execute {
            what: r.enum_u32("execute", ExecuteWhat::from_u32)?,
            module: r.id()?,
            execution_count: r.i32()?,
            all_ranks: r.bool()?,
            real_time: r.f64()?,
            animation_step: r.f64()?,
        },
        MessageType::ExecutionProgress => Payload::ExecutionProgress {
            stage: r.enum_u32("stage", ProgressStage::from_u32)?,
        },
        MessageType::CancelExecute => Payload::CancelExecute { module: r.id()? },
        MessageType::AddObject => Payload::AddObject {
            sender_port: r.str(PORT_NAME_LEN, "sender_port")?,
            dest_port: r.str(PORT_NAME_LEN, "dest_port")?,
            object_name: r.str(OBJECT_NAME_LEN, "object_name")?,
            object_type: r.object_type()?,
            meta: r.meta()?,
        },
        MessageType::AddObjectCompleted => Payload::AddObjectCompleted {
            object_name: r.str(OBJECT_NAME_LEN, "object_name")?,
            origin: r.id()?,
        },
        MessageType::ObjectReceived => Payload::ObjectReceived {
            port: r.str(PORT_NAME_LEN, "port")?,
            object_name: r.str(OBJECT_NAME_LEN, "object_name")?,
            object_type: r.object_type()?,
        },
        MessageType::AddPort => Payload::AddPort(r.port_info()?),
        MessageType::RemovePort => Payload::RemovePort(r.port_info()?),
        MessageType::Connect => Payload::Connect(r.link()?),
        MessageType::Disconnect => Payload::Disconnect(r.link()?),
        MessageType::AddParameter => Payload::AddParameter {
            module: r.id()?,
            name: r.str(PARAM_NAME_LEN, "name")?,
            description: r.str(DESCRIPTION_LEN, "description")?,
            group: r.str(PARAM_NAME_LEN, "group")?,
            param_type: r.enum_u32("param_type", ParamType::from_u32)?,
            presentation: r.enum_u32("presentation", Presentation::from_u32)?,
        },
        MessageType::RemoveParameter => Payload::RemoveParameter {
            module: r.id()?,
            name: r.str(PARAM_NAME_LEN, "name")?,
        },
        MessageType::SetParameter => Payload::SetParameter {
            module: r.id()?,
            name: r.str(PARAM_NAME_LEN, "name")?,
            value: r.param_value()?,
            range: r.enum_u32("range", RangeType::from_u32)?,
            init: r.bool()?,
            reply: r.bool()?,
        },
        MessageType::SetParameterChoices => {
            let module = r.id()?;
            let name = r.str(PARAM_NAME_LEN, "name")?;
            let n = r.u32()? as usize;
            if n > MAX_CHOICES {
                return Err(ProtocolError::BadField {
                    field: "num_choices",
                    value: n as i64,
                });
            }
            let mut choices = Vec::with_capacity(n);
            for i in 0..MAX_CHOICES {
                let c = r.str(PARAM_CHOICE_LEN, "choice")?;
                if i < n {
                    choices.push(c);
                }
            }
            Payload::SetParameterChoices {
                module,
                name,
                choices,
            }
        }
        MessageType::Ping => Payload::Ping { ch: r.u8()? },
        MessageType::Pong => Payload::Pong {
            ch: r.u8()?,
            module: r.id()?,
        },
        MessageType::Barrier => Payload::Barrier,
        MessageType::BarrierReached => Payload::BarrierReached,
        MessageType::SendText => Payload::SendText {
            text_type: r.enum_u32("text_type", TextType::from_u32)?,
            reference_uuid: r.uuid()?,
            reference_type: r.message_type()?,
            truncated: r.bool()?,
            text: r.str(TEXT_LEN, "text")?,
        },
        MessageType::ObjectReceivePolicy => {
            Payload::ObjectReceivePolicy(r.enum_u32("policy", ObjectReceivePolicy::from_u32)?)
        }
        MessageType::SchedulingPolicy => {
            Payload::SchedulingPolicy(r.enum_u32("policy", SchedulingPolicy::from_u32)?)
        }
        MessageType::ReducePolicy => {
            Payload::ReducePolicy(r.enum_u32("policy", ReducePolicy::from_u32)?)
        }
        MessageType::ModuleAvailable => Payload::ModuleAvailable {
            hub: r.id()?,
            name: r.str(MODULE_NAME_LEN, "name")?,
            path: r.str(ADDRESS_LEN, "path")?,
        },
        MessageType::LockUi => Payload::LockUi { locked: r.bool()? },
        MessageType::RequestTunnel => Payload::RequestTunnel {
            src_port: r.u16()?,
            dest_host: r.str(ADDRESS_LEN, "dest_host")?,
            dest_port: r.u16()?,
            remove: r.bool()?,
        },
        MessageType::RequestObject => Payload::RequestObject {
            object_name: r.str(OBJECT_NAME_LEN, "object_name")?,
            referrer: r.str(OBJECT_NAME_LEN, "referrer")?,
            array: r.bool()?,
        },
        MessageType::SendObject => Payload::SendObject {
            object_name: r.str(OBJECT_NAME_LEN, "object_name")?,
            referrer: r.str(OBJECT_NAME_LEN, "referrer")?,
            array: r.bool()?,
        },
    };
    Ok(payload)
}
