//! Protocol message definitions
//!
//! A message is a kind, a protocol version and one of three payload shapes.
//! The kind alone decides which shape follows the header on the wire.

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use super::codec::{
    check_string, decode_string, decode_u32, encode_string, encode_u32, string_size, CodecError,
    CodecResult, LengthField,
};
use super::PROTOCOL_VERSION;

/// Bytes taken by the kind and version fields
pub const HEADER_SIZE: usize = 8;

/// Smallest possible encoded variable record: kind, name length, 1-byte name, value
const MIN_VAR_SIZE: usize = 13;

/// Message kind identifiers, numbered in wire order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageKind {
    None = 0,
    NodeDescr = 1,
    AppDescr = 2,
    DaemonReg = 3,
    ClientReg = 4,
    VarDescr = 5,
    VarReq = 6,
    VarSet = 7,
    ClientUnreg = 8,
    Confirm = 9,
    Fail = 10,
    PerfUpdate = 11,
    ProbeReq = 12,
    ProbeSet = 13,
    TclvarReq = 14,
    Database = 15,
    WithConf = 16,
    Projection = 17,
    SimConsReq = 18,
    SimConsResult = 19,
    ProjReq = 20,
    ProjResult = 21,
}

/// The three payload layouts a message can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadShape {
    Registration,
    Description,
    Update,
}

impl MessageKind {
    pub const ALL: [MessageKind; 22] = [
        MessageKind::None,
        MessageKind::NodeDescr,
        MessageKind::AppDescr,
        MessageKind::DaemonReg,
        MessageKind::ClientReg,
        MessageKind::VarDescr,
        MessageKind::VarReq,
        MessageKind::VarSet,
        MessageKind::ClientUnreg,
        MessageKind::Confirm,
        MessageKind::Fail,
        MessageKind::PerfUpdate,
        MessageKind::ProbeReq,
        MessageKind::ProbeSet,
        MessageKind::TclvarReq,
        MessageKind::Database,
        MessageKind::WithConf,
        MessageKind::Projection,
        MessageKind::SimConsReq,
        MessageKind::SimConsResult,
        MessageKind::ProjReq,
        MessageKind::ProjResult,
    ];

    /// Look up a kind by its wire value
    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    /// Payload layout for this kind, `None` for the placeholder kind `NONE`
    pub fn shape(self) -> Option<PayloadShape> {
        use MessageKind as K;
        match self {
            K::None => None,
            K::DaemonReg | K::ClientReg | K::ClientUnreg | K::Confirm | K::Fail => {
                Some(PayloadShape::Registration)
            }
            K::NodeDescr
            | K::AppDescr
            | K::VarDescr
            | K::TclvarReq
            | K::Database
            | K::WithConf
            | K::Projection
            | K::SimConsReq
            | K::SimConsResult
            | K::ProjReq
            | K::ProjResult => Some(PayloadShape::Description),
            K::VarReq | K::VarSet | K::PerfUpdate | K::ProbeReq | K::ProbeSet => {
                Some(PayloadShape::Update)
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        use MessageKind as K;
        match self {
            K::None => "NONE",
            K::NodeDescr => "NODE_DESCR",
            K::AppDescr => "APP_DESCR",
            K::DaemonReg => "DAEMON_REG",
            K::ClientReg => "CLIENT_REG",
            K::VarDescr => "VAR_DESCR",
            K::VarReq => "VAR_REQ",
            K::VarSet => "VAR_SET",
            K::ClientUnreg => "CLIENT_UNREG",
            K::Confirm => "CONFIRM",
            K::Fail => "FAIL",
            K::PerfUpdate => "PERF_UPDATE",
            K::ProbeReq => "PROBE_REQ",
            K::ProbeSet => "PROBE_SET",
            K::TclvarReq => "TCLVAR_REQ",
            K::Database => "DATABASE",
            K::WithConf => "WITH_CONF",
            K::Projection => "PROJECTION",
            K::SimConsReq => "SIM_CONS_REQ",
            K::SimConsResult => "SIM_CONS_RESULT",
            K::ProjReq => "PROJ_REQ",
            K::ProjResult => "PROJ_RESULT",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag of a variable record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum VarKind {
    Integer = 0,
    String = 1,
}

impl VarKind {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(VarKind::Integer),
            1 => Some(VarKind::String),
            _ => None,
        }
    }

    /// Zero value of this kind
    pub fn default_value(self) -> VarValue {
        match self {
            VarKind::Integer => VarValue::Integer(0),
            VarKind::String => VarValue::String(String::new()),
        }
    }
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarKind::Integer => f.write_str("int"),
            VarKind::String => f.write_str("str"),
        }
    }
}

/// Value held by a variable record
///
/// Integers travel as 32-bit big-endian words, so host values are kept as
/// `i32` rather than silently narrowed at encode time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VarValue {
    Integer(i32),
    String(String),
}

impl VarValue {
    pub fn kind(&self) -> VarKind {
        match self {
            VarValue::Integer(_) => VarKind::Integer,
            VarValue::String(_) => VarKind::String,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            VarValue::Integer(v) => Some(*v),
            VarValue::String(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            VarValue::String(s) => Some(s),
            VarValue::Integer(_) => None,
        }
    }
}

impl fmt::Display for VarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VarValue::Integer(v) => write!(f, "{}", v),
            VarValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// A named, typed tunable variable
///
/// `shadow` stages values received from the server; it only reaches `value`
/// through [`VarDef::pull`]. Only `value` travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarDef {
    pub name: String,
    pub value: VarValue,
    pub shadow: VarValue,
}

impl VarDef {
    pub fn new(name: impl Into<String>, value: VarValue) -> Self {
        Self {
            name: name.into(),
            shadow: value.clone(),
            value,
        }
    }

    pub fn integer(name: impl Into<String>, value: i32) -> Self {
        Self::new(name, VarValue::Integer(value))
    }

    pub fn string(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, VarValue::String(value.into()))
    }

    pub fn kind(&self) -> VarKind {
        self.value.kind()
    }

    /// Copy the staged shadow value into the live value
    pub fn pull(&mut self) {
        self.value = self.shadow.clone();
    }

    /// Check name and value limits without encoding
    pub fn validate(&self) -> CodecResult<()> {
        if self.name.is_empty() {
            return Err(CodecError::EmptyName);
        }
        // Declarations are whitespace separated, so names cannot contain any.
        if self.name.contains(char::is_whitespace) {
            return Err(CodecError::WhitespaceInName(self.name.clone()));
        }
        check_string(&self.name, LengthField::U32)?;
        if let VarValue::String(s) = &self.value {
            check_string(s, LengthField::U32)?;
        }
        Ok(())
    }

    /// Encoded size of this record
    pub fn encoded_len(&self) -> usize {
        let value_len = match &self.value {
            VarValue::Integer(_) => 4,
            VarValue::String(s) => string_size(s, LengthField::U32),
        };
        4 + string_size(&self.name, LengthField::U32) + value_len
    }

    /// Encode kind, name and value. Nothing is written if the record is invalid.
    pub fn encode(&self, buf: &mut impl BufMut) -> CodecResult<()> {
        self.validate()?;
        encode_u32(buf, self.kind() as u32);
        encode_string(buf, &self.name, LengthField::U32)?;
        match &self.value {
            VarValue::Integer(v) => encode_u32(buf, *v as u32),
            VarValue::String(s) => encode_string(buf, s, LengthField::U32)?,
        }
        Ok(())
    }

    /// Decode a record; the shadow starts equal to the value
    pub fn decode(buf: &mut impl Buf) -> CodecResult<Self> {
        let raw_kind = decode_u32(buf)?;
        let kind = VarKind::from_u32(raw_kind).ok_or(CodecError::UnknownVarKind(raw_kind))?;
        let name = decode_string(buf, LengthField::U32)?;
        if name.is_empty() {
            return Err(CodecError::EmptyName);
        }
        let value = match kind {
            VarKind::Integer => VarValue::Integer(decode_u32(buf)? as i32),
            VarKind::String => VarValue::String(decode_string(buf, LengthField::U32)?),
        };
        Ok(Self::new(name, value))
    }
}

/// Variant payload of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Registration bookkeeping; `param` depends on the kind
    Registration { param: u32, client_id: u32 },
    /// A single opaque string
    Description { text: String },
    /// Variable records stamped with the session timestamp
    Update { timestamp: u32, vars: Vec<VarDef> },
}

impl Payload {
    pub fn shape(&self) -> PayloadShape {
        match self {
            Payload::Registration { .. } => PayloadShape::Registration,
            Payload::Description { .. } => PayloadShape::Description,
            Payload::Update { .. } => PayloadShape::Update,
        }
    }

    fn size(&self) -> usize {
        match self {
            Payload::Registration { .. } => 8,
            Payload::Description { text } => string_size(text, LengthField::U16),
            Payload::Update { vars, .. } => 8 + vars.iter().map(VarDef::encoded_len).sum::<usize>(),
        }
    }

    fn validate(&self) -> CodecResult<()> {
        match self {
            Payload::Registration { .. } => Ok(()),
            Payload::Description { text } => check_string(text, LengthField::U16),
            Payload::Update { vars, .. } => vars.iter().try_for_each(VarDef::validate),
        }
    }
}

/// A protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    kind: MessageKind,
    version: u32,
    payload: Payload,
}

impl Message {
    /// Build a message; the payload must match the kind's shape
    pub fn new(kind: MessageKind, payload: Payload) -> CodecResult<Self> {
        if kind.shape() != Some(payload.shape()) {
            return Err(CodecError::UnsupportedKind(kind));
        }
        Ok(Self {
            kind,
            version: PROTOCOL_VERSION,
            payload,
        })
    }

    /// Registration request; `signal_mode` asks the server to pre-push values
    pub fn client_reg(signal_mode: bool, client_id: u32) -> Self {
        Self::registration(MessageKind::ClientReg, signal_mode as u32, client_id)
    }

    pub fn client_unreg(client_id: u32) -> Self {
        Self::registration(MessageKind::ClientUnreg, 0, client_id)
    }

    pub fn confirm(param: u32, client_id: u32) -> Self {
        Self::registration(MessageKind::Confirm, param, client_id)
    }

    pub fn fail() -> Self {
        Self::registration(MessageKind::Fail, 0, 0)
    }

    fn registration(kind: MessageKind, param: u32, client_id: u32) -> Self {
        Self {
            kind,
            version: PROTOCOL_VERSION,
            payload: Payload::Registration { param, client_id },
        }
    }

    /// Description message of any description-shaped kind
    pub fn description(kind: MessageKind, text: impl Into<String>) -> CodecResult<Self> {
        Self::new(kind, Payload::Description { text: text.into() })
    }

    /// Update message of any update-shaped kind
    pub fn update(kind: MessageKind, timestamp: u32, vars: Vec<VarDef>) -> CodecResult<Self> {
        Self::new(kind, Payload::Update { timestamp, vars })
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Exact number of bytes [`Message::serialize`] writes
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.size()
    }

    /// Write header and payload, returning the number of bytes written.
    ///
    /// The message is validated first, so a failed call leaves `buf` untouched.
    pub fn serialize(&self, buf: &mut BytesMut) -> CodecResult<usize> {
        self.payload.validate()?;
        let start = buf.len();

        encode_u32(buf, self.kind.as_u32());
        encode_u32(buf, self.version);
        match &self.payload {
            Payload::Registration { param, client_id } => {
                encode_u32(buf, *param);
                encode_u32(buf, *client_id);
            }
            Payload::Description { text } => {
                encode_string(buf, text, LengthField::U16)?;
            }
            Payload::Update { timestamp, vars } => {
                encode_u32(buf, *timestamp);
                encode_u32(buf, vars.len() as u32);
                for var in vars {
                    var.encode(buf)?;
                }
            }
        }

        Ok(buf.len() - start)
    }

    /// Decode a complete message; every byte of `buf` must be consumed
    pub fn deserialize(mut buf: &[u8]) -> CodecResult<Self> {
        let raw_kind = decode_u32(&mut buf)?;
        let kind = MessageKind::from_u32(raw_kind).ok_or(CodecError::UnknownKind(raw_kind))?;

        let version = decode_u32(&mut buf)?;
        if version != PROTOCOL_VERSION {
            return Err(CodecError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            });
        }

        let payload = match kind.shape() {
            Some(PayloadShape::Registration) => Payload::Registration {
                param: decode_u32(&mut buf)?,
                client_id: decode_u32(&mut buf)?,
            },
            Some(PayloadShape::Description) => Payload::Description {
                text: decode_string(&mut buf, LengthField::U16)?,
            },
            Some(PayloadShape::Update) => {
                let timestamp = decode_u32(&mut buf)?;
                let count = decode_u32(&mut buf)? as usize;
                let mut vars = Vec::with_capacity(count.min(buf.len() / MIN_VAR_SIZE));
                for _ in 0..count {
                    vars.push(VarDef::decode(&mut buf)?);
                }
                Payload::Update { timestamp, vars }
            }
            None => return Err(CodecError::UnsupportedKind(kind)),
        };

        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }

        Ok(Self {
            kind,
            version,
            payload,
        })
    }
}
