//! Datagram wire format: pulse identifiers, transitions, and the XTC
//! container every contribution and result travels in.

use thiserror::Error;

/// Number of time-ordered bits in a pulse identifier.
pub const PULSE_VALUE_BITS: u32 = 56;
const PULSE_VALUE_MASK: u64 = (1 << PULSE_VALUE_BITS) - 1;

/// Control-byte flag marking a normal event (clear for transitions).
const CTRL_EVENT: u8 = 0x80;
/// Control-byte mask for the readout-group tag.
const CTRL_GROUP_MASK: u8 = 0x0f;

/// Index of the write-through word in a result payload.
pub const WRT_IDX: usize = 0;
/// Index of the monitor-token word in a result payload.
pub const MON_IDX: usize = 1;

/// Number of 32-bit words in a contribution payload.
pub const INPUT_EXTENT: usize = 2;
/// Number of 32-bit words in a result payload.
pub const RESULT_EXTENT: usize = 2;

/// 64-bit pulse identifier: 56 time-ordered value bits plus a control byte
/// carrying the event flag and the readout-group tag. Ordering is by the
/// value bits only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PulseId(u64);

impl PulseId {
    /// Builds a pulse id for a normal event in the given readout group.
    pub fn event(value: u64, group: u8) -> Self {
        Self::with_control(value, CTRL_EVENT | (group & CTRL_GROUP_MASK))
    }

    /// Builds a pulse id for a transition in the given readout group.
    pub fn transition(value: u64, group: u8) -> Self {
        Self::with_control(value, group & CTRL_GROUP_MASK)
    }

    fn with_control(value: u64, control: u8) -> Self {
        Self((value & PULSE_VALUE_MASK) | ((control as u64) << PULSE_VALUE_BITS))
    }

    /// Reconstructs a pulse id from its raw wire representation.
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// Time-ordered value bits.
    pub fn value(self) -> u64 {
        self.0 & PULSE_VALUE_MASK
    }

    /// Control byte (event flag + readout group).
    pub fn control(self) -> u8 {
        (self.0 >> PULSE_VALUE_BITS) as u8
    }

    /// True for normal events, false for transitions.
    pub fn is_event(self) -> bool {
        self.control() & CTRL_EVENT != 0
    }

    /// Readout-group tag carried in the control byte.
    pub fn readout_group(self) -> u8 {
        self.control() & CTRL_GROUP_MASK
    }
}

/// Lifecycle transition identifiers embedded in datagrams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransitionId {
    ClearReadout = 0,
    Reset = 1,
    Configure = 2,
    Unconfigure = 3,
    Enable = 4,
    Disable = 5,
    ConfigUpdate = 6,
    BeginRecord = 7,
    EndRecord = 8,
    L1Accept = 12,
}

impl TransitionId {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::ClearReadout),
            1 => Some(Self::Reset),
            2 => Some(Self::Configure),
            3 => Some(Self::Unconfigure),
            4 => Some(Self::Enable),
            5 => Some(Self::Disable),
            6 => Some(Self::ConfigUpdate),
            7 => Some(Self::BeginRecord),
            8 => Some(Self::EndRecord),
            12 => Some(Self::L1Accept),
            _ => None,
        }
    }

    /// L1Accept is the only service carried by normal events.
    pub fn is_event(self) -> bool {
        matches!(self, Self::L1Accept)
    }
}

/// Hierarchy level of a datagram source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Level {
    Segment = 0,
    Event = 1,
    Control = 2,
}

impl Level {
    fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Segment),
            1 => Some(Self::Event),
            2 => Some(Self::Control),
            _ => None,
        }
    }
}

/// Datagram source identifier (id + level), 8 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Src {
    pub id: u32,
    pub level: Level,
}

impl Src {
    pub fn new(id: u32, level: Level) -> Self {
        Self { id, level }
    }
}

/// Payload type tag (type + version), 4 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeId {
    pub kind: u16,
    pub version: u16,
}

impl TypeId {
    /// Type code for plain data payloads.
    pub const DATA: u16 = 1;

    pub fn new(kind: u16, version: u16) -> Self {
        Self { kind, version }
    }

    fn to_u32(self) -> u32 {
        ((self.version as u32) << 16) | self.kind as u32
    }

    fn from_u32(value: u32) -> Self {
        Self {
            kind: value as u16,
            version: (value >> 16) as u16,
        }
    }
}

/// Bitmask describing degraded or missing information on a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Damage(u32);

impl Damage {
    pub const MISSING_CONTRIBUTION: u32 = 1 << 0;
    pub const DUPLICATE_CONTRIBUTION: u32 = 1 << 1;
    pub const OUT_OF_ORDER: u32 = 1 << 2;
    pub const USER_DEFINED: u32 = 1 << 15;

    pub fn none() -> Self {
        Self(0)
    }

    pub fn from_value(value: u32) -> Self {
        Self(value)
    }

    pub fn value(self) -> u32 {
        self.0
    }

    pub fn increase(&mut self, bits: u32) {
        self.0 |= bits;
    }

    pub fn has(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    pub fn is_clean(self) -> bool {
        self.0 == 0
    }
}

/// Self-describing container header plus payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xtc {
    pub type_id: TypeId,
    pub damage: Damage,
    payload: Vec<u8>,
}

impl Xtc {
    /// Bytes occupied by the TypeId, damage, and extent words.
    pub const HEADER_SIZE: usize = 12;

    pub fn new(type_id: TypeId, payload: Vec<u8>) -> Self {
        Self {
            type_id,
            damage: Damage::none(),
            payload,
        }
    }

    /// Total container size including the header, as carried on the wire.
    pub fn extent(&self) -> u32 {
        (Self::HEADER_SIZE + self.payload.len()) as u32
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.payload
    }

    pub fn sizeof_payload(&self) -> usize {
        self.payload.len()
    }
}

/// Errors surfaced while decoding datagram bytes.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DgramError {
    #[error("buffer of {0} bytes is too short for a datagram header")]
    Truncated(usize),
    #[error("unknown transition id {0}")]
    UnknownTransition(u32),
    #[error("unknown source level {0}")]
    UnknownLevel(u32),
    #[error("extent {extent} exceeds the {avail} bytes available")]
    BadExtent { extent: u32, avail: usize },
    #[error("extent {0} is smaller than the container header")]
    ShortExtent(u32),
}

/// Atomic unit of all transport: fixed header plus one XTC container.
///
/// Wire layout (little-endian): 8-byte pulse id, 4-byte transition id,
/// 4-byte environment, 8-byte source (id + level), then the container
/// (4-byte TypeId, 4-byte damage, 4-byte extent, payload bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dgram {
    pub pulse_id: PulseId,
    pub service: TransitionId,
    pub env: u32,
    pub src: Src,
    pub xtc: Xtc,
}

impl Dgram {
    /// Fixed header bytes preceding the container.
    pub const HEADER_SIZE: usize = 24;

    /// Builds a contribution datagram carrying two L3 input words.
    pub fn contribution(
        pulse_id: PulseId,
        service: TransitionId,
        env: u32,
        src_id: u32,
        inputs: [u32; INPUT_EXTENT],
    ) -> Self {
        let mut payload = Vec::with_capacity(INPUT_EXTENT * 4);
        for word in inputs {
            payload.extend_from_slice(&word.to_le_bytes());
        }
        Self {
            pulse_id,
            service,
            env,
            src: Src::new(src_id, Level::Segment),
            xtc: Xtc::new(TypeId::new(TypeId::DATA, 0), payload),
        }
    }

    /// Total encoded size of this datagram.
    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.xtc.extent() as usize
    }

    pub fn is_event(&self) -> bool {
        self.pulse_id.is_event()
    }

    /// Reads the payload as little-endian u32 words.
    pub fn payload_words(&self) -> Vec<u32> {
        self.xtc
            .payload()
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size());
        out.extend_from_slice(&self.pulse_id.raw().to_le_bytes());
        out.extend_from_slice(&(self.service as u32).to_le_bytes());
        out.extend_from_slice(&self.env.to_le_bytes());
        out.extend_from_slice(&self.src.id.to_le_bytes());
        out.extend_from_slice(&(self.src.level as u32).to_le_bytes());
        out.extend_from_slice(&self.xtc.type_id.to_u32().to_le_bytes());
        out.extend_from_slice(&self.xtc.damage.value().to_le_bytes());
        out.extend_from_slice(&self.xtc.extent().to_le_bytes());
        out.extend_from_slice(self.xtc.payload());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, DgramError> {
        if buf.len() < Self::HEADER_SIZE + Xtc::HEADER_SIZE {
            return Err(DgramError::Truncated(buf.len()));
        }
        let word_u64 = |off: usize| {
            u64::from_le_bytes([
                buf[off],
                buf[off + 1],
                buf[off + 2],
                buf[off + 3],
                buf[off + 4],
                buf[off + 5],
                buf[off + 6],
                buf[off + 7],
            ])
        };
        let word_u32 =
            |off: usize| u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]]);

        let pulse_id = PulseId::from_raw(word_u64(0));
        let service_raw = word_u32(8);
        let service =
            TransitionId::from_u32(service_raw).ok_or(DgramError::UnknownTransition(service_raw))?;
        let env = word_u32(12);
        let src_id = word_u32(16);
        let level_raw = word_u32(20);
        let level = Level::from_u32(level_raw).ok_or(DgramError::UnknownLevel(level_raw))?;

        let type_id = TypeId::from_u32(word_u32(24));
        let damage = Damage::from_value(word_u32(28));
        let extent = word_u32(32);
        if (extent as usize) < Xtc::HEADER_SIZE {
            return Err(DgramError::ShortExtent(extent));
        }
        let payload_len = extent as usize - Xtc::HEADER_SIZE;
        let payload_off = Self::HEADER_SIZE + Xtc::HEADER_SIZE;
        if buf.len() < payload_off + payload_len {
            return Err(DgramError::BadExtent {
                extent,
                avail: buf.len() - Self::HEADER_SIZE,
            });
        }
        let payload = buf[payload_off..payload_off + payload_len].to_vec();

        let mut xtc = Xtc::new(type_id, payload);
        xtc.damage = damage;
        Ok(Self {
            pulse_id,
            service,
            env,
            src: Src::new(src_id, level),
            xtc,
        })
    }
}

/// Result datagram: the transition header with a fresh two-word payload,
/// sourced from this trigger builder.
#[derive(Debug, Clone)]
pub struct ResultDgram {
    dg: Dgram,
}

impl ResultDgram {
    /// Builds a zeroed result for the given event or transition header.
    pub fn new(transition: &Dgram, id: u32) -> Self {
        let payload = vec![0u8; RESULT_EXTENT * 4];
        let dg = Dgram {
            pulse_id: transition.pulse_id,
            service: transition.service,
            env: transition.env,
            src: Src::new(id, Level::Event),
            xtc: Xtc::new(TypeId::new(TypeId::DATA, 0), payload),
        };
        Self { dg }
    }

    pub fn pulse_id(&self) -> PulseId {
        self.dg.pulse_id
    }

    pub fn is_event(&self) -> bool {
        self.dg.is_event()
    }

    pub fn result(&self) -> [u32; RESULT_EXTENT] {
        let words = self.dg.payload_words();
        [words[0], words[1]]
    }

    pub fn set_result(&mut self, idx: usize, value: u32) {
        let bytes = self.dg.xtc.payload_mut();
        bytes[idx * 4..idx * 4 + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Applies the decision callback against the result words in place.
    pub fn with_result_words<R>(&mut self, f: impl FnOnce(&mut [u32; RESULT_EXTENT]) -> R) -> R {
        let mut words = self.result();
        let out = f(&mut words);
        for (idx, word) in words.iter().enumerate() {
            self.set_result(idx, *word);
        }
        out
    }

    pub fn increase_damage(&mut self, bits: u32) {
        self.dg.xtc.damage.increase(bits);
    }

    pub fn damage(&self) -> Damage {
        self.dg.xtc.damage
    }

    pub fn dgram(&self) -> &Dgram {
        &self.dg
    }

    pub fn encode(&self) -> Vec<u8> {
        self.dg.encode()
    }
}
