use anyhow::Context;

use crate::{Decode, Encode, NameCache, WireBuf};

// Masks of the single-bit flags within the header's second 16-bit word.
// OPCODE occupies the four bits below QR, RCODE the bottom nibble.
const FLAG_QR: u16 = 1 << 15;
const FLAG_AA: u16 = 1 << 10;
const FLAG_TC: u16 = 1 << 9;
const FLAG_RD: u16 = 1 << 8;
const FLAG_RA: u16 = 1 << 7;
const FLAG_Z: u16 = 1 << 6;
const FLAG_AD: u16 = 1 << 5;
const FLAG_CD: u16 = 1 << 4;
const OPCODE_SHIFT: u16 = 11;
const OPCODE_MASK: u16 = 0xF << OPCODE_SHIFT;
const RCODE_MASK: u16 = 0xF;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Opcode {
    /// Standard query
    #[default]
    Query,
    /// Inverse query
    IQuery,
    /// Status request
    Status,
    Notify,
    Update,
    /// Anything this daemon has no business interpreting, kept verbatim
    Other(u8),
}

impl Opcode {
    fn from_value(value: u8) -> Self {
        match value {
            0 => Opcode::Query,
            1 => Opcode::IQuery,
            2 => Opcode::Status,
            4 => Opcode::Notify,
            5 => Opcode::Update,
            other => Opcode::Other(other),
        }
    }

    fn value(self) -> u8 {
        match self {
            Opcode::Query => 0,
            Opcode::IQuery => 1,
            Opcode::Status => 2,
            Opcode::Notify => 4,
            Opcode::Update => 5,
            Opcode::Other(other) => other,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Rcode {
    #[default]
    Success,
    /// Server was unable to interpret the query
    FormatError,
    /// Server failed to process the query due to an internal error
    ServerFailure,
    /// The queried name doesn't exist
    NameError,
    /// The query kind is not supported by the server
    NotImplemented,
    /// Server refuses to answer
    Refused,
    /// Codes 6-15, kept verbatim so forwarded answers survive intact
    Other(u8),
}

impl Rcode {
    fn from_value(value: u8) -> Self {
        match value {
            0 => Rcode::Success,
            1 => Rcode::FormatError,
            2 => Rcode::ServerFailure,
            3 => Rcode::NameError,
            4 => Rcode::NotImplemented,
            5 => Rcode::Refused,
            other => Rcode::Other(other),
        }
    }

    fn value(self) -> u8 {
        match self {
            Rcode::Success => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
            Rcode::Other(other) => other,
        }
    }
}

/// The fixed 12-byte message header.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct DnsHeader {
    /// Transaction ID. A response must echo the query's ID.
    pub id: u16,
    pub is_response: bool,
    pub opcode: Opcode,
    pub is_authoritative: bool,
    pub truncation: bool,
    pub recursion_desired: bool,
    pub recursion_available: bool,
    /// The reserved Z bit, carried verbatim
    pub z: bool,
    /// DNSSEC: the answer was authenticated upstream
    pub authenticated_data: bool,
    /// DNSSEC: the requestor accepts unauthenticated data
    pub checking_disabled: bool,
    pub response_code: Rcode,
    pub question_count: u16,
    pub answer_count: u16,
    pub authority_count: u16,
    pub additional_count: u16,
}

impl DnsHeader {
    pub fn new() -> Self {
        DnsHeader::default()
    }

    /// Packs everything between ID and the section counts into the 16-bit
    /// flags word. Unknown opcodes and response codes re-encode to the
    /// values they arrived with, so any flags word survives a round trip.
    pub fn flags_word(&self) -> u16 {
        let mut flags = (self.opcode.value() as u16) << OPCODE_SHIFT | self.response_code.value() as u16;
        let bits = [
            (FLAG_QR, self.is_response),
            (FLAG_AA, self.is_authoritative),
            (FLAG_TC, self.truncation),
            (FLAG_RD, self.recursion_desired),
            (FLAG_RA, self.recursion_available),
            (FLAG_Z, self.z),
            (FLAG_AD, self.authenticated_data),
            (FLAG_CD, self.checking_disabled),
        ];
        for (mask, set) in bits {
            if set {
                flags |= mask;
            }
        }
        flags
    }

    fn apply_flags_word(&mut self, flags: u16) {
        self.is_response = flags & FLAG_QR != 0;
        self.opcode = Opcode::from_value(((flags & OPCODE_MASK) >> OPCODE_SHIFT) as u8);
        self.is_authoritative = flags & FLAG_AA != 0;
        self.truncation = flags & FLAG_TC != 0;
        self.recursion_desired = flags & FLAG_RD != 0;
        self.recursion_available = flags & FLAG_RA != 0;
        self.z = flags & FLAG_Z != 0;
        self.authenticated_data = flags & FLAG_AD != 0;
        self.checking_disabled = flags & FLAG_CD != 0;
        self.response_code = Rcode::from_value((flags & RCODE_MASK) as u8);
    }
}

impl Decode for DnsHeader {
    fn decode(buf: &mut WireBuf) -> anyhow::Result<Self> {
        let mut header = DnsHeader::new();
        header.id = buf.read_u16().context("id is missing")?;
        header.apply_flags_word(buf.read_u16().context("flags are missing")?);

        for (section, count) in [
            ("question", &mut header.question_count),
            ("answer", &mut header.answer_count),
            ("authority", &mut header.authority_count),
            ("additional", &mut header.additional_count),
        ] {
            *count = buf.read_u16().with_context(|| format!("{} count is missing", section))?;
        }

        Ok(header)
    }
}

impl Encode for DnsHeader {
    fn encode_with_names(&self, buf: &mut WireBuf, _names: Option<&mut NameCache>) -> anyhow::Result<()> {
        buf.write_u16(self.id);
        buf.write_u16(self.flags_word());
        buf.write_u16(self.question_count);
        buf.write_u16(self.answer_count);
        buf.write_u16(self.authority_count);
        buf.write_u16(self.additional_count);
        Ok(())
    }
}
