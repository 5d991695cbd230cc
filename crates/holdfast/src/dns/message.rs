use std::net::Ipv4Addr;

use anyhow::Context as _;
use holdfast_dns_lib::{
    Decode as _, DnsHeader, DnsPacket, Encode as _, Question, Record, RecordData, RecordType, WireBuf,
};

/// TYPE and CLASS tail of an A/IN question.
const NAME_QUERY_MAGIC: [u8; 4] = [0, 1, 0, 1];
/// TYPE and CLASS tail of a TXT/IN question.
const TEXT_QUERY_MAGIC: [u8; 4] = [0, 16, 0, 1];

/// TTL of the black-hole answer.
const BLACKHOLE_TTL: u32 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    /// An A/IN question, the kind eligible for black-holing
    Name,
    /// A TXT/IN question, the kind that may carry a command
    Text,
    /// Anything else; forwarded verbatim
    Other,
}

/// One inbound query: the raw bytes plus everything the pipeline needs
/// parsed out of them. Immutable once constructed.
pub struct DnsQuery {
    pub raw: Vec<u8>,
    pub header: DnsHeader,
    /// QNAME with original case, labels joined by dots
    pub name: String,
    pub kind: QueryKind,
}

impl DnsQuery {
    pub fn parse(raw: &[u8]) -> anyhow::Result<DnsQuery> {
        let mut buf = WireBuf::from_bytes(raw);
        let header = DnsHeader::decode(&mut buf).context("header parsing error")?;
        if header.question_count == 0 {
            anyhow::bail!("query carries no question");
        }
        let question = Question::decode(&mut buf).context("question parsing error")?;

        Ok(DnsQuery {
            raw: raw.to_vec(),
            header,
            name: question.name,
            kind: classify(raw),
        })
    }
}

/// Classifies a query by looking for the question's 4-byte TYPE+CLASS tail
/// anywhere past the header.
fn classify(raw: &[u8]) -> QueryKind {
    let Some(body) = raw.get(13..) else {
        return QueryKind::Other;
    };
    if body.windows(4).skip(1).any(|window| window == TEXT_QUERY_MAGIC) {
        QueryKind::Text
    } else if body.windows(4).any(|window| window == NAME_QUERY_MAGIC) {
        QueryKind::Name
    } else {
        QueryKind::Other
    }
}

/// Builds the black-hole response: the request header with QR and RA set,
/// and a single `A 0.0.0.0` answer whose name points back at the question.
pub fn blackhole_response(query: &DnsQuery) -> anyhow::Result<Vec<u8>> {
    let mut packet = response_skeleton(query);
    packet.header.question_count = 1;
    packet.header.answer_count = 1;
    packet.questions.push(Question::new(&query.name, RecordType::A));
    packet
        .answers
        .push(Record::new(&query.name, RecordData::A(Ipv4Addr::UNSPECIFIED), BLACKHOLE_TTL));

    let mut buf = WireBuf::with_capacity(query.raw.len() + 16);
    packet.encode(&mut buf).context("error while encoding the black-hole response")?;
    Ok(buf.into_vec())
}

/// Builds a TXT response carrying command output, split into 255-byte
/// strings as needed.
pub fn txt_response(query: &DnsQuery, text: &str, ttl: u32) -> anyhow::Result<Vec<u8>> {
    let mut packet = response_skeleton(query);
    packet.header.question_count = 1;
    packet.header.answer_count = 1;
    packet.questions.push(Question::new(&query.name, RecordType::Txt));
    packet
        .answers
        .push(Record::new(&query.name, RecordData::txt_from_text(text), ttl));

    let mut buf = WireBuf::with_capacity(query.raw.len() + 16 + text.len());
    packet.encode(&mut buf).context("error while encoding the TXT response")?;
    Ok(buf.into_vec())
}

fn response_skeleton(query: &DnsQuery) -> DnsPacket {
    let mut packet = DnsPacket::new();
    packet.header = query.header.clone();
    packet.header.is_response = true;
    packet.header.recursion_available = true;
    packet.header.truncation = false;
    packet.header.answer_count = 0;
    packet.header.authority_count = 0;
    packet.header.additional_count = 0;
    packet
}

/// Builds an encoded query for tests elsewhere in the crate.
#[cfg(test)]
pub(crate) fn build_query(name: &str, rtype: RecordType, id: u16) -> Vec<u8> {
    let mut packet = DnsPacket::new();
    packet.header.id = id;
    packet.header.recursion_desired = true;
    packet.header.question_count = 1;
    packet.questions.push(Question::new(name, rtype));
    let mut buf = WireBuf::new();
    packet.encode(&mut buf).expect("query encoding shouldn't fail");
    buf.into_vec()
}
