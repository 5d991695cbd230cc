#[cfg(test)]
pub(crate) mod test_utils;

mod buf;
mod header;
mod question;
mod record;

use anyhow::Context;
pub use buf::{Decode, Encode, NameCache, WireBuf};
pub use header::{DnsHeader, Opcode, Rcode};
pub use question::{Question, RecordType};
pub use record::{Record, RecordData};

/// The only CLASS this daemon ever deals with (IN).
pub const IN_CLASS: u16 = 1;
/// RFC 1035: a full domain name may not exceed 255 octets on the wire.
pub const MAX_NAME_WIRE_LEN: usize = 255;
/// RFC 1035: a single character-string inside TXT RDATA holds at most 255 bytes.
pub const MAX_TXT_SEGMENT_LEN: usize = 255;

/// A parsed DNS message: header plus all four record sections.
#[derive(Debug, PartialEq, Eq, Default, Clone)]
pub struct DnsPacket {
    pub header: DnsHeader,
    pub questions: Vec<Question>,
    pub answers: Vec<Record>,
    pub authorities: Vec<Record>,
    pub additionals: Vec<Record>,
}

impl DnsPacket {
    pub fn new() -> Self {
        DnsPacket::default()
    }

    /// First question of the message, if any. Queries handled by the daemon
    /// always carry exactly one.
    pub fn question(&self) -> Option<&Question> {
        self.questions.first()
    }
}

impl Decode for DnsPacket {
    fn decode(buf: &mut WireBuf) -> anyhow::Result<Self> {
        let header = DnsHeader::decode(buf).context("header parsing error")?;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for idx in 0..header.question_count {
            questions.push(Question::decode(buf).with_context(|| format!("question parsing error at idx {}", idx))?);
        }

        let mut answers = Vec::with_capacity(header.answer_count as usize);
        for idx in 0..header.answer_count {
            answers.push(Record::decode(buf).with_context(|| format!("answer RR parsing error at idx {}", idx))?);
        }

        let mut authorities = Vec::with_capacity(header.authority_count as usize);
        for idx in 0..header.authority_count {
            authorities.push(Record::decode(buf).with_context(|| format!("authority RR parsing error at idx {}", idx))?);
        }

        let mut additionals = Vec::with_capacity(header.additional_count as usize);
        for idx in 0..header.additional_count {
            additionals
                .push(Record::decode(buf).with_context(|| format!("additional RR parsing error at idx {}", idx))?);
        }

        Ok(DnsPacket {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }
}

impl Encode for DnsPacket {
    fn encode_with_names(&self, buf: &mut WireBuf, mut names: Option<&mut NameCache>) -> anyhow::Result<()> {
        self.header.encode_with_names(buf, names.as_deref_mut()).context("writing header")?;

        self.questions
            .iter()
            .enumerate()
            .try_for_each(|(idx, question)| {
                question
                    .encode_with_names(buf, names.as_deref_mut())
                    .with_context(|| format!("writing question at idx {}", idx))
            })?;

        for (section, records) in [
            ("answer", &self.answers),
            ("authority", &self.authorities),
            ("additional", &self.additionals),
        ] {
            records.iter().enumerate().try_for_each(|(idx, record)| {
                record
                    .encode_with_names(buf, names.as_deref_mut())
                    .with_context(|| format!("writing {} RR at idx {}", section, idx))
            })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use proptest::collection::vec;
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{arb_header, arb_question, arb_record};

    fn arb_dns_packet() -> impl Strategy<Value = DnsPacket> {
        (0..3u16, 0..3u16, 0..3u16)
            .prop_flat_map(|(questions_len, answers_len, authorities_len)| {
                (
                    arb_header(),
                    vec(arb_question(), questions_len as usize),
                    vec(arb_record(), answers_len as usize),
                    vec(arb_record(), authorities_len as usize),
                )
                    .prop_map(|(mut header, questions, answers, authorities)| {
                        header.question_count = questions.len() as u16;
                        header.answer_count = answers.len() as u16;
                        header.authority_count = authorities.len() as u16;
                        header.additional_count = 0;
                        DnsPacket {
                            header,
                            questions,
                            answers,
                            authorities,
                            additionals: Vec::new(),
                        }
                    })
            })
            .boxed()
    }

    proptest! {
        #[test]
        fn dns_packet_roundtrip(packet in arb_dns_packet()) {
            let mut buf = WireBuf::new();
            packet.encode(&mut buf).expect("shouldn't have failed");
            let decoded = DnsPacket::decode(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(packet, decoded, "DnsPacket roundtrip test failed");
        }
    }

    #[test]
    fn answer_name_is_compressed_to_a_pointer() {
        let mut packet = DnsPacket::new();
        packet.header.id = 77;
        packet.header.is_response = true;
        packet.header.question_count = 1;
        packet.header.answer_count = 1;
        packet.questions.push(Question::new("github.com", RecordType::A));
        packet.answers.push(Record::new(
            "github.com",
            RecordData::A(Ipv4Addr::UNSPECIFIED),
            600,
        ));

        let mut buf = WireBuf::new();
        packet.encode(&mut buf).expect("shouldn't have failed");

        // The question name starts right after the 12-byte header, so the
        // answer must reuse it through a 0xC00C pointer.
        let answer_name_pos = 12 + 12 /* "github.com" as labels */ + 4 /* QTYPE + QCLASS */;
        assert_eq!(&buf.as_slice()[answer_name_pos..answer_name_pos + 2], &[0xC0, 0x0C]);

        let decoded = DnsPacket::decode(&mut buf).expect("shouldn't have failed");
        assert_eq!(decoded.answers[0].name, "github.com");
    }
}
