use proptest::collection::vec;
use proptest::prelude::*;
use proptest::strategy::Union;

use crate::{Decode as _, DnsHeader, Question, Record, RecordData, RecordType, WireBuf};

prop_compose! {
    /// Decoding arbitrary header bytes always yields a canonical header, so
    /// this covers every flag combination without a hand-written generator
    /// per field.
    pub fn arb_header()(id: u16, flags: u16) -> DnsHeader {
        let mut raw = Vec::with_capacity(12);
        raw.extend_from_slice(&id.to_be_bytes());
        raw.extend_from_slice(&flags.to_be_bytes());
        raw.extend_from_slice(&[0; 8]);
        DnsHeader::decode(&mut WireBuf::from_bytes(&raw)).expect("12 bytes always decode")
    }
}

prop_compose! {
    pub fn arb_question()(name in arb_name(), rtype in arb_record_type(), class: u16) -> Question {
        Question { name, rtype, class }
    }
}

prop_compose! {
    pub fn arb_record()(name in arb_name(), data in arb_record_data(), class: u16, ttl: u32) -> Record {
        Record { name, class, ttl, data }
    }
}

pub fn arb_record_data() -> impl Strategy<Value = RecordData> {
    let variants = vec![
        any::<std::net::Ipv4Addr>().prop_map(RecordData::A).boxed(),
        any::<std::net::Ipv6Addr>().prop_map(RecordData::Aaaa).boxed(),
        arb_name().prop_map(RecordData::Cname).boxed(),
        vec("[ -~]{0,255}", 1..4).prop_map(RecordData::Txt).boxed(),
        vec(any::<u8>(), 1..100)
            .prop_map(|rdata| RecordData::Unknown {
                // The reserved QTYPE, so decoding doesn't mistake it for a
                // record kind we handle structurally
                rtype: 65535,
                rdata,
            })
            .boxed(),
    ];

    Union::new(variants)
}

fn arb_record_type() -> impl Strategy<Value = RecordType> {
    prop_oneof![
        Just(RecordType::A),
        Just(RecordType::Ns),
        Just(RecordType::Cname),
        Just(RecordType::Txt),
        Just(RecordType::Aaaa),
        Just(RecordType::Any),
        Just(RecordType::Unknown(65535)),
    ]
}

fn arb_name() -> impl Strategy<Value = String> {
    proptest::string::string_regex(r"(([a-z0-9][a-z0-9-]{1,20}\.){0,3}[a-z0-9]{2,20})|")
        .expect("regex should be valid")
}
