use anyhow::Context;

use crate::{Decode, Encode, NameCache, WireBuf, IN_CLASS};

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RecordType {
    A,
    Ns,
    Cname,
    Txt,
    Aaaa,
    Any,
    Unknown(u16),
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::Ns,
            5 => RecordType::Cname,
            16 => RecordType::Txt,
            28 => RecordType::Aaaa,
            255 => RecordType::Any,
            _ => RecordType::Unknown(value),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::Ns => 2,
            RecordType::Cname => 5,
            RecordType::Txt => 16,
            RecordType::Aaaa => 28,
            RecordType::Any => 255,
            RecordType::Unknown(rtype) => rtype,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Question {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
}

impl Question {
    pub fn new(name: &str, rtype: RecordType) -> Self {
        Question {
            name: name.to_owned(),
            rtype,
            class: IN_CLASS,
        }
    }
}

impl Decode for Question {
    fn decode(buf: &mut WireBuf) -> anyhow::Result<Self> {
        let name = buf.read_name().context("QNAME is missing")?;
        let rtype = buf.read_u16().context("QTYPE is missing")?.into();
        let class = buf.read_u16().context("QCLASS is missing")?;

        Ok(Question { name, rtype, class })
    }
}

impl Encode for Question {
    fn encode_with_names(&self, buf: &mut WireBuf, names: Option<&mut NameCache>) -> anyhow::Result<()> {
        buf.write_name(&self.name, names).context("writing QNAME")?;
        buf.write_u16(self.rtype.into());
        buf.write_u16(self.class);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::arb_question;

    proptest! {
        #[test]
        fn question_roundtrip(question in arb_question()) {
            let mut buf = WireBuf::new();
            question.encode(&mut buf).expect("shouldn't have failed");
            let decoded = Question::decode(&mut buf).expect("shouldn't have failed");
            prop_assert_eq!(question, decoded, "Question roundtrip test failed");
        }
    }
}
