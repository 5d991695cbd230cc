use std::net::{Ipv4Addr, Ipv6Addr};

use anyhow::Context;

use crate::{Decode, Encode, NameCache, RecordType, WireBuf, IN_CLASS, MAX_TXT_SEGMENT_LEN};

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Record {
    pub name: String,
    pub class: u16,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    pub fn new(name: &str, data: RecordData, ttl: u32) -> Self {
        Record {
            name: name.to_owned(),
            class: IN_CLASS,
            ttl,
            data,
        }
    }
}

impl Decode for Record {
    fn decode(buf: &mut WireBuf) -> anyhow::Result<Self> {
        let name = buf.read_name().context("NAME is missing")?;
        let rtype: RecordType = buf.read_u16().context("TYPE is missing")?.into();
        let class = buf.read_u16().context("CLASS is missing")?;
        let ttl = buf.read_u32().context("TTL is missing")?;
        let data = RecordData::decode_with_type(buf, rtype).context("can't decode RDATA")?;

        Ok(Record { name, class, ttl, data })
    }
}

impl Encode for Record {
    fn encode_with_names(&self, buf: &mut WireBuf, mut names: Option<&mut NameCache>) -> anyhow::Result<()> {
        buf.write_name(&self.name, names.as_deref_mut()).context("writing NAME")?;
        buf.write_u16(self.data.rtype().into());
        buf.write_u16(self.class);
        buf.write_u32(self.ttl);
        self.data.encode_with_names(buf, names).context("writing RDATA")?;
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Cname(String),
    /// One or more character-strings, each at most 255 bytes on the wire.
    Txt(Vec<String>),
    Unknown { rtype: u16, rdata: Vec<u8> },
}

impl RecordData {
    /// Builds TXT RDATA from arbitrary text, splitting it into as many
    /// 255-byte character-strings as needed.
    pub fn txt_from_text(text: &str) -> Self {
        let mut segments = Vec::with_capacity(text.len() / MAX_TXT_SEGMENT_LEN + 1);
        let mut rest = text;
        loop {
            if rest.len() <= MAX_TXT_SEGMENT_LEN {
                segments.push(rest.to_owned());
                break;
            }
            let mut split = MAX_TXT_SEGMENT_LEN;
            // Never split a multi-byte character in half.
            while !rest.is_char_boundary(split) {
                split -= 1;
            }
            let (head, tail) = rest.split_at(split);
            segments.push(head.to_owned());
            rest = tail;
        }
        RecordData::Txt(segments)
    }

    pub fn rtype(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Aaaa(_) => RecordType::Aaaa,
            RecordData::Cname(_) => RecordType::Cname,
            RecordData::Txt(_) => RecordType::Txt,
            RecordData::Unknown { rtype, .. } => RecordType::Unknown(*rtype),
        }
    }

    pub fn decode_with_type(buf: &mut WireBuf, rtype: RecordType) -> anyhow::Result<Self> {
        let rd_length = buf.read_u16().context("RDLENGTH is missing")? as usize;
        Ok(match rtype {
            RecordType::A => {
                if rd_length != 4 {
                    anyhow::bail!("A record: unexpected RDLENGTH {}", rd_length);
                }
                let octets: [u8; 4] = buf.read_bytes(4).context("A record: ADDRESS is missing")?.try_into().unwrap();
                RecordData::A(octets.into())
            }
            RecordType::Aaaa => {
                if rd_length != 16 {
                    anyhow::bail!("AAAA record: unexpected RDLENGTH {}", rd_length);
                }
                let octets: [u8; 16] =
                    buf.read_bytes(16).context("AAAA record: ADDRESS is missing")?.try_into().unwrap();
                RecordData::Aaaa(octets.into())
            }
            RecordType::Cname => RecordData::Cname(buf.read_name().context("CNAME record: name is missing")?),
            RecordType::Txt => {
                let mut remaining = rd_length;
                let mut segments = Vec::new();
                while remaining > 0 {
                    let seg_len = buf.read_u8().context("TXT record: segment length is missing")? as usize;
                    remaining = remaining
                        .checked_sub(1 + seg_len)
                        .context("TXT record: segment overruns RDLENGTH")?;
                    let segment = buf.read_bytes(seg_len).context("TXT record: segment data is missing")?;
                    segments.push(
                        std::str::from_utf8(segment)
                            .context("TXT record: segment is not UTF-8")?
                            .to_owned(),
                    );
                }
                RecordData::Txt(segments)
            }
            RecordType::Ns | RecordType::Any | RecordType::Unknown(_) => {
                let rdata = buf
                    .read_bytes(rd_length)
                    .with_context(|| format!("{:?} record: RDATA is missing", rtype))?
                    .to_vec();
                RecordData::Unknown {
                    rtype: rtype.into(),
                    rdata,
                }
            }
        })
    }
}

impl Encode for RecordData {
    fn encode_with_names(&self, buf: &mut WireBuf, names: Option<&mut NameCache>) -> anyhow::Result<()> {
        match self {
            RecordData::A(address) => {
                buf.write_u16(4);
                buf.write_bytes(&address.octets());
            }
            RecordData::Aaaa(address) => {
                buf.write_u16(16);
                buf.write_bytes(&address.octets());
            }
            RecordData::Cname(cname) => {
                // RDLENGTH isn't known until the name has been written, so
                // write a stub and patch it afterwards.
                let rdlength_pos = buf.len();
                buf.write_u16(0);
                let name_len = buf.write_name(cname, names).context("CNAME record: writing name")?;
                buf.set_u16(rdlength_pos, name_len as u16)
                    .context("CNAME record: writing RDLENGTH")?;
            }
            RecordData::Txt(segments) => {
                let mut rd_length = 0usize;
                for segment in segments {
                    if segment.len() > MAX_TXT_SEGMENT_LEN {
                        anyhow::bail!("TXT record: segment of {} bytes is too long", segment.len());
                    }
                    rd_length += 1 + segment.len();
                }
                buf.write_u16(rd_length as u16);
                for segment in segments {
                    buf.write_u8(segment.len() as u8);
                    buf.write_bytes(segment.as_bytes());
                }
            }
            RecordData::Unknown { rdata, .. } => {
                buf.write_u16(rdata.len() as u16);
                buf.write_bytes(rdata);
            }
        }
        Ok(())
    }
}
