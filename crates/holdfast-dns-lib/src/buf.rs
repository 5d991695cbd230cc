use std::collections::HashMap;

use anyhow::Context;

use crate::MAX_NAME_WIRE_LEN;

/// Positions of names already written to a buffer, so later occurrences can
/// be replaced with RFC 1035 compression pointers.
pub type NameCache = HashMap<String, usize>;

pub trait Decode: Sized {
    fn decode(buf: &mut WireBuf) -> anyhow::Result<Self>;
}

pub trait Encode {
    fn encode_with_names(&self, buf: &mut WireBuf, names: Option<&mut NameCache>) -> anyhow::Result<()>;

    fn encode(&self, buf: &mut WireBuf) -> anyhow::Result<()> {
        let mut names = NameCache::new();
        self.encode_with_names(buf, Some(&mut names))
    }
}

/// A byte buffer with a read cursor. Writes always append; reads consume from
/// the cursor. Name reads may jump backwards to follow compression pointers
/// without disturbing the cursor.
#[derive(Debug, Default)]
pub struct WireBuf {
    buf: Vec<u8>,
    pos: usize,
}

impl WireBuf {
    pub fn new() -> Self {
        WireBuf::default()
    }

    pub fn from_bytes(src: &[u8]) -> Self {
        WireBuf {
            buf: src.to_vec(),
            pos: 0,
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        WireBuf {
            buf: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn read_u8(&mut self) -> anyhow::Result<u8> {
        let byte = *self.buf.get(self.pos).context("unexpected end of packet")?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> anyhow::Result<u16> {
        self.read_bytes(2)
            .map(|bytes| u16::from_be_bytes(bytes.try_into().expect("two bytes")))
    }

    pub fn read_u32(&mut self) -> anyhow::Result<u32> {
        self.read_bytes(4)
            .map(|bytes| u32::from_be_bytes(bytes.try_into().expect("four bytes")))
    }

    pub fn read_bytes(&mut self, n: usize) -> anyhow::Result<&[u8]> {
        let end = self.pos.checked_add(n).context("length overflow")?;
        let bytes = self.buf.get(self.pos..end).context("unexpected end of packet")?;
        self.pos = end;
        Ok(bytes)
    }

    pub fn write_u8(&mut self, data: u8) {
        self.buf.push(data);
    }

    pub fn write_u16(&mut self, data: u16) {
        self.buf.extend_from_slice(&data.to_be_bytes());
    }

    pub fn write_u32(&mut self, data: u32) {
        self.buf.extend_from_slice(&data.to_be_bytes());
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Overwrites two bytes at an already-written position. Used for
    /// back-patching RDLENGTH once variable-length RDATA has been written.
    pub fn set_u16(&mut self, pos: usize, data: u16) -> anyhow::Result<()> {
        let dst = self
            .buf
            .get_mut(pos..pos + 2)
            .with_context(|| format!("position {} is out of bounds", pos))?;
        dst.copy_from_slice(&data.to_be_bytes());
        Ok(())
    }

    /// Reads a domain name at the cursor, following compression pointers.
    /// Labels are joined with dots; the root name decodes to "".
    pub fn read_name(&mut self) -> anyhow::Result<String> {
        let mut labels: Vec<String> = Vec::new();
        let mut pos = self.pos;
        let mut jumped = false;
        // Pointer chains longer than this cannot occur in a legitimate
        // message and indicate a loop.
        let mut jumps_left = 16u8;
        let mut wire_len = 0usize;

        loop {
            let len_byte = *self.buf.get(pos).context("malformed packet: expected name label length")?;
            if len_byte & 0xC0 == 0xC0 {
                let second = *self
                    .buf
                    .get(pos + 1)
                    .context("malformed packet: expected second pointer byte in name")?;
                if !jumped {
                    self.pos = pos + 2;
                    jumped = true;
                }
                jumps_left = jumps_left.checked_sub(1).context("malformed packet: name pointer loop")?;
                pos = (((len_byte as usize) ^ 0xC0) << 8) | second as usize;
            } else {
                pos += 1;
                wire_len += 1 + len_byte as usize;
                if wire_len > MAX_NAME_WIRE_LEN {
                    anyhow::bail!("malformed packet: name exceeds {} octets", MAX_NAME_WIRE_LEN);
                }

                if len_byte == 0 {
                    if !jumped {
                        self.pos = pos;
                    }
                    break;
                }

                let label = self
                    .buf
                    .get(pos..pos + len_byte as usize)
                    .with_context(|| format!("malformed packet: expected label of length {} at byte {}", len_byte, pos))?;
                let label = std::str::from_utf8(label)
                    .with_context(|| format!("malformed packet: name label at byte {} is not UTF-8", pos))?;
                labels.push(label.to_owned());
                pos += len_byte as usize;

                if !jumped {
                    self.pos = pos;
                }
            }
        }

        Ok(labels.join("."))
    }

    /// Writes a domain name, substituting a compression pointer for any
    /// suffix already present in the cache. Returns the number of bytes
    /// appended to the buffer.
    pub fn write_name(&mut self, name: &str, mut names: Option<&mut NameCache>) -> anyhow::Result<usize> {
        if name.len() + 2 > MAX_NAME_WIRE_LEN {
            anyhow::bail!("name is too long ({} chars): {}", name.len(), name);
        }

        let start = self.buf.len();
        let mut remaining = name;
        loop {
            if remaining.is_empty() {
                self.write_u8(0);
                break;
            }

            if let Some(&offset) = names.as_ref().and_then(|cache| cache.get(remaining)) {
                // A pointer offset wider than 14 bits cannot be encoded;
                // packets produced by this daemon never get close.
                self.write_u16(0xC000 | offset as u16);
                break;
            }

            let (label, rest) = match remaining.split_once('.') {
                Some((label, rest)) => (label, rest),
                None => (remaining, ""),
            };
            if label.is_empty() || label.len() > 0x3F {
                anyhow::bail!("invalid label of length {} in name: {}", label.len(), name);
            }

            if let Some(cache) = names.as_deref_mut() {
                cache.insert(remaining.to_owned(), self.buf.len());
            }
            self.write_u8(label.len() as u8);
            self.write_bytes(label.as_bytes());
            remaining = rest;
        }

        Ok(self.buf.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_root_name() {
        let mut buf = WireBuf::from_bytes(&[0x0]);
        assert_eq!(buf.read_name().expect("shouldn't have failed"), "");
    }

    #[test]
    fn read_plain_name() {
        let raw = [0x6, 0x67, 0x6f, 0x6f, 0x67, 0x6c, 0x65, 0x3, 0x63, 0x6f, 0x6d, 0x0];
        let mut buf = WireBuf::from_bytes(&raw);
        assert_eq!(buf.read_name().expect("shouldn't have failed"), "google.com");
        // The cursor must land exactly on the terminating zero's successor.
        assert!(buf.read_u8().is_err());
    }

    #[test]
    fn read_name_rejects_truncated_label() {
        let mut buf = WireBuf::from_bytes(&[0x5, 0x67, 0x6f]);
        assert!(buf.read_name().is_err());
    }

    #[test]
    fn read_name_rejects_pointer_loop() {
        // A pointer that points at itself forever.
        let mut buf = WireBuf::from_bytes(&[0xC0, 0x00]);
        let err = buf.read_name().unwrap_err();
        assert!(err.to_string().contains("pointer loop"));
    }

    #[test]
    fn name_roundtrip_with_pointer() {
        let mut buf = WireBuf::new();
        let mut names = NameCache::new();
        buf.write_name("google.com", Some(&mut names)).expect("shouldn't have failed");
        buf.write_name("api.google.com", Some(&mut names))
            .expect("shouldn't have failed");

        // Second name must reuse the first through a pointer to offset 0.
        assert_eq!(
            buf.as_slice(),
            &[0x6, 0x67, 0x6f, 0x6f, 0x67, 0x6c, 0x65, 0x3, 0x63, 0x6f, 0x6d, 0x0, 0x3, 0x61, 0x70, 0x69, 0xC0, 0x0]
        );
        assert_eq!(buf.read_name().expect("shouldn't have failed"), "google.com");
        assert_eq!(buf.read_name().expect("shouldn't have failed"), "api.google.com");
    }

    #[test]
    fn write_name_rejects_oversized_label() {
        let name = format!("{}.com", "a".repeat(64));
        let mut buf = WireBuf::new();
        assert!(buf.write_name(&name, None).is_err());
    }

    #[test]
    fn write_name_rejects_oversized_name() {
        let name = vec!["a".repeat(60); 5].join(".");
        let mut buf = WireBuf::new();
        assert!(buf.write_name(&name, None).is_err());
    }
}
