use std::net::IpAddr;

use anyhow::Context as _;
use tokio::io::AsyncRead;

use super::cipher::CipherReader;

/// Only the low nibble of the address-type byte selects the encoding; the
/// high nibble is preserved by upstream clients for their own purposes.
pub const ADDRESS_TYPE_MASK: u8 = 0x0F;
pub const ADDRESS_TYPE_IPV4: u8 = 0x01;
pub const ADDRESS_TYPE_DOMAIN: u8 = 0x03;
pub const ADDRESS_TYPE_IPV6: u8 = 0x04;

/// The destination a relay client asks to reach: an address in one of three
/// encodings followed by a big-endian port.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ProxyRequest {
    pub host: DestHost,
    pub port: u16,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum DestHost {
    Ip(IpAddr),
    Domain(String),
}

impl ProxyRequest {
    /// Reads one request off the decrypted stream. Failures leave the
    /// stream out of frame and are terminal for the connection.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut CipherReader<R>) -> anyhow::Result<ProxyRequest> {
        let mut type_byte = [0u8; 1];
        reader.read_exact(&mut type_byte).await.context("address type is missing")?;

        let host = match type_byte[0] & ADDRESS_TYPE_MASK {
            ADDRESS_TYPE_IPV4 => {
                let mut octets = [0u8; 4];
                reader.read_exact(&mut octets).await.context("IPv4 address is missing")?;
                DestHost::Ip(IpAddr::from(octets))
            }
            ADDRESS_TYPE_IPV6 => {
                let mut octets = [0u8; 16];
                reader.read_exact(&mut octets).await.context("IPv6 address is missing")?;
                DestHost::Ip(IpAddr::from(octets))
            }
            ADDRESS_TYPE_DOMAIN => {
                let mut length = [0u8; 1];
                reader.read_exact(&mut length).await.context("domain length is missing")?;
                let mut name = vec![0u8; length[0] as usize];
                reader.read_exact(&mut name).await.context("domain name is missing")?;
                let name = String::from_utf8(name).context("domain name is not UTF-8")?;
                // A domain that is really an IP literal gets the same
                // treatment as one sent in binary form
                match name.parse::<IpAddr>() {
                    Ok(ip) => DestHost::Ip(ip),
                    Err(_) => DestHost::Domain(name),
                }
            }
            unknown => anyhow::bail!("unknown address type {}", unknown),
        };

        let mut port = [0u8; 2];
        reader.read_exact(&mut port).await.context("port is missing")?;
        let port = u16::from_be_bytes(port);
        if port < 1 {
            anyhow::bail!("invalid destination port {}", port);
        }

        let request = ProxyRequest { host, port };
        if request.host_text().contains('\0') {
            anyhow::bail!("destination must not contain a NUL byte");
        }
        Ok(request)
    }

    /// Textual destination without the port, as fed to the blacklist.
    pub fn host_text(&self) -> String {
        match &self.host {
            DestHost::Ip(ip) => ip.to_string(),
            DestHost::Domain(name) => name.clone(),
        }
    }

    /// host:port form suitable for dialling.
    pub fn dial_text(&self) -> String {
        match &self.host {
            DestHost::Ip(IpAddr::V6(ip)) => format!("[{}]:{}", ip, self.port),
            DestHost::Ip(IpAddr::V4(ip)) => format!("{}:{}", ip, self.port),
            DestHost::Domain(name) => format!("{}:{}", name, self.port),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        match &self.host {
            DestHost::Ip(ip) => Some(*ip),
            DestHost::Domain(_) => None,
        }
    }
}

/// Addresses the relay refuses to dial: anything that would loop traffic
/// back into the host or its networks.
pub fn is_reserved_addr(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_private()
                || ip.is_link_local()
                || ip.is_multicast()
                || ip.is_broadcast()
                // Carrier-grade NAT, 100.64.0.0/10
                || (ip.octets()[0] == 100 && ip.octets()[1] & 0xC0 == 0x40)
        }
        IpAddr::V6(ip) => {
            ip.is_unspecified()
                || ip.is_loopback()
                || ip.is_multicast()
                // Link-local, fe80::/10
                || (ip.segments()[0] & 0xFFC0 == 0xFE80)
                // Unique local, fc00::/7
                || (ip.segments()[0] & 0xFE00 == 0xFC00)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::cipher::{CipherKey, CipherStream};
    use super::*;

    /// Encrypts `payload` as a relay client would and hands back the
    /// server-side reader.
    async fn reader_with_payload(payload: &[u8]) -> CipherReader<tokio::io::ReadHalf<tokio::io::DuplexStream>> {
        let key = CipherKey::derive("test password");
        let (client, server) = tokio::io::duplex(4096);
        let (_, mut client_w) = CipherStream::new(client, key.clone()).split();
        client_w.write(payload).await.expect("write failed");
        let (server_r, _) = CipherStream::new(server, key).split();
        server_r
    }

    #[tokio::test]
    async fn parses_an_ipv4_request() {
        let mut reader = reader_with_payload(&[0x01, 10, 0, 0, 5, 0x00, 0x50]).await;
        let request = ProxyRequest::read_from(&mut reader).await.expect("shouldn't have failed");
        assert_eq!(request.host, DestHost::Ip("10.0.0.5".parse().unwrap()));
        assert_eq!(request.port, 80);
        assert_eq!(request.dial_text(), "10.0.0.5:80");
    }

    #[tokio::test]
    async fn parses_an_ipv6_request() {
        let mut payload = vec![0x04];
        payload.extend_from_slice(&"2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets());
        payload.extend_from_slice(&443u16.to_be_bytes());
        let mut reader = reader_with_payload(&payload).await;
        let request = ProxyRequest::read_from(&mut reader).await.expect("shouldn't have failed");
        assert_eq!(request.host, DestHost::Ip("2001:db8::1".parse().unwrap()));
        assert_eq!(request.dial_text(), "[2001:db8::1]:443");
    }

    #[tokio::test]
    async fn parses_a_domain_request() {
        let mut payload = vec![0x03, 11];
        payload.extend_from_slice(b"example.com");
        payload.extend_from_slice(&8080u16.to_be_bytes());
        let mut reader = reader_with_payload(&payload).await;
        let request = ProxyRequest::read_from(&mut reader).await.expect("shouldn't have failed");
        assert_eq!(request.host, DestHost::Domain("example.com".to_owned()));
        assert_eq!(request.port, 8080);
    }

    #[tokio::test]
    async fn high_nibble_of_the_type_byte_is_ignored() {
        let mut reader = reader_with_payload(&[0xF1, 8, 8, 8, 8, 0x00, 0x35]).await;
        let request = ProxyRequest::read_from(&mut reader).await.expect("shouldn't have failed");
        assert_eq!(request.host, DestHost::Ip("8.8.8.8".parse().unwrap()));
    }

    #[tokio::test]
    async fn domain_that_is_an_ip_literal_parses_as_ip() {
        let mut payload = vec![0x03, 9];
        payload.extend_from_slice(b"127.0.0.1");
        payload.extend_from_slice(&22u16.to_be_bytes());
        let mut reader = reader_with_payload(&payload).await;
        let request = ProxyRequest::read_from(&mut reader).await.expect("shouldn't have failed");
        assert_eq!(request.ip(), Some("127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn rejects_port_zero() {
        let mut reader = reader_with_payload(&[0x01, 0, 0, 0, 0, 0x00, 0x00]).await;
        let err = ProxyRequest::read_from(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("invalid destination port"));
    }

    #[tokio::test]
    async fn rejects_unknown_address_types() {
        let mut reader = reader_with_payload(&[0x02, 0, 0, 0, 0, 0x00, 0x50]).await;
        let err = ProxyRequest::read_from(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("unknown address type"));
    }

    #[tokio::test]
    async fn rejects_nul_in_the_destination() {
        let mut payload = vec![0x03, 5];
        payload.extend_from_slice(b"a\0b.c");
        payload.extend_from_slice(&80u16.to_be_bytes());
        let mut reader = reader_with_payload(&payload).await;
        let err = ProxyRequest::read_from(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }

    #[test]
    fn reserved_address_classification() {
        for reserved in ["0.0.0.0", "127.0.0.1", "10.0.0.1", "172.16.3.4", "192.168.1.1", "169.254.0.1", "224.0.0.1", "100.64.0.7", "::1", "fe80::1", "fd00::1", "ff02::1"] {
            assert!(is_reserved_addr(reserved.parse().unwrap()), "{} should be reserved", reserved);
        }
        for public in ["8.8.8.8", "93.184.216.34", "2001:4860:4860::8888"] {
            assert!(!is_reserved_addr(public.parse().unwrap()), "{} should be dialable", public);
        }
    }
}
