//! Bounds-checked decoding of the few application-layer fields we label
//! packets with: the TLS Client Hello server name and the DNS query name.
//!
//! Every read goes through [`Cursor`], so a truncated or hostile buffer ends
//! the walk early instead of indexing past the end.

/// TLS record content types
pub const TLS_HANDSHAKE: u8 = 22;
pub const TLS_APPLICATION_DATA: u8 = 23;

/// TLS handshake types
pub const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub const HANDSHAKE_SERVER_HELLO: u8 = 2;

pub const EXT_SERVER_NAME: u16 = 0;
const SNI_HOST_NAME: u8 = 0;

/// Offset of the question section in a DNS message.
const DNS_HEADER_LEN: usize = 12;
const DNS_POINTER_MASK: u8 = 0xC0;

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn at(buf: &'a [u8], pos: usize) -> Self {
        Cursor { buf, pos }
    }

    fn u8(&mut self) -> Option<u8> {
        let b = *self.buf.get(self.pos)?;
        self.pos += 1;
        Some(b)
    }

    fn u16(&mut self) -> Option<u16> {
        let bytes = self.buf.get(self.pos..self.pos.checked_add(2)?)?;
        self.pos += 2;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let bytes = self.buf.get(self.pos..self.pos.checked_add(len)?)?;
        self.pos += len;
        Some(bytes)
    }

    /// Moves forward without requiring the skipped bytes to exist; the next read checks.
    fn skip(&mut self, len: usize) {
        self.pos = self.pos.saturating_add(len);
    }
}

/// Server name from a TLS record holding a Client Hello, if it carries one.
pub fn extract_sni(record: &[u8]) -> Option<String> {
    if record.first() != Some(&TLS_HANDSHAKE) || record.get(5) != Some(&HANDSHAKE_CLIENT_HELLO) {
        return None;
    }

    // record header (5) + handshake header (4), then client version and random
    let mut cur = Cursor::at(record, 9);
    cur.skip(2 + 32);

    let session_id_len = cur.u8()? as usize;
    cur.skip(session_id_len);
    let cipher_suites_len = cur.u16()? as usize;
    cur.skip(cipher_suites_len);
    let compression_len = cur.u8()? as usize;
    cur.skip(compression_len);

    let extensions_len = cur.u16()? as usize;
    let extensions_end = cur.pos.saturating_add(extensions_len);

    while cur.pos < extensions_end {
        let ext_type = cur.u16()?;
        let ext_len = cur.u16()? as usize;

        if ext_type != EXT_SERVER_NAME {
            cur.skip(ext_len);
            continue;
        }

        // server name list length
        cur.skip(2);
        if cur.u8()? != SNI_HOST_NAME {
            return None;
        }
        let name_len = cur.u16()? as usize;
        return cur.take(name_len).map(ascii);
    }

    None
}

/// Short label for a TLS record that is not a Client Hello with SNI.
pub fn classify_tls_record(record: &[u8]) -> &'static str {
    match record.first() {
        Some(&TLS_HANDSHAKE) if record.len() > 9 => {
            if record[5] == HANDSHAKE_SERVER_HELLO {
                "Server Hello"
            } else {
                "TLS Handshake"
            }
        }
        Some(&TLS_APPLICATION_DATA) => "Application Data",
        _ => "TLS Record",
    }
}

/// First question name of a DNS message. Compression pointers end the name
/// (they are not followed) and a truncated label yields what was read so far.
pub fn dns_query_name(message: &[u8]) -> String {
    let mut cur = Cursor::at(message, DNS_HEADER_LEN);
    let mut labels: Vec<String> = Vec::new();

    while let Some(len) = cur.u8() {
        if len == 0 || len & DNS_POINTER_MASK == DNS_POINTER_MASK {
            break;
        }
        match cur.take(len as usize) {
            Some(label) => labels.push(ascii(label)),
            None => break,
        }
    }

    labels.join(".")
}

/// Bytes outside 7-bit ASCII become `?`.
fn ascii(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|&b| if b.is_ascii() { b as char } else { '?' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn client_hello(sni: &str) -> Vec<u8> {
        let mut ext = Vec::new();
        // an unrelated extension first (supported_groups)
        ext.extend_from_slice(&[0x00, 0x0a, 0x00, 0x04, 0x00, 0x02, 0x00, 0x1d]);
        let name = sni.as_bytes();
        let list_len = name.len() + 3;
        ext.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        ext.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
        ext.extend_from_slice(&(list_len as u16).to_be_bytes());
        ext.push(SNI_HOST_NAME);
        ext.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext.extend_from_slice(name);

        let mut body = vec![0x03, 0x03];
        body.extend_from_slice(&[0xab; 32]);
        body.push(4);
        body.extend_from_slice(&[1, 2, 3, 4]);
        body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]);
        body.extend_from_slice(&[0x01, 0x00]);
        body.extend_from_slice(&(ext.len() as u16).to_be_bytes());
        body.extend_from_slice(&ext);

        let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![TLS_HANDSHAKE, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    fn dns_query(labels: &[&[u8]]) -> Vec<u8> {
        let mut msg = vec![0x12, 0x34, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        for label in labels {
            msg.push(label.len() as u8);
            msg.extend_from_slice(label);
        }
        msg.push(0);
        msg.extend_from_slice(&[0, 1, 0, 1]);
        msg
    }

    #[test]
    fn extracts_sni_from_client_hello() {
        assert_eq!(extract_sni(&client_hello("example.com")).as_deref(), Some("example.com"));
    }

    #[test]
    fn truncated_client_hello_yields_nothing() {
        let record = client_hello("example.com");
        for cut in 0..record.len() {
            assert_eq!(extract_sni(&record[..cut]), None, "cut at {cut}");
        }
    }

    #[test]
    fn non_client_hello_has_no_sni() {
        let mut record = client_hello("example.com");
        record[5] = HANDSHAKE_SERVER_HELLO;
        assert_eq!(extract_sni(&record), None);
        assert_eq!(classify_tls_record(&record), "Server Hello");

        record[0] = TLS_APPLICATION_DATA;
        assert_eq!(extract_sni(&record), None);
        assert_eq!(classify_tls_record(&record), "Application Data");
    }

    #[test]
    fn classifies_short_and_foreign_records() {
        assert_eq!(classify_tls_record(&[22, 3, 1, 0, 4, 1, 0]), "TLS Record");
        assert_eq!(classify_tls_record(&[21, 3, 3, 0, 2, 2, 40]), "TLS Record");
        assert_eq!(classify_tls_record(&[]), "TLS Record");
        assert_eq!(classify_tls_record(&[22, 3, 1, 0, 4, 11, 0, 0, 0, 0]), "TLS Handshake");
    }

    #[test]
    fn decodes_dns_labels() {
        let msg = dns_query(&[b"www", b"example", b"com"]);
        assert_eq!(dns_query_name(&msg), "www.example.com");
    }

    #[test]
    fn dns_pointer_stops_decoding() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[3, b'w', b'w', b'w', 0xC0, 0x0c]);
        assert_eq!(dns_query_name(&msg), "www");

        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[0xC0, 0x0c]);
        assert_eq!(dns_query_name(&msg), "");
    }

    #[test]
    fn dns_truncated_label_keeps_prefix() {
        let mut msg = vec![0u8; 12];
        msg.extend_from_slice(&[3, b'w', b'w', b'w', 7, b'e', b'x']);
        assert_eq!(dns_query_name(&msg), "www");
        assert_eq!(dns_query_name(&[0u8; 5]), "");
    }

    proptest! {
        #[test]
        fn decoders_never_panic(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let _ = extract_sni(&bytes);
            let _ = classify_tls_record(&bytes);
            let _ = dns_query_name(&bytes);
        }

        #[test]
        fn sni_survives_any_name(name in "[a-z0-9.-]{1,64}") {
            prop_assert_eq!(extract_sni(&client_hello(&name)), Some(name));
        }
    }
}
