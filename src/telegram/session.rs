//! Session-string codec.
//!
//! A session string is a `'1'` version tag followed by the base64url encoding
//! of `[dc_id:u8][ip:4 bytes BE][port:u16 BE][auth_key:256 bytes]`. The DC
//! address table is fixed; the IP in the payload is informational and the
//! decoder trusts the dc id.

use crate::error::{Error, Result};
use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// Version tag every supported session string starts with.
const SESSION_VERSION: char = '1';

/// Raw auth key size in bytes.
pub const AUTH_KEY_LEN: usize = 256;

/// Decoded payload size: dc + ip + port + auth key.
const PAYLOAD_LEN: usize = 1 + 4 + 2 + AUTH_KEY_LEN;

/// Fixed data-center address table.
const DC_ADDRS: [(i32, Ipv4Addr); 5] = [
    (1, Ipv4Addr::new(149, 154, 175, 53)),
    (2, Ipv4Addr::new(149, 154, 167, 51)),
    (3, Ipv4Addr::new(149, 154, 175, 100)),
    (4, Ipv4Addr::new(149, 154, 167, 91)),
    (5, Ipv4Addr::new(91, 108, 56, 130)),
];

/// Decoded session material
pub struct TgSession {
    /// Home data center id
    pub dc_id: i32,
    /// Data center address carried in the string
    pub addr: SocketAddr,
    /// MTProto auth key
    pub auth_key: [u8; AUTH_KEY_LEN],
}

/// Decode a session string into its DC and auth key.
pub fn decode(encoded: &str) -> Result<TgSession> {
    let payload = encoded
        .strip_prefix(SESSION_VERSION)
        .ok_or_else(|| Error::Telegram("unsupported session string version".to_string()))?;

    let raw = URL_SAFE
        .decode(payload)
        .map_err(|e| Error::Telegram(format!("malformed session string: {}", e)))?;
    if raw.len() != PAYLOAD_LEN {
        return Err(Error::Telegram(format!(
            "malformed session string: expected {} payload bytes, got {}",
            PAYLOAD_LEN,
            raw.len()
        )));
    }

    let dc_id = raw[0] as i32;
    let ip = Ipv4Addr::new(raw[1], raw[2], raw[3], raw[4]);
    let port = u16::from_be_bytes([raw[5], raw[6]]);

    let mut auth_key = [0u8; AUTH_KEY_LEN];
    auth_key.copy_from_slice(&raw[7..]);

    Ok(TgSession {
        dc_id,
        addr: SocketAddr::V4(SocketAddrV4::new(ip, port)),
        auth_key,
    })
}

/// Encode an auth key into a session string for the given DC.
///
/// The auth-issuing collaborator writes these; it lives here so both sides
/// agree on the format and the decoder can be tested against it.
pub fn encode(dc_id: i32, auth_key: &[u8; AUTH_KEY_LEN], port: u16) -> Result<String> {
    let ip = DC_ADDRS
        .iter()
        .find(|(id, _)| *id == dc_id)
        .map(|(_, ip)| *ip)
        .ok_or_else(|| Error::Telegram(format!("unknown data center {}", dc_id)))?;

    let mut payload = Vec::with_capacity(PAYLOAD_LEN);
    payload.push(dc_id as u8);
    payload.extend_from_slice(&ip.octets());
    payload.extend_from_slice(&port.to_be_bytes());
    payload.extend_from_slice(auth_key);

    Ok(format!("{}{}", SESSION_VERSION, URL_SAFE.encode(payload)))
}
