//! RFC 6455 opening handshake.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(sha1(client_key ++ GUID))`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    let digest = hasher.finalize();
    STANDARD.encode(digest)
}

/// True if the request carries the required `Connection: Upgrade` and
/// `Upgrade: websocket` headers (case-insensitive, comma-separated values
/// tolerated for `Connection`).
pub fn is_websocket_upgrade(connection_header: Option<&str>, upgrade_header: Option<&str>) -> bool {
    let has_upgrade_token = connection_header
        .map(|v| v.split(',').any(|tok| tok.trim().eq_ignore_ascii_case("upgrade")))
        .unwrap_or(false);
    let is_websocket = upgrade_header
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    has_upgrade_token && is_websocket
}
