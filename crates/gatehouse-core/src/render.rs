//! Client configuration rendering.
//!
//! Pure transforms: a peer plus its owning gateway's endpoint and interface
//! key become a wg-quick document and a QR encoding of it. No side effects,
//! no store access; decrypting the peer's private key is the caller's job.

use std::fmt::Write as _;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use qrcode::QrCode;
use qrcode::render::svg;

use gatehouse_types::{Gateway, Peer};

use crate::error::RenderError;
use crate::subnet;

/// Render the wg-quick configuration for an applied peer.
///
/// Full-tunnel: all IPv4 and IPv6 traffic routes through the gateway,
/// keepalive 25s.
pub fn client_config(
    gateway: &Gateway,
    peer: &Peer,
    private_key: &str,
    dns_servers: &[String],
    listen_port: u16,
) -> Result<String, RenderError> {
    if !peer.applied {
        return Err(RenderError::PeerNotApplied);
    }
    let endpoint = gateway.public_addr.as_deref().ok_or(RenderError::NoEndpoint)?;
    let gateway_key = gateway
        .public_key
        .as_deref()
        .ok_or(RenderError::MissingServerKey)?;

    let address = subnet::host_address(gateway.subnet, peer.host_index);

    let mut doc = String::new();
    let _ = writeln!(doc, "# {}", peer.name);
    let _ = writeln!(doc, "[Interface]");
    let _ = writeln!(doc, "PrivateKey = {private_key}");
    let _ = writeln!(doc, "Address = {address}/32");
    if !dns_servers.is_empty() {
        let _ = writeln!(doc, "DNS = {}", dns_servers.join(", "));
    }
    let _ = writeln!(doc);
    let _ = writeln!(doc, "[Peer]");
    let _ = writeln!(doc, "PublicKey = {gateway_key}");
    let _ = writeln!(doc, "AllowedIPs = 0.0.0.0/0, ::/0");
    let _ = writeln!(doc, "Endpoint = {endpoint}:{listen_port}");
    let _ = writeln!(doc, "PersistentKeepalive = 25");

    Ok(doc)
}

/// Encode a configuration document as an SVG QR image.
pub fn qr_svg(config: &str) -> Result<String, RenderError> {
    let code = QrCode::new(config.as_bytes())?;
    Ok(code
        .render::<svg::Color<'_>>()
        .min_dimensions(240, 240)
        .quiet_zone(true)
        .build())
}

/// The QR image as a data URI, ready for an <img> tag.
pub fn qr_data_uri(config: &str) -> Result<String, RenderError> {
    let image = qr_svg(config)?;
    Ok(format!(
        "data:image/svg+xml;base64,{}",
        BASE64.encode(image.as_bytes())
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use gatehouse_types::GatewayState;
    use uuid::Uuid;

    fn gateway() -> Gateway {
        Gateway {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            region: "us-east-1".into(),
            machine_class: "t3.micro".into(),
            state: GatewayState::Running,
            state_reason: None,
            cloud_id: Some("m-1234".into()),
            public_addr: Some("203.0.113.7".into()),
            public_key: Some("gw-public-key".into()),
            subnet: "10.10.0.0/24".parse().unwrap(),
            next_host_index: 2,
            created_at: Utc::now(),
            last_reconciled_at: None,
        }
    }

    fn peer(applied: bool) -> Peer {
        Peer {
            id: Uuid::new_v4(),
            gateway_id: Uuid::new_v4(),
            name: "my-phone".into(),
            device_class: "phone".into(),
            host_index: 2,
            public_key: "peer-public-key".into(),
            private_key_enc: vec![],
            private_key_nonce: vec![],
            applied,
            removing: false,
            created_at: Utc::now(),
        }
    }

    fn dns() -> Vec<String> {
        vec!["1.1.1.1".into(), "8.8.8.8".into()]
    }

    #[test]
    fn renders_full_tunnel_config() {
        let doc =
            client_config(&gateway(), &peer(true), "peer-private-key", &dns(), 51820).unwrap();

        assert!(doc.contains("# my-phone"));
        assert!(doc.contains("PrivateKey = peer-private-key"));
        assert!(doc.contains("Address = 10.10.0.2/32"));
        assert!(doc.contains("DNS = 1.1.1.1, 8.8.8.8"));
        assert!(doc.contains("PublicKey = gw-public-key"));
        assert!(doc.contains("AllowedIPs = 0.0.0.0/0, ::/0"));
        assert!(doc.contains("Endpoint = 203.0.113.7:51820"));
        assert!(doc.contains("PersistentKeepalive = 25"));
    }

    #[test]
    fn pending_peer_is_rejected_with_no_output() {
        let err =
            client_config(&gateway(), &peer(false), "key", &dns(), 51820).unwrap_err();
        assert!(matches!(err, RenderError::PeerNotApplied));
    }

    #[test]
    fn missing_endpoint_is_rejected() {
        let mut gw = gateway();
        gw.public_addr = None;
        let err = client_config(&gw, &peer(true), "key", &dns(), 51820).unwrap_err();
        assert!(matches!(err, RenderError::NoEndpoint));
    }

    #[test]
    fn missing_gateway_key_is_rejected() {
        let mut gw = gateway();
        gw.public_key = None;
        let err = client_config(&gw, &peer(true), "key", &dns(), 51820).unwrap_err();
        assert!(matches!(err, RenderError::MissingServerKey));
    }

    #[test]
    fn empty_dns_list_omits_the_line() {
        let doc = client_config(&gateway(), &peer(true), "key", &[], 51820).unwrap();
        assert!(!doc.contains("DNS"));
    }

    #[test]
    fn qr_encodes_the_document() {
        let doc =
            client_config(&gateway(), &peer(true), "peer-private-key", &dns(), 51820).unwrap();
        let uri = qr_data_uri(&doc).unwrap();
        let prefix = "data:image/svg+xml;base64,";
        assert!(uri.starts_with(prefix));
        let svg = BASE64.decode(&uri[prefix.len()..]).unwrap();
        assert!(String::from_utf8(svg).unwrap().contains("<svg"));
    }
}
