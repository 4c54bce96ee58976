use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use beach_pier_core::{AuthToken, PairingPayload};
use tracing::debug;

use crate::identity::HostIdentity;

/// Address a device should dial. An explicit override wins; a concrete bind
/// address is used as-is; a wildcard bind picks the first non-loopback IPv4
/// interface, falling back to loopback.
pub fn advertised_host(bind: SocketAddr, advertise: Option<&str>) -> String {
    if let Some(host) = advertise.map(str::trim).filter(|host| !host.is_empty()) {
        return host.to_string();
    }
    if !bind.ip().is_unspecified() {
        return bind.ip().to_string();
    }
    first_lan_ipv4()
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
        .to_string()
}

fn first_lan_ipv4() -> Option<IpAddr> {
    let interfaces = match if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(err) => {
            debug!(error = %err, "could not enumerate interfaces");
            return None;
        }
    };
    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .map(|iface| iface.ip())
        .find(IpAddr::is_ipv4)
}

pub fn pairing_payload(
    local: SocketAddr,
    advertise: Option<&str>,
    identity: &HostIdentity,
    token: &AuthToken,
) -> PairingPayload {
    PairingPayload::new(
        advertised_host(local, advertise),
        local.port(),
        identity.fingerprint(),
        token,
    )
}
