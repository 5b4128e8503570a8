//! LAN service discovery.
//!
//! Advertises `_boww._tcp` on every interface so capture clients can find
//! the server without static configuration. Advertisement failure is not
//! fatal; statically configured clients still connect.

use std::collections::HashMap;

use mdns_sd::{ServiceDaemon, ServiceInfo};
use tracing::info;

const SERVICE_TYPE: &str = "_boww._tcp.local.";

/// Start advertising; the returned daemon must stay alive for the
/// advertisement to persist.
pub fn advertise(instance: &str, port: u16) -> anyhow::Result<ServiceDaemon> {
    let daemon = ServiceDaemon::new()?;

    let host_name = format!(
        "{}.local.",
        instance.to_ascii_lowercase().replace(' ', "-")
    );
    let service = ServiceInfo::new(
        SERVICE_TYPE,
        instance,
        &host_name,
        "",
        port,
        None::<HashMap<String, String>>,
    )?
    .enable_addr_auto();

    daemon.register(service)?;
    info!(instance, service = SERVICE_TYPE, port, "advertising on mDNS");
    Ok(daemon)
}
