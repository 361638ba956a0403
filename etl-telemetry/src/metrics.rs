use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Mutex;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};
use tracing::info;

// `PrometheusBuilder::install` registers a process-wide recorder and fails when called
// twice, which happens across tests sharing a binary. The flag turns repeated calls into
// no-ops.
static INSTALLED: Mutex<bool> = Mutex::new(false);

/// Installs the Prometheus recorder and serves `[::]:{port}/metrics`.
///
/// Must be called from within a tokio runtime since the exporter spawns its HTTP listener
/// on it.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    let mut installed = match INSTALLED.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };

    if *installed {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port))
        .install()?;

    *installed = true;
    info!(port, "prometheus exporter listening");

    Ok(())
}
