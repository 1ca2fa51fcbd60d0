use anyhow::{Context, Result};
use std::net::ToSocketAddrs;
use std::time::Duration;

use crate::ViewerConfig;

pub fn check_viewer(cfg: &ViewerConfig) -> Result<()> {
    let bind = cfg.bind();
    let mut addrs = bind
        .to_socket_addrs()
        .with_context(|| format!("viewer.bind is not a host:port address: {}", bind))?;
    anyhow::ensure!(addrs.next().is_some(), "viewer.bind resolves to nothing: {}", bind);
    anyhow::ensure!(cfg.ws_path().starts_with('/'), "viewer.ws_path must start with '/'");
    anyhow::ensure!(
        cfg.push_timeout() >= Duration::from_millis(10),
        "viewer.push_timeout_ms too small; set >= 10"
    );
    Ok(())
}
