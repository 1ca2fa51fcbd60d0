use anyhow::Result;

use crate::mav::parse_serial;
use crate::LinkConfig;

const SCHEMES: &[&str] = &["udpin:", "udpout:", "udpbcast:", "tcpin:", "tcpout:", "serial:"];

pub fn check_link(cfg: &LinkConfig) -> Result<()> {
    let addr = cfg.address.trim();
    anyhow::ensure!(!addr.is_empty(), "link.address missing");
    anyhow::ensure!(
        SCHEMES.iter().any(|s| addr.starts_with(s)),
        "link.address must start with one of {:?}: {}",
        SCHEMES,
        addr
    );
    if let Some(rest) = addr.strip_prefix("serial:") {
        let (_, baud) = parse_serial(rest)
            .ok_or_else(|| anyhow::anyhow!("link.address serial form is serial:<device>:<baud>: {}", addr))?;
        anyhow::ensure!(baud > 0, "link.address baud must be > 0");
    }
    anyhow::ensure!(!cfg.heartbeat_timeout().is_zero(), "link.heartbeat_timeout_ms must be > 0");
    let timing = cfg.loop_timing();
    anyhow::ensure!(!timing.recv_timeout.is_zero(), "link.recv_timeout_ms must be > 0");
    anyhow::ensure!(!timing.idle_delay.is_zero(), "link.idle_delay_ms must be > 0");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_common_addresses() {
        for a in ["udpin:0.0.0.0:14550", "tcpout:127.0.0.1:5760", "serial:/dev/ttyACM0:115200"] {
            check_link(&LinkConfig::new(a)).unwrap();
        }
    }

    #[test]
    fn rejects_bad_addresses_and_timings() {
        assert!(check_link(&LinkConfig::new("")).is_err());
        assert!(check_link(&LinkConfig::new("udp://0.0.0.0:14550")).is_err());
        assert!(check_link(&LinkConfig::new("serial:/dev/ttyACM0")).is_err());
        assert!(check_link(&LinkConfig::new("serial:/dev/ttyACM0:0")).is_err());
        assert!(check_link(&LinkConfig::new("serial::57600")).is_err());
        assert!(check_link(&LinkConfig::new("serial:/dev/ttyACM0:fast")).is_err());

        let mut cfg = LinkConfig::new("udpin:0.0.0.0:14550");
        cfg.heartbeat_timeout_ms = Some(0);
        assert!(check_link(&cfg).is_err());
    }
}
