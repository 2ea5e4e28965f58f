//! mDNS service advertisement.
//!
//! Advertises `_opensentry._tcp.local.` with the device TXT records.
//! Everything here is best-effort: a missing or broken mDNS stack logs a
//! warning and request servicing continues untouched.

use mdns_sd::{ServiceDaemon, ServiceInfo};

const SERVICE_TYPE: &str = "_opensentry._tcp.local.";

pub struct MdnsAdvertiser {
    daemon: Option<ServiceDaemon>,
    fullname: Option<String>,
}

impl MdnsAdvertiser {
    /// Register the service. Failures are logged, never propagated.
    pub fn start(device_name: &str, port: u16, txt: &[(String, String)]) -> Self {
        let instance = sanitize_instance(device_name);
        let host = format!("{instance}.local.");

        let daemon = match ServiceDaemon::new() {
            Ok(daemon) => daemon,
            Err(err) => {
                log::warn!("mDNS advertise failed: {err}");
                return Self {
                    daemon: None,
                    fullname: None,
                };
            }
        };

        let properties: Vec<(&str, &str)> =
            txt.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
        let info = match ServiceInfo::new(SERVICE_TYPE, &instance, &host, "", port, &properties[..])
        {
            Ok(info) => info.enable_addr_auto(),
            Err(err) => {
                log::warn!("mDNS service info invalid: {err}");
                let _ = daemon.shutdown();
                return Self {
                    daemon: None,
                    fullname: None,
                };
            }
        };

        let fullname = info.get_fullname().to_string();
        match daemon.register(info) {
            Ok(()) => {
                log::info!("mDNS advertised {SERVICE_TYPE} for {device_name} on port {port}");
                Self {
                    daemon: Some(daemon),
                    fullname: Some(fullname),
                }
            }
            Err(err) => {
                log::warn!("mDNS advertise failed: {err}");
                let _ = daemon.shutdown();
                Self {
                    daemon: None,
                    fullname: None,
                }
            }
        }
    }

    pub fn stop(&mut self) {
        if let (Some(daemon), Some(fullname)) = (self.daemon.take(), self.fullname.take()) {
            if let Err(err) = daemon.unregister(&fullname) {
                log::debug!("mDNS unregister failed: {err}");
            }
            let _ = daemon.shutdown();
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sanitize_instance(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if cleaned.is_empty() {
        "opensentry".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_names_are_dns_safe() {
        assert_eq!(sanitize_instance("Open Sentry #1"), "Open-Sentry--1");
        assert_eq!(sanitize_instance(""), "opensentry");
        assert_eq!(sanitize_instance("cam_01"), "cam-01");
    }
}
