use std::collections::HashSet;
use std::fmt;
use std::sync::{LazyLock, OnceLock};

use parking_lot::Mutex;

/// Device ids handed out in this process. Never pruned; it only needs to
/// keep concurrently emulated devices apart.
static ISSUED_DEVICE_IDS: LazyLock<Mutex<HashSet<String>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Signaling parameters of one emulated device.
#[derive(Debug, Clone, Default)]
pub struct SipConfig {
    /// Platform address, e.g. `tcp://127.0.0.1:5060`.
    pub addr: String,
    /// SIP domain, e.g. `3402000000`.
    pub domain: String,
    /// Device id, or its prefix when `random` is non-zero.
    pub user: String,
    /// Number of random decimal digits appended to `user`.
    pub random: usize,
    /// Platform id, e.g. `34020000002000000001`.
    pub server: String,
    device_id: OnceLock<String>,
}

impl SipConfig {
    pub fn new(addr: &str, domain: &str, user: &str, random: usize, server: &str) -> Self {
        SipConfig {
            addr: addr.to_string(),
            domain: domain.to_string(),
            user: user.to_string(),
            random,
            server: server.to_string(),
            device_id: OnceLock::new(),
        }
    }

    /// The device id, derived on first use and fixed afterwards.
    ///
    /// `user` followed by `random` digits. A suffix already issued to
    /// another config in this process is redrawn.
    pub fn device_id(&self) -> &str {
        self.device_id.get_or_init(|| {
            if self.random == 0 {
                return self.user.clone();
            }
            let mut issued = ISSUED_DEVICE_IDS.lock();
            loop {
                let candidate = format!("{}{}", self.user, random_digits(self.random));
                if issued.insert(candidate.clone()) {
                    return candidate;
                }
                tracing::debug!(device_id = %candidate, "device id already issued, redraw");
            }
        })
    }
}

/// `n` decimal digits taken from concatenated random `u64`s.
fn random_digits(n: usize) -> String {
    let mut digits = String::with_capacity(n + 20);
    while digits.len() < n {
        digits.push_str(&rand::random::<u64>().to_string());
    }
    digits.truncate(n);
    digits
}

impl fmt::Display for SipConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if !self.addr.is_empty() {
            parts.push(format!("addr={}", self.addr));
        }
        if !self.domain.is_empty() {
            parts.push(format!("domain={}", self.domain));
        }
        if !self.user.is_empty() {
            parts.push(format!("user={}", self.user));
            parts.push(format!("deviceID={}", self.device_id()));
        }
        if self.random > 0 {
            parts.push(format!("random={}", self.random));
        }
        if !self.server.is_empty() {
            parts.push(format!("server={}", self.server));
        }
        f.write_str(&parts.join(","))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hundred_configs_get_distinct_ids() {
        let configs: Vec<SipConfig> = (0..100)
            .map(|_| SipConfig::new("tcp://127.0.0.1:5060", "3402000000", "3402000000", 4, "srs"))
            .collect();
        let ids: HashSet<&str> = configs.iter().map(|c| c.device_id()).collect();
        assert_eq!(ids.len(), 100);
        assert!(ids.iter().all(|id| id.len() == 14 && id.starts_with("3402000000")));
    }

    #[test]
    fn device_id_is_stable() {
        let c = SipConfig::new("", "", "dev", 6, "");
        let first = c.device_id().to_string();
        assert_eq!(c.device_id(), first);
        assert_eq!(c.clone().device_id(), first);
    }

    #[test]
    fn zero_random_uses_user_verbatim() {
        let a = SipConfig::new("", "", "34020000001320000001", 0, "");
        let b = SipConfig::new("", "", "34020000001320000001", 0, "");
        assert_eq!(a.device_id(), "34020000001320000001");
        assert_eq!(b.device_id(), "34020000001320000001");
    }

    #[test]
    fn display_skips_empty_fields() {
        let c = SipConfig::new("tcp://127.0.0.1:5060", "3402000000", "", 0, "srs");
        assert_eq!(c.to_string(), "addr=tcp://127.0.0.1:5060,domain=3402000000,server=srs");

        let c = SipConfig::new("", "", "cam", 0, "");
        assert_eq!(c.to_string(), "user=cam,deviceID=cam");
    }
}
