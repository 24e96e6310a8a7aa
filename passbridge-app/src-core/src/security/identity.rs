use sha2::{Digest, Sha256};

/// Stable host attributes that bind a persisted session to one machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostAttributes {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub user: String,
}

impl HostAttributes {
    /// Collect attributes from the running host.
    pub fn current() -> Self {
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().to_string())
            .unwrap_or_else(|_| "unknown-host".to_string());
        let user = std::env::var("USER")
            .or_else(|_| std::env::var("USERNAME"))
            .unwrap_or_else(|_| "unknown-user".to_string());

        Self {
            hostname,
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            user,
        }
    }

    /// SHA-256 over the attributes, hex encoded.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [&self.hostname, &self.os, &self.arch, &self.user] {
            // length-prefix so ("ab","c") and ("a","bc") differ
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        }
        hex::encode(hasher.finalize())
    }
}

/// Fingerprint of the current device.
pub fn device_fingerprint() -> String {
    HostAttributes::current().fingerprint()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(hostname: &str) -> HostAttributes {
        HostAttributes {
            hostname: hostname.into(),
            os: "linux".into(),
            arch: "x86_64".into(),
            user: "alice".into(),
        }
    }

    #[test]
    fn test_fingerprint_stable() {
        assert_eq!(attrs("box").fingerprint(), attrs("box").fingerprint());
        assert_eq!(device_fingerprint(), device_fingerprint());
        assert_eq!(device_fingerprint().len(), 64);
    }

    #[test]
    fn test_fingerprint_changes_with_host() {
        assert_ne!(attrs("box-a").fingerprint(), attrs("box-b").fingerprint());
    }

    #[test]
    fn test_fingerprint_field_boundaries() {
        let mut a = attrs("ab");
        a.os = "c".into();
        let mut b = attrs("a");
        b.os = "bc".into();
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
