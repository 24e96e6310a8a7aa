use url::Url;

use crate::error::{AppError, Result};

/// Extract the lowercased hostname from a page URL.
///
/// A missing scheme is treated as `https://`, so `example.com/inbox`
/// resolves to `example.com`.
pub fn extract_hostname(raw: &str) -> Result<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(AppError::InvalidUrl("empty URL".into()));
    }

    let with_scheme = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let parsed = Url::parse(&with_scheme).map_err(|e| AppError::InvalidUrl(e.to_string()))?;
    let host = parsed
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AppError::InvalidUrl(format!("no host in {:?}", raw)))?;

    Ok(host.to_lowercase())
}
