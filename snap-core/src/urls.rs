use std::fmt;

use url::{Host, Url};

/// Why a webhook destination was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookUrlError {
    Unparsable,
    TooLong,
    UnsupportedScheme,
    PlainHttpNotLoopback,
}

impl WebhookUrlError {
    pub fn reason(&self) -> &'static str {
        match self {
            WebhookUrlError::Unparsable => "unparsable",
            WebhookUrlError::TooLong => "too_long",
            WebhookUrlError::UnsupportedScheme => "unsupported_scheme",
            WebhookUrlError::PlainHttpNotLoopback => "plain_http_not_loopback",
        }
    }
}

impl fmt::Display for WebhookUrlError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for WebhookUrlError {}

const MAX_URL_LENGTH: usize = 2048;

/// Webhook destinations must be https. Plain http is only allowed towards
/// loopback hosts, for local development against the delivery engine.
pub fn validate_webhook_url(raw: &str) -> Result<(), WebhookUrlError> {
    if raw.len() > MAX_URL_LENGTH {
        return Err(WebhookUrlError::TooLong);
    }
    let url = Url::parse(raw).map_err(|_| WebhookUrlError::Unparsable)?;
    match url.scheme() {
        "https" => Ok(()),
        "http" => {
            if host_is_loopback(url.host()) {
                Ok(())
            } else {
                Err(WebhookUrlError::PlainHttpNotLoopback)
            }
        }
        _ => Err(WebhookUrlError::UnsupportedScheme),
    }
}

fn host_is_loopback(host: Option<Host<&str>>) -> bool {
    match host {
        Some(Host::Ipv4(ip)) => ip.is_loopback(),
        Some(Host::Ipv6(ip)) => ip.is_loopback(),
        Some(Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        None => false,
    }
}
