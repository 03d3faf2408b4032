use thiserror::Error;
use url::Url;

use snap_core::{validate_webhook_url, ScreenshotRequest, WebhookUrlError};

/// Configured maxima for incoming capture requests.
#[derive(Debug, Clone)]
pub struct RequestLimits {
    pub max_width: u32,
    pub max_height: u32,
    pub max_wait_ms: u32,
}

impl Default for RequestLimits {
    fn default() -> Self {
        Self {
            max_width: 3840,
            max_height: 2160,
            max_wait_ms: 30_000,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("target url is not a valid http(s) url")]
    InvalidUrl,
    #[error("width must be between 1 and {max}")]
    WidthOutOfRange { max: u32 },
    #[error("height must be between 1 and {max}")]
    HeightOutOfRange { max: u32 },
    #[error("quality must be between 1 and 100")]
    QualityOutOfRange,
    #[error("wait_ms must be at most {max}")]
    WaitTooLong { max: u32 },
    #[error("webhook url rejected: {0}")]
    WebhookUrl(#[from] WebhookUrlError),
}

pub fn validate_request(
    request: &ScreenshotRequest,
    limits: &RequestLimits,
) -> Result<(), ValidationError> {
    let parsed = Url::parse(&request.url).map_err(|_| ValidationError::InvalidUrl)?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl);
    }

    if request.width == 0 || request.width > limits.max_width {
        return Err(ValidationError::WidthOutOfRange {
            max: limits.max_width,
        });
    }
    if request.height == 0 || request.height > limits.max_height {
        return Err(ValidationError::HeightOutOfRange {
            max: limits.max_height,
        });
    }

    if request.format.supports_quality() {
        if let Some(quality) = request.quality {
            if !(1..=100).contains(&quality) {
                return Err(ValidationError::QualityOutOfRange);
            }
        }
    }

    if let Some(wait_ms) = request.wait_ms {
        if wait_ms > limits.max_wait_ms {
            return Err(ValidationError::WaitTooLong {
                max: limits.max_wait_ms,
            });
        }
    }

    Ok(())
}

/// Full admission-side validation: the request itself plus the optional
/// per-job webhook destination.
pub fn validate_submission(
    request: &ScreenshotRequest,
    webhook_url: Option<&str>,
    limits: &RequestLimits,
) -> Result<(), ValidationError> {
    validate_request(request, limits)?;
    if let Some(webhook_url) = webhook_url {
        validate_webhook_url(webhook_url)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use snap_core::ImageFormat;

    fn request() -> ScreenshotRequest {
        ScreenshotRequest {
            url: "https://example.com".to_string(),
            width: 1200,
            height: 800,
            format: ImageFormat::Png,
            full_page: false,
            wait_selector: None,
            wait_ms: None,
            quality: None,
            language: None,
        }
    }

    #[test]
    fn accepts_a_reasonable_request() {
        assert!(validate_request(&request(), &RequestLimits::default()).is_ok());
    }

    #[test]
    fn zero_and_oversized_dimensions_are_rejected() {
        let limits = RequestLimits::default();

        let mut zero_width = request();
        zero_width.width = 0;
        assert_eq!(
            validate_request(&zero_width, &limits),
            Err(ValidationError::WidthOutOfRange { max: 3840 })
        );

        let mut too_tall = request();
        too_tall.height = limits.max_height + 1;
        assert_eq!(
            validate_request(&too_tall, &limits),
            Err(ValidationError::HeightOutOfRange { max: 2160 })
        );
    }

    #[test]
    fn quality_bounds_apply_to_lossy_formats() {
        let limits = RequestLimits::default();

        let mut jpeg = request();
        jpeg.format = ImageFormat::Jpeg;
        jpeg.quality = Some(0);
        assert_eq!(
            validate_request(&jpeg, &limits),
            Err(ValidationError::QualityOutOfRange)
        );

        jpeg.quality = Some(85);
        assert!(validate_request(&jpeg, &limits).is_ok());

        // PNG ignores the setting entirely.
        let mut png = request();
        png.quality = Some(0);
        assert!(validate_request(&png, &limits).is_ok());
    }

    #[test]
    fn wait_budget_is_bounded() {
        let mut patient = request();
        patient.wait_ms = Some(60_000);
        assert_eq!(
            validate_request(&patient, &RequestLimits::default()),
            Err(ValidationError::WaitTooLong { max: 30_000 })
        );
    }

    #[test]
    fn non_http_targets_are_rejected() {
        let mut bad = request();
        bad.url = "file:///etc/passwd".to_string();
        assert_eq!(
            validate_request(&bad, &RequestLimits::default()),
            Err(ValidationError::InvalidUrl)
        );

        bad.url = "definitely not a url".to_string();
        assert_eq!(
            validate_request(&bad, &RequestLimits::default()),
            Err(ValidationError::InvalidUrl)
        );
    }

    #[test]
    fn submission_checks_the_webhook_destination() {
        let result = validate_submission(
            &request(),
            Some("http://example.com/hook"),
            &RequestLimits::default(),
        );
        assert!(matches!(result, Err(ValidationError::WebhookUrl(_))));

        assert!(validate_submission(
            &request(),
            Some("https://example.com/hook"),
            &RequestLimits::default(),
        )
        .is_ok());
    }
}
