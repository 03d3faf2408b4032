use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::signing;
use crate::types::Job;

/// Why a presented artifact token was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    Malformed,
    Expired,
    SignatureMismatch,
    WrongUser,
}

impl TokenError {
    pub fn reason(&self) -> &'static str {
        match self {
            TokenError::Malformed => "malformed",
            TokenError::Expired => "expired",
            TokenError::SignatureMismatch => "signature_mismatch",
            TokenError::WrongUser => "wrong_user",
        }
    }
}

impl fmt::Display for TokenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.reason())
    }
}

impl std::error::Error for TokenError {}

/// Issues and validates the signed tokens that gate direct access to stored
/// artifacts. A token binds (job id, owner, expiry) to an HMAC signature;
/// possession of a valid token is authorization.
pub struct ArtifactTokenizer {
    secret: String,
    ttl: Duration,
}

impl ArtifactTokenizer {
    pub fn new(secret: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.into(),
            ttl,
        }
    }

    /// Token shape: `v1.<unix expiry>.<hex hmac>`.
    pub fn issue(&self, job: &Job, now: DateTime<Utc>) -> String {
        let expires = (now + chrono::Duration::from_std(self.ttl).expect("ttl out of range"))
            .timestamp();
        let signature = signing::sign_payload(
            Self::signed_material(&job.id, &job.user_id, expires).as_bytes(),
            &self.secret,
        );
        format!("v1.{expires}.{signature}")
    }

    /// Recompute the expected signature over the candidate job's fields and
    /// require constant-time equality plus an unexpired deadline. When
    /// `strict_user` is set, the job must additionally belong to that user.
    pub fn validate(
        &self,
        token: &str,
        job: &Job,
        now: DateTime<Utc>,
        strict_user: Option<&str>,
    ) -> Result<(), TokenError> {
        let mut parts = token.splitn(3, '.');
        let (version, expires, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(v), Some(e), Some(s)) => (v, e, s),
            _ => return Err(TokenError::Malformed),
        };
        if version != "v1" {
            return Err(TokenError::Malformed);
        }
        let expires: i64 = expires.parse().map_err(|_| TokenError::Malformed)?;

        if !signing::verify_payload(
            Self::signed_material(&job.id, &job.user_id, expires).as_bytes(),
            &self.secret,
            signature,
        ) {
            return Err(TokenError::SignatureMismatch);
        }
        if now.timestamp() > expires {
            return Err(TokenError::Expired);
        }
        if let Some(user_id) = strict_user {
            if job.user_id != user_id {
                return Err(TokenError::WrongUser);
            }
        }
        Ok(())
    }

    fn signed_material(job_id: &str, user_id: &str, expires: i64) -> String {
        format!("{job_id}:{user_id}:{expires}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageFormat, JobKind, NewJob, ScreenshotRequest};

    fn job_for(user: &str) -> Job {
        NewJob {
            user_id: user.to_string(),
            api_key_id: "k1".to_string(),
            kind: JobKind::Screenshot,
            request: ScreenshotRequest {
                url: "https://example.com".to_string(),
                width: 800,
                height: 600,
                format: ImageFormat::Png,
                full_page: false,
                wait_selector: None,
                wait_ms: None,
                quality: None,
                language: None,
            },
            webhook_url: None,
            max_retries: 3,
        }
        .into_job(Utc::now())
    }

    fn tokenizer() -> ArtifactTokenizer {
        ArtifactTokenizer::new("artifact-secret", Duration::from_secs(900))
    }

    #[test]
    fn issued_tokens_validate() {
        let job = job_for("u1");
        let now = Utc::now();
        let token = tokenizer().issue(&job, now);
        assert!(tokenizer().validate(&token, &job, now, None).is_ok());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let job = job_for("u1");
        let now = Utc::now();
        let token = tokenizer().issue(&job, now);
        let later = now + chrono::Duration::seconds(901);
        assert_eq!(
            tokenizer().validate(&token, &job, later, None),
            Err(TokenError::Expired)
        );
    }

    #[test]
    fn tokens_are_bound_to_the_job() {
        let job = job_for("u1");
        let other = job_for("u1");
        let now = Utc::now();
        let token = tokenizer().issue(&job, now);
        assert_eq!(
            tokenizer().validate(&token, &other, now, None),
            Err(TokenError::SignatureMismatch)
        );
    }

    #[test]
    fn strict_mode_requires_matching_user() {
        let job = job_for("u1");
        let now = Utc::now();
        let token = tokenizer().issue(&job, now);
        assert!(tokenizer().validate(&token, &job, now, Some("u1")).is_ok());
        assert_eq!(
            tokenizer().validate(&token, &job, now, Some("u2")),
            Err(TokenError::WrongUser)
        );
    }

    #[test]
    fn garbage_is_malformed() {
        let job = job_for("u1");
        let now = Utc::now();
        assert_eq!(
            tokenizer().validate("not-a-token", &job, now, None),
            Err(TokenError::Malformed)
        );
        assert_eq!(
            tokenizer().validate("v2.123.abc", &job, now, None),
            Err(TokenError::Malformed)
        );
    }
}
