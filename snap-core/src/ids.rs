use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use uuid::Uuid;

/// Generate a job id: millisecond time prefix plus a random suffix.
/// The time prefix keeps ids roughly sortable by creation; the suffix makes
/// collisions between concurrent submissions vanishingly unlikely.
pub fn job_id(now: DateTime<Utc>) -> String {
    format!("job_{:012x}{}", now.timestamp_millis(), random_suffix(10))
}

/// Generate a webhook delivery id, same scheme as job ids.
pub fn delivery_id(now: DateTime<Utc>) -> String {
    format!("whd_{:012x}{}", now.timestamp_millis(), random_suffix(10))
}

/// Generate a worker identity for lock ownership. One per worker task, stable
/// for the lifetime of the task.
pub fn worker_id(prefix: &str) -> String {
    format!("{}-{}", prefix, Uuid::now_v7())
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique() {
        let now = Utc::now();
        let a = job_id(now);
        let b = job_id(now);
        assert_ne!(a, b);
        assert!(a.starts_with("job_"));
    }

    #[test]
    fn time_prefix_sorts_across_milliseconds() {
        let earlier = job_id(Utc::now());
        let later = job_id(Utc::now() + chrono::Duration::seconds(2));
        assert!(later > earlier);
    }

    #[test]
    fn delivery_ids_carry_their_own_prefix() {
        assert!(delivery_id(Utc::now()).starts_with("whd_"));
    }
}
