//! Cron errors.

#[derive(Debug, thiserror::Error)]
pub enum CronError {
    /// A rate spec that does not parse or falls outside its field's domain.
    #[error("invalid {field} spec {spec:?}: {reason}")]
    InvalidSpec {
        field: &'static str,
        spec: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, CronError>;
