use warden_cron::CronError;
use warden_events::EventError;

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error(transparent)]
    Event(#[from] EventError),
    #[error(transparent)]
    Cron(#[from] CronError),
    #[error("plugin {0:?} is already installed")]
    DuplicatePlugin(String),
    #[error("plugin {plugin:?} failed to start: {reason:#}")]
    Startup {
        plugin: String,
        reason: anyhow::Error,
    },
}

pub type Result<T> = std::result::Result<T, HostError>;
