#[derive(Debug, thiserror::Error)]
pub enum NurseError {
    #[error("already running")]
    AlreadyRunning,

    #[error("failed to start process")]
    FailedToStart,
}
