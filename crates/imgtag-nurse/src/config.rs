use std::collections::HashMap;
use std::time::Duration;

/// How to spawn and restart-throttle the supervised child.
#[derive(Clone, Debug)]
pub struct NurseConfig {
    pub path: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,

    /// A child must stay alive at least this long for the failure counter
    /// to reset.
    pub min_alive_time: Duration,

    /// Consecutive fast failures before `Nurse::run` gives up.
    pub max_failed_restarts: u32,

    /// Grace period between SIGTERM and a forced kill on shutdown.
    pub kill_timeout: Duration,
}

impl NurseConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            args: Vec::new(),
            env: HashMap::new(),
            min_alive_time: Duration::from_secs(5),
            max_failed_restarts: 5,
            kill_timeout: Duration::from_secs(5),
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}
