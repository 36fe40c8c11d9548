use std::env;

/// Which runtime a newly built plan should commit to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ForwardType {
    #[default]
    Cpu,
    /// Pick the best runtime available in this build.
    Auto,
}

impl ForwardType {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(Self::Cpu),
            "auto" => Some(Self::Auto),
            _ => None,
        }
    }
}

/// Executor configuration. Caches keep the configuration that was current
/// when they were built.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub forward_type: ForwardType,
    pub num_threads: usize,
    /// Record per-operator run time and flops.
    pub profile: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            forward_type: ForwardType::default(),
            num_threads: num_cpus::get().max(1),
            profile: false,
        }
    }
}

impl ExecutorConfig {
    pub fn with_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn with_forward_type(mut self, forward_type: ForwardType) -> Self {
        self.forward_type = forward_type;
        self
    }

    pub fn with_profiling(mut self, profile: bool) -> Self {
        self.profile = profile;
        self
    }

    /// Defaults overridden by `LAZYGRAPH_FORWARD`, `LAZYGRAPH_NUM_THREADS`
    /// and `LAZYGRAPH_PROFILE`. Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = env::var("LAZYGRAPH_FORWARD") {
            match ForwardType::parse(&v) {
                Some(f) => config.forward_type = f,
                None => tracing::warn!("ignoring LAZYGRAPH_FORWARD={v}"),
            }
        }
        if let Ok(v) = env::var("LAZYGRAPH_NUM_THREADS") {
            match v.trim().parse::<usize>() {
                Ok(n) => config = config.with_threads(n),
                Err(_) => tracing::warn!("ignoring LAZYGRAPH_NUM_THREADS={v}"),
            }
        }
        if let Ok(v) = env::var("LAZYGRAPH_PROFILE") {
            config.profile = matches!(v.trim(), "1" | "true" | "on");
        }
        config
    }
}
