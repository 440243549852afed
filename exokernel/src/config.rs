//! Machine configuration.

/// Default number of physical page frames (8 MiB).
pub const DEFAULT_FRAMES: usize = 2048;

/// Parameters of a [`Machine`](crate::Machine).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineConfig {
    /// Number of physical page frames, including the reserved frame zero.
    pub frames: usize,
    /// Mutes kernel logging and the echo of user console output.
    pub quiet: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            frames: DEFAULT_FRAMES,
            quiet: false,
        }
    }
}

impl MachineConfig {
    /// Starts a configuration from the defaults.
    pub fn builder() -> MachineConfigBuilder {
        MachineConfigBuilder {
            config: Self::default(),
        }
    }
}

/// The [`MachineConfigBuilder`] provides an interface for configuring a
/// machine before it boots.
///
/// ```
/// use exokernel::MachineConfig;
///
/// let config = MachineConfig::builder().frames(64).quiet(true).build();
/// assert_eq!(config.frames, 64);
/// ```
pub struct MachineConfigBuilder {
    config: MachineConfig,
}

impl MachineConfigBuilder {
    /// Sets the amount of physical memory, in page frames.
    ///
    /// Frame zero is never handed out, so a machine has `frames - 1` usable
    /// frames.
    pub fn frames(mut self, frames: usize) -> Self {
        self.config.frames = frames.max(1);
        self
    }

    /// Mutes kernel logging.
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.config.quiet = quiet;
        self
    }

    /// Finishes the configuration.
    pub fn build(self) -> MachineConfig {
        self.config
    }
}
