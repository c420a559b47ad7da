use anyhow::{Result, ensure};

/// Process-wide configuration of trap handling.
///
/// A `Config` is handed to [`init_traps`](crate::init_traps). The first call
/// fixes the configuration for the lifetime of the process; later calls are
/// no-ops.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde_derive::Serialize, serde_derive::Deserialize)
)]
pub struct Config {
    pub(crate) signals_based_traps: bool,
    pub(crate) alt_stack_size_multiplier: usize,
    pub(crate) alt_stack_size: Option<usize>,
    pub(crate) handle_sigfpe: bool,
}

impl Config {
    /// Creates a new configuration object with the default configuration
    /// specified.
    pub const fn new() -> Config {
        Config {
            signals_based_traps: true,
            alt_stack_size_multiplier: 4,
            alt_stack_size: None,
            handle_sigfpe: cfg!(any(target_arch = "x86", target_arch = "x86_64")),
        }
    }

    /// Configures whether hardware faults are caught with signal handlers.
    ///
    /// When disabled no process-wide handlers are installed and only explicit
    /// raises such as [`raise_trap`](crate::raise_trap) unwind guarded calls.
    /// A fault in guest code then crashes the process like any other fault.
    ///
    /// This is `true` by default.
    pub fn signals_based_traps(&mut self, enable: bool) -> &mut Self {
        self.signals_based_traps = enable;
        self
    }

    /// Configures the size of each thread's alternate signal stack as a
    /// multiple of the platform's `SIGSTKSZ`.
    ///
    /// The default is 4. Has no effect when
    /// [`Config::alt_stack_size`] is set.
    pub fn alt_stack_size_multiplier(&mut self, multiplier: usize) -> &mut Self {
        self.alt_stack_size_multiplier = multiplier;
        self
    }

    /// Configures an explicit size, in bytes, for each thread's alternate
    /// signal stack. The guard page is not included and the size is rounded up
    /// to a multiple of the page size.
    pub fn alt_stack_size(&mut self, size: Option<usize>) -> &mut Self {
        self.alt_stack_size = size;
        self
    }

    /// Configures whether `SIGFPE` is handled, which is how x86 reports
    /// integer division by zero and overflow.
    ///
    /// This is `true` by default on x86 and x86_64 and `false` elsewhere since
    /// other architectures don't fault on integer division.
    pub fn handle_sigfpe(&mut self, enable: bool) -> &mut Self {
        self.handle_sigfpe = enable;
        self
    }

    /// Checks this configuration for settings which can't work.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.alt_stack_size_multiplier > 0,
            "alternate signal stack size multiplier must be nonzero"
        );
        if let Some(size) = self.alt_stack_size {
            ensure!(size > 0, "alternate signal stack size must be nonzero");
        }
        #[cfg(unix)]
        ensure!(
            self.alt_stack_bytes(rustix::param::page_size()).is_some(),
            "alternate signal stack size is too large"
        );
        Ok(())
    }

    /// Size in bytes of the usable part of an alternate signal stack, rounded
    /// up to `page_size`.
    ///
    /// Returns `None` if the stack and its guard page don't fit in the
    /// address space.
    #[cfg(unix)]
    pub(crate) fn alt_stack_bytes(&self, page_size: usize) -> Option<usize> {
        let size = match self.alt_stack_size {
            Some(size) => size,
            None => libc::SIGSTKSZ.checked_mul(self.alt_stack_size_multiplier)?,
        };
        let size = size.checked_next_multiple_of(page_size)?;
        size.checked_add(page_size)?;
        Some(size)
    }
}

impl Default for Config {
    fn default() -> Config {
        Config::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::new();
        config.validate().unwrap();
        assert!(config.signals_based_traps);
        assert_eq!(config.alt_stack_size_multiplier, 4);
        assert_eq!(config, Config::default());
    }

    #[test]
    fn rejects_empty_alt_stack() {
        let mut config = Config::new();
        config.alt_stack_size_multiplier(0);
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.alt_stack_size(Some(0));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("nonzero"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn explicit_size_overrides_multiplier() {
        let page = 0x1000;
        let rounded = |n: usize| n.next_multiple_of(page);
        let mut config = Config::new();
        assert_eq!(config.alt_stack_bytes(page), Some(rounded(4 * libc::SIGSTKSZ)));
        config.alt_stack_size_multiplier(8);
        assert_eq!(config.alt_stack_bytes(page), Some(rounded(8 * libc::SIGSTKSZ)));
        config.alt_stack_size(Some(1 << 20));
        assert_eq!(config.alt_stack_bytes(page), Some(1 << 20));
        config.alt_stack_size(Some(1));
        assert_eq!(config.alt_stack_bytes(page), Some(page));
    }

    #[cfg(unix)]
    #[test]
    fn rejects_stacks_too_large_to_map() {
        let page = rustix::param::page_size();

        let mut config = Config::new();
        config.alt_stack_size(Some(usize::MAX));
        assert_eq!(config.alt_stack_bytes(page), None);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("too large"), "{err}");

        // Rounds up without overflowing, but leaves no room for the guard.
        config.alt_stack_size(Some(usize::MAX - page * 2 + 2));
        assert_eq!(config.alt_stack_bytes(page), None);
        assert!(config.validate().is_err());

        let mut config = Config::new();
        config.alt_stack_size_multiplier(usize::MAX);
        assert_eq!(config.alt_stack_bytes(page), None);
        assert!(config.validate().is_err());
    }
}
