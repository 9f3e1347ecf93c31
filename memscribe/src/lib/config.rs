use crate::stack::SkipLevel;
use once_cell::sync::OnceCell;
use std::ffi::CStr;

/// File name of the log, relative to the traced program's cwd.
pub const LOG_FILE_NAME: &str = "MemoryLog";
/// Environment variable overriding the stack presentation level.
pub const SKIP_VAR: &CStr = c"MEMSCRIBE_SKIP";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Config {
    pub log_path:   &'static str,
    pub skip:       SkipLevel,
}

impl Default for Config {
    fn default() -> Self {
        Self { log_path: LOG_FILE_NAME, skip: SkipLevel::default() }
    }
}

impl Config {
    /// Reads the environment via `getenv`, which does not allocate.
    pub fn from_env() -> Self {
        let raw = unsafe { libc::getenv(SKIP_VAR.as_ptr()) };
        let skip = if raw.is_null() {
            None
        } else {
            SkipLevel::parse(unsafe { CStr::from_ptr(raw) }.to_bytes())
        };

        Self { skip: skip.unwrap_or_default(), ..Self::default() }
    }

    /// Process-wide configuration, read once on first use.
    pub fn get() -> &'static Config {
        static CONFIG: OnceCell<Config> = OnceCell::new();
        CONFIG.get_or_init(Config::from_env)
    }
}
