use thiserror_no_std::Error;

/// Sizing parameters of a memory context
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Config {
    /// How many objects the object store can hold
    pub object_frames: usize,
    /// How many root page tables the projection layer keeps cached
    pub root_tables: usize,
    /// How many non-root page tables the projection layer keeps cached
    pub page_tables: usize,
    /// Addresses at or above `2^user_va_bits` are never projected
    pub user_va_bits: u8,
}

#[derive(Debug, Error, Eq, PartialEq, Copy, Clone)]
pub enum ConfigError {
    #[error("at least one root table must be cached")]
    NoRootTables,
    #[error("at least two non-root page tables must be cached but only {0} are configured")]
    TooFewPageTables(usize),
    #[error("user address width of {0} bits is not supported by Sv39")]
    UnsupportedUserVaBits(u8),
    #[error("object frame count of {0} does not fit into an object id")]
    TooManyObjectFrames(usize),
    #[error("the image holds {objects} objects but only {frames} object frames are configured")]
    ImageTooLarge { objects: usize, frames: usize },
}

impl Config {
    pub const DEFAULT: Config = Config {
        object_frames: 4096,
        root_tables: 16,
        page_tables: 256,
        user_va_bits: 38,
    };

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.root_tables == 0 {
            return Err(ConfigError::NoRootTables);
        }
        if self.page_tables < 2 {
            return Err(ConfigError::TooFewPageTables(self.page_tables));
        }
        if !(13..=39).contains(&self.user_va_bits) {
            return Err(ConfigError::UnsupportedUserVaBits(self.user_va_bits));
        }
        if u32::try_from(self.object_frames).is_err() {
            return Err(ConfigError::TooManyObjectFrames(self.object_frames));
        }
        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::DEFAULT
    }
}
