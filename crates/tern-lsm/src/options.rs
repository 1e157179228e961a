use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Engine tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Initialize an empty database when no manifest can be recovered.
    pub create_if_missing: bool,

    /// Number of L0 slots. Once all are occupied the next round merges them
    /// into the first sorted level.
    pub max_l0_levels: usize,

    /// Lower bound for merge compaction output tables; outputs stay below
    /// twice this size.
    pub min_table_size: usize,

    /// WAL size that triggers a compaction round.
    pub min_log_size: u64,

    /// Number of decoded tables kept by the table cache.
    pub num_tbl_cache: usize,

    /// Growth factor of the byte budget between sorted levels.
    pub level_size_multiplier: u64,

    /// Sync the WAL after every write instead of only flushing it.
    pub sync_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            max_l0_levels: 4,
            min_table_size: 4 * 1024 * 1024,
            min_log_size: 4 * 1024 * 1024,
            num_tbl_cache: 64,
            level_size_multiplier: 10,
            sync_writes: false,
        }
    }
}

impl Options {
    pub fn validate(&self) -> Result<()> {
        if self.max_l0_levels == 0 {
            return Err(Error::Config("max_l0_levels must be > 0".to_string()));
        }
        if self.min_table_size == 0 {
            return Err(Error::Config("min_table_size must be > 0".to_string()));
        }
        if self.min_log_size == 0 {
            return Err(Error::Config("min_log_size must be > 0".to_string()));
        }
        if self.num_tbl_cache == 0 {
            return Err(Error::Config("num_tbl_cache must be > 0".to_string()));
        }
        if self.level_size_multiplier < 2 {
            return Err(Error::Config(format!(
                "level_size_multiplier ({}) must be >= 2",
                self.level_size_multiplier
            )));
        }
        Ok(())
    }

    /// Byte budget of sorted level `level` (`level >= max_l0_levels`).
    pub fn level_budget(&self, level: usize) -> u64 {
        let depth = level.saturating_sub(self.max_l0_levels) as u32 + 1;
        (self.min_table_size as u64).saturating_mul(self.level_size_multiplier.saturating_pow(depth))
    }
}
