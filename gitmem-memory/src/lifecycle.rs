//! Retention scoring
//!
//! Memories lose weight with age and gain it with use. The score decides
//! the storage tier, flags stale memories and picks archive candidates:
//!
//! - **recency**: `0.5^(age_days / half_life)`; resolved memories decay twice as fast
//! - **activation**: `ln(1 + hits) / ln(1 + saturation)`, clamped to 1
//! - **retention**: `0.7 * recency + 0.3 * activation`

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};
use crate::index::IndexRecord;
use crate::node::MemoryStatus;

const RECENCY_WEIGHT: f64 = 0.7;
const ACTIVATION_WEIGHT: f64 = 0.3;
const HOT_THRESHOLD: f64 = 0.5;
const WARM_THRESHOLD: f64 = 0.2;
const STALE_THRESHOLD: f64 = 0.2;
const ARCHIVE_THRESHOLD: f64 = 0.1;

/// Storage tier derived from the retention score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Hot,
    Warm,
    Cold,
    Archived,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Hot, Tier::Warm, Tier::Cold, Tier::Archived];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
            Self::Archived => "archived",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Tier {
    type Err = MemoryError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| MemoryError::validation(format!("unknown tier: {s:?}")))
    }
}

/// Scorer parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub half_life_days: f64,
    /// Hit count at which activation saturates
    pub saturation: u32,
    pub stale_after_days: i64,
    pub archive_after_days: i64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            half_life_days: 30.0,
            saturation: 20,
            stale_after_days: 90,
            archive_after_days: 180,
        }
    }
}

/// Score of one memory at one instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LifecycleScore {
    pub recency: f64,
    pub activation: f64,
    pub retention: f64,
    pub tier: Tier,
    pub stale: bool,
    pub age_days: f64,
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleScorer {
    config: LifecycleConfig,
}

impl LifecycleScorer {
    pub fn new(config: LifecycleConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Score an indexed record
    pub fn score(&self, record: &IndexRecord, now: DateTime<Utc>) -> LifecycleScore {
        self.score_parts(
            record.memory.created_at,
            record.memory.status,
            record.activation_count,
            now,
        )
    }

    pub fn score_parts(
        &self,
        created_at: DateTime<Utc>,
        status: MemoryStatus,
        activation_count: u32,
        now: DateTime<Utc>,
    ) -> LifecycleScore {
        let age_days = ((now - created_at).num_seconds().max(0) as f64) / 86_400.0;

        let half_life = match status {
            MemoryStatus::Resolved => self.config.half_life_days / 2.0,
            _ => self.config.half_life_days,
        };
        let recency = if half_life > 0.0 {
            0.5f64.powf(age_days / half_life)
        } else {
            0.0
        };

        let saturation = (1.0 + self.config.saturation.max(1) as f64).ln();
        let activation = ((1.0 + activation_count as f64).ln() / saturation).min(1.0);

        let retention = RECENCY_WEIGHT * recency + ACTIVATION_WEIGHT * activation;

        let tier = match status {
            MemoryStatus::Archived | MemoryStatus::Tombstoned => Tier::Archived,
            _ if retention >= HOT_THRESHOLD => Tier::Hot,
            _ if retention >= WARM_THRESHOLD => Tier::Warm,
            _ => Tier::Cold,
        };

        let stale = status == MemoryStatus::Active
            && age_days > self.config.stale_after_days as f64
            && retention < STALE_THRESHOLD;

        LifecycleScore {
            recency,
            activation,
            retention,
            tier,
            stale,
            age_days,
        }
    }

    /// Whether a record should be archived now
    pub fn is_archive_candidate(&self, record: &IndexRecord, now: DateTime<Utc>) -> bool {
        if !matches!(
            record.memory.status,
            MemoryStatus::Active | MemoryStatus::Resolved
        ) {
            return false;
        }
        let score = self.score(record, now);
        score.age_days > self.config.archive_after_days as f64 && score.retention < ARCHIVE_THRESHOLD
    }

    /// Records that should be archived, in input order
    pub fn archive_candidates<'a>(
        &self,
        records: &'a [IndexRecord],
        now: DateTime<Utc>,
    ) -> Vec<&'a IndexRecord> {
        records
            .iter()
            .filter(|r| self.is_archive_candidate(r, now))
            .collect()
    }
}
