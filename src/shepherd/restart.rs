use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Stability floor applied when the strategy's largest delay is zero: a child
/// that stays up this long is considered settled and its cursor resets.
pub const STABLE_RUN_FLOOR: Duration = Duration::from_secs(60);

/// Sequence of delays (seconds) between consecutive unplanned exits.
///
/// The cursor walks the sequence one step per exit and the tail value repeats
/// forever, so `[0, 0, 5]` means two immediate restarts and then one every
/// five seconds. A single integer in the config is the one-element sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartStrategy(Vec<u64>);

impl Default for RestartStrategy {
    fn default() -> Self {
        RestartStrategy(vec![0])
    }
}

impl RestartStrategy {
    pub fn new(delays: Vec<u64>) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !delays.is_empty(),
            "restart strategy must list at least one delay"
        );
        Ok(RestartStrategy(delays))
    }

    /// Delay to wait before the next start, given how many consecutive
    /// unplanned exits preceded this one.
    pub fn delay(&self, cursor: usize) -> Duration {
        Duration::from_secs(self.0[cursor.min(self.0.len() - 1)])
    }

    /// Cursor position after one more unplanned exit. Capped at the last
    /// index, so the tail delay repeats.
    pub fn advance(&self, cursor: usize) -> usize {
        (cursor + 1).min(self.0.len() - 1)
    }

    /// How long a child must run continuously before the cursor resets.
    pub fn stability_window(&self) -> Duration {
        let max = self.0.iter().copied().max().unwrap_or(0);
        if max == 0 {
            STABLE_RUN_FLOOR
        } else {
            Duration::from_secs(max)
        }
    }
}

impl<'de> Deserialize<'de> for RestartStrategy {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error as _;

        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(u64),
            Seq(Vec<u64>),
        }

        let delays = match Raw::deserialize(deserializer)? {
            Raw::One(s) => vec![s],
            Raw::Seq(v) => v,
        };
        RestartStrategy::new(delays).map_err(D::Error::custom)
    }
}
