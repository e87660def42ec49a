use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{ChainKey, NotifyTaskType};

/// Name of one height watermark kept per chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WatermarkName {
    Polling,
    Sync,
    Notify(NotifyTaskType),
}

impl WatermarkName {
    /// Storage key for this watermark
    pub fn as_key(&self) -> String {
        match self {
            WatermarkName::Polling => "polling".to_string(),
            WatermarkName::Sync => "sync".to_string(),
            WatermarkName::Notify(t) => format!("notify_{}", t.as_str()),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "polling" => Some(WatermarkName::Polling),
            "sync" => Some(WatermarkName::Sync),
            other => {
                let task = other.strip_prefix("notify_")?;
                NotifyTaskType::ALL
                    .into_iter()
                    .find(|t| t.as_str() == task)
                    .map(WatermarkName::Notify)
            }
        }
    }
}

impl fmt::Display for WatermarkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    pub height: u64,
    pub modified: DateTime<Utc>,
}

/// All watermarks of one chain. A missing watermark reads as height 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorProcessHeights {
    pub chain: ChainKey,
    pub heights: BTreeMap<WatermarkName, Watermark>,
}

impl AnchorProcessHeights {
    pub fn new(chain: ChainKey) -> Self {
        Self {
            chain,
            heights: BTreeMap::new(),
        }
    }

    pub fn get(&self, name: WatermarkName) -> u64 {
        self.heights.get(&name).map(|w| w.height).unwrap_or(0)
    }

    pub fn polling(&self) -> u64 {
        self.get(WatermarkName::Polling)
    }

    pub fn sync(&self) -> u64 {
        self.get(WatermarkName::Sync)
    }

    pub fn notify(&self, task: NotifyTaskType) -> u64 {
        self.get(WatermarkName::Notify(task))
    }

    /// Raise a watermark. Returns false and leaves the value untouched when
    /// `height` is lower than what is already recorded.
    pub fn raise(&mut self, name: WatermarkName, height: u64) -> bool {
        let now = Utc::now();
        match self.heights.get_mut(&name) {
            Some(w) if w.height > height => false,
            Some(w) => {
                w.height = height;
                w.modified = now;
                true
            }
            None => {
                self.heights.insert(
                    name,
                    Watermark {
                        height,
                        modified: now,
                    },
                );
                true
            }
        }
    }
}
