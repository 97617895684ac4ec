use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::types::PatternKind;

const CACHE_TTL: Duration = Duration::from_secs(300);

/// Per-pattern exit parameters, percentages as configured
/// (`target: 1.8` means +1.8%).
#[derive(Debug, Clone, Deserialize)]
pub struct PatternTarget {
    pub target: f64,
    pub stop: f64,
    #[serde(default = "default_max_hours")]
    pub max_hours: i64,
    #[serde(default = "default_min_minutes")]
    pub min_minutes: i64,
}

fn default_max_hours() -> i64 {
    24
}

fn default_min_minutes() -> i64 {
    720
}

#[derive(Debug, Clone, Deserialize)]
struct PatternConfigFile {
    pattern_targets: HashMap<String, PatternTarget>,
}

/// Lazily loaded pattern target table keyed by lowercase pattern name.
/// Reloads from disk at most every five minutes; missing or broken files fall
/// back to built-in defaults.
pub struct PatternConfig {
    path: Option<PathBuf>,
    cache: Mutex<Option<(Instant, HashMap<String, PatternTarget>)>>,
}

impl PatternConfig {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            cache: Mutex::new(None),
        }
    }

    pub fn builtin() -> Self {
        Self::new(None)
    }

    pub fn target_for(&self, kind: PatternKind) -> PatternTarget {
        let table = self.load();
        table
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| default_target(kind))
    }

    fn load(&self) -> HashMap<String, PatternTarget> {
        let mut cache = self.cache.lock().expect("pattern config cache poisoned");
        if let Some((loaded_at, table)) = cache.as_ref() {
            if loaded_at.elapsed() < CACHE_TTL {
                return table.clone();
            }
        }
        let table = self.read_file().unwrap_or_default();
        *cache = Some((Instant::now(), table.clone()));
        table
    }

    fn read_file(&self) -> Option<HashMap<String, PatternTarget>> {
        let path = self.path.as_ref()?;
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str::<PatternConfigFile>(&raw) {
                Ok(file) => Some(file.pattern_targets),
                Err(e) => {
                    warn!("pattern config {} unparseable: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                warn!("pattern config {} unreadable: {}", path.display(), e);
                None
            }
        }
    }
}

fn default_target(kind: PatternKind) -> PatternTarget {
    let (target, stop) = match kind {
        PatternKind::Hammer | PatternKind::InvertedHammer => (1.8, 1.5),
        PatternKind::BullishEngulfing => (2.3, 2.0),
        PatternKind::PiercingLine => (1.8, 1.5),
        PatternKind::MorningStar => (2.5, 2.5),
        _ => (2.0, 2.0),
    };
    PatternTarget {
        target,
        stop,
        max_hours: default_max_hours(),
        min_minutes: default_min_minutes(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_defaults_per_pattern() {
        let config = PatternConfig::builtin();
        let hammer = config.target_for(PatternKind::Hammer);
        assert_eq!(hammer.target, 1.8);
        assert_eq!(hammer.stop, 1.5);
        let star = config.target_for(PatternKind::MorningStar);
        assert_eq!(star.target, 2.5);
        assert_eq!(star.max_hours, 24);
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = std::env::temp_dir().join("candle_bot_pattern_cfg_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("targets.json");
        std::fs::write(
            &path,
            r#"{"pattern_targets": {"hammer": {"target": 3.0, "stop": 1.0, "max_hours": 12}}}"#,
        )
        .unwrap();
        let config = PatternConfig::new(Some(path));
        let hammer = config.target_for(PatternKind::Hammer);
        assert_eq!(hammer.target, 3.0);
        assert_eq!(hammer.max_hours, 12);
        // Unlisted patterns keep defaults.
        assert_eq!(config.target_for(PatternKind::MorningStar).target, 2.5);
    }
}
