//! Parsing of the `WATCH_ENTITIES` list.
//!
//! The list is comma-separated. Each entry is either an entity id
//! (`gpu-1`) or an entity id with a topic (`site-7:carbon`). Blank entries
//! are skipped and duplicates collapse onto their first occurrence.

/// One subscription the watcher takes out at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub entity_id: String,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TargetError {
    #[error("no entities to watch")]
    Empty,

    #[error("invalid watch entry {0:?}: expected `entity` or `entity:topic`")]
    InvalidEntry(String),
}

pub fn parse_targets(raw: &str) -> Result<Vec<WatchTarget>, TargetError> {
    let mut targets: Vec<WatchTarget> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        let target = match entry.split_once(':') {
            None => WatchTarget {
                entity_id: entry.to_string(),
                topic: None,
            },
            Some((entity_id, topic)) => {
                let (entity_id, topic) = (entity_id.trim(), topic.trim());
                if entity_id.is_empty() || topic.is_empty() || topic.contains(':') {
                    return Err(TargetError::InvalidEntry(entry.to_string()));
                }
                WatchTarget {
                    entity_id: entity_id.to_string(),
                    topic: Some(topic.to_string()),
                }
            }
        };

        if !targets.contains(&target) {
            targets.push(target);
        }
    }

    if targets.is_empty() {
        return Err(TargetError::Empty);
    }
    Ok(targets)
}
