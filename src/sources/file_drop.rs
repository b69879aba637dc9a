use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tracing::debug;

use super::provider::{OddsQuote, ResultRow, SourceAdapter, SourcePayload};
use crate::db::models::{Event, RecordCategory};
use crate::error::FetchError;

/// Manual fallback: operators drop `{season}_{round:02}_{category}.json`
/// files (a JSON array of result rows or odds quotes) into a directory.
pub struct FileDrop {
    dir: PathBuf,
}

impl FileDrop {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileDrop { dir: dir.into() }
    }

    pub fn path_for(&self, event: &Event, category: RecordCategory) -> PathBuf {
        self.dir.join(format!(
            "{}_{:02}_{}.json",
            event.key.season, event.key.round, category
        ))
    }
}

#[async_trait]
impl SourceAdapter for FileDrop {
    fn name(&self) -> &str {
        "file_drop"
    }

    async fn fetch(&self, event: &Event, category: RecordCategory) -> Result<SourcePayload, FetchError> {
        let path = self.path_for(event, category);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(FetchError::NotYetAvailable(format!("{} not present", path.display())));
            }
            Err(e) => return Err(FetchError::Transient(format!("{}: {e}", path.display()))),
        };
        debug!("Read {} bytes from {}", text.len(), path.display());

        let bad = |e: serde_json::Error| FetchError::Permanent(format!("{}: {e}", path.display()));
        match category {
            RecordCategory::Result => {
                let rows: Vec<ResultRow> = serde_json::from_str(&text).map_err(bad)?;
                Ok(SourcePayload::Results(rows))
            }
            RecordCategory::Odds => {
                let quotes: Vec<OddsQuote> = serde_json::from_str(&text).map_err(bad)?;
                Ok(SourcePayload::Odds(quotes))
            }
            other => Err(FetchError::Permanent(format!("file_drop does not serve {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{EventKey, EventStatus};

    fn event() -> Event {
        Event {
            key: EventKey::new(2025, 3),
            name: "Japanese Grand Prix".into(),
            start: "2025-04-06T05:00:00Z".parse().unwrap(),
            status: EventStatus::Completed,
            participants: vec![],
            country: None,
            location: None,
        }
    }

    fn scratch_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("raceweek-filedrop-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn missing_file_is_not_yet_available() {
        let src = FileDrop::new(scratch_dir("missing"));
        let err = src.fetch(&event(), RecordCategory::Result).await.unwrap_err();
        assert!(matches!(err, FetchError::NotYetAvailable(_)));
    }

    #[tokio::test]
    async fn reads_dropped_results() {
        let dir = scratch_dir("results");
        let src = FileDrop::new(&dir);
        let path = src.path_for(&event(), RecordCategory::Result);
        assert!(path.ends_with("2025_03_result.json"));
        std::fs::write(
            &path,
            r#"[{"driver":"Max Verstappen","position":1},{"driver":"Lando Norris","position":2}]"#,
        )
        .unwrap();

        let payload = src.fetch(&event(), RecordCategory::Result).await.unwrap();
        assert_eq!(payload.len(), 2);
        std::fs::remove_dir_all(dir).ok();
    }

    #[tokio::test]
    async fn garbage_file_is_permanent() {
        let dir = scratch_dir("garbage");
        let src = FileDrop::new(&dir);
        std::fs::write(src.path_for(&event(), RecordCategory::Odds), "not json").unwrap();
        let err = src.fetch(&event(), RecordCategory::Odds).await.unwrap_err();
        assert!(matches!(err, FetchError::Permanent(_)));
        std::fs::remove_dir_all(dir).ok();
    }
}
