//! ---
//! pps_section: "04-simulation"
//! pps_subsection: "module"
//! pps_type: "source"
//! pps_scope: "code"
//! pps_description: "Replay of recorded tag streams from CSV or JSON files."
//! pps_version: "v0.1.0"
//! pps_owner: "tbd"
//! ---
use std::fs;
use std::path::Path;
use std::slice::Chunks;

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use tracing::info;

use pps_core::TagEvent;

/// Recorded tags held in memory and handed out in fixed-size batches.
#[derive(Debug, Default, Clone)]
pub struct TagReplay {
    tags: Vec<TagEvent>,
}

impl TagReplay {
    pub fn from_tags(tags: Vec<TagEvent>) -> Self {
        Self { tags }
    }

    /// Load `.csv` (header `channel,time[,kind,missed]`) or `.json` (array of tags).
    pub fn from_path(path: &Path) -> Result<Self> {
        let replay = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json(path)?,
            Some("csv") => Self::from_csv(path)?,
            _ => bail!("unsupported tag file format: {}", path.display()),
        };
        info!(path = %path.display(), tags = replay.len(), "tag file loaded");
        Ok(replay)
    }

    fn from_json(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read tag file {}", path.display()))?;
        let tags = serde_json::from_str(&contents)
            .with_context(|| format!("invalid tag JSON {}", path.display()))?;
        Ok(Self { tags })
    }

    fn from_csv(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("unable to open tag csv {}", path.display()))?;
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(file);
        let mut tags = Vec::new();
        for (line, row) in reader.deserialize::<TagEvent>().enumerate() {
            let tag = row.with_context(|| {
                format!("invalid tag on data row {} of {}", line + 1, path.display())
            })?;
            tags.push(tag);
        }
        Ok(Self { tags })
    }

    /// Record `tags` as CSV in the format [`TagReplay::from_path`] reads.
    pub fn write_csv(path: &Path, tags: &[TagEvent]) -> Result<()> {
        let mut writer = WriterBuilder::new()
            .has_headers(true)
            .from_path(path)
            .with_context(|| format!("unable to create tag csv {}", path.display()))?;
        for tag in tags {
            writer.serialize(tag)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn tags(&self) -> &[TagEvent] {
        &self.tags
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Consecutive batches of at most `size` tags, in stream order.
    pub fn batches(&self, size: usize) -> Chunks<'_, TagEvent> {
        self.tags.chunks(size.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    fn temp(suffix: &str) -> Result<NamedTempFile> {
        Ok(Builder::new().suffix(suffix).tempfile()?)
    }

    #[test]
    fn loads_csv_with_optional_columns() -> Result<()> {
        let mut file = temp(".csv")?;
        writeln!(file, "channel,time")?;
        writeln!(file, "1, 0")?;
        writeln!(file, "2, 1500")?;
        file.flush()?;
        let replay = TagReplay::from_path(file.path())?;
        assert_eq!(
            replay.tags(),
            &[TagEvent::normal(1, 0), TagEvent::normal(2, 1_500)]
        );
        Ok(())
    }

    #[test]
    fn loads_json_overflow_markers() -> Result<()> {
        let mut file = temp(".json")?;
        write!(
            file,
            r#"[{{"channel":1,"time":10}},{{"channel":4,"time":20,"kind":"overflow","missed":3}}]"#
        )?;
        file.flush()?;
        let replay = TagReplay::from_path(file.path())?;
        assert_eq!(replay.tags()[1], TagEvent::overflow(4, 20, 3));
        Ok(())
    }

    #[test]
    fn recorded_stream_reloads_identically() -> Result<()> {
        let file = temp(".csv")?;
        let tags = vec![
            TagEvent::normal(1, 0),
            TagEvent::overflow(2, 5, 9),
            TagEvent::normal(2, -40),
        ];
        TagReplay::write_csv(file.path(), &tags)?;
        assert_eq!(TagReplay::from_path(file.path())?.tags(), tags.as_slice());
        Ok(())
    }

    #[test]
    fn reports_bad_rows_with_position() -> Result<()> {
        let mut file = temp(".csv")?;
        writeln!(file, "channel,time\n1,0\n2,soon")?;
        file.flush()?;
        let err = TagReplay::from_path(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("data row 2"));
        Ok(())
    }

    #[test]
    fn rejects_unknown_extensions() -> Result<()> {
        let file = temp(".bin")?;
        assert!(TagReplay::from_path(file.path()).is_err());
        Ok(())
    }

    #[test]
    fn batches_preserve_order() {
        let replay = TagReplay::from_tags((0..10).map(|t| TagEvent::normal(1, t)).collect());
        let sizes: Vec<usize> = replay.batches(4).map(<[TagEvent]>::len).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(replay.batches(0).count(), 10);
    }
}
