use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Default label file for a model: same path, `.txt` extension.
pub fn default_labels_path(model_path: &Path) -> PathBuf {
    model_path.with_extension("txt")
}

/// Load class labels for a model with `class_count` classes.
///
/// One label per line, blank lines ignored. A missing file yields numeric labels.
/// Classes the file does not name are numbered; names beyond `class_count` are ignored.
pub fn load_labels(path: &Path, class_count: usize) -> Result<Vec<String>> {
    if !path.exists() {
        log::warn!(
            "Labels: {} not found; using numeric class ids",
            path.display()
        );
        return Ok(numeric_labels(class_count));
    }

    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read labels file {}", path.display()))?;
    let names: Vec<String> = raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();

    if names.len() != class_count {
        log::warn!(
            "Labels: {} lists {} labels, model has {} classes",
            path.display(),
            names.len(),
            class_count
        );
    }

    Ok((0..class_count)
        .map(|i| names.get(i).cloned().unwrap_or_else(|| i.to_string()))
        .collect())
}

pub fn numeric_labels(class_count: usize) -> Vec<String> {
    (0..class_count).map(|i| i.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::NamedTempFile;

    struct CapturingLogger {
        lines: Mutex<Vec<String>>,
    }

    impl log::Log for CapturingLogger {
        fn enabled(&self, metadata: &log::Metadata) -> bool {
            metadata.level() <= log::Level::Warn
        }

        fn log(&self, record: &log::Record) {
            if self.enabled(record.metadata()) {
                if let Ok(mut lines) = self.lines.lock() {
                    lines.push(record.args().to_string());
                }
            }
        }

        fn flush(&self) {}
    }

    static LOGGER: CapturingLogger = CapturingLogger {
        lines: Mutex::new(Vec::new()),
    };

    #[test]
    fn missing_file_yields_numeric_labels() -> Result<()> {
        let labels = load_labels(Path::new("/nonexistent/model.txt"), 3)?;
        assert_eq!(labels, vec!["0", "1", "2"]);
        Ok(())
    }

    #[test]
    fn short_file_is_padded_and_blank_lines_skipped() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "door\n\n  key  \n")?;
        let labels = load_labels(file.path(), 3)?;
        assert_eq!(labels, vec!["door", "key", "2"]);
        Ok(())
    }

    #[test]
    fn long_file_is_truncated() -> Result<()> {
        let mut file = NamedTempFile::new()?;
        writeln!(file, "a\nb\nc")?;
        assert_eq!(load_labels(file.path(), 2)?, vec!["a", "b"]);
        Ok(())
    }

    #[test]
    fn warnings_carry_the_component_prefix() -> Result<()> {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Warn);

        let mut file = NamedTempFile::new()?;
        writeln!(file, "only-one")?;
        load_labels(file.path(), 2)?;
        load_labels(Path::new("/nonexistent/prefixed.txt"), 1)?;

        let lines = LOGGER.lines.lock().unwrap().clone();
        let ours: Vec<&String> = lines
            .iter()
            .filter(|l| l.contains("prefixed.txt") || l.contains("lists 1 labels"))
            .collect();
        assert_eq!(ours.len(), 2);
        assert!(ours.iter().all(|l| l.starts_with("Labels: ")));
        Ok(())
    }

    #[test]
    fn default_path_swaps_extension() {
        assert_eq!(
            default_labels_path(Path::new("models/Game_v1_640.onnx")),
            PathBuf::from("models/Game_v1_640.txt")
        );
    }
}
