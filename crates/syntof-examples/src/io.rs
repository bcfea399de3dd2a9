//! CSV exchange: event matrices in, label/hidden/count tables out.
//!
//! Input files hold one sample each, a header row of channel names and one
//! event per row. Output tables carry a leading unnamed row index and a
//! trailing `sample` column so they load directly as data frames.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use csv::{ReaderBuilder, WriterBuilder};
use ndarray::Array2;
use syntof_core::{EventMatrix, StandardScaler};

/// Read one sample's events.
pub fn read_events(path: &Path) -> Result<EventMatrix> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(file);

    let columns: Vec<String> = reader
        .headers()
        .with_context(|| format!("Missing header row in {}", path.display()))?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    anyhow::ensure!(!columns.is_empty(), "{} has no channels", path.display());

    let mut values = Vec::new();
    let mut rows = 0usize;
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("Malformed row {} in {}", line + 1, path.display()))?;
        anyhow::ensure!(
            record.len() == columns.len(),
            "row {} of {} has {} fields, expected {}",
            line + 1,
            path.display(),
            record.len(),
            columns.len()
        );
        for field in record.iter() {
            let value: f32 = field
                .trim()
                .parse()
                .with_context(|| format!("Non-numeric value {field:?} at row {} of {}", line + 1, path.display()))?;
            values.push(value);
        }
        rows += 1;
    }

    let values = Array2::from_shape_vec((rows, columns.len()), values)?;
    let source = path.to_string_lossy().into_owned();
    Ok(EventMatrix::new(source, columns, values)?)
}

/// CSV files in `dir` whose names start with `prefix`, sorted by name.
pub fn list_event_files(dir: &Path, prefix: Option<&str>) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("csv")))
        .filter(|path| {
            let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default();
            prefix.is_none_or(|p| name.starts_with(p))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Read every matching file in `dir`.
pub fn read_event_dir(dir: &Path, prefix: Option<&str>) -> Result<Vec<EventMatrix>> {
    let files = list_event_files(dir, prefix)?;
    anyhow::ensure!(
        !files.is_empty(),
        "no CSV files matching {:?} in {}",
        prefix.unwrap_or("*"),
        dir.display()
    );
    files.iter().map(|path| read_events(path)).collect()
}

/// Write a matrix with a header, as used for synthetic inputs.
pub fn write_events(path: &Path, events: &EventMatrix) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(&events.columns)?;
    for row in events.values.rows() {
        writer.write_record(row.iter().map(|v| v.to_string()))?;
    }
    writer.flush()?;
    Ok(())
}

fn check_rows(n_rows: usize, sample: &[String], what: &str) -> Result<()> {
    anyhow::ensure!(
        n_rows == sample.len(),
        "{what} has {n_rows} rows but {} sample entries",
        sample.len()
    );
    Ok(())
}

/// One label column per repetition, headed by the repetition index, then `sample`.
pub fn write_labels(path: &Path, labelings: &[(usize, Vec<usize>)], sample: &[String]) -> Result<()> {
    for (_, labels) in labelings {
        check_rows(labels.len(), sample, "labeling")?;
    }
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec![String::new()];
    header.extend(labelings.iter().map(|(rep, _)| rep.to_string()));
    header.push("sample".to_string());
    writer.write_record(&header)?;

    for (row, id) in sample.iter().enumerate() {
        let mut record = vec![row.to_string()];
        record.extend(labelings.iter().map(|(_, labels)| labels[row].to_string()));
        record.push(id.clone());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), repetitions = labelings.len(), rows = sample.len(), "wrote labels table");
    Ok(())
}

/// Per-repetition embeddings side by side, then `sample`.
///
/// Column `{rep}_{j}` is coordinate `j` of repetition `rep`.
pub fn write_hidden(path: &Path, hidden: &[(usize, Array2<f32>)], sample: &[String]) -> Result<()> {
    for (_, h) in hidden {
        check_rows(h.nrows(), sample, "hidden matrix")?;
    }
    let width: usize = hidden.iter().map(|(_, h)| h.ncols()).sum();
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec![String::new()];
    for (rep, h) in hidden {
        header.extend((0..h.ncols()).map(|j| format!("{rep}_{j}")));
    }
    header.push("sample".to_string());
    writer.write_record(&header)?;

    for (row, id) in sample.iter().enumerate() {
        let mut record = Vec::with_capacity(width + 2);
        record.push(row.to_string());
        for (_, h) in hidden {
            record.extend(h.row(row).iter().map(|v| v.to_string()));
        }
        record.push(id.clone());
        writer.write_record(&record)?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), columns = width, "wrote hidden table");
    Ok(())
}

/// Events per cluster, one row per cluster and one column per labeling.
pub fn cluster_counts(labelings: &[(usize, Vec<usize>)]) -> Array2<usize> {
    let n_clusters = labelings
        .iter()
        .flat_map(|(_, labels)| labels.iter().copied())
        .max()
        .map_or(0, |m| m + 1);
    let mut counts = Array2::zeros((n_clusters, labelings.len()));
    for (col, (_, labels)) in labelings.iter().enumerate() {
        for &label in labels {
            counts[[label, col]] += 1;
        }
    }
    counts
}

pub fn write_counts(path: &Path, labelings: &[(usize, Vec<usize>)]) -> Result<()> {
    let counts = cluster_counts(labelings);
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;

    let mut header = vec!["cluster".to_string()];
    header.extend(labelings.iter().map(|(rep, _)| rep.to_string()));
    writer.write_record(&header)?;
    for (cluster, row) in counts.rows().into_iter().enumerate() {
        let mut record = vec![cluster.to_string()];
        record.extend(row.iter().map(|c| c.to_string()));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Selected cluster count per repetition: `repetition,n_clusters`.
pub fn write_cluster_numbers(path: &Path, n_clusters: &[(usize, usize)]) -> Result<()> {
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .with_context(|| format!("Failed to create {}", path.display()))?;
    writer.write_record(["repetition", "n_clusters"])?;
    for (rep, k) in n_clusters {
        writer.write_record([rep.to_string(), k.to_string()])?;
    }
    writer.flush()?;
    tracing::info!(path = %path.display(), ?n_clusters, "wrote cluster numbers");
    Ok(())
}

pub fn read_cluster_numbers(path: &Path) -> Result<Vec<(usize, usize)>> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let mut out = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("{}: bad record {}", path.display(), line + 2))?;
        let field = |i: usize| -> Result<usize> {
            let text = record.get(i).unwrap_or_default().trim();
            text.parse()
                .with_context(|| format!("{}: line {}: '{text}' is not a count", path.display(), line + 2))
        };
        out.push((field(0)?, field(1)?));
    }
    Ok(out)
}

pub fn save_scaler(path: &Path, scaler: &StandardScaler) -> Result<()> {
    let json = serde_json::to_string_pretty(scaler)?;
    fs::write(path, json).with_context(|| format!("Failed to write scaler to {}", path.display()))?;
    Ok(())
}

pub fn load_scaler(path: &Path) -> Result<StandardScaler> {
    let json = fs::read_to_string(path).with_context(|| format!("Failed to read scaler from {}", path.display()))?;
    serde_json::from_str(&json).with_context(|| format!("Invalid scaler file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn test_read_events_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("batch1_ctrl_S7.csv");
        fs::write(&path, "CD45,NeuN,GFAP\n1.0,2.0,3.0\n4.5,-1.0,0.0\n").unwrap();

        let events = read_events(&path).unwrap();
        assert_eq!(events.columns, vec!["CD45", "NeuN", "GFAP"]);
        assert_eq!(events.values, array![[1.0f32, 2.0, 3.0], [4.5, -1.0, 0.0]]);
        assert_eq!(events.sample_id(), "S7");
    }

    #[test]
    fn test_read_events_rejects_text() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        fs::write(&path, "a,b\n1.0,oops\n").unwrap();
        let err = read_events(&path).unwrap_err();
        assert!(format!("{err:#}").contains("oops"));
    }

    #[test]
    fn test_list_event_files_filters_and_sorts() {
        let dir = tempdir().unwrap();
        for name in ["LowNo_2.csv", "LBD_1.csv", "LowNo_1.csv", "notes.txt"] {
            fs::write(dir.path().join(name), "a\n1\n").unwrap();
        }
        let files = list_event_files(dir.path(), Some("LowNo")).unwrap();
        let names: Vec<_> = files.iter().map(|p| p.file_name().unwrap().to_string_lossy().into_owned()).collect();
        assert_eq!(names, vec!["LowNo_1.csv", "LowNo_2.csv"]);
        assert_eq!(list_event_files(dir.path(), None).unwrap().len(), 3);
    }

    #[test]
    fn test_labels_table_layout() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("labels.csv");
        let sample = vec!["S1".to_string(), "S1".to_string(), "S2".to_string()];
        write_labels(&path, &[(0, vec![0, 1, 1]), (2, vec![2, 2, 0])], &sample).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ",0,2,sample");
        assert_eq!(lines[1], "0,0,2,S1");
        assert_eq!(lines[3], "2,1,0,S2");

        assert!(write_labels(&path, &[(0, vec![0, 1])], &sample).is_err());
    }

    #[test]
    fn test_hidden_table_concatenates_repetitions() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("hidden.csv");
        let sample = vec!["S1".to_string(), "S2".to_string()];
        let h0 = array![[0.5f32, 1.0], [2.0, 3.0]];
        let h1 = array![[9.0f32], [8.0]];
        write_hidden(&path, &[(0, h0), (3, h1)], &sample).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], ",0_0,0_1,3_0,sample");
        assert_eq!(lines[2], "1,2,3,8,S2");
    }

    #[test]
    fn test_cluster_counts() {
        let counts = cluster_counts(&[(0, vec![0, 0, 2]), (1, vec![1, 1, 1])]);
        assert_eq!(counts, array![[2usize, 0], [0, 3], [1, 0]]);
    }

    #[test]
    fn test_counts_header_keeps_repetition_ids() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("counts.csv");
        write_counts(&path, &[(1, vec![0, 1]), (4, vec![1, 1])]).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines, vec!["cluster,1,4", "0,1,0", "1,1,2"]);
    }

    #[test]
    fn test_cluster_numbers_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("cluster_numbers.csv");
        let n_clusters = vec![(0, 14), (2, 16), (3, 15)];
        write_cluster_numbers(&path, &n_clusters).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().lines().next(), Some("repetition,n_clusters"));
        assert_eq!(read_cluster_numbers(&path).unwrap(), n_clusters);

        fs::write(&path, "repetition,n_clusters\n0,many\n").unwrap();
        assert!(format!("{:#}", read_cluster_numbers(&path).unwrap_err()).contains("many"));
    }

    #[test]
    fn test_scaler_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scaler.json");
        let scaler = StandardScaler {
            columns: vec!["a".into(), "b".into()],
            mean: array![1.0f32, -2.0],
            scale: array![0.5f32, 1.0],
        };
        save_scaler(&path, &scaler).unwrap();
        assert_eq!(load_scaler(&path).unwrap(), scaler);
    }
}
