/// Parameter persistence
///
/// Checkpoints are an ordered sequence of (shape, data) entries. The file
/// layout is a collaborator concern; this slice only guarantees that load
/// validates the entry count and shapes against the live parameters and
/// leaves in-memory weights untouched on any mismatch.
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::{info, warn};

use crate::error::VulcanResult;
use crate::tensor::Parameter;

#[derive(Serialize, Deserialize)]
struct CheckpointEntry {
    shape: Vec<usize>,
    data: Vec<f32>,
}

/// Save parameters in order.
pub fn save(parameters: &[Parameter], path: &Path) -> VulcanResult<()> {
    let entries: Vec<CheckpointEntry> = parameters
        .iter()
        .map(|p| CheckpointEntry {
            shape: p.tensor().shape(),
            data: p.tensor().data().to_vec(),
        })
        .collect();
    let file = File::create(path)?;
    serde_json::to_writer(BufWriter::new(file), &entries)?;
    info!(path = %path.display(), count = entries.len(), "checkpoint saved");
    Ok(())
}

/// Load a checkpoint into `parameters` in order.
///
/// Returns true when the weights were applied. A count or shape mismatch
/// logs a warning, applies nothing, and returns false.
pub fn load(parameters: &[Parameter], path: &Path) -> VulcanResult<bool> {
    let file = File::open(path)?;
    let entries: Vec<CheckpointEntry> = serde_json::from_reader(BufReader::new(file))?;

    if entries.len() != parameters.len() {
        warn!(
            expected = parameters.len(),
            found = entries.len(),
            path = %path.display(),
            "checkpoint parameter count mismatch; keeping in-memory weights"
        );
        return Ok(false);
    }
    for (param, entry) in parameters.iter().zip(entries.iter()) {
        if param.tensor().shape() != entry.shape {
            warn!(
                name = param.name(),
                path = %path.display(),
                "checkpoint shape mismatch; keeping in-memory weights"
            );
            return Ok(false);
        }
    }

    for (param, entry) in parameters.iter().zip(entries.into_iter()) {
        param.tensor().data_mut().copy_from_slice(&entry.data);
    }
    info!(path = %path.display(), count = parameters.len(), "checkpoint loaded");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(shapes: &[&[usize]]) -> Vec<Parameter> {
        shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| {
                let count: usize = shape.iter().product();
                let data: Vec<f32> = (0..count).map(|j| (i * 100 + j) as f32).collect();
                Parameter::new(format!("p{i}"), data, shape).unwrap()
            })
            .collect()
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let original = params(&[&[2, 3], &[4]]);
        save(&original, &path).unwrap();

        let restored = params(&[&[2, 3], &[4]]);
        for p in &restored {
            p.tensor().data_mut().fill(0.0);
        }
        assert!(load(&restored, &path).unwrap());
        for (a, b) in original.iter().zip(restored.iter()) {
            assert_eq!(&*a.tensor().data(), &*b.tensor().data());
        }
    }

    #[test]
    fn test_count_mismatch_keeps_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        save(&params(&[&[2]]), &path).unwrap();

        let live = params(&[&[2], &[3]]);
        let before: Vec<f32> = live[0].tensor().data().to_vec();
        assert!(!load(&live, &path).unwrap());
        assert_eq!(&*live[0].tensor().data(), before.as_slice());
    }

    #[test]
    fn test_shape_mismatch_keeps_weights() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        save(&params(&[&[2, 2]]), &path).unwrap();

        let live = params(&[&[4]]);
        assert!(!load(&live, &path).unwrap());
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let live = params(&[&[2]]);
        assert!(load(&live, Path::new("/nonexistent/checkpoint.json")).is_err());
    }
}
