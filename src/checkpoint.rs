//! Checkpoint contract (C6): the logical representation a training loop hands
//! to a checkpoint writer. The state dict itself (`HashMap<String, Tensor>`)
//! comes from [`crate::Module::state_dict`]; this module adds optional side
//! metadata and a JSON-backed save/load pair over the flat map — the same
//! shape the teacher's own `state_io` module provides for its parameter list,
//! generalized here to the full path-to-tensor state dict. The on-disk
//! directory layout beyond this one flat file stays the caller's concern
//! (spec Section 1): this is the logical-contract boundary, not a checkpoint
//! storage scheme.

use crate::error::CoreResult;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

/// Side information alongside a state dict. Every field is caller-populated
/// and none of it is interpreted by this crate; backward compatibility across
/// checkpoints is by exact state-dict path match only (adding a parameter
/// needs a new path, not a metadata bump).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: Option<u64>,
    pub loss: Option<f32>,
    pub timestamp: Option<u64>,
    pub version: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct CheckpointFile {
    meta: CheckpointMeta,
    state_dict: HashMap<String, Tensor>,
}

/// Write `state_dict` (as returned by `Module::state_dict`) plus `meta` to a
/// single JSON file at `path`.
pub fn save(path: impl AsRef<Path>, state_dict: &HashMap<String, Tensor>, meta: CheckpointMeta) -> CoreResult<()> {
    let file = CheckpointFile { meta, state_dict: state_dict.clone() };
    let f = File::create(path)?;
    let w = BufWriter::new(f);
    serde_json::to_writer(w, &file)?;
    Ok(())
}

/// Read back a state dict and its metadata from a JSON file written by
/// [`save`]. Callers pass the state dict to `Module::load_state_dict`.
pub fn load(path: impl AsRef<Path>) -> CoreResult<(HashMap<String, Tensor>, CheckpointMeta)> {
    let f = File::open(path)?;
    let r = BufReader::new(f);
    let file: CheckpointFile = serde_json::from_reader(r)?;
    Ok((file.state_dict, file.meta))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shape::Shape;

    fn scratch_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("autodiff_core_checkpoint_test_{}_{}.json", tag, std::process::id()))
    }

    #[test]
    fn save_then_load_round_trips_state_dict_and_meta() {
        let path = scratch_path("roundtrip");
        let mut state_dict = HashMap::new();
        state_dict.insert("encoder.layer0.weight".to_string(), Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], Shape::new(vec![2, 2])).unwrap());
        state_dict.insert("encoder.layer0.bias".to_string(), Tensor::zeros(Shape::new(vec![2])));
        let meta = CheckpointMeta { epoch: Some(3), loss: Some(0.125), timestamp: Some(1_700_000_000), version: Some("v1".to_string()) };

        save(&path, &state_dict, meta.clone()).unwrap();
        let (loaded_dict, loaded_meta) = load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(loaded_meta, meta);
        assert_eq!(loaded_dict.len(), state_dict.len());
        assert_eq!(loaded_dict["encoder.layer0.weight"].data(), state_dict["encoder.layer0.weight"].data());
        assert_eq!(loaded_dict["encoder.layer0.weight"].shape().dims(), &[2, 2]);
    }

    #[test]
    fn load_missing_file_is_an_io_error() {
        let path = scratch_path("missing");
        std::fs::remove_file(&path).ok();
        assert!(load(&path).is_err());
    }

    #[test]
    fn meta_fields_are_all_optional() {
        let path = scratch_path("empty_meta");
        let state_dict = HashMap::new();
        save(&path, &state_dict, CheckpointMeta::default()).unwrap();
        let (dict, meta) = load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert!(dict.is_empty());
        assert_eq!(meta, CheckpointMeta::default());
    }
}
