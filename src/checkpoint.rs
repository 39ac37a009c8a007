//! JSON checkpoints of the full training state.
//!
//! A checkpoint directory holds one `checkpoint-{step}.json` file per save,
//! where `step` is the model's global step. Restoring picks the highest step;
//! older files beyond the retention limit are deleted after each save.
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand_xorshift::XorShiftRng;

use crate::models::naism::ModelState;

/// Number of checkpoints kept by default.
pub const DEFAULT_MAX_TO_KEEP: usize = 5;

/// Checkpoint error types.
#[derive(Debug, Fail)]
pub enum CheckpointError {
    /// Reading or writing a checkpoint failed.
    #[fail(display = "Checkpoint I/O error at {:?}: {}", path, cause)]
    Io {
        /// The file or directory involved.
        path: PathBuf,
        /// The underlying error.
        #[cause]
        cause: io::Error,
    },
    /// A checkpoint could not be encoded or decoded.
    #[fail(display = "Malformed checkpoint {:?}: {}", path, cause)]
    Serialization {
        /// The checkpoint file.
        path: PathBuf,
        /// The underlying error.
        #[cause]
        cause: serde_json::Error,
    },
    /// The stored state does not fit the model being trained.
    #[fail(display = "Checkpoint does not match the model: {}", reason)]
    ShapeMismatch {
        /// What disagreed.
        reason: String,
    },
}

/// Everything needed to resume training.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrainingState {
    /// Number of completed epochs.
    pub epoch: usize,
    /// The trainer's random number generator.
    pub rng: XorShiftRng,
    /// Model parameters, hyperparameters and step count.
    pub model: ModelState,
}

/// Directory name for a run, e.g. `lr0.0100_bs256_pinterest-20`.
pub fn run_name(learning_rate: f32, batch_size: usize, dataset: &str) -> String {
    format!("lr{:.4}_bs{}_{}", learning_rate, batch_size, dataset)
}

fn checkpoint_filename(step: u64) -> String {
    format!("checkpoint-{}.json", step)
}

fn parse_step(filename: &str) -> Option<u64> {
    filename
        .strip_prefix("checkpoint-")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

/// Saves and restores [`TrainingState`]s in a single directory.
#[derive(Clone, Debug)]
pub struct Checkpointer {
    directory: PathBuf,
    max_to_keep: usize,
}

impl Checkpointer {
    /// Checkpoint into `directory`.
    pub fn new<P: Into<PathBuf>>(directory: P) -> Self {
        Checkpointer {
            directory: directory.into(),
            max_to_keep: DEFAULT_MAX_TO_KEEP,
        }
    }

    /// Set the number of checkpoints to retain. Zero keeps all of them.
    pub fn max_to_keep(mut self, max_to_keep: usize) -> Self {
        self.max_to_keep = max_to_keep;
        self
    }

    /// The checkpoint directory.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Existing checkpoints, ordered by ascending step.
    pub fn checkpoints(&self) -> Vec<(u64, PathBuf)> {
        let entries = match fs::read_dir(&self.directory) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut checkpoints: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                let path = entry.path();
                let step = path.file_name().and_then(|x| x.to_str()).and_then(parse_step)?;
                Some((step, path))
            })
            .collect();

        checkpoints.sort_by_key(|&(step, _)| step);

        checkpoints
    }

    /// Path of the most recent checkpoint, if any.
    pub fn latest(&self) -> Option<PathBuf> {
        self.checkpoints().pop().map(|(_, path)| path)
    }

    /// Write `state`, then prune old checkpoints.
    pub fn save(&self, state: &TrainingState) -> Result<PathBuf, CheckpointError> {
        fs::create_dir_all(&self.directory).map_err(|cause| CheckpointError::Io {
            path: self.directory.clone(),
            cause,
        })?;

        let path = self
            .directory
            .join(checkpoint_filename(state.model.global_step));
        let temp_path = path.with_extension("json.tmp");

        let json = serde_json::to_string(state).map_err(|cause| CheckpointError::Serialization {
            path: path.clone(),
            cause,
        })?;

        fs::write(&temp_path, json).map_err(|cause| CheckpointError::Io {
            path: temp_path.clone(),
            cause,
        })?;
        fs::rename(&temp_path, &path).map_err(|cause| CheckpointError::Io {
            path: path.clone(),
            cause,
        })?;

        info!(
            path = %path.display(),
            step = state.model.global_step,
            epoch = state.epoch,
            "saved checkpoint"
        );

        self.prune()?;

        Ok(path)
    }

    /// Read the checkpoint at `path`.
    pub fn restore(&self, path: &Path) -> Result<TrainingState, CheckpointError> {
        let json = fs::read_to_string(path).map_err(|cause| CheckpointError::Io {
            path: path.to_path_buf(),
            cause,
        })?;

        let state: TrainingState =
            serde_json::from_str(&json).map_err(|cause| CheckpointError::Serialization {
                path: path.to_path_buf(),
                cause,
            })?;

        info!(
            path = %path.display(),
            step = state.model.global_step,
            epoch = state.epoch,
            "restored checkpoint"
        );

        Ok(state)
    }

    /// Read the most recent checkpoint, if one exists.
    pub fn restore_latest(&self) -> Result<Option<TrainingState>, CheckpointError> {
        match self.latest() {
            Some(path) => self.restore(&path).map(Some),
            None => Ok(None),
        }
    }

    fn prune(&self) -> Result<(), CheckpointError> {
        if self.max_to_keep == 0 {
            return Ok(());
        }

        let checkpoints = self.checkpoints();
        let excess = checkpoints.len().saturating_sub(self.max_to_keep);

        for (step, path) in checkpoints.into_iter().take(excess) {
            debug!(step, path = %path.display(), "removing old checkpoint");
            fs::remove_file(&path).map_err(|cause| CheckpointError::Io { path, cause })?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use tempfile::TempDir;

    use super::*;
    use crate::data::MinibatchBuilder;
    use crate::models::naism::{Hyperparameters, ImplicitNAISModel};

    fn state(steps: usize) -> TrainingState {
        let mut model = Hyperparameters::new(4).embedding_dim(3).from_seed(1).build();
        let mut builder = MinibatchBuilder::new(model.padding_idx());
        builder.push(vec![0, 1], 2, 1.0);
        builder.push(vec![0, 1], 3, 0.0);
        let batch = builder.build();

        for _ in 0..steps {
            model.fit_minibatch(&batch).unwrap();
        }

        TrainingState {
            epoch: steps,
            rng: XorShiftRng::seed_from_u64(9),
            model: model.state(),
        }
    }

    #[test]
    fn run_name_format() {
        assert_eq!(run_name(0.01, 256, "pinterest-20"), "lr0.0100_bs256_pinterest-20");
        assert_eq!(run_name(0.5, 64, "ml-1m"), "lr0.5000_bs64_ml-1m");
    }

    #[test]
    fn step_parsing() {
        assert_eq!(parse_step(&checkpoint_filename(42)), Some(42));
        assert_eq!(parse_step("checkpoint-x.json"), None);
        assert_eq!(parse_step("checkpoint-3.json.tmp"), None);
        assert_eq!(parse_step("other-3.json"), None);
    }

    #[test]
    fn missing_directory_has_no_checkpoint() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path().join("absent"));

        assert!(checkpointer.latest().is_none());
        assert!(checkpointer.restore_latest().unwrap().is_none());
    }

    #[test]
    fn save_and_restore() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path().join(run_name(0.01, 2, "toy")));
        let state = state(3);

        let path = checkpointer.save(&state).unwrap();
        assert!(path.starts_with(checkpointer.directory()));
        assert!(path.ends_with("checkpoint-3.json"));

        let restored = checkpointer.restore_latest().unwrap().unwrap();

        assert_eq!(restored.epoch, 3);
        assert_eq!(restored.model.global_step, 3);
        assert_eq!(restored.model.parameters, state.model.parameters);

        let model = ImplicitNAISModel::from_state(restored.model).unwrap();
        assert_eq!(model.state().parameters, state.model.parameters);
    }

    #[test]
    fn keeps_newest_checkpoints() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path()).max_to_keep(2);

        for steps in 1..5 {
            checkpointer.save(&state(steps)).unwrap();
        }

        let steps: Vec<u64> = checkpointer
            .checkpoints()
            .into_iter()
            .map(|(step, _)| step)
            .collect();

        assert_eq!(steps, vec![3, 4]);
    }

    #[test]
    fn corrupt_checkpoint_is_an_error() {
        let dir = TempDir::new().unwrap();
        let checkpointer = Checkpointer::new(dir.path());
        fs::write(dir.path().join(checkpoint_filename(7)), "{not json").unwrap();

        match checkpointer.restore_latest() {
            Err(CheckpointError::Serialization { .. }) => {}
            other => panic!("unexpected result: {:?}", other.map(|x| x.is_some())),
        }
    }
}
