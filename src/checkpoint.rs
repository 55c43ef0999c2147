use std::{
    collections::BTreeMap,
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::Path,
};

use dfdx::prelude::*;
use zip::{result::ZipError, write::FileOptions, ZipArchive, ZipWriter};

use crate::{
    error::{Error, Result},
    model::{ParamVisitor, Parameters},
    optim::{Adam, Moments},
};

const STEP_ENTRY: &str = "optimizer/step";

fn moment_entry(kind: &str, name: &str) -> String {
    format!("optimizer/{kind}/{name}")
}

fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn f32_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Writes the model weights as an npz archive, then appends the optimizer
/// step and moments to the same archive.
pub fn save_checkpoint<M, D>(path: impl AsRef<Path>, model: &M, optimizer: &Adam) -> Result<()>
where
    M: SaveToNpz<f32, D>,
    D: Device<f32>,
{
    let path = path.as_ref();
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    model.save(path).map_err(Error::checkpoint)?;

    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut zip = ZipWriter::new_append(file)?;
    let options = FileOptions::default();
    zip.start_file(STEP_ENTRY, options)?;
    zip.write_all(&optimizer.step.to_le_bytes())?;
    for (name, moments) in &optimizer.moments {
        zip.start_file(moment_entry("m", name), options)?;
        zip.write_all(&f32_bytes(&moments.m))?;
        zip.start_file(moment_entry("v", name), options)?;
        zip.write_all(&f32_bytes(&moments.v))?;
    }
    zip.finish()?;
    Ok(())
}

/// Restores weights and optimizer state written by [`save_checkpoint`].
///
/// A checkpoint without optimizer entries restores the weights and resets the
/// optimizer. Moments are required for every parameter once any step was taken.
pub fn load_checkpoint<M, D>(path: impl AsRef<Path>, model: &mut M, optimizer: &mut Adam) -> Result<()>
where
    M: LoadFromNpz<f32, D> + Parameters<D>,
    D: Device<f32>,
{
    let path = path.as_ref();
    model.load(path).map_err(Error::checkpoint)?;

    let mut archive = ZipArchive::new(File::open(path)?)?;
    let step = match read_entry(&mut archive, STEP_ENTRY) {
        Ok(bytes) => {
            let bytes: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| Error::Checkpoint(format!("`{STEP_ENTRY}` is not a u64")))?;
            u64::from_le_bytes(bytes)
        }
        Err(Error::Zip(ZipError::FileNotFound)) => 0,
        Err(e) => return Err(e),
    };

    let mut reader = MomentReader {
        archive: &mut archive,
        required: step > 0,
        moments: BTreeMap::new(),
    };
    model.visit_params("", &mut reader)?;

    optimizer.step = step;
    optimizer.moments = reader.moments;
    Ok(())
}

fn read_entry(archive: &mut ZipArchive<File>, name: &str) -> Result<Vec<u8>> {
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

struct MomentReader<'a> {
    archive: &'a mut ZipArchive<File>,
    required: bool,
    moments: BTreeMap<String, Moments>,
}

impl MomentReader<'_> {
    fn read(&mut self, kind: &str, name: &str, expected: usize) -> Result<Option<Vec<f32>>> {
        let entry = moment_entry(kind, name);
        let bytes = match read_entry(self.archive, &entry) {
            Ok(bytes) => bytes,
            Err(Error::Zip(ZipError::FileNotFound)) if !self.required => return Ok(None),
            Err(Error::Zip(ZipError::FileNotFound)) => {
                return Err(Error::Checkpoint(format!("missing `{entry}`")))
            }
            Err(e) => return Err(e),
        };
        if bytes.len() != expected * 4 {
            return Err(Error::ShapeMismatch {
                name: entry,
                expected,
                found: bytes.len() / 4,
            });
        }
        Ok(Some(f32_values(&bytes)))
    }
}

impl<D: Device<f32>> ParamVisitor<D> for MomentReader<'_> {
    type Err = Error;

    fn visit<S: Shape>(&mut self, name: &str, param: &mut Tensor<S, f32, D>) -> Result<()> {
        let expected = param.shape().num_elements();
        if let (Some(m), Some(v)) = (self.read("m", name, expected)?, self.read("v", name, expected)?) {
            self.moments.insert(name.to_string(), Moments { m, v });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{model::tests::TestModel, optim::AdamConfig};
    use dfdx::nn::modules::Linear;

    fn trained_once(dev: &Cpu) -> (Linear<3, 2, f32, Cpu>, Adam) {
        let mut linear: Linear<3, 2, f32, Cpu> = BuildModule::build(dev);
        let x = dev.tensor([0.5, 1.0, -1.5]);
        let grads = linear
            .forward(x.traced(linear.alloc_grads()))
            .sum::<Rank0, _>()
            .backward();
        let mut adam = Adam::new(AdamConfig::default());
        adam.update(&mut linear, &grads).unwrap();
        (linear, adam)
    }

    #[test]
    fn restores_weights_and_optimizer() {
        let dev: Cpu = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoints").join("checkpoint_at_epoch_1.npz");
        let (linear, adam) = trained_once(&dev);
        save_checkpoint(&path, &linear, &adam).unwrap();

        let mut restored: Linear<3, 2, f32, Cpu> = BuildModule::build(&dev);
        let mut restored_adam = Adam::default();
        load_checkpoint(&path, &mut restored, &mut restored_adam).unwrap();

        assert_eq!(restored.weight.as_vec(), linear.weight.as_vec());
        assert_eq!(restored.bias.as_vec(), linear.bias.as_vec());
        assert_eq!(restored_adam.step, 1);
        assert_eq!(restored_adam.moments, adam.moments);
    }

    #[test]
    fn weights_only_archive_resets_optimizer() {
        let dev: Cpu = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.npz");
        let (linear, _) = trained_once(&dev);
        linear.save(&path).unwrap();

        let mut restored: Linear<3, 2, f32, Cpu> = BuildModule::build(&dev);
        let mut adam = Adam::default();
        adam.step = 7;
        load_checkpoint(&path, &mut restored, &mut adam).unwrap();
        assert_eq!(adam.step, 0);
        assert!(adam.moments.is_empty());
        assert_eq!(restored.weight.as_vec(), linear.weight.as_vec());
    }

    #[test]
    fn mismatched_moments_fail() {
        let dev: Cpu = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.npz");
        let (linear, mut adam) = trained_once(&dev);
        if let Some(moments) = adam.moments.get_mut("bias") {
            moments.m.push(0.0);
            moments.v.push(0.0);
        }
        save_checkpoint(&path, &linear, &adam).unwrap();

        let mut restored: Linear<3, 2, f32, Cpu> = BuildModule::build(&dev);
        let err = load_checkpoint(&path, &mut restored, &mut Adam::default()).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { expected: 2, found: 3, .. }), "{err}");
    }

    #[test]
    fn loading_into_a_different_shape_fails() {
        let dev: Cpu = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.npz");
        let (linear, adam) = trained_once(&dev);
        save_checkpoint(&path, &linear, &adam).unwrap();

        let mut wider: Linear<3, 4, f32, Cpu> = BuildModule::build(&dev);
        let err = load_checkpoint(&path, &mut wider, &mut Adam::default()).unwrap_err();
        assert!(matches!(err, Error::Checkpoint(_)), "{err}");
    }

    #[test]
    fn full_model_round_trip() {
        let dev: Cpu = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.npz");
        let model = TestModel::build_on_device(&dev);
        save_checkpoint(&path, &model, &Adam::default()).unwrap();

        let mut restored = TestModel::build_on_device(&dev);
        load_checkpoint(&path, &mut restored, &mut Adam::default()).unwrap();
        assert_eq!(
            restored.decoder.layers.modules[0].mh_attn.w_v.weight.as_vec(),
            model.decoder.layers.modules[0].mh_attn.w_v.weight.as_vec()
        );
        assert_eq!(
            restored.positional_encoding.weight.as_vec(),
            model.positional_encoding.weight.as_vec()
        );
    }
}
