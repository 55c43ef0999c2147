use std::collections::BTreeMap;

use dfdx::prelude::*;

use crate::{
    error::{Error, Result},
    model::{ParamVisitor, Parameters},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamConfig {
    pub lr: f64,
    pub betas: [f64; 2],
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-4,
            betas: [0.9, 0.98],
            eps: 1e-9,
        }
    }
}

/// First and second moment estimates for one parameter, flattened.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Moments {
    pub m: Vec<f32>,
    pub v: Vec<f32>,
}

/// Adam with bias correction. Moments live on the host, keyed by parameter
/// name, so the whole state can be written next to the weights.
///
/// dfdx's own `Adam` keeps its moments private, so they could not be saved.
/// Each step copies parameters and gradients to the host and back.
#[derive(Debug, Clone)]
pub struct Adam {
    pub cfg: AdamConfig,
    pub step: u64,
    pub moments: BTreeMap<String, Moments>,
}

impl Adam {
    pub fn new(cfg: AdamConfig) -> Self {
        Self {
            cfg,
            step: 0,
            moments: BTreeMap::new(),
        }
    }

    /// Applies one step to every parameter of `model` using `grads`.
    pub fn update<P: Parameters<D>, D: Device<f32>>(
        &mut self,
        model: &mut P,
        grads: &Gradients<f32, D>,
    ) -> Result<()> {
        self.step += 1;
        let mut visitor = AdamStep {
            cfg: &self.cfg,
            t: self.step,
            moments: &mut self.moments,
            grads,
        };
        model.visit_params("", &mut visitor)
    }
}

impl Default for Adam {
    fn default() -> Self {
        Self::new(Default::default())
    }
}

struct AdamStep<'a, D: Storage<f32>> {
    cfg: &'a AdamConfig,
    t: u64,
    moments: &'a mut BTreeMap<String, Moments>,
    grads: &'a Gradients<f32, D>,
}

impl<D: Device<f32>> ParamVisitor<D> for AdamStep<'_, D> {
    type Err = Error;

    fn visit<S: Shape>(&mut self, name: &str, param: &mut Tensor<S, f32, D>) -> Result<()> {
        let g = self.grads.get(param).as_vec();
        let mut p = param.as_vec();
        let moments = self.moments.entry(name.to_string()).or_insert_with(|| Moments {
            m: vec![0.0; p.len()],
            v: vec![0.0; p.len()],
        });
        if moments.m.len() != p.len() || moments.v.len() != p.len() {
            return Err(Error::ShapeMismatch {
                name: name.to_string(),
                expected: p.len(),
                found: moments.m.len().min(moments.v.len()),
            });
        }

        let [b1, b2] = self.cfg.betas;
        let t = self.t.min(i32::MAX as u64) as i32;
        let step_size = (self.cfg.lr / (1.0 - b1.powi(t))) as f32;
        let bias_correction2_sqrt = (1.0 - b2.powi(t)).sqrt() as f32;
        let (b1, b2, eps) = (b1 as f32, b2 as f32, self.cfg.eps as f32);

        for (((p, g), m), v) in p
            .iter_mut()
            .zip(&g)
            .zip(moments.m.iter_mut())
            .zip(moments.v.iter_mut())
        {
            *m = b1 * *m + (1.0 - b1) * g;
            *v = b2 * *v + (1.0 - b2) * g * g;
            *p -= step_size * *m / (v.sqrt() / bias_correction2_sqrt + eps);
        }
        param.copy_from(&p);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dfdx::nn::modules::Linear;

    #[test]
    fn first_step_moves_by_learning_rate() {
        let dev: Cpu = Default::default();
        let mut linear: Linear<3, 2, f32, Cpu> = BuildModule::build(&dev);
        let before = linear.weight.as_vec();

        let x = dev.tensor([1.0, -2.0, 0.5]);
        let loss = linear.forward(x.traced(linear.alloc_grads())).sum::<Rank0, _>();
        let grads = loss.backward();
        let g = grads.get(&linear.weight).as_vec();

        let mut adam = Adam::new(AdamConfig {
            lr: 1e-2,
            ..Default::default()
        });
        adam.update(&mut linear, &grads).unwrap();

        assert_eq!(adam.step, 1);
        for ((w0, w1), g) in before.iter().zip(linear.weight.as_vec()).zip(g) {
            let expected = w0 - 1e-2 * g.signum();
            assert!((w1 - expected).abs() < 1e-5, "{w1} vs {expected}");
        }
        assert_eq!(adam.moments.len(), 2);
        assert!(adam.moments.contains_key("weight"));
    }

    #[test]
    fn zero_gradient_leaves_parameter_alone() {
        let dev: Cpu = Default::default();
        let mut linear: Linear<2, 2, f32, Cpu> = BuildModule::build(&dev);
        let before = linear.bias.as_vec();
        let grads = linear.alloc_grads();
        Adam::default().update(&mut linear, &grads).unwrap();
        assert_eq!(linear.bias.as_vec(), before);
    }

    #[test]
    fn mismatched_moments_are_rejected() {
        let dev: Cpu = Default::default();
        let mut linear: Linear<2, 2, f32, Cpu> = BuildModule::build(&dev);
        let grads = linear.alloc_grads();
        let mut adam = Adam::default();
        adam.moments.insert(
            "weight".into(),
            Moments {
                m: vec![0.0; 3],
                v: vec![0.0; 3],
            },
        );
        assert!(matches!(
            adam.update(&mut linear, &grads),
            Err(Error::ShapeMismatch { expected: 4, found: 3, .. })
        ));
    }
}
