//! Reconstruction model abstraction and the built-in dense autoencoder.
//!
//! The engine never inspects model internals; it only calls the
//! [`ReconstructionModel`] capabilities: encode an item into its latent
//! representation, reconstruct it, and measure the reconstruction error.
//! Custom architectures plug in through [`ModelPlugin`] and the
//! [registry](crate::registry::ModelRegistry) without touching the engine.

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::{Error, Result};

/// A trained (or trainable) reconstruction model.
///
/// Items are flat `f32` vectors in `[0, 1]`, one value per pixel. The
/// anomaly signal is the mean squared error between an item and its
/// reconstruction.
pub trait ReconstructionModel: Send {
    /// Registry key of the plugin that produced this model.
    fn model_type(&self) -> &str;

    /// Expected length of an input vector.
    fn input_dim(&self) -> usize;

    /// One gradient step over a mini-batch (rows are items). Returns the
    /// mean reconstruction loss of the batch before the update.
    fn fit_batch(&mut self, inputs: &Array2<f32>) -> Result<f32>;

    /// Project an item into the model's latent space.
    fn encode(&self, input: ArrayView1<'_, f32>) -> Array1<f32>;

    /// Run the full encode/decode pass.
    fn reconstruct(&self, input: ArrayView1<'_, f32>) -> Array1<f32>;

    /// Mean squared error between the item and its reconstruction.
    fn reconstruction_error(&self, input: ArrayView1<'_, f32>) -> f32 {
        let recon = self.reconstruct(input);
        let diff = &recon - &input;
        diff.mapv(|v| v * v).mean().unwrap_or(0.0)
    }

    /// Serialize the trained weights for the baseline archive.
    fn to_weights(&self) -> Result<Vec<u8>>;
}

/// Factory for a model architecture, registered under a string key.
///
/// `create` builds an untrained model for baseline derivation; `restore`
/// rebuilds a trained model from the weights blob stored in a baseline
/// archive.
pub trait ModelPlugin: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn create(&self, config: &ModelConfig) -> Result<Box<dyn ReconstructionModel>>;

    fn restore(&self, weights: &[u8]) -> Result<Box<dyn ReconstructionModel>>;
}

fn sigmoid(z: f32) -> f32 {
    1.0 / (1.0 + (-z).exp())
}

/// Built-in single-hidden-layer autoencoder.
///
/// Sigmoid activations on both layers, mean-squared-error loss, plain SGD.
/// Deliberately small: it makes the engine usable without plugins, while
/// heavier architectures come in through the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenseAutoencoder {
    input_dim: usize,
    latent_dim: usize,
    learning_rate: f32,
    w_enc: Array2<f32>,
    b_enc: Array1<f32>,
    w_dec: Array2<f32>,
    b_dec: Array1<f32>,
}

impl DenseAutoencoder {
    pub fn new(input_dim: usize, latent_dim: usize, learning_rate: f32) -> Self {
        // Xavier-style init keeps sigmoid activations out of saturation.
        let mut rng = rand::thread_rng();
        let enc_scale = (6.0 / (input_dim + latent_dim) as f32).sqrt();
        let dec_scale = (6.0 / (latent_dim + input_dim) as f32).sqrt();

        Self {
            input_dim,
            latent_dim,
            learning_rate,
            w_enc: Array2::from_shape_fn((input_dim, latent_dim), |_| {
                rng.gen_range(-enc_scale..enc_scale)
            }),
            b_enc: Array1::zeros(latent_dim),
            w_dec: Array2::from_shape_fn((latent_dim, input_dim), |_| {
                rng.gen_range(-dec_scale..dec_scale)
            }),
            b_dec: Array1::zeros(input_dim),
        }
    }

    pub fn latent_dim(&self) -> usize {
        self.latent_dim
    }

    fn forward(&self, inputs: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let hidden = (inputs.dot(&self.w_enc) + &self.b_enc).mapv(sigmoid);
        let output = (hidden.dot(&self.w_dec) + &self.b_dec).mapv(sigmoid);
        (hidden, output)
    }
}

impl ReconstructionModel for DenseAutoencoder {
    fn model_type(&self) -> &str {
        "dense"
    }

    fn input_dim(&self) -> usize {
        self.input_dim
    }

    fn fit_batch(&mut self, inputs: &Array2<f32>) -> Result<f32> {
        if inputs.ncols() != self.input_dim {
            return Err(Error::TaskFailed(format!(
                "batch has {} columns, model expects {}",
                inputs.ncols(),
                self.input_dim
            )));
        }

        let n = inputs.nrows();
        if n == 0 {
            return Ok(0.0);
        }

        let (hidden, output) = self.forward(inputs);
        let diff = &output - inputs;
        let loss = diff.mapv(|v| v * v).mean().unwrap_or(0.0);

        // Backprop through the sigmoid output layer.
        let scale = 2.0 / (n * self.input_dim) as f32;
        let mut d_out = &diff * &output.mapv(|v| v * (1.0 - v));
        d_out *= scale;

        let grad_w_dec = hidden.t().dot(&d_out);
        let grad_b_dec = d_out.sum_axis(Axis(0));

        let d_hidden = d_out.dot(&self.w_dec.t());
        let d_hid = &d_hidden * &hidden.mapv(|v| v * (1.0 - v));

        let grad_w_enc = inputs.t().dot(&d_hid);
        let grad_b_enc = d_hid.sum_axis(Axis(0));

        self.w_dec.scaled_add(-self.learning_rate, &grad_w_dec);
        self.b_dec.scaled_add(-self.learning_rate, &grad_b_dec);
        self.w_enc.scaled_add(-self.learning_rate, &grad_w_enc);
        self.b_enc.scaled_add(-self.learning_rate, &grad_b_enc);

        Ok(loss)
    }

    fn encode(&self, input: ArrayView1<'_, f32>) -> Array1<f32> {
        let mut hidden = input.dot(&self.w_enc);
        hidden += &self.b_enc;
        hidden.mapv_into(sigmoid)
    }

    fn reconstruct(&self, input: ArrayView1<'_, f32>) -> Array1<f32> {
        let hidden = self.encode(input);
        let mut output = hidden.dot(&self.w_dec);
        output += &self.b_dec;
        output.mapv_into(sigmoid)
    }

    fn to_weights(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Plugin wrapper for [`DenseAutoencoder`]; registered under `"dense"`.
pub struct DensePlugin;

impl ModelPlugin for DensePlugin {
    fn name(&self) -> &str {
        "dense"
    }

    fn description(&self) -> &str {
        "Single-hidden-layer autoencoder (sigmoid, MSE, SGD)"
    }

    fn create(&self, config: &ModelConfig) -> Result<Box<dyn ReconstructionModel>> {
        let input_dim = (config.input_side * config.input_side) as usize;
        Ok(Box::new(DenseAutoencoder::new(
            input_dim,
            config.latent_dim,
            config.learning_rate,
        )))
    }

    fn restore(&self, weights: &[u8]) -> Result<Box<dyn ReconstructionModel>> {
        let model: DenseAutoencoder = serde_json::from_slice(weights)?;
        Ok(Box::new(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn toy_batch() -> Array2<f32> {
        // Four items with a simple repeating structure.
        Array2::from_shape_fn((4, 16), |(i, j)| ((i + j) % 4) as f32 / 4.0)
    }

    #[test]
    fn training_reduces_loss() {
        let mut model = DenseAutoencoder::new(16, 4, 0.5);
        let batch = toy_batch();

        let first = model.fit_batch(&batch).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = model.fit_batch(&batch).unwrap();
        }
        assert!(
            last < first,
            "loss should decrease: first={} last={}",
            first,
            last
        );
    }

    #[test]
    fn dimension_mismatch_is_an_error() {
        let mut model = DenseAutoencoder::new(16, 4, 0.1);
        let bad = Array2::zeros((2, 9));
        assert!(model.fit_batch(&bad).is_err());
    }

    #[test]
    fn encode_has_latent_dim() {
        let model = DenseAutoencoder::new(16, 4, 0.1);
        let item = Array1::zeros(16);
        assert_eq!(model.encode(item.view()).len(), 4);
    }

    #[test]
    fn weights_roundtrip_preserves_errors() {
        let mut model = DenseAutoencoder::new(16, 4, 0.5);
        let batch = toy_batch();
        for _ in 0..20 {
            model.fit_batch(&batch).unwrap();
        }

        let weights = model.to_weights().unwrap();
        let restored = DensePlugin.restore(&weights).unwrap();

        let item = batch.row(0);
        assert_eq!(
            model.reconstruction_error(item),
            restored.reconstruction_error(item)
        );
    }
}
