use anyhow::anyhow;
use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Dropout, Embedding, Linear, Module, VarMap};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Tanh,
    Relu,
    Sigmoid,
    Linear,
}

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> Result<Tensor> {
        match self {
            Activation::Tanh => xs.tanh(),
            Activation::Relu => xs.relu(),
            Activation::Sigmoid => sigmoid(xs),
            Activation::Linear => Ok(xs.clone()),
        }
    }

    /// True when the activation maps onto [0, 1].
    pub fn is_unit_bounded(&self) -> bool {
        matches!(self, Activation::Sigmoid)
    }
}

/// Logistic sigmoid built from differentiable primitives.
pub fn sigmoid(xs: &Tensor) -> Result<Tensor> {
    xs.neg()?.exp()?.affine(1.0, 1.0)?.recip()
}

/// Creates trainable variables in a `VarMap` from a seeded RNG.
///
/// Candle's CPU backend cannot be seeded, so initial weights are drawn on the
/// host and inserted the same way pretrained tensors are.
pub struct WeightInitializer<'a, R: Rng> {
    varmap: &'a VarMap,
    device: &'a Device,
    rng: &'a mut R,
}

impl<'a, R: Rng> WeightInitializer<'a, R> {
    pub fn new(varmap: &'a VarMap, device: &'a Device, rng: &'a mut R) -> Self {
        Self { varmap, device, rng }
    }

    fn insert(&mut self, name: &str, values: Vec<f32>, dims: &[usize]) -> Result<Tensor> {
        let tensor = Tensor::from_vec(values, dims, self.device)?;
        let var = Var::from_tensor(&tensor)?;
        let out = var.as_tensor().clone();
        let mut ws = self
            .varmap
            .data()
            .lock()
            .map_err(|_| candle_core::Error::Msg("VarMap lock poisoned".to_string()))?;
        ws.insert(name.to_string(), var);
        Ok(out)
    }

    /// Glorot/Xavier uniform: U(-l, l) with l = sqrt(6 / (fan_in + fan_out)).
    pub fn glorot_uniform(
        &mut self,
        name: &str,
        dims: &[usize],
        fan_in: usize,
        fan_out: usize,
    ) -> Result<Tensor> {
        let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt() as f32;
        let dist = Uniform::new_inclusive(-limit, limit);
        let n: usize = dims.iter().product();
        let values: Vec<f32> = (0..n).map(|_| dist.sample(self.rng)).collect();
        self.insert(name, values, dims)
    }

    pub fn zeros(&mut self, name: &str, dims: &[usize]) -> Result<Tensor> {
        let n: usize = dims.iter().product();
        self.insert(name, vec![0.0; n], dims)
    }

    pub fn linear(&mut self, prefix: &str, in_dim: usize, out_dim: usize) -> Result<Linear> {
        let weight = self.glorot_uniform(
            &format!("{}.weight", prefix),
            &[out_dim, in_dim],
            in_dim,
            out_dim,
        )?;
        let bias = self.zeros(&format!("{}.bias", prefix), &[out_dim])?;
        Ok(Linear::new(weight, Some(bias)))
    }

    pub fn embedding(&mut self, prefix: &str, vocab: usize, dim: usize) -> Result<Embedding> {
        let weight = self.glorot_uniform(&format!("{}.weight", prefix), &[vocab, dim], vocab, dim)?;
        Ok(Embedding::new(weight, dim))
    }
}

/// 1D convolution without weight sharing: each output position has its own
/// kernel. Input (batch, length, channels) -> (batch, length - k + 1, filters).
#[derive(Debug, Clone)]
pub struct LocallyConnected1D {
    weight: Tensor,
    bias: Tensor,
    kernel_size: usize,
    activation: Activation,
}

impl LocallyConnected1D {
    pub fn new<R: Rng>(
        init: &mut WeightInitializer<'_, R>,
        prefix: &str,
        input_length: usize,
        channels: usize,
        filters: usize,
        kernel_size: usize,
        activation: Activation,
    ) -> anyhow::Result<Self> {
        if kernel_size == 0 || kernel_size > input_length {
            return Err(anyhow!(
                "Locally connected kernel size {} does not fit input length {}",
                kernel_size,
                input_length
            ));
        }
        let positions = input_length - kernel_size + 1;
        let fan_in = kernel_size * channels;
        let weight = init.glorot_uniform(
            &format!("{}.weight", prefix),
            &[positions, fan_in, filters],
            fan_in,
            filters,
        )?;
        let bias = init.zeros(&format!("{}.bias", prefix), &[positions, filters])?;
        Ok(Self {
            weight,
            bias,
            kernel_size,
            activation,
        })
    }

    pub fn output_length(&self) -> usize {
        self.weight.dims()[0]
    }

    pub fn filters(&self) -> usize {
        self.weight.dims()[2]
    }
}

impl Module for LocallyConnected1D {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let positions = self.output_length();
        let windows = (0..positions)
            .map(|i| xs.narrow(1, i, self.kernel_size)?.flatten_from(1))
            .collect::<Result<Vec<_>>>()?;
        // (positions, batch, k * channels) x (positions, k * channels, filters)
        let stacked = Tensor::stack(&windows, 0)?;
        let out = stacked
            .matmul(&self.weight)?
            .broadcast_add(&self.bias.unsqueeze(1)?)?
            .transpose(0, 1)?
            .contiguous()?;
        self.activation.apply(&out)
    }
}

/// Fully connected layer followed by an activation.
#[derive(Debug, Clone)]
pub struct Dense {
    linear: Linear,
    activation: Activation,
}

impl Dense {
    pub fn new(linear: Linear, activation: Activation) -> Self {
        Self { linear, activation }
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }
}

impl Module for Dense {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.activation.apply(&self.linear.forward(xs)?)
    }
}

/// Dense stack with dropout between layers.
#[derive(Debug, Clone)]
pub struct DenseStack {
    layers: Vec<Dense>,
    dropout: Option<Dropout>,
}

impl DenseStack {
    pub fn new(layers: Vec<Dense>, dropout_probability: f32) -> Self {
        let dropout = (dropout_probability > 0.0).then(|| Dropout::new(dropout_probability));
        Self { layers, dropout }
    }

    pub fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut out = xs.clone();
        for layer in &self.layers {
            out = layer.forward(&out)?;
            if let Some(dropout) = &self.dropout {
                out = dropout.forward(&out, train)?;
            }
        }
        Ok(out)
    }

    /// Sum of absolute kernel weights, for L1 regularization.
    pub fn l1_norm(&self) -> Result<Tensor> {
        let mut total = Tensor::zeros((), DType::F32, self.device())?;
        for layer in &self.layers {
            total = (total + layer.weight().abs()?.sum_all()?)?;
        }
        Ok(total)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    fn device(&self) -> &Device {
        self.layers
            .first()
            .map(|l| l.weight().device())
            .unwrap_or(&Device::Cpu)
    }
}
