//! The `Embed` layer.
//!
//! Maps integer ids to dense vectors of a fixed size. Inputs must be
//! `int32`.

use crate::nn::initializers::Initializer;
use crate::nn::module::{Module, ModuleError, ModuleResult};
use crate::tensor::{DType, Tensor};
use crate::transform::Context;

/// Embedding lookup table.
///
/// The table has shape `[vocab_size, embed_dim]` and is always created as
/// `float32`, since integer ids carry no precision of their own.
///
/// # Example
///
/// ```ignore
/// let embed = Embed::new(6, 12);
/// let ids = Tensor::zeros(&[8], DType::I32);
/// let vectors = embed.forward(&mut ctx, &ids)?; // [8, 12]
/// ```
#[derive(Debug, Clone)]
pub struct Embed {
    /// Number of rows in the table.
    pub vocab_size: usize,
    /// Size of each output vector.
    pub embed_dim: usize,
    pub w_init: Initializer,
    name: String,
}

impl Embed {
    pub fn new(vocab_size: usize, embed_dim: usize) -> Self {
        Self {
            vocab_size,
            embed_dim,
            w_init: Initializer::TruncatedNormal {
                stddev: 1.0,
                mean: 0.0,
            },
            name: "embed".to_string(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl Module for Embed {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "Embed"
    }

    /// Looks up table rows: `[ids...] -> [ids..., embed_dim]`.
    ///
    /// An id outside `[0, vocab_size)` is an error.
    fn forward(&self, ctx: &mut Context<'_>, ids: &Tensor) -> ModuleResult<Tensor> {
        if ids.dtype() != DType::I32 {
            return Err(ModuleError::invalid_input(
                &self.name,
                format!("ids must be int32, got {}", ids.dtype()),
            ));
        }
        let table = ctx.get_parameter(
            &self.name,
            "embeddings",
            &[self.vocab_size, self.embed_dim],
            DType::F32,
            &self.w_init,
        )?;
        Ok(table.take_rows(ids)?)
    }
}
