//! Models module.
pub mod naism;

/// The user representation computed by implicit item-to-item models:
/// the pooled embedding of the user's history.
#[derive(Clone, Debug)]
pub struct ImplicitUser {
    user_embedding: Vec<f32>,
}

impl ImplicitUser {
    /// The pooled user embedding.
    pub fn embedding(&self) -> &[f32] {
        &self.user_embedding
    }
}
