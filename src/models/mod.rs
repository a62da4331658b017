pub mod dalle_bart;
pub mod vqgan;
