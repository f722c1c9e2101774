//! The layer catalog (C5): concrete modules built on top of the autograd
//! graph and the module system. Each file owns one family of layers and the
//! unit tests that pin its forward/backward numerics.

pub mod attention;
pub mod conv;
pub mod dropout;
pub mod linear;
pub mod moe;
pub mod norm;
pub mod positional;
pub mod rnn;
pub mod support;
pub mod transformer;

pub use attention::{KvCache, MultiHeadAttention};
pub use conv::{AvgPool2d, Conv2d, LazyConv2d, MaxPool2d};
pub use dropout::Dropout;
pub use linear::{LazyLinear, Linear};
pub use moe::{ExpertRoutingInfo, MixtureOfExperts};
pub use norm::{BatchNorm1d, LayerNorm};
pub use positional::PositionalEncoding;
pub use rnn::{RnnActivation, GRU, LSTM, SimpleRNN};
pub use transformer::{Activation, NormPosition, TransformerDecoderLayer, TransformerEncoderLayer};
