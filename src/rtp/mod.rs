pub mod layer;
pub mod ssrc;
