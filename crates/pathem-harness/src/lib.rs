//! Boundary adapters for the pathem harness binary: best-effort
//! shaping-directive application and the periodic `ss` sampling loop.

pub mod apply;
pub mod sampler;
