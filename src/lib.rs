// scanout
// Copyright (c) 2026
//
// Direct-to-display GPU rendering without a windowing system: KMS display
// object resolution, GBM buffer allocation, zero-copy EGL import and a
// vsync-paced frame loop over atomic or legacy commits.

pub mod config;
pub mod core;
pub mod device;
pub mod prelude;
