// Audio processing (DSP)
// Modules: decoder, rhythm, hpss, downbeat

pub mod decoder;
pub mod downbeat;
pub mod hpss;
pub mod rhythm;
