
mod clone_pipeline;
mod dex_roundtrip;
