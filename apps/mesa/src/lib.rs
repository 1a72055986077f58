pub mod headless;
pub mod obs;
