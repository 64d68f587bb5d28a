pub mod kite;
pub mod paper;

pub use kite::KiteGateway;
pub use paper::PaperGateway;
