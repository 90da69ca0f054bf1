pub mod http;
pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

pub use http::HttpRecognizer;
pub use stub::ScriptedRecognizer;

#[cfg(feature = "backend-tract")]
pub use tract::TractRecognizer;
