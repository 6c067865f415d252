pub mod detector;
pub mod exif;
pub mod fetch;
pub mod fingerprint;
pub mod queue;
pub mod retry;
pub mod storage;
pub mod upload;
