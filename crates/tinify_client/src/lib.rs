//! Client for the [TinyPNG](https://tinypng.com) image compression API.
//!
//! A [`Client`] is bound to a single API key. Compressing an image is a
//! two-step exchange with the remote service: [`Client::compress`] streams
//! the source bytes to the shrink endpoint and yields a
//! [`CompressionRecord`] describing the result, after which
//! [`Client::download`] fetches the compressed bytes from the URL in that
//! record. The service piggybacks the per-key usage counter on every
//! response through the `Compression-Count` header; [`Client::used_quota`]
//! exposes it without performing a compression.

mod client;
mod error;

pub use client::{Client, ClientOptions, CompressionRecord, DownloadOptions};
pub use error::ClientError;
