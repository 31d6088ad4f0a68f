//! Wire types and service stubs generated by `build.rs` from
//! `randchain.proto` via `tonic-build`.

#[rustfmt::skip]
#[allow(clippy::all, clippy::pedantic)]
pub mod randchain;
