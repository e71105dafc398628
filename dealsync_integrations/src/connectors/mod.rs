//! Record sources implementing `dealsync_core::records::RecordSource`.

#[cfg(feature = "hubspot")]
pub mod hubspot;
