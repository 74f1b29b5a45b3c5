//! Clip web pages into an Outline-style wiki as Markdown.
//!
//! [`extract`] turns page HTML into a [`models::PageContent`], [`pipeline`]
//! re-hosts the referenced images through [`outline`], and [`clip`] ties the
//! steps together behind the persisted settings in [`store`].

pub mod clip;
mod dom;
pub mod embed;
pub mod error;
pub mod extract;
pub mod images;
pub mod markdown;
pub mod models;
pub mod outline;
pub mod pipeline;
pub mod store;

pub use clip::ClipService;
pub use error::ClipError;
