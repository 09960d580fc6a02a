// Library root. The preprocessing pipeline and serving layer live in this
// directory; the model-fitting engine lives in the sibling `ensemble/`
// directory and is mounted below.

pub mod artifact;
pub mod config;
pub mod data;
pub mod derive;
pub mod impute;
pub mod normalize;
pub mod report;
pub mod request;
pub mod schema;
pub mod service;
pub mod train;

#[path = "../ensemble/mod.rs"]
pub mod ensemble;
