// Database models
//
// - model.rs: rows of the model metadata table

mod model;

pub use model::ModelRow;
