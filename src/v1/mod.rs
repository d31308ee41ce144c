pub mod health;
pub mod inference;
pub mod models;
pub mod prompt;

#[cfg(test)]
pub mod testing;

pub use health::health_check;
pub use inference::inference;
pub use models::list_models;
