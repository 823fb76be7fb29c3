pub mod app_state;
pub mod handlers;

pub use app_state::AppState;
