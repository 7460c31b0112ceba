mod app;
mod batch;

pub use app::add_routes;
pub use batch::AppState;
