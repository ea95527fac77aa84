pub mod machines;

use axum::Router;
use axum::middleware;
use axum::routing::get;

use crate::auth::auth_middleware;
use crate::state::AppState;

pub fn api_router(state: AppState) -> Router {
    Router::new()
        // Machines
        .route(
            "/machines",
            get(machines::list_machines).post(machines::deploy_machines),
        )
        .route(
            "/machines/{id}",
            get(machines::get_machine).delete(machines::destroy_machine),
        )
        .route("/machines/{id}/health", get(machines::machine_health))
        // Working directories
        .route("/deployments", get(machines::list_deployments))
        // Auth middleware
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .with_state(state)
}
