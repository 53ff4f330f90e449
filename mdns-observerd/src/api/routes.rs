use std::sync::Arc;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use mdns_observer::Observer;
use shared::protocol::{normalize_name, API_PREFIX};
use shared::{AddressEntry, ServiceEntry};
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub observer: Arc<Observer>,
    pub hash_rx: watch::Receiver<String>,
    pub config: Arc<Config>,
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub group: String,
    pub interface: String,
    pub watch: Vec<String>,
    pub remove_timeout_secs: u64,
    pub query_interval_secs: u64,
}

#[derive(Deserialize)]
pub struct ServiceQuery {
    #[serde(rename = "type")]
    pub service_type: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/config", get(get_config))
        .route("/services", get(get_services))
        .route("/services/hash", get(get_hash))
        .route("/services/:instance", get(get_service))
        .route("/addresses", get(get_addresses));

    Router::new().nest(API_PREFIX, api).with_state(state)
}

fn config_response(config: &Config) -> ConfigResponse {
    ConfigResponse {
        group: config.transport.group.to_string(),
        interface: config.transport.interface.to_string(),
        watch: config.watch.clone(),
        remove_timeout_secs: config.observer.remove_timeout_secs,
        query_interval_secs: config.query.interval_secs,
    }
}

/// Keep services of `service_type`, compared case-insensitively
fn filter_by_type(services: Vec<ServiceEntry>, service_type: &str) -> Vec<ServiceEntry> {
    let wanted = normalize_name(service_type);
    services
        .into_iter()
        .filter(|s| s.service_type().is_some_and(|t| t.eq_ignore_ascii_case(&wanted)))
        .collect()
}

async fn get_config(State(state): State<AppState>) -> Json<ConfigResponse> {
    Json(config_response(&state.config))
}

async fn get_services(
    State(state): State<AppState>,
    Query(params): Query<ServiceQuery>,
) -> Json<Vec<ServiceEntry>> {
    let services = state.observer.services();
    match params.service_type {
        Some(service_type) => Json(filter_by_type(services, &service_type)),
        None => Json(services),
    }
}

async fn get_hash(State(state): State<AppState>) -> String {
    state.hash_rx.borrow().clone()
}

async fn get_service(
    State(state): State<AppState>,
    Path(instance): Path<String>,
) -> Result<Json<ServiceEntry>, StatusCode> {
    state
        .observer
        .service(&instance)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn get_addresses(State(state): State<AppState>) -> Json<Vec<AddressEntry>> {
    Json(state.observer.addresses())
}
