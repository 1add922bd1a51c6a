use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use murmur::{Murmur, SharedValueDelegate};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Clone)]
pub struct AppState {
    pub murmur: Murmur,
    pub store: Arc<SharedValueDelegate>,
}

#[derive(Deserialize)]
struct ValueParams {
    set: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(value))
        .route("/members", get(members))
        .with_state(state)
}

/// `GET /?set=v` sets the shared value, `GET /` reads it.
async fn value(State(state): State<AppState>, Query(params): Query<ValueParams>) -> String {
    match params.set.filter(|value| !value.is_empty()) {
        Some(value) => {
            state.store.set_value(value.as_str());
            format!("SET last value: {}", value)
        }
        None => format!("last value: {}", state.store.get_value()),
    }
}

async fn members(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "local": state.murmur.name(),
        "members": state.murmur.members(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur::config::MurmurConfigBuilder;
    use murmur::{MemoryNetwork, NoopEventDelegate};

    async fn state() -> AppState {
        let network = MemoryNetwork::new();
        let config = MurmurConfigBuilder::new().with_name("web").build().unwrap();
        let store = Arc::new(SharedValueDelegate::new("web", 5));
        let murmur = Murmur::new(config, store.clone(), Arc::new(NoopEventDelegate), Arc::new(network.bind())).unwrap();
        murmur.start().await.unwrap();
        AppState { murmur, store }
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let state = state().await;

        let empty = value(State(state.clone()), Query(ValueParams { set: None })).await;
        assert_eq!(empty, "last value: ");

        let set = value(State(state.clone()), Query(ValueParams { set: Some("blue".into()) })).await;
        assert_eq!(set, "SET last value: blue");

        let get = value(State(state.clone()), Query(ValueParams { set: Some(String::new()) })).await;
        assert_eq!(get, "last value: blue");

        state.murmur.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_members_lists_local_node() {
        let state = state().await;
        let Json(body) = members(State(state.clone())).await;
        assert_eq!(body["local"], "web");
        assert_eq!(body["members"][0]["name"], "web");
        state.murmur.shutdown().await.unwrap();
    }
}
