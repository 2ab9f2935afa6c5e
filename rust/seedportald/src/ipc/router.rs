use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

type Handler = fn(&mut AppState, &Request) -> Option<serde_json::Value>;

const HANDLERS: [Handler; 10] = [
    handlers::core::try_handle,
    handlers::directory::try_handle,
    handlers::schedule::try_handle,
    handlers::attendance::try_handle,
    handlers::debriefs::try_handle,
    handlers::documents::try_handle,
    handlers::notifications::try_handle,
    handlers::seed::try_handle,
    handlers::assistant::try_handle,
    handlers::backup_exchange::try_handle,
];

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    log::debug!("ipc {} {}", req.id, req.method);
    for handler in HANDLERS {
        if let Some(resp) = handler(state, &req) {
            return resp;
        }
    }

    log::warn!("unknown method: {}", req.method);
    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
