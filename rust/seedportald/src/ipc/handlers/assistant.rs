use crate::assistant::{self, PromptContext};
use crate::ipc::error::ok;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_conn, HandlerErr};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;

fn handle_tools_list(req: &Request) -> serde_json::Value {
    ok(&req.id, json!({ "tools": assistant::tool_catalogue() }))
}

fn tools_call(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let empty = json!({});
    let args = params.get("arguments").filter(|v| v.is_object()).unwrap_or(&empty);
    let result = assistant::call_tool(conn, &name, args)?;
    Ok(json!({ "name": name, "result": result }))
}

fn prompt(params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let ctx = PromptContext {
        user_type: get_required_str(params, "userType")?,
        user_name: get_optional_str(params, "userName").unwrap_or_default(),
        user_email: get_optional_str(params, "userEmail").unwrap_or_default(),
        clinic_id: get_optional_str(params, "clinicId"),
        client_id: get_optional_str(params, "clientId"),
        student_id: get_optional_str(params, "studentId"),
    };
    Ok(json!({ "systemPrompt": assistant::system_prompt(&ctx) }))
}

fn handle_prompt(req: &Request) -> serde_json::Value {
    match prompt(&req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assistant.tools.list" => Some(handle_tools_list(req)),
        "assistant.tools.call" => Some(with_conn(state, req, tools_call)),
        "assistant.prompt" => Some(handle_prompt(req)),
        _ => None,
    }
}
